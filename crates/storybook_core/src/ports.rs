//! crates/storybook_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases or APIs.

use crate::domain::{
    Book, BookStatus, GenerationJob, LedgerEntry, NewBook, NewPageImage, Page, PageContext,
    PageImage, PointHistory, PromptMessage, SamplerParams, User, UserCredentials,
    VisibilityChange,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, Clone, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Insufficient credits: required {required}, current {current}")]
    InsufficientCredits { required: i64, current: i64 },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// A language, image or storage backend failed.
    #[error("Upstream service failed: {0}")]
    Upstream(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Persistence Port
//=========================================================================================

/// The transactional store behind books, pages, variants, balances and jobs.
///
/// Every method that takes a `LedgerEntry` applies it in the same unit of work as
/// its other writes: if the balance would go negative the whole call fails with
/// `PortError::InsufficientCredits` and nothing is written.
#[async_trait]
pub trait DatabaseService: Send + Sync {
    // --- Users and Auth ---
    async fn create_user_with_email(
        &self,
        email: &str,
        hashed_password: &str,
        signup_bonus: i64,
    ) -> PortResult<User>;

    async fn get_user_by_email(&self, email: &str) -> PortResult<UserCredentials>;

    async fn get_user(&self, user_id: Uuid) -> PortResult<User>;

    async fn create_auth_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()>;

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid>;

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()>;

    // --- Credits ---
    async fn get_point_history(&self, user_id: Uuid) -> PortResult<Vec<PointHistory>>;

    // --- Books ---
    /// Debits, persists the book with all pages and their adopted images, and marks
    /// the job (if any) as succeeded.
    async fn commit_book(
        &self,
        book: NewBook,
        debit: LedgerEntry,
        job_id: Option<Uuid>,
    ) -> PortResult<Book>;

    async fn get_book(&self, book_id: Uuid) -> PortResult<Book>;

    /// Pages ordered by page number, cover first.
    async fn get_pages_for_book(&self, book_id: Uuid) -> PortResult<Vec<Page>>;

    async fn latest_book_for_user(&self, user_id: Uuid) -> PortResult<Option<Book>>;

    /// Sets the status. The reward is applied only if the book has never been
    /// rewarded before, and the flag is set in the same unit of work.
    async fn update_book_visibility(
        &self,
        book_id: Uuid,
        status: BookStatus,
        reward: Option<LedgerEntry>,
    ) -> PortResult<VisibilityChange>;

    // --- Pages and Variants ---
    async fn get_page_context(&self, page_id: Uuid) -> PortResult<PageContext>;

    /// Variants of a page, oldest first.
    async fn get_page_images(&self, page_id: Uuid) -> PortResult<Vec<PageImage>>;

    /// Debits and appends an unadopted variant.
    async fn commit_page_image(
        &self,
        image: NewPageImage,
        debit: LedgerEntry,
    ) -> PortResult<PageImage>;

    /// Makes the variant with `image_url` the page's adopted image, serialized per page.
    async fn adopt_page_image(&self, page_id: Uuid, image_url: &str) -> PortResult<Page>;

    // --- Generation Jobs ---
    async fn create_generation_job(&self, user_id: Uuid) -> PortResult<GenerationJob>;

    async fn get_generation_job(&self, job_id: Uuid) -> PortResult<GenerationJob>;

    /// Marks a job that is still generating as failed.
    async fn fail_generation_job(&self, job_id: Uuid) -> PortResult<()>;
}

//=========================================================================================
// Generation Backend Ports
//=========================================================================================

#[async_trait]
pub trait TextGenerationService: Send + Sync {
    /// Runs one chat completion and returns the generated text.
    async fn generate(&self, messages: &[PromptMessage], temperature: f32) -> PortResult<String>;
}

#[async_trait]
pub trait ImageGenerationService: Send + Sync {
    /// Renders a prompt and returns the raw image bytes (PNG).
    async fn generate(&self, prompt: &str, params: &SamplerParams) -> PortResult<Bytes>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores an object under `key` and returns its public URL.
    async fn put(&self, bytes: Bytes, key: &str, content_type: &str) -> PortResult<String>;
}
