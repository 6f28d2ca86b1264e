//! crates/storybook_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application.
//! These structs are independent of any database or serialization format,
//! except where a type is also part of a wire contract (status enums).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

//=========================================================================================
// Users, Auth and Credits
//=========================================================================================

/// Represents a user together with their current credit balance.
#[derive(Debug, Clone)]
pub struct User {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub points: i64,
}

// Only used internally for login/signup - contains sensitive data
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub user_id: Uuid,
    pub email: String,
    pub hashed_password: String,
}

// Represents a browser login session (auth cookie)
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub id: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Why a balance changed. Persisted as the `reason` column of the point history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointReason {
    Signup,
    InitialGeneration,
    RegeneratePage,
    RefineAndRegenerate,
    PublicBookReward,
}

impl PointReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointReason::Signup => "signup",
            PointReason::InitialGeneration => "initial_generation",
            PointReason::RegeneratePage => "regenerate_page",
            PointReason::RefineAndRegenerate => "refine_and_regenerate",
            PointReason::PublicBookReward => "public_book_reward",
        }
    }
}

impl fmt::Display for PointReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PointReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signup" => Ok(PointReason::Signup),
            "initial_generation" => Ok(PointReason::InitialGeneration),
            "regenerate_page" => Ok(PointReason::RegeneratePage),
            "refine_and_regenerate" => Ok(PointReason::RefineAndRegenerate),
            "public_book_reward" => Ok(PointReason::PublicBookReward),
            other => Err(format!("unknown point reason '{}'", other)),
        }
    }
}

/// A single signed balance change. Every balance mutation writes exactly one of these.
#[derive(Debug, Clone)]
pub struct PointHistory {
    pub id: Uuid,
    pub user_id: Uuid,
    pub delta: i64,
    pub reason: PointReason,
    pub book_id: Option<Uuid>,
    pub page_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A balance change that has not been applied yet.
///
/// Negative `delta` is a debit. Stores apply it together with the rest of the
/// unit of work and refuse it if the balance would drop below zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub user_id: Uuid,
    pub delta: i64,
    pub reason: PointReason,
    pub book_id: Option<Uuid>,
    pub page_id: Option<Uuid>,
}

//=========================================================================================
// Books, Pages and Variants
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookStatus {
    Private,
    Published,
    Community,
    Public,
}

impl BookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookStatus::Private => "private",
            BookStatus::Published => "published",
            BookStatus::Community => "community",
            BookStatus::Public => "public",
        }
    }
}

impl FromStr for BookStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(BookStatus::Private),
            "published" => Ok(BookStatus::Published),
            "community" => Ok(BookStatus::Community),
            "public" => Ok(BookStatus::Public),
            other => Err(format!("unknown book status '{}'", other)),
        }
    }
}

/// The user's choices that a book was generated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookParams {
    pub theme: String,
    pub genre: String,
    pub character: String,
    pub art_style: String,
    pub target_age: String,
    pub page_count: u32,
    pub language: String,
}

#[derive(Debug, Clone)]
pub struct Book {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub params: BookParams,
    pub status: BookStatus,
    /// Set once the one-time reward for going public has been paid out.
    pub public_reward_granted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A page of a book. `page_number` 0 is the cover.
///
/// `image_url` and `prompt` mirror the adopted variant referenced by
/// `adopted_image_id`; they are never stored independently of it.
#[derive(Debug, Clone)]
pub struct Page {
    pub id: Uuid,
    pub book_id: Uuid,
    pub page_number: u32,
    pub text: String,
    pub adopted_image_id: Option<Uuid>,
    pub image_url: Option<String>,
    pub prompt: Option<String>,
    pub version: i64,
}

/// One immutable illustration attempt for a page.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub id: Uuid,
    pub page_id: Uuid,
    pub image_url: String,
    pub prompt: String,
    pub is_adopted: bool,
    pub created_at: DateTime<Utc>,
}

/// A page together with the book that owns it, used for ownership checks.
#[derive(Debug, Clone)]
pub struct PageContext {
    pub page: Page,
    pub book: Book,
}

#[derive(Debug, Clone)]
pub struct PageWithVariants {
    pub page: Page,
    pub variants: Vec<PageImage>,
}

#[derive(Debug, Clone)]
pub struct BookDetail {
    pub book: Book,
    pub pages: Vec<PageWithVariants>,
}

/// Result of a visibility change; `rewarded` is true only on the single
/// transition that paid out the public-book reward.
#[derive(Debug, Clone)]
pub struct VisibilityChange {
    pub book: Book,
    pub rewarded: bool,
}

//=========================================================================================
// Generation Artifacts (not yet persisted)
//=========================================================================================

/// A stored illustration and the exact prompt that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedImage {
    pub image_url: String,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct NewPage {
    pub page_number: u32,
    pub text: String,
    pub image: RenderedImage,
}

/// Everything the pipeline produced for one book, committed in a single unit of work.
#[derive(Debug, Clone)]
pub struct NewBook {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub params: BookParams,
    pub pages: Vec<NewPage>,
}

#[derive(Debug, Clone)]
pub struct NewPageImage {
    pub page_id: Uuid,
    pub image: RenderedImage,
}

//=========================================================================================
// Generation Jobs
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Generating,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Generating => "generating",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generating" => Ok(JobStatus::Generating),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// A server-issued handle for one paid generation run.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: JobStatus,
    pub book_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

//=========================================================================================
// Backend Requests
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

/// One chat message sent to the language backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }
}

/// Sampler settings passed through to the image backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerParams {
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f32,
    pub seed: Option<u64>,
    pub negative_prompt: Option<String>,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
            steps: 30,
            cfg_scale: 7.0,
            seed: None,
            negative_prompt: Some("text, letters, watermark, signature, blurry".to_string()),
        }
    }
}
