//! services/api/src/web/books.rs
//!
//! Book endpoints: paid generation, the latest-book lookup used by recovery,
//! the book detail view and visibility changes.

use crate::error::ApiError;
use crate::web::middleware::CurrentUser;
use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use storybook_core::domain::{Book, BookDetail, BookStatus, PageImage, PageWithVariants};
use storybook_core::ports::{PortError, PortResult};
use storybook_core::{BookRequest, BookStudio};
use tokio::task::JoinHandle;
use utoipa::ToSchema;
use uuid::Uuid;

//=========================================================================================
// API Payload Structs
//=========================================================================================

#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBookRequest {
    pub theme: String,
    pub genre: String,
    pub character: String,
    pub art_style: String,
    pub target_age: String,
    pub page_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Job id obtained from `POST /generation-jobs` before submitting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

impl GenerateBookRequest {
    fn into_parts(self) -> (BookRequest, Option<Uuid>) {
        let request = BookRequest {
            theme: self.theme,
            genre: self.genre,
            character: self.character,
            art_style: self.art_style,
            target_age: self.target_age,
            page_count: self.page_count,
            language: self.language.unwrap_or_default(),
        };
        (request, self.job_id)
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBookResponse {
    pub book_id: Uuid,
    pub title: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct LatestBookResponse {
    pub id: Uuid,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VariantView {
    pub id: Uuid,
    pub image_url: String,
    pub prompt: String,
    pub is_adopted: bool,
    pub created_at: DateTime<Utc>,
}

impl From<PageImage> for VariantView {
    fn from(image: PageImage) -> Self {
        Self {
            id: image.id,
            image_url: image.image_url,
            prompt: image.prompt,
            is_adopted: image.is_adopted,
            created_at: image.created_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PageView {
    pub id: Uuid,
    pub page_number: u32,
    pub text: String,
    pub image_url: Option<String>,
    pub prompt: Option<String>,
    pub version: i64,
    pub variants: Vec<VariantView>,
}

impl From<PageWithVariants> for PageView {
    fn from(entry: PageWithVariants) -> Self {
        let page = entry.page;
        Self {
            id: page.id,
            page_number: page.page_number,
            text: page.text,
            image_url: page.image_url,
            prompt: page.prompt,
            version: page.version,
            variants: entry.variants.into_iter().map(VariantView::from).collect(),
        }
    }
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BookView {
    pub id: Uuid,
    pub title: String,
    pub theme: String,
    pub genre: String,
    pub character: String,
    pub art_style: String,
    pub target_age: String,
    pub page_count: u32,
    pub language: String,
    pub status: String,
    pub public_reward_granted: bool,
    pub created_at: DateTime<Utc>,
    pub pages: Vec<PageView>,
}

impl From<BookDetail> for BookView {
    fn from(detail: BookDetail) -> Self {
        let book = detail.book;
        Self {
            id: book.id,
            title: book.title,
            theme: book.params.theme,
            genre: book.params.genre,
            character: book.params.character,
            art_style: book.params.art_style,
            target_age: book.params.target_age,
            page_count: book.params.page_count,
            language: book.params.language,
            status: book.status.as_str().to_string(),
            public_reward_granted: book.public_reward_granted,
            created_at: book.created_at,
            pages: detail.pages.into_iter().map(PageView::from).collect(),
        }
    }
}

#[derive(Deserialize, ToSchema)]
pub struct VisibilityRequest {
    /// One of `private`, `published`, `community`, `public`.
    pub status: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityResponse {
    pub status: String,
    pub rewarded: bool,
    pub public_reward_granted: bool,
}

//=========================================================================================
// Handlers
//=========================================================================================

/// Generate a complete picture book and charge for it.
///
/// Runs the story, scene and image stages and commits the book together with
/// the debit. Nothing is stored or charged when any stage fails.
#[utoipa::path(
    post,
    path = "/generate",
    request_body = GenerateBookRequest,
    responses(
        (status = 201, description = "Book generated", body = GenerateBookResponse),
        (status = 400, description = "Invalid parameters or insufficient credits"),
        (status = 403, description = "Job belongs to another user"),
        (status = 409, description = "Job already finished"),
        (status = 500, description = "A generation stage failed; nothing was committed")
    )
)]
pub async fn generate_book_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Json(req): Json<GenerateBookRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (request, job_id) = req.into_parts();
    let book = spawn_generation(&state.studio, user_id, request, job_id)
        .await
        .map_err(|e| ApiError::Internal(format!("Generation task failed: {}", e)))??;
    Ok((
        StatusCode::CREATED,
        Json(GenerateBookResponse {
            book_id: book.id,
            title: book.title,
        }),
    ))
}

/// Runs a generation on its own task so that it finishes, and marks its job,
/// even when the requesting connection is dropped.
pub fn spawn_generation(
    studio: &BookStudio,
    user_id: Uuid,
    request: BookRequest,
    job_id: Option<Uuid>,
) -> JoinHandle<PortResult<Book>> {
    let studio = studio.clone();
    tokio::spawn(async move { studio.generate_book(user_id, request, job_id).await })
}

/// The current user's most recently created book, or `null`.
#[utoipa::path(
    get,
    path = "/latest-book-for-current-user",
    responses(
        (status = 200, description = "Latest book id, or null when the user has none", body = LatestBookResponse),
        (status = 401, description = "Not logged in")
    )
)]
pub async fn latest_book_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> Result<Json<Option<LatestBookResponse>>, ApiError> {
    let latest = state.studio.latest_book(user_id).await?;
    Ok(Json(latest.map(|book| LatestBookResponse { id: book.id })))
}

/// A book with its pages and every page's variant history.
#[utoipa::path(
    get,
    path = "/books/{id}",
    params(("id" = Uuid, Path, description = "Book id")),
    responses(
        (status = 200, description = "Book detail", body = BookView),
        (status = 403, description = "Book belongs to another user"),
        (status = 404, description = "Book not found")
    )
)]
pub async fn get_book_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(book_id): Path<Uuid>,
) -> Result<Json<BookView>, ApiError> {
    let detail = state.studio.book_detail(user_id, book_id).await?;
    Ok(Json(BookView::from(detail)))
}

/// Change a book's visibility. The first switch to `public` pays the reward once.
#[utoipa::path(
    post,
    path = "/books/{id}/visibility",
    params(("id" = Uuid, Path, description = "Book id")),
    request_body = VisibilityRequest,
    responses(
        (status = 200, description = "Visibility changed", body = VisibilityResponse),
        (status = 400, description = "Unknown status"),
        (status = 403, description = "Book belongs to another user"),
        (status = 404, description = "Book not found")
    )
)]
pub async fn set_visibility_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(book_id): Path<Uuid>,
    Json(req): Json<VisibilityRequest>,
) -> Result<Json<VisibilityResponse>, ApiError> {
    let status = req
        .status
        .parse::<BookStatus>()
        .map_err(PortError::InvalidInput)?;
    let change = state.studio.set_visibility(user_id, book_id, status).await?;
    Ok(Json(VisibilityResponse {
        status: change.book.status.as_str().to_string(),
        rewarded: change.rewarded,
        public_reward_granted: change.book.public_reward_granted,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use storybook_core::domain::JobStatus;
    use storybook_core::memory::{
        FlakyImageBackend, MemoryDatabase, MemoryObjectStorage, ScriptedTextBackend,
    };
    use storybook_core::StudioSettings;

    #[tokio::test]
    async fn generation_outlives_a_dropped_request() {
        let db = Arc::new(MemoryDatabase::new());
        let studio = BookStudio::new(
            db.clone(),
            Arc::new(ScriptedTextBackend::repeating("unused")),
            Arc::new(FlakyImageBackend::new(None)),
            Arc::new(MemoryObjectStorage::default()),
            StudioSettings::default(),
        );
        let user = db.seed_user(10).unwrap();
        let job = studio.open_generation_job(user).await.unwrap();

        let request = BookRequest {
            theme: "sharing".to_string(),
            genre: "adventure".to_string(),
            character: "fox".to_string(),
            art_style: "watercolor".to_string(),
            target_age: "3-5".to_string(),
            page_count: 5,
            language: "en".to_string(),
        };
        drop(spawn_generation(&studio, user, request, Some(job.id)));

        let status = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let job = studio.generation_job(user, job.id).await.unwrap();
                if job.status != JobStatus::Generating {
                    return job.status;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(status, JobStatus::Failed);
    }

    #[test]
    fn generate_request_accepts_camel_case_and_optional_fields() {
        let req: GenerateBookRequest = serde_json::from_value(serde_json::json!({
            "theme": "friendship",
            "genre": "adventure",
            "character": "fox",
            "artStyle": "watercolor",
            "targetAge": "3-5",
            "pageCount": 5
        }))
        .unwrap();
        let (request, job_id) = req.into_parts();
        assert_eq!(request.art_style, "watercolor");
        assert_eq!(request.page_count, 5);
        assert!(request.language.is_empty());
        assert!(job_id.is_none());
    }

    #[test]
    fn generate_response_uses_book_id_key() {
        let json = serde_json::to_value(GenerateBookResponse {
            book_id: Uuid::nil(),
            title: "T".to_string(),
        })
        .unwrap();
        assert!(json.get("bookId").is_some());
    }
}
