//! services/api/src/web/rest.rs
//!
//! Contains the credit balance endpoint and the master definition for the
//! OpenAPI specification.

use crate::error::ApiError;
use crate::web::{auth, books, jobs, middleware::CurrentUser, pages, state::AppState};
use axum::{extract::State, Extension, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use storybook_core::domain::PointHistory;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        auth::signup_handler,
        auth::login_handler,
        auth::logout_handler,
        books::generate_book_handler,
        books::latest_book_handler,
        books::get_book_handler,
        books::set_visibility_handler,
        pages::regenerate_page_image_handler,
        pages::refine_page_image_handler,
        pages::apply_new_image_handler,
        jobs::open_job_handler,
        jobs::get_job_handler,
        points_handler,
    ),
    components(
        schemas(
            auth::SignupRequest,
            auth::LoginRequest,
            auth::AuthResponse,
            books::GenerateBookRequest,
            books::GenerateBookResponse,
            books::LatestBookResponse,
            books::BookView,
            books::PageView,
            books::VariantView,
            books::VisibilityRequest,
            books::VisibilityResponse,
            pages::RegenerateRequest,
            pages::RegenerateResponse,
            pages::RefineRequest,
            pages::RefineResponse,
            pages::ApplyImageRequest,
            pages::ApplyImageResponse,
            jobs::JobView,
            PointsResponse,
            PointEntryView,
        )
    ),
    tags(
        (name = "Storybook API", description = "Picture book generation, page variants and credits.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response Structs
//=========================================================================================

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PointEntryView {
    pub id: Uuid,
    pub delta: i64,
    pub reason: String,
    pub book_id: Option<Uuid>,
    pub page_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<PointHistory> for PointEntryView {
    fn from(entry: PointHistory) -> Self {
        Self {
            id: entry.id,
            delta: entry.delta,
            reason: entry.reason.as_str().to_string(),
            book_id: entry.book_id,
            page_id: entry.page_id,
            created_at: entry.created_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct PointsResponse {
    pub points: i64,
    /// Newest first.
    pub history: Vec<PointEntryView>,
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// The current credit balance and its history.
#[utoipa::path(
    get,
    path = "/points",
    responses(
        (status = 200, description = "Balance and history", body = PointsResponse),
        (status = 401, description = "Not logged in")
    )
)]
pub async fn points_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> Result<Json<PointsResponse>, ApiError> {
    let (user, history) = state.studio.point_statement(user_id).await?;
    Ok(Json(PointsResponse {
        points: user.points,
        history: history.into_iter().map(PointEntryView::from).collect(),
    }))
}
