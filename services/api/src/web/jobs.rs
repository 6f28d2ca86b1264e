//! services/api/src/web/jobs.rs
//!
//! Generation job endpoints. A client asks for a job id before submitting a
//! generation so that it can later learn whether that exact run finished.

use crate::error::ApiError;
use crate::web::middleware::CurrentUser;
use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use storybook_core::domain::GenerationJob;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: Uuid,
    /// One of `generating`, `succeeded`, `failed`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_id: Option<Uuid>,
}

impl From<GenerationJob> for JobView {
    fn from(job: GenerationJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status.as_str().to_string(),
            book_id: job.book_id,
        }
    }
}

/// Open a generation job to pass as `jobId` to `POST /generate`.
#[utoipa::path(
    post,
    path = "/generation-jobs",
    responses(
        (status = 201, description = "Job opened", body = JobView),
        (status = 401, description = "Not logged in")
    )
)]
pub async fn open_job_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.studio.open_generation_job(user_id).await?;
    Ok((StatusCode::CREATED, Json(JobView::from(job))))
}

/// Current status of a generation job.
#[utoipa::path(
    get,
    path = "/generation-jobs/{id}",
    params(("id" = Uuid, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job status", body = JobView),
        (status = 403, description = "Job belongs to another user"),
        (status = 404, description = "Job not found")
    )
)]
pub async fn get_job_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    let job = state.studio.generation_job(user_id, job_id).await?;
    Ok(Json(JobView::from(job)))
}
