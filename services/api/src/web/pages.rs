//! services/api/src/web/pages.rs
//!
//! Variant endpoints: paid regeneration of a page image (same prompt or refined
//! by feedback) and adopting a variant as the page's canonical image.

use crate::error::ApiError;
use crate::web::middleware::CurrentUser;
use crate::web::state::AppState;
use axum::{extract::State, Extension, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegenerateRequest {
    pub page_id: Uuid,
    pub base_image_url: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegenerateResponse {
    pub new_image_url: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefineRequest {
    pub page_id: Uuid,
    pub base_image_url: String,
    pub feedback: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefineResponse {
    pub new_image_url: String,
    pub new_scene_prompt: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplyImageRequest {
    pub page_id: Uuid,
    pub new_image_url: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplyImageResponse {
    pub success: bool,
    /// The page version after the adoption.
    pub version: i64,
}

/// Render a new pending variant with the exact prompt of an existing one.
#[utoipa::path(
    post,
    path = "/regenerate-page-image",
    request_body = RegenerateRequest,
    responses(
        (status = 200, description = "Pending variant created", body = RegenerateResponse),
        (status = 400, description = "Insufficient credits"),
        (status = 403, description = "Page belongs to another user"),
        (status = 404, description = "Page or base image not found"),
        (status = 500, description = "Generation failed; nothing was charged")
    )
)]
pub async fn regenerate_page_image_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Json(req): Json<RegenerateRequest>,
) -> Result<Json<RegenerateResponse>, ApiError> {
    let variant = state
        .studio
        .regenerate_page_image(user_id, req.page_id, &req.base_image_url)
        .await?;
    Ok(Json(RegenerateResponse {
        new_image_url: variant.image_url,
    }))
}

/// Revise a variant's scene with feedback and render it as a new pending variant.
#[utoipa::path(
    post,
    path = "/refine-and-regenerate-page-image",
    request_body = RefineRequest,
    responses(
        (status = 200, description = "Pending variant created", body = RefineResponse),
        (status = 400, description = "Empty feedback or insufficient credits"),
        (status = 403, description = "Page belongs to another user"),
        (status = 404, description = "Page or base image not found"),
        (status = 500, description = "Generation failed; nothing was charged")
    )
)]
pub async fn refine_page_image_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Json(req): Json<RefineRequest>,
) -> Result<Json<RefineResponse>, ApiError> {
    let refined = state
        .studio
        .refine_and_regenerate_page_image(user_id, req.page_id, &req.base_image_url, &req.feedback)
        .await?;
    Ok(Json(RefineResponse {
        new_image_url: refined.image.image_url,
        new_scene_prompt: refined.scene_prompt,
    }))
}

/// Adopt a variant as the page's canonical image.
#[utoipa::path(
    post,
    path = "/apply-new-image",
    request_body = ApplyImageRequest,
    responses(
        (status = 200, description = "Variant adopted", body = ApplyImageResponse),
        (status = 403, description = "Page belongs to another user"),
        (status = 404, description = "Page or image not found")
    )
)]
pub async fn apply_new_image_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Json(req): Json<ApplyImageRequest>,
) -> Result<Json<ApplyImageResponse>, ApiError> {
    let page = state
        .studio
        .apply_new_image(user_id, req.page_id, &req.new_image_url)
        .await?;
    Ok(Json(ApplyImageResponse {
        success: true,
        version: page.version,
    }))
}
