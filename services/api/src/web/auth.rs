//! services/api/src/web/auth.rs
//!
//! Authentication endpoints for user signup, login, and logout.

use crate::error::ApiError;
use crate::web::middleware::{session_id_from_headers, SESSION_COOKIE};
use crate::web::state::AppState;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use storybook_core::ports::PortError;
use tracing::{error, info};
use utoipa::ToSchema;
use uuid::Uuid;

const SESSION_DAYS: i64 = 30;
const MIN_PASSWORD_LEN: usize = 8;

//=========================================================================================
// Request/Response Types
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub user_id: Uuid,
    pub email: String,
    pub points: i64,
}

//=========================================================================================
// Helpers
//=========================================================================================

fn session_cookie(auth_session_id: &str, max_age_seconds: i64) -> String {
    format!(
        "{}={}; HttpOnly; Secure; SameSite=Lax; Path=/; Max-Age={}",
        SESSION_COOKIE, auth_session_id, max_age_seconds
    )
}

/// Creates a login session for `user_id` and returns its `Set-Cookie` value.
async fn open_session(state: &AppState, user_id: Uuid) -> Result<String, ApiError> {
    let auth_session_id = Uuid::new_v4().to_string();
    let expires_at = Utc::now() + Duration::days(SESSION_DAYS);
    state
        .db
        .create_auth_session(&auth_session_id, user_id, expires_at)
        .await?;
    Ok(session_cookie(
        &auth_session_id,
        Duration::days(SESSION_DAYS).num_seconds(),
    ))
}

fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| {
            error!("Failed to hash password: {:?}", e);
            ApiError::Internal("Failed to hash password".to_string())
        })
}

fn invalid_credentials() -> ApiError {
    ApiError::Port(PortError::Unauthorized)
}

//=========================================================================================
// Handlers
//=========================================================================================

/// POST /auth/signup - Create a new user account with the signup bonus
#[utoipa::path(
    post,
    path = "/auth/signup",
    request_body = SignupRequest,
    responses(
        (status = 201, description = "User created successfully", body = AuthResponse),
        (status = 400, description = "Invalid request"),
        (status = 409, description = "Email already registered"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn signup_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let email = req.email.trim().to_lowercase();
    if !email.contains('@') {
        return Err(PortError::InvalidInput("email address is not valid".to_string()).into());
    }
    if req.password.len() < MIN_PASSWORD_LEN {
        return Err(PortError::InvalidInput(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        ))
        .into());
    }

    let password_hash = hash_password(&req.password)?;
    let user = state
        .db
        .create_user_with_email(&email, &password_hash, state.config.pricing.signup_bonus)
        .await?;
    let cookie = open_session(&state, user.user_id).await?;
    info!(user_id = %user.user_id, points = user.points, "User signed up");

    let response = AuthResponse {
        user_id: user.user_id,
        email: user.email.unwrap_or(email),
        points: user.points,
    };
    Ok((
        StatusCode::CREATED,
        [(header::SET_COOKIE, cookie)],
        Json(response),
    ))
}

/// POST /auth/login - Login with existing account
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 401, description = "Invalid credentials"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let email = req.email.trim().to_lowercase();
    let user_creds = match state.db.get_user_by_email(&email).await {
        Ok(creds) => creds,
        Err(PortError::NotFound(_)) => return Err(invalid_credentials()),
        Err(e) => return Err(e.into()),
    };

    let parsed_hash = PasswordHash::new(&user_creds.hashed_password).map_err(|e| {
        error!("Failed to parse password hash: {:?}", e);
        ApiError::Internal("Authentication error".to_string())
    })?;
    if Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .is_err()
    {
        return Err(invalid_credentials());
    }

    let user = state.db.get_user(user_creds.user_id).await?;
    let cookie = open_session(&state, user.user_id).await?;

    let response = AuthResponse {
        user_id: user.user_id,
        email: user_creds.email,
        points: user.points,
    };
    Ok((StatusCode::OK, [(header::SET_COOKIE, cookie)], Json(response)))
}

/// POST /auth/logout - Logout and invalidate session
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 200, description = "Logout successful"),
        (status = 401, description = "No active session")
    )
)]
pub async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let auth_session_id = session_id_from_headers(&headers).ok_or_else(invalid_credentials)?;
    state.db.delete_auth_session(auth_session_id).await?;
    Ok((StatusCode::OK, [(header::SET_COOKIE, session_cookie("", 0))]))
}
