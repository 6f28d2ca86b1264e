//! services/api/src/web/middleware.rs
//!
//! Authentication middleware for protecting routes.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::web::state::AppState;

/// The name of the cookie carrying the auth session id.
pub const SESSION_COOKIE: &str = "session";

/// The id of the authenticated user, inserted into request extensions by `require_auth`.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub Uuid);

/// Extracts the auth session id from the `Cookie` header, if present.
pub fn session_id_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())?
        .split(';')
        .find_map(|c| {
            c.trim()
                .strip_prefix(SESSION_COOKIE)
                .and_then(|rest| rest.strip_prefix('='))
        })
        .filter(|id| !id.is_empty())
}

/// Middleware that validates the auth session cookie and resolves the user.
///
/// If valid, inserts a `CurrentUser` into request extensions for handlers to use.
/// If invalid or missing, returns 401 Unauthorized.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_session_id = session_id_from_headers(req.headers())
        .ok_or(StatusCode::UNAUTHORIZED)?
        .to_string();

    let user_id = state
        .db
        .validate_auth_session(&auth_session_id)
        .await
        .map_err(|e| {
            warn!(error = %e, "Rejected auth session");
            StatusCode::UNAUTHORIZED
        })?;

    req.extensions_mut().insert(CurrentUser(user_id));
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(cookie).unwrap());
        headers
    }

    #[test]
    fn session_cookie_is_found_among_others() {
        assert_eq!(
            session_id_from_headers(&headers("theme=dark; session=abc-123; lang=en")),
            Some("abc-123")
        );
    }

    #[test]
    fn similar_names_and_empty_values_are_ignored() {
        assert_eq!(session_id_from_headers(&headers("sessionx=1")), None);
        assert_eq!(session_id_from_headers(&headers("session=")), None);
        assert_eq!(session_id_from_headers(&HeaderMap::new()), None);
    }
}
