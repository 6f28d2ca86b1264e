//! services/api/src/client.rs
//!
//! The client side of generation recovery: an HTTP client for the storybook API
//! and a marker store that keeps the pending-generation marker in a JSON file.

use crate::web::auth::{AuthResponse, LoginRequest};
use crate::web::books::{GenerateBookRequest, GenerateBookResponse, LatestBookResponse};
use crate::web::jobs::JobView;
use crate::web::middleware::SESSION_COOKIE;
use async_trait::async_trait;
use reqwest::{header, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use storybook_core::domain::JobStatus;
use storybook_core::ports::{PortError, PortResult};
use storybook_core::recovery::{BookLocator, JobMarker, JobSnapshot, MarkerStore};
use tracing::debug;
use uuid::Uuid;

//=========================================================================================
// HTTP Client
//=========================================================================================

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    required: Option<i64>,
    #[serde(default)]
    current: Option<i64>,
}

/// Maps a failed response back to the `PortError` the server started from.
fn error_from_status(status: StatusCode, body: &str) -> PortError {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok();
    let message = parsed
        .as_ref()
        .map(|b| b.error.clone())
        .unwrap_or_else(|| body.to_string());

    match status {
        StatusCode::BAD_REQUEST => match parsed {
            Some(ErrorBody {
                required: Some(required),
                current: Some(current),
                ..
            }) => PortError::InsufficientCredits { required, current },
            _ => PortError::InvalidInput(message),
        },
        StatusCode::UNAUTHORIZED => PortError::Unauthorized,
        StatusCode::FORBIDDEN => PortError::Forbidden(message),
        StatusCode::NOT_FOUND => PortError::NotFound(message),
        StatusCode::CONFLICT => PortError::Conflict(message),
        other => PortError::Upstream(format!("HTTP {}: {}", other, message)),
    }
}

fn session_from_set_cookie(response: &Response) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|cookie| {
            cookie
                .split(';')
                .next()?
                .trim()
                .strip_prefix(SESSION_COOKIE)?
                .strip_prefix('=')
                .map(str::to_string)
        })
        .filter(|id| !id.is_empty())
}

/// A logged-in client of the storybook API.
#[derive(Clone)]
pub struct HttpStudioClient {
    http: reqwest::Client,
    base_url: String,
    session: Option<String>,
}

impl HttpStudioClient {
    pub fn new(base_url: &str) -> PortResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            session: None,
        })
    }

    /// Uses an existing auth session id instead of logging in.
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.session {
            Some(session) => builder.header(header::COOKIE, format!("{}={}", SESSION_COOKIE, session)),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> PortResult<T> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .map_err(|e| PortError::Upstream(format!("Request failed: {}", e)))?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> PortResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_status(status, &body));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| PortError::Upstream(format!("Malformed response: {}", e)))
    }

    /// Logs in and keeps the session cookie for later requests.
    pub async fn login(&mut self, email: &str, password: &str) -> PortResult<AuthResponse> {
        let response = self
            .http
            .post(self.url("/auth/login"))
            .json(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await
            .map_err(|e| PortError::Upstream(format!("Request failed: {}", e)))?;

        let session = session_from_set_cookie(&response);
        let auth: AuthResponse = Self::decode(response).await?;
        self.session = Some(session.ok_or(PortError::Unauthorized)?);
        debug!(user_id = %auth.user_id, "Logged in");
        Ok(auth)
    }

    pub async fn open_job(&self) -> PortResult<JobView> {
        self.send(self.http.post(self.url("/generation-jobs"))).await
    }

    pub async fn generate(&self, request: &GenerateBookRequest) -> PortResult<GenerateBookResponse> {
        self.send(self.http.post(self.url("/generate")).json(request))
            .await
    }
}

#[async_trait]
impl BookLocator for HttpStudioClient {
    async fn latest_book_id(&self) -> PortResult<Option<Uuid>> {
        let latest: Option<LatestBookResponse> = self
            .send(self.http.get(self.url("/latest-book-for-current-user")))
            .await?;
        Ok(latest.map(|book| book.id))
    }

    async fn job_status(&self, job_id: Uuid) -> PortResult<JobSnapshot> {
        let job: JobView = self
            .send(self.http.get(self.url(&format!("/generation-jobs/{}", job_id))))
            .await?;
        Ok(JobSnapshot {
            status: job.status.parse::<JobStatus>().map_err(PortError::Unexpected)?,
            book_id: job.book_id,
        })
    }
}

//=========================================================================================
// File Marker Store
//=========================================================================================

/// Keeps the single generation marker as a JSON file.
#[derive(Clone, Debug)]
pub struct FileMarkerStore {
    path: PathBuf,
}

impl FileMarkerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MarkerStore for FileMarkerStore {
    async fn load(&self) -> PortResult<Option<JobMarker>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PortError::Unexpected(e.to_string())),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| PortError::Unexpected(format!("Unreadable marker {}: {}", self.path.display(), e)))
    }

    async fn save(&self, marker: &JobMarker) -> PortResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PortError::Unexpected(e.to_string()))?;
        }
        let json = serde_json::to_vec_pretty(marker).map_err(|e| PortError::Unexpected(e.to_string()))?;
        let partial = self.path.with_extension("partial");
        tokio::fs::write(&partial, json)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        tokio::fs::rename(&partial, &self.path)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))
    }

    async fn clear(&self) -> PortResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PortError::Unexpected(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use storybook_core::recovery::{check_pending_generation, RecoveryGuard, RecoveryOutcome};
    use tempfile::TempDir;

    #[tokio::test]
    async fn marker_file_round_trips_and_clears() {
        let dir = TempDir::new().unwrap();
        let store = FileMarkerStore::new(dir.path().join("state").join("generation.json"));
        assert!(store.load().await.unwrap().is_none());

        let marker = JobMarker::generating(Utc::now(), Some(Uuid::new_v4()));
        store.save(&marker).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(marker));

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn marker_file_uses_camel_case_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("generation.json");
        tokio::fs::write(
            &path,
            r#"{"status":"generating","startedAt":"2024-05-01T10:00:00Z"}"#,
        )
        .await
        .unwrap();

        let marker = FileMarkerStore::new(&path).load().await.unwrap().unwrap();
        assert!(marker.job_id.is_none());
        assert_eq!(marker.started_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[tokio::test]
    async fn corrupt_marker_lands_and_is_removed() {
        struct Unreachable;

        #[async_trait]
        impl BookLocator for Unreachable {
            async fn latest_book_id(&self) -> PortResult<Option<Uuid>> {
                Err(PortError::Upstream("offline".to_string()))
            }
            async fn job_status(&self, _job_id: Uuid) -> PortResult<JobSnapshot> {
                Err(PortError::Upstream("offline".to_string()))
            }
        }

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("generation.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let store = FileMarkerStore::new(&path);

        let outcome = check_pending_generation(
            &store,
            &Unreachable,
            &RecoveryGuard::new(),
            Utc::now() + Duration::minutes(1),
        )
        .await;
        assert_eq!(outcome, RecoveryOutcome::Landing);
        assert!(!path.exists());
    }

    #[test]
    fn insufficient_credit_body_maps_back() {
        let err = error_from_status(
            StatusCode::BAD_REQUEST,
            r#"{"error":"Insufficient credits","required":150,"current":50}"#,
        );
        assert!(matches!(
            err,
            PortError::InsufficientCredits { required: 150, current: 50 }
        ));
    }

    #[test]
    fn status_codes_map_to_port_errors() {
        let body = r#"{"error":"nope"}"#;
        assert!(matches!(
            error_from_status(StatusCode::BAD_REQUEST, body),
            PortError::InvalidInput(m) if m == "nope"
        ));
        assert!(matches!(
            error_from_status(StatusCode::UNAUTHORIZED, body),
            PortError::Unauthorized
        ));
        assert!(matches!(
            error_from_status(StatusCode::CONFLICT, body),
            PortError::Conflict(_)
        ));
        assert!(matches!(
            error_from_status(StatusCode::BAD_GATEWAY, "plain text"),
            PortError::Upstream(m) if m.contains("plain text")
        ));
    }
}
