//! crates/storybook_core/src/recovery.rs
//!
//! Client-side recovery of an interrupted generation.
//!
//! Before a paid generation is submitted the client records a `JobMarker`. After
//! any reload it runs `check_pending_generation`, which only observes server
//! state: it never resubmits and never triggers billing. A marker older than
//! `RECOVERY_TIMEOUT_MINUTES` is dropped without asking the server.

use crate::domain::JobStatus;
use crate::ports::PortResult;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};
use uuid::Uuid;

pub const RECOVERY_TIMEOUT_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerStatus {
    Generating,
}

/// The advisory record of an in-flight generation, held by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMarker {
    pub status: MarkerStatus,
    pub started_at: DateTime<Utc>,
    /// Server-issued job id, when the client obtained one before submitting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

impl JobMarker {
    pub fn generating(started_at: DateTime<Utc>, job_id: Option<Uuid>) -> Self {
        Self {
            status: MarkerStatus::Generating,
            started_at,
            job_id,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.started_at >= Duration::minutes(RECOVERY_TIMEOUT_MINUTES)
    }
}

/// Durable client-local storage for the single marker record.
#[async_trait]
pub trait MarkerStore: Send + Sync {
    async fn load(&self) -> PortResult<Option<JobMarker>>;
    async fn save(&self, marker: &JobMarker) -> PortResult<()>;
    async fn clear(&self) -> PortResult<()>;
}

/// What the server reports for a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub book_id: Option<Uuid>,
}

/// The read-only server queries recovery relies on.
#[async_trait]
pub trait BookLocator: Send + Sync {
    /// Id of the current user's most recently created book.
    async fn latest_book_id(&self) -> PortResult<Option<Uuid>>;

    async fn job_status(&self, job_id: Uuid) -> PortResult<JobSnapshot>;
}

/// Where the client should go after a recovery check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No marker; nothing was pending.
    Idle,
    /// The job is still running; the marker is kept.
    StillGenerating,
    /// The generation finished; open this book's edit view.
    OpenBook(Uuid),
    /// Outcome unknown or failed; go to the neutral landing view.
    Landing,
    /// Another check is already running in this page lifecycle.
    AlreadyChecking,
}

/// Same-lifecycle re-entrancy guard for the recovery check.
#[derive(Debug, Default)]
pub struct RecoveryGuard {
    running: AtomicBool,
}

/// Releases the guard when dropped.
pub struct GuardToken<'a> {
    guard: &'a RecoveryGuard,
}

impl RecoveryGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_enter(&self) -> Option<GuardToken<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GuardToken { guard: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}

/// Records a new marker immediately before a generation request is issued.
pub async fn begin_generation(
    store: &dyn MarkerStore,
    now: DateTime<Utc>,
    job_id: Option<Uuid>,
) -> PortResult<JobMarker> {
    let marker = JobMarker::generating(now, job_id);
    store.save(&marker).await?;
    Ok(marker)
}

/// Clears the marker after the generation request returned (success or error).
pub async fn finish_generation(store: &dyn MarkerStore) -> PortResult<()> {
    store.clear().await
}

/// Reconciles a pending marker with the server.
///
/// Never fails: every error path clears the marker and lands on the neutral view.
pub async fn check_pending_generation(
    store: &dyn MarkerStore,
    locator: &dyn BookLocator,
    guard: &RecoveryGuard,
    now: DateTime<Utc>,
) -> RecoveryOutcome {
    let Some(_token) = guard.try_enter() else {
        return RecoveryOutcome::AlreadyChecking;
    };

    let marker = match store.load().await {
        Ok(Some(marker)) => marker,
        Ok(None) => return RecoveryOutcome::Idle,
        Err(e) => {
            warn!(error = %e, "Could not read generation marker");
            clear_quietly(store).await;
            return RecoveryOutcome::Landing;
        }
    };

    if marker.is_expired(now) {
        info!(started_at = %marker.started_at, "Generation marker expired");
        clear_quietly(store).await;
        return RecoveryOutcome::Landing;
    }

    let outcome = match marker.job_id {
        Some(job_id) => match locator.job_status(job_id).await {
            Ok(JobSnapshot {
                status: JobStatus::Succeeded,
                book_id: Some(book_id),
            }) => RecoveryOutcome::OpenBook(book_id),
            Ok(JobSnapshot {
                status: JobStatus::Generating,
                ..
            }) => RecoveryOutcome::StillGenerating,
            Ok(snapshot) => {
                info!(%job_id, status = snapshot.status.as_str(), "Generation did not produce a book");
                RecoveryOutcome::Landing
            }
            Err(e) => {
                warn!(%job_id, error = %e, "Job status query failed");
                RecoveryOutcome::Landing
            }
        },
        None => match locator.latest_book_id().await {
            Ok(Some(book_id)) => RecoveryOutcome::OpenBook(book_id),
            Ok(None) => RecoveryOutcome::StillGenerating,
            Err(e) => {
                warn!(error = %e, "Latest book query failed");
                RecoveryOutcome::Landing
            }
        },
    };

    if outcome != RecoveryOutcome::StillGenerating {
        clear_quietly(store).await;
    }
    outcome
}

async fn clear_quietly(store: &dyn MarkerStore) {
    if let Err(e) = store.clear().await {
        warn!(error = %e, "Could not clear generation marker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_serializes_with_camel_case_fields() {
        let started_at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let json = serde_json::to_value(JobMarker::generating(started_at, None)).unwrap();
        assert_eq!(json["status"], "generating");
        assert_eq!(json["startedAt"], "2024-05-01T10:00:00Z");
        assert!(json.get("jobId").is_none());
    }

    #[test]
    fn marker_expires_at_thirty_minutes() {
        let now = Utc::now();
        let marker = JobMarker::generating(now, None);
        assert!(!marker.is_expired(now + Duration::minutes(29)));
        assert!(marker.is_expired(now + Duration::minutes(30)));
        assert!(!marker.is_expired(now - Duration::minutes(5)));
    }

    #[test]
    fn guard_rejects_reentry_until_released() {
        let guard = RecoveryGuard::new();
        let token = guard.try_enter();
        assert!(token.is_some());
        assert!(guard.try_enter().is_none());
        drop(token);
        assert!(!guard.is_running());
        assert!(guard.try_enter().is_some());
    }
}
