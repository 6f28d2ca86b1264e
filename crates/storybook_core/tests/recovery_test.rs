//! Recovery of an interrupted generation from the client-side marker.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use storybook_core::domain::JobStatus;
use storybook_core::memory::MemoryMarkerStore;
use storybook_core::ports::{PortError, PortResult};
use storybook_core::recovery::{
    begin_generation, check_pending_generation, finish_generation, JobSnapshot,
};
use storybook_core::{BookLocator, JobMarker, RecoveryGuard, RecoveryOutcome};
use uuid::Uuid;

/// Answers recovery queries from fixed values and counts them.
struct StubLocator {
    latest: PortResult<Option<Uuid>>,
    job: PortResult<JobSnapshot>,
    queries: AtomicUsize,
}

impl StubLocator {
    fn latest(latest: PortResult<Option<Uuid>>) -> Self {
        Self {
            latest,
            job: Err(PortError::NotFound("no job".to_string())),
            queries: AtomicUsize::new(0),
        }
    }

    fn job(job: PortResult<JobSnapshot>) -> Self {
        Self {
            latest: Ok(None),
            job,
            queries: AtomicUsize::new(0),
        }
    }

    fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BookLocator for StubLocator {
    async fn latest_book_id(&self) -> PortResult<Option<Uuid>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.latest.clone()
    }

    async fn job_status(&self, _job_id: Uuid) -> PortResult<JobSnapshot> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.job.clone()
    }
}

fn marker_minutes_ago(minutes: i64, job_id: Option<Uuid>) -> MemoryMarkerStore {
    MemoryMarkerStore::with_marker(JobMarker::generating(
        Utc::now() - Duration::minutes(minutes),
        job_id,
    ))
}

#[tokio::test]
async fn no_marker_is_idle() {
    let store = MemoryMarkerStore::default();
    let locator = StubLocator::latest(Ok(Some(Uuid::new_v4())));
    let outcome =
        check_pending_generation(&store, &locator, &RecoveryGuard::new(), Utc::now()).await;
    assert_eq!(outcome, RecoveryOutcome::Idle);
    assert_eq!(locator.queries(), 0);
}

#[tokio::test]
async fn recent_marker_with_a_book_opens_it_and_clears() {
    let book_id = Uuid::new_v4();
    let store = marker_minutes_ago(5, None);
    let locator = StubLocator::latest(Ok(Some(book_id)));

    let outcome =
        check_pending_generation(&store, &locator, &RecoveryGuard::new(), Utc::now()).await;
    assert_eq!(outcome, RecoveryOutcome::OpenBook(book_id));
    assert!(store.current().is_none());
}

#[tokio::test]
async fn recent_marker_without_a_book_keeps_waiting() {
    let store = marker_minutes_ago(2, None);
    let locator = StubLocator::latest(Ok(None));

    let outcome =
        check_pending_generation(&store, &locator, &RecoveryGuard::new(), Utc::now()).await;
    assert_eq!(outcome, RecoveryOutcome::StillGenerating);
    assert!(store.current().is_some());
}

#[tokio::test]
async fn expired_marker_lands_without_asking_the_server() {
    let store = marker_minutes_ago(30, None);
    let locator = StubLocator::latest(Ok(Some(Uuid::new_v4())));

    let outcome =
        check_pending_generation(&store, &locator, &RecoveryGuard::new(), Utc::now()).await;
    assert_eq!(outcome, RecoveryOutcome::Landing);
    assert!(store.current().is_none());
    assert_eq!(locator.queries(), 0);
}

#[tokio::test]
async fn server_error_lands_and_clears() {
    let store = marker_minutes_ago(1, None);
    let locator = StubLocator::latest(Err(PortError::Upstream("connection refused".to_string())));

    let outcome =
        check_pending_generation(&store, &locator, &RecoveryGuard::new(), Utc::now()).await;
    assert_eq!(outcome, RecoveryOutcome::Landing);
    assert!(store.current().is_none());
}

#[tokio::test]
async fn unreadable_marker_lands() {
    let store = marker_minutes_ago(1, None);
    store.fail_reads(true);
    let locator = StubLocator::latest(Ok(Some(Uuid::new_v4())));

    let outcome =
        check_pending_generation(&store, &locator, &RecoveryGuard::new(), Utc::now()).await;
    assert_eq!(outcome, RecoveryOutcome::Landing);
    assert_eq!(locator.queries(), 0);
    store.fail_reads(false);
    assert!(store.current().is_none());
}

#[tokio::test]
async fn job_marker_follows_the_job_status() {
    let book_id = Uuid::new_v4();
    let cases = [
        (
            Ok(JobSnapshot { status: JobStatus::Succeeded, book_id: Some(book_id) }),
            RecoveryOutcome::OpenBook(book_id),
            false,
        ),
        (
            Ok(JobSnapshot { status: JobStatus::Generating, book_id: None }),
            RecoveryOutcome::StillGenerating,
            true,
        ),
        (
            Ok(JobSnapshot { status: JobStatus::Failed, book_id: None }),
            RecoveryOutcome::Landing,
            false,
        ),
        (
            Err(PortError::NotFound("job".to_string())),
            RecoveryOutcome::Landing,
            false,
        ),
    ];

    for (snapshot, expected, kept) in cases {
        let store = marker_minutes_ago(3, Some(Uuid::new_v4()));
        let locator = StubLocator::job(snapshot);
        let outcome =
            check_pending_generation(&store, &locator, &RecoveryGuard::new(), Utc::now()).await;
        assert_eq!(outcome, expected);
        assert_eq!(store.current().is_some(), kept);
    }
}

#[tokio::test]
async fn concurrent_check_in_the_same_lifecycle_is_rejected() {
    let store = marker_minutes_ago(1, None);
    let locator = StubLocator::latest(Ok(Some(Uuid::new_v4())));
    let guard = RecoveryGuard::new();

    let _held = guard.try_enter().unwrap();
    let outcome = check_pending_generation(&store, &locator, &guard, Utc::now()).await;
    assert_eq!(outcome, RecoveryOutcome::AlreadyChecking);
    assert!(store.current().is_some());
    assert_eq!(locator.queries(), 0);
}

#[tokio::test]
async fn marker_lifecycle_around_a_submission() {
    let store = MemoryMarkerStore::default();
    let job_id = Uuid::new_v4();
    let marker = begin_generation(&store, Utc::now(), Some(job_id)).await.unwrap();
    assert_eq!(store.current(), Some(marker));
    assert_eq!(store.current().and_then(|m| m.job_id), Some(job_id));

    finish_generation(&store).await.unwrap();
    assert!(store.current().is_none());
}
