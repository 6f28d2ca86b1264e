//! crates/storybook_core/src/memory.rs
//!
//! In-memory implementations of the ports, for tests and local experiments.
//!
//! `MemoryDatabase` follows the same unit-of-work rules as the PostgreSQL adapter:
//! each call validates everything first and only then mutates, under one lock,
//! so a refused ledger entry leaves no trace.

use crate::domain::{
    Book, BookStatus, GenerationJob, JobStatus, LedgerEntry, NewBook, NewPageImage, Page,
    PageContext, PageImage, PointHistory, PointReason, PromptMessage, SamplerParams, User,
    UserCredentials, VisibilityChange,
};
use crate::ports::{
    DatabaseService, ImageGenerationService, ObjectStorage, PortError, PortResult,
    TextGenerationService,
};
use crate::recovery::{JobMarker, MarkerStore};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

fn poisoned<T>(_: T) -> PortError {
    PortError::Unexpected("in-memory store lock poisoned".to_string())
}

//=========================================================================================
// MemoryDatabase
//=========================================================================================

struct UserRow {
    email: Option<String>,
    hashed_password: Option<String>,
    points: i64,
}

struct PageRow {
    id: Uuid,
    book_id: Uuid,
    page_number: u32,
    text: String,
    adopted_image_id: Option<Uuid>,
    version: i64,
}

struct ImageRow {
    id: Uuid,
    page_id: Uuid,
    image_url: String,
    prompt: String,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, UserRow>,
    auth_sessions: HashMap<String, (Uuid, DateTime<Utc>)>,
    history: Vec<PointHistory>,
    books: Vec<Book>,
    pages: Vec<PageRow>,
    images: Vec<ImageRow>,
    jobs: HashMap<Uuid, GenerationJob>,
}

impl MemoryState {
    fn user(&self, user_id: Uuid) -> PortResult<&UserRow> {
        self.users
            .get(&user_id)
            .ok_or_else(|| PortError::NotFound(format!("User {} not found", user_id)))
    }

    /// Validates an entry and returns the balance it would leave.
    fn check_entry(&self, entry: &LedgerEntry) -> PortResult<i64> {
        entry.apply_to(self.user(entry.user_id)?.points)
    }

    fn write_entry(&mut self, entry: &LedgerEntry, new_balance: i64) {
        if let Some(user) = self.users.get_mut(&entry.user_id) {
            user.points = new_balance;
        }
        self.history.push(PointHistory {
            id: Uuid::new_v4(),
            user_id: entry.user_id,
            delta: entry.delta,
            reason: entry.reason,
            book_id: entry.book_id,
            page_id: entry.page_id,
            created_at: Utc::now(),
        });
    }

    fn book(&self, book_id: Uuid) -> PortResult<&Book> {
        self.books
            .iter()
            .find(|b| b.id == book_id)
            .ok_or_else(|| PortError::NotFound(format!("Book {} not found", book_id)))
    }

    fn page_row(&self, page_id: Uuid) -> PortResult<&PageRow> {
        self.pages
            .iter()
            .find(|p| p.id == page_id)
            .ok_or_else(|| PortError::NotFound(format!("Page {} not found", page_id)))
    }

    fn page_view(&self, row: &PageRow) -> Page {
        let adopted = row
            .adopted_image_id
            .and_then(|id| self.images.iter().find(|i| i.id == id));
        Page {
            id: row.id,
            book_id: row.book_id,
            page_number: row.page_number,
            text: row.text.clone(),
            adopted_image_id: row.adopted_image_id,
            image_url: adopted.map(|i| i.image_url.clone()),
            prompt: adopted.map(|i| i.prompt.clone()),
            version: row.version,
        }
    }

    fn image_view(&self, row: &ImageRow) -> PageImage {
        let is_adopted = self
            .pages
            .iter()
            .any(|p| p.id == row.page_id && p.adopted_image_id == Some(row.id));
        PageImage {
            id: row.id,
            page_id: row.page_id,
            image_url: row.image_url.clone(),
            prompt: row.prompt.clone(),
            is_adopted,
            created_at: row.created_at,
        }
    }
}

/// A `DatabaseService` kept entirely in memory.
#[derive(Default)]
pub struct MemoryDatabase {
    state: Mutex<MemoryState>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> PortResult<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(poisoned)
    }

    /// Adds a user with a starting balance and a matching signup history entry.
    pub fn seed_user(&self, points: i64) -> PortResult<Uuid> {
        let user_id = Uuid::new_v4();
        let mut state = self.lock()?;
        state.users.insert(
            user_id,
            UserRow {
                email: None,
                hashed_password: None,
                points: 0,
            },
        );
        let entry = LedgerEntry::credit(user_id, points, PointReason::Signup);
        let balance = state.check_entry(&entry)?;
        state.write_entry(&entry, balance);
        Ok(user_id)
    }

    /// Overwrites a balance without a history entry, to simulate out-of-band spending.
    pub fn force_points(&self, user_id: Uuid, points: i64) -> PortResult<()> {
        let mut state = self.lock()?;
        match state.users.get_mut(&user_id) {
            Some(user) => {
                user.points = points;
                Ok(())
            }
            None => Err(PortError::NotFound(format!("User {} not found", user_id))),
        }
    }

    pub fn book_count(&self) -> usize {
        self.state.lock().map(|s| s.books.len()).unwrap_or_default()
    }

    pub fn page_count(&self) -> usize {
        self.state.lock().map(|s| s.pages.len()).unwrap_or_default()
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().map(|s| s.images.len()).unwrap_or_default()
    }

    pub fn history_count(&self) -> usize {
        self.state.lock().map(|s| s.history.len()).unwrap_or_default()
    }
}

#[async_trait]
impl DatabaseService for MemoryDatabase {
    async fn create_user_with_email(
        &self,
        email: &str,
        hashed_password: &str,
        signup_bonus: i64,
    ) -> PortResult<User> {
        let mut state = self.lock()?;
        if state
            .users
            .values()
            .any(|u| u.email.as_deref() == Some(email))
        {
            return Err(PortError::Conflict(format!("email {} already registered", email)));
        }
        let user_id = Uuid::new_v4();
        state.users.insert(
            user_id,
            UserRow {
                email: Some(email.to_string()),
                hashed_password: Some(hashed_password.to_string()),
                points: 0,
            },
        );
        let entry = LedgerEntry::credit(user_id, signup_bonus, PointReason::Signup);
        let balance = state.check_entry(&entry)?;
        state.write_entry(&entry, balance);
        Ok(User {
            user_id,
            email: Some(email.to_string()),
            points: balance,
        })
    }

    async fn get_user_by_email(&self, email: &str) -> PortResult<UserCredentials> {
        let state = self.lock()?;
        state
            .users
            .iter()
            .find_map(|(id, u)| match (&u.email, &u.hashed_password) {
                (Some(e), Some(hash)) if e == email => Some(UserCredentials {
                    user_id: *id,
                    email: e.clone(),
                    hashed_password: hash.clone(),
                }),
                _ => None,
            })
            .ok_or_else(|| PortError::NotFound(format!("User with email {} not found", email)))
    }

    async fn get_user(&self, user_id: Uuid) -> PortResult<User> {
        let state = self.lock()?;
        let row = state.user(user_id)?;
        Ok(User {
            user_id,
            email: row.email.clone(),
            points: row.points,
        })
    }

    async fn create_auth_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()> {
        let mut state = self.lock()?;
        state
            .auth_sessions
            .insert(session_id.to_string(), (user_id, expires_at));
        Ok(())
    }

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid> {
        let state = self.lock()?;
        match state.auth_sessions.get(session_id) {
            Some((user_id, expires_at)) if *expires_at > Utc::now() => Ok(*user_id),
            _ => Err(PortError::Unauthorized),
        }
    }

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()> {
        self.lock()?.auth_sessions.remove(session_id);
        Ok(())
    }

    async fn get_point_history(&self, user_id: Uuid) -> PortResult<Vec<PointHistory>> {
        let state = self.lock()?;
        Ok(state
            .history
            .iter()
            .rev()
            .filter(|h| h.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn commit_book(
        &self,
        book: NewBook,
        debit: LedgerEntry,
        job_id: Option<Uuid>,
    ) -> PortResult<Book> {
        let mut state = self.lock()?;

        let balance = state.check_entry(&debit)?;
        if let Some(job_id) = job_id {
            match state.jobs.get(&job_id) {
                Some(job) if job.status == JobStatus::Generating => {}
                Some(job) => {
                    return Err(PortError::Conflict(format!(
                        "job {} is already {}",
                        job_id,
                        job.status.as_str()
                    )))
                }
                None => return Err(PortError::NotFound(format!("Job {} not found", job_id))),
            }
        }
        if state.books.iter().any(|b| b.id == book.id) {
            return Err(PortError::Conflict(format!("book {} already exists", book.id)));
        }

        let now = Utc::now();
        state.write_entry(&debit, balance);
        let committed = Book {
            id: book.id,
            user_id: book.user_id,
            title: book.title,
            params: book.params,
            status: BookStatus::Private,
            public_reward_granted: false,
            created_at: now,
            updated_at: now,
        };
        state.books.push(committed.clone());

        for new_page in book.pages {
            let page_id = Uuid::new_v4();
            let image_id = Uuid::new_v4();
            state.images.push(ImageRow {
                id: image_id,
                page_id,
                image_url: new_page.image.image_url,
                prompt: new_page.image.prompt,
                created_at: now,
            });
            state.pages.push(PageRow {
                id: page_id,
                book_id: committed.id,
                page_number: new_page.page_number,
                text: new_page.text,
                adopted_image_id: Some(image_id),
                version: 1,
            });
        }

        if let Some(job_id) = job_id {
            if let Some(job) = state.jobs.get_mut(&job_id) {
                job.status = JobStatus::Succeeded;
                job.book_id = Some(committed.id);
                job.updated_at = now;
            }
        }

        Ok(committed)
    }

    async fn get_book(&self, book_id: Uuid) -> PortResult<Book> {
        self.lock()?.book(book_id).cloned()
    }

    async fn get_pages_for_book(&self, book_id: Uuid) -> PortResult<Vec<Page>> {
        let state = self.lock()?;
        let mut pages: Vec<Page> = state
            .pages
            .iter()
            .filter(|p| p.book_id == book_id)
            .map(|p| state.page_view(p))
            .collect();
        pages.sort_by_key(|p| p.page_number);
        Ok(pages)
    }

    async fn latest_book_for_user(&self, user_id: Uuid) -> PortResult<Option<Book>> {
        let state = self.lock()?;
        Ok(state
            .books
            .iter()
            .rev()
            .find(|b| b.user_id == user_id)
            .cloned())
    }

    async fn update_book_visibility(
        &self,
        book_id: Uuid,
        status: BookStatus,
        reward: Option<LedgerEntry>,
    ) -> PortResult<VisibilityChange> {
        let mut state = self.lock()?;
        let already_rewarded = state.book(book_id)?.public_reward_granted;

        let payout = match reward {
            Some(entry) if !already_rewarded => {
                let balance = state.check_entry(&entry)?;
                Some((entry, balance))
            }
            _ => None,
        };

        let rewarded = payout.is_some();
        if let Some((entry, balance)) = payout {
            state.write_entry(&entry, balance);
        }
        let book = state
            .books
            .iter_mut()
            .find(|b| b.id == book_id)
            .ok_or_else(|| PortError::NotFound(format!("Book {} not found", book_id)))?;
        book.status = status;
        book.public_reward_granted |= rewarded;
        book.updated_at = Utc::now();

        Ok(VisibilityChange {
            book: book.clone(),
            rewarded,
        })
    }

    async fn get_page_context(&self, page_id: Uuid) -> PortResult<PageContext> {
        let state = self.lock()?;
        let row = state.page_row(page_id)?;
        let book = state.book(row.book_id)?.clone();
        Ok(PageContext {
            page: state.page_view(row),
            book,
        })
    }

    async fn get_page_images(&self, page_id: Uuid) -> PortResult<Vec<PageImage>> {
        let state = self.lock()?;
        state.page_row(page_id)?;
        Ok(state
            .images
            .iter()
            .filter(|i| i.page_id == page_id)
            .map(|i| state.image_view(i))
            .collect())
    }

    async fn commit_page_image(
        &self,
        image: NewPageImage,
        debit: LedgerEntry,
    ) -> PortResult<PageImage> {
        let mut state = self.lock()?;
        state.page_row(image.page_id)?;
        let balance = state.check_entry(&debit)?;

        state.write_entry(&debit, balance);
        let row = ImageRow {
            id: Uuid::new_v4(),
            page_id: image.page_id,
            image_url: image.image.image_url,
            prompt: image.image.prompt,
            created_at: Utc::now(),
        };
        let view = state.image_view(&row);
        state.images.push(row);
        Ok(view)
    }

    async fn adopt_page_image(&self, page_id: Uuid, image_url: &str) -> PortResult<Page> {
        let mut state = self.lock()?;
        state.page_row(page_id)?;
        let image_id = state
            .images
            .iter()
            .find(|i| i.page_id == page_id && i.image_url == image_url)
            .map(|i| i.id)
            .ok_or_else(|| {
                PortError::NotFound(format!("page {} has no image {}", page_id, image_url))
            })?;

        let row = state
            .pages
            .iter_mut()
            .find(|p| p.id == page_id)
            .ok_or_else(|| PortError::NotFound(format!("Page {} not found", page_id)))?;
        row.adopted_image_id = Some(image_id);
        row.version += 1;

        let row = state.page_row(page_id)?;
        Ok(state.page_view(row))
    }

    async fn create_generation_job(&self, user_id: Uuid) -> PortResult<GenerationJob> {
        let mut state = self.lock()?;
        state.user(user_id)?;
        let now = Utc::now();
        let job = GenerationJob {
            id: Uuid::new_v4(),
            user_id,
            status: JobStatus::Generating,
            book_id: None,
            created_at: now,
            updated_at: now,
        };
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_generation_job(&self, job_id: Uuid) -> PortResult<GenerationJob> {
        self.lock()?
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Job {} not found", job_id)))
    }

    async fn fail_generation_job(&self, job_id: Uuid) -> PortResult<()> {
        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| PortError::NotFound(format!("Job {} not found", job_id)))?;
        if job.status == JobStatus::Generating {
            job.status = JobStatus::Failed;
            job.updated_at = Utc::now();
        }
        Ok(())
    }
}

//=========================================================================================
// Scripted Backends
//=========================================================================================

type Responder = Box<dyn Fn(&[PromptMessage]) -> PortResult<String> + Send + Sync>;

enum Script {
    Responder(Responder),
    Sequence(Mutex<VecDeque<PortResult<String>>>),
}

/// A language backend answering from a closure or a fixed sequence, recording requests.
pub struct ScriptedTextBackend {
    script: Script,
    requests: Mutex<Vec<Vec<PromptMessage>>>,
}

impl ScriptedTextBackend {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&[PromptMessage]) -> PortResult<String> + Send + Sync + 'static,
    {
        Self {
            script: Script::Responder(Box::new(respond)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answers with each result in turn, then fails.
    pub fn sequence(responses: Vec<PortResult<String>>) -> Self {
        Self {
            script: Script::Sequence(Mutex::new(responses.into())),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(response: &str) -> Self {
        let response = response.to_string();
        Self::new(move |_| Ok(response.clone()))
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<Vec<PromptMessage>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TextGenerationService for ScriptedTextBackend {
    async fn generate(&self, messages: &[PromptMessage], _temperature: f32) -> PortResult<String> {
        self.requests.lock().map_err(poisoned)?.push(messages.to_vec());
        match &self.script {
            Script::Responder(respond) => respond(messages),
            Script::Sequence(queue) => queue
                .lock()
                .map_err(poisoned)?
                .pop_front()
                .unwrap_or_else(|| Err(PortError::Unexpected("script exhausted".to_string()))),
        }
    }
}

/// An image backend that echoes the prompt as bytes and can start failing after
/// a number of successful calls.
pub struct FlakyImageBackend {
    fail_from: Option<usize>,
    calls: AtomicUsize,
}

impl FlakyImageBackend {
    pub fn new(fail_from: Option<usize>) -> Self {
        Self {
            fail_from,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageGenerationService for FlakyImageBackend {
    async fn generate(&self, prompt: &str, _params: &SamplerParams) -> PortResult<Bytes> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_from.is_some_and(|n| call >= n) {
            return Err(PortError::Upstream(format!("image backend failed on call {}", call)));
        }
        Ok(Bytes::from(prompt.as_bytes().to_vec()))
    }
}

/// Object storage backed by a map; URLs use the `memory://` scheme.
#[derive(Default)]
pub struct MemoryObjectStorage {
    objects: Mutex<HashMap<String, Bytes>>,
}

impl MemoryObjectStorage {
    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().ok().and_then(|o| o.get(key).cloned())
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put(&self, bytes: Bytes, key: &str, _content_type: &str) -> PortResult<String> {
        self.objects
            .lock()
            .map_err(poisoned)?
            .insert(key.to_string(), bytes);
        Ok(format!("memory://{}", key))
    }
}

//=========================================================================================
// Client-side Marker Store
//=========================================================================================

/// A marker store held in memory, with switchable read failures.
#[derive(Default)]
pub struct MemoryMarkerStore {
    marker: Mutex<Option<JobMarker>>,
    fail_reads: std::sync::atomic::AtomicBool,
}

impl MemoryMarkerStore {
    pub fn with_marker(marker: JobMarker) -> Self {
        Self {
            marker: Mutex::new(Some(marker)),
            ..Self::default()
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn current(&self) -> Option<JobMarker> {
        self.marker.lock().ok().and_then(|m| m.clone())
    }
}

#[async_trait]
impl MarkerStore for MemoryMarkerStore {
    async fn load(&self) -> PortResult<Option<JobMarker>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("marker storage unavailable".to_string()));
        }
        Ok(self.marker.lock().map_err(poisoned)?.clone())
    }

    async fn save(&self, marker: &JobMarker) -> PortResult<()> {
        *self.marker.lock().map_err(poisoned)? = Some(marker.clone());
        Ok(())
    }

    async fn clear(&self) -> PortResult<()> {
        *self.marker.lock().map_err(poisoned)? = None;
        Ok(())
    }
}
