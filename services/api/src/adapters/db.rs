//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `DatabaseService` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.
//!
//! Every operation that carries a `LedgerEntry` runs in one transaction: the
//! user's row is locked, the entry is checked against the balance, and the
//! balance, the history row and the rest of the work are written together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use storybook_core::domain::{
    Book, BookParams, BookStatus, GenerationJob, JobStatus, LedgerEntry, NewBook, NewPageImage,
    Page, PageContext, PageImage, PointHistory, PointReason, User, UserCredentials, VisibilityChange,
};
use storybook_core::ports::{DatabaseService, PortError, PortResult};
use tracing::debug;
use uuid::Uuid;

type PgTransaction<'a> = Transaction<'a, Postgres>;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `DatabaseService` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    async fn begin(&self) -> PortResult<PgTransaction<'static>> {
        self.pool.begin().await.map_err(unexpected)
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

const BOOK_COLUMNS: &str = "id, user_id, title, theme, genre, character_key, art_style, \
     target_age, page_count, language, status, public_reward_granted, created_at, updated_at";

const PAGE_SELECT: &str = "SELECT p.id, p.book_id, p.page_number, p.text, p.adopted_image_id, \
     i.image_url, i.prompt, p.version \
     FROM pages p LEFT JOIN page_images i ON i.id = p.adopted_image_id";

const IMAGE_SELECT: &str = "SELECT i.id, i.page_id, i.image_url, i.prompt, \
     COALESCE(p.adopted_image_id = i.id, FALSE) AS is_adopted, i.created_at \
     FROM page_images i JOIN pages p ON p.id = i.page_id";

#[derive(FromRow)]
struct UserRecord {
    user_id: Uuid,
    email: Option<String>,
    points: i64,
}
impl UserRecord {
    fn to_domain(self) -> User {
        User {
            user_id: self.user_id,
            email: self.email,
            points: self.points,
        }
    }
}

#[derive(FromRow)]
struct CredentialsRecord {
    user_id: Uuid,
    email: String,
    hashed_password: String,
}

#[derive(FromRow)]
struct BookRecord {
    id: Uuid,
    user_id: Uuid,
    title: String,
    theme: String,
    genre: String,
    character_key: String,
    art_style: String,
    target_age: String,
    page_count: i32,
    language: String,
    status: String,
    public_reward_granted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl BookRecord {
    fn to_domain(self) -> PortResult<Book> {
        let status = self.status.parse::<BookStatus>().map_err(PortError::Unexpected)?;
        Ok(Book {
            id: self.id,
            user_id: self.user_id,
            title: self.title,
            params: BookParams {
                theme: self.theme,
                genre: self.genre,
                character: self.character_key,
                art_style: self.art_style,
                target_age: self.target_age,
                page_count: self.page_count.max(0) as u32,
                language: self.language,
            },
            status,
            public_reward_granted: self.public_reward_granted,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct PageRecord {
    id: Uuid,
    book_id: Uuid,
    page_number: i32,
    text: String,
    adopted_image_id: Option<Uuid>,
    image_url: Option<String>,
    prompt: Option<String>,
    version: i64,
}
impl PageRecord {
    fn to_domain(self) -> Page {
        Page {
            id: self.id,
            book_id: self.book_id,
            page_number: self.page_number.max(0) as u32,
            text: self.text,
            adopted_image_id: self.adopted_image_id,
            image_url: self.image_url,
            prompt: self.prompt,
            version: self.version,
        }
    }
}

#[derive(FromRow)]
struct PageImageRecord {
    id: Uuid,
    page_id: Uuid,
    image_url: String,
    prompt: String,
    is_adopted: bool,
    created_at: DateTime<Utc>,
}
impl PageImageRecord {
    fn to_domain(self) -> PageImage {
        PageImage {
            id: self.id,
            page_id: self.page_id,
            image_url: self.image_url,
            prompt: self.prompt,
            is_adopted: self.is_adopted,
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct PointHistoryRecord {
    id: Uuid,
    user_id: Uuid,
    delta: i64,
    reason: String,
    book_id: Option<Uuid>,
    page_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}
impl PointHistoryRecord {
    fn to_domain(self) -> PortResult<PointHistory> {
        Ok(PointHistory {
            id: self.id,
            user_id: self.user_id,
            delta: self.delta,
            reason: self.reason.parse().map_err(PortError::Unexpected)?,
            book_id: self.book_id,
            page_id: self.page_id,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct JobRecord {
    id: Uuid,
    user_id: Uuid,
    status: String,
    book_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl JobRecord {
    fn to_domain(self) -> PortResult<GenerationJob> {
        Ok(GenerationJob {
            id: self.id,
            user_id: self.user_id,
            status: self.status.parse::<JobStatus>().map_err(PortError::Unexpected)?,
            book_id: self.book_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

//=========================================================================================
// Transaction Helpers
//=========================================================================================

/// Locks the user's balance, applies `entry` and records it in the history.
/// Returns the new balance, or `InsufficientCredits` without writing anything.
async fn apply_entry(tx: &mut PgTransaction<'_>, entry: &LedgerEntry) -> PortResult<i64> {
    let current: i64 = sqlx::query_scalar("SELECT points FROM users WHERE user_id = $1 FOR UPDATE")
        .bind(entry.user_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(unexpected)?
        .ok_or_else(|| PortError::NotFound(format!("User {} not found", entry.user_id)))?;

    let balance = entry.apply_to(current)?;

    sqlx::query("UPDATE users SET points = $1 WHERE user_id = $2")
        .bind(balance)
        .bind(entry.user_id)
        .execute(&mut **tx)
        .await
        .map_err(unexpected)?;

    sqlx::query(
        "INSERT INTO point_history (id, user_id, delta, reason, book_id, page_id) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(Uuid::new_v4())
    .bind(entry.user_id)
    .bind(entry.delta)
    .bind(entry.reason.as_str())
    .bind(entry.book_id)
    .bind(entry.page_id)
    .execute(&mut **tx)
    .await
    .map_err(unexpected)?;

    debug!(user_id = %entry.user_id, delta = entry.delta, balance, "Ledger entry applied");
    Ok(balance)
}

async fn fetch_book(tx: &mut PgTransaction<'_>, book_id: Uuid) -> PortResult<Book> {
    let sql = format!("SELECT {} FROM books WHERE id = $1", BOOK_COLUMNS);
    sqlx::query_as::<_, BookRecord>(&sql)
        .bind(book_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(unexpected)?
        .ok_or_else(|| PortError::NotFound(format!("Book {} not found", book_id)))?
        .to_domain()
}

async fn fetch_page(tx: &mut PgTransaction<'_>, page_id: Uuid) -> PortResult<Page> {
    let sql = format!("{} WHERE p.id = $1", PAGE_SELECT);
    sqlx::query_as::<_, PageRecord>(&sql)
        .bind(page_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(unexpected)?
        .map(PageRecord::to_domain)
        .ok_or_else(|| PortError::NotFound(format!("Page {} not found", page_id)))
}

//=========================================================================================
// `DatabaseService` Trait Implementation
//=========================================================================================

#[async_trait]
impl DatabaseService for DbAdapter {
    async fn create_user_with_email(
        &self,
        email: &str,
        hashed_password: &str,
        signup_bonus: i64,
    ) -> PortResult<User> {
        let mut tx = self.begin().await?;
        let user_id = Uuid::new_v4();

        sqlx::query("INSERT INTO users (user_id, email, hashed_password) VALUES ($1, $2, $3)")
            .bind(user_id)
            .bind(email)
            .bind(hashed_password)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    PortError::Conflict(format!("email {} already registered", email))
                } else {
                    unexpected(e)
                }
            })?;

        let entry = LedgerEntry::credit(user_id, signup_bonus, PointReason::Signup);
        let points = apply_entry(&mut tx, &entry).await?;
        tx.commit().await.map_err(unexpected)?;

        Ok(User {
            user_id,
            email: Some(email.to_string()),
            points,
        })
    }

    async fn get_user_by_email(&self, email: &str) -> PortResult<UserCredentials> {
        let record = sqlx::query_as::<_, CredentialsRecord>(
            "SELECT user_id, email, hashed_password FROM users \
             WHERE email = $1 AND hashed_password IS NOT NULL",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?
        .ok_or_else(|| PortError::NotFound(format!("User with email {} not found", email)))?;

        Ok(UserCredentials {
            user_id: record.user_id,
            email: record.email,
            hashed_password: record.hashed_password,
        })
    }

    async fn get_user(&self, user_id: Uuid) -> PortResult<User> {
        sqlx::query_as::<_, UserRecord>("SELECT user_id, email, points FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .map(UserRecord::to_domain)
            .ok_or_else(|| PortError::NotFound(format!("User {} not found", user_id)))
    }

    async fn create_auth_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()> {
        sqlx::query("INSERT INTO auth_sessions (id, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(session_id)
            .bind(user_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT user_id FROM auth_sessions WHERE id = $1 AND expires_at > NOW()",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?
        .ok_or(PortError::Unauthorized)
    }

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()> {
        sqlx::query("DELETE FROM auth_sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn get_point_history(&self, user_id: Uuid) -> PortResult<Vec<PointHistory>> {
        let records = sqlx::query_as::<_, PointHistoryRecord>(
            "SELECT id, user_id, delta, reason, book_id, page_id, created_at \
             FROM point_history WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        records.into_iter().map(PointHistoryRecord::to_domain).collect()
    }

    async fn commit_book(
        &self,
        book: NewBook,
        debit: LedgerEntry,
        job_id: Option<Uuid>,
    ) -> PortResult<Book> {
        let mut tx = self.begin().await?;
        apply_entry(&mut tx, &debit).await?;

        if let Some(job_id) = job_id {
            let status: String =
                sqlx::query_scalar("SELECT status FROM generation_jobs WHERE id = $1 FOR UPDATE")
                    .bind(job_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(unexpected)?
                    .ok_or_else(|| PortError::NotFound(format!("Job {} not found", job_id)))?;
            if status != JobStatus::Generating.as_str() {
                return Err(PortError::Conflict(format!(
                    "job {} is already {}",
                    job_id, status
                )));
            }
        }

        let params = &book.params;
        sqlx::query(
            "INSERT INTO books (id, user_id, title, theme, genre, character_key, art_style, \
             target_age, page_count, language) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(book.id)
        .bind(book.user_id)
        .bind(&book.title)
        .bind(&params.theme)
        .bind(&params.genre)
        .bind(&params.character)
        .bind(&params.art_style)
        .bind(&params.target_age)
        .bind(params.page_count as i32)
        .bind(&params.language)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                PortError::Conflict(format!("book {} already exists", book.id))
            } else {
                unexpected(e)
            }
        })?;

        for page in &book.pages {
            let page_id = Uuid::new_v4();
            let image_id = Uuid::new_v4();

            sqlx::query(
                "INSERT INTO pages (id, book_id, page_number, text, adopted_image_id) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(page_id)
            .bind(book.id)
            .bind(page.page_number as i32)
            .bind(&page.text)
            .bind(image_id)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;

            sqlx::query(
                "INSERT INTO page_images (id, page_id, image_url, prompt) VALUES ($1, $2, $3, $4)",
            )
            .bind(image_id)
            .bind(page_id)
            .bind(&page.image.image_url)
            .bind(&page.image.prompt)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;
        }

        if let Some(job_id) = job_id {
            sqlx::query(
                "UPDATE generation_jobs SET status = $1, book_id = $2, updated_at = NOW() \
                 WHERE id = $3",
            )
            .bind(JobStatus::Succeeded.as_str())
            .bind(book.id)
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;
        }

        let committed = fetch_book(&mut tx, book.id).await?;
        tx.commit().await.map_err(unexpected)?;
        Ok(committed)
    }

    async fn get_book(&self, book_id: Uuid) -> PortResult<Book> {
        let sql = format!("SELECT {} FROM books WHERE id = $1", BOOK_COLUMNS);
        sqlx::query_as::<_, BookRecord>(&sql)
            .bind(book_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .ok_or_else(|| PortError::NotFound(format!("Book {} not found", book_id)))?
            .to_domain()
    }

    async fn get_pages_for_book(&self, book_id: Uuid) -> PortResult<Vec<Page>> {
        let sql = format!("{} WHERE p.book_id = $1 ORDER BY p.page_number ASC", PAGE_SELECT);
        let records = sqlx::query_as::<_, PageRecord>(&sql)
            .bind(book_id)
            .fetch_all(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(records.into_iter().map(PageRecord::to_domain).collect())
    }

    async fn latest_book_for_user(&self, user_id: Uuid) -> PortResult<Option<Book>> {
        let sql = format!(
            "SELECT {} FROM books WHERE user_id = $1 ORDER BY created_at DESC LIMIT 1",
            BOOK_COLUMNS
        );
        sqlx::query_as::<_, BookRecord>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .map(BookRecord::to_domain)
            .transpose()
    }

    async fn update_book_visibility(
        &self,
        book_id: Uuid,
        status: BookStatus,
        reward: Option<LedgerEntry>,
    ) -> PortResult<VisibilityChange> {
        let mut tx = self.begin().await?;

        let already_rewarded: bool = sqlx::query_scalar(
            "SELECT public_reward_granted FROM books WHERE id = $1 FOR UPDATE",
        )
        .bind(book_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(unexpected)?
        .ok_or_else(|| PortError::NotFound(format!("Book {} not found", book_id)))?;

        let rewarded = match reward {
            Some(entry) if !already_rewarded => {
                apply_entry(&mut tx, &entry).await?;
                true
            }
            _ => false,
        };

        sqlx::query(
            "UPDATE books SET status = $1, public_reward_granted = public_reward_granted OR $2, \
             updated_at = NOW() WHERE id = $3",
        )
        .bind(status.as_str())
        .bind(rewarded)
        .bind(book_id)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;

        let book = fetch_book(&mut tx, book_id).await?;
        tx.commit().await.map_err(unexpected)?;
        Ok(VisibilityChange { book, rewarded })
    }

    async fn get_page_context(&self, page_id: Uuid) -> PortResult<PageContext> {
        let mut tx = self.begin().await?;
        let page = fetch_page(&mut tx, page_id).await?;
        let book = fetch_book(&mut tx, page.book_id).await?;
        tx.commit().await.map_err(unexpected)?;
        Ok(PageContext { page, book })
    }

    async fn get_page_images(&self, page_id: Uuid) -> PortResult<Vec<PageImage>> {
        let sql = format!("{} WHERE i.page_id = $1 ORDER BY i.created_at ASC", IMAGE_SELECT);
        let records = sqlx::query_as::<_, PageImageRecord>(&sql)
            .bind(page_id)
            .fetch_all(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(records.into_iter().map(PageImageRecord::to_domain).collect())
    }

    async fn commit_page_image(
        &self,
        image: NewPageImage,
        debit: LedgerEntry,
    ) -> PortResult<PageImage> {
        let mut tx = self.begin().await?;
        apply_entry(&mut tx, &debit).await?;

        let page_exists: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM pages WHERE id = $1 FOR SHARE")
                .bind(image.page_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(unexpected)?;
        if page_exists.is_none() {
            return Err(PortError::NotFound(format!("Page {} not found", image.page_id)));
        }

        let record = sqlx::query_as::<_, PageImageRecord>(
            "INSERT INTO page_images (id, page_id, image_url, prompt) VALUES ($1, $2, $3, $4) \
             RETURNING id, page_id, image_url, prompt, FALSE AS is_adopted, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(image.page_id)
        .bind(&image.image.image_url)
        .bind(&image.image.prompt)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                PortError::Conflict(format!("image {} already recorded", image.image.image_url))
            } else {
                unexpected(e)
            }
        })?;

        tx.commit().await.map_err(unexpected)?;
        Ok(record.to_domain())
    }

    async fn adopt_page_image(&self, page_id: Uuid, image_url: &str) -> PortResult<Page> {
        let mut tx = self.begin().await?;

        // Serializes concurrent adopts of the same page.
        let locked: Option<Uuid> = sqlx::query_scalar("SELECT id FROM pages WHERE id = $1 FOR UPDATE")
            .bind(page_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(unexpected)?;
        if locked.is_none() {
            return Err(PortError::NotFound(format!("Page {} not found", page_id)));
        }

        let image_id: Uuid = sqlx::query_scalar(
            "SELECT id FROM page_images WHERE page_id = $1 AND image_url = $2",
        )
        .bind(page_id)
        .bind(image_url)
        .fetch_optional(&mut *tx)
        .await
        .map_err(unexpected)?
        .ok_or_else(|| PortError::NotFound(format!("page {} has no image {}", page_id, image_url)))?;

        sqlx::query("UPDATE pages SET adopted_image_id = $1, version = version + 1 WHERE id = $2")
            .bind(image_id)
            .bind(page_id)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;

        let page = fetch_page(&mut tx, page_id).await?;
        tx.commit().await.map_err(unexpected)?;
        Ok(page)
    }

    async fn create_generation_job(&self, user_id: Uuid) -> PortResult<GenerationJob> {
        sqlx::query_as::<_, JobRecord>(
            "INSERT INTO generation_jobs (id, user_id, status) VALUES ($1, $2, $3) \
             RETURNING id, user_id, status, book_id, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(JobStatus::Generating.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?
        .to_domain()
    }

    async fn get_generation_job(&self, job_id: Uuid) -> PortResult<GenerationJob> {
        sqlx::query_as::<_, JobRecord>(
            "SELECT id, user_id, status, book_id, created_at, updated_at \
             FROM generation_jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?
        .ok_or_else(|| PortError::NotFound(format!("Job {} not found", job_id)))?
        .to_domain()
    }

    async fn fail_generation_job(&self, job_id: Uuid) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE generation_jobs SET status = $1, updated_at = NOW() \
             WHERE id = $2 AND status = $3",
        )
        .bind(JobStatus::Failed.as_str())
        .bind(job_id)
        .bind(JobStatus::Generating.as_str())
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;

        if result.rows_affected() == 0 {
            // Already finished jobs are left as they are.
            self.get_generation_job(job_id).await?;
        }
        Ok(())
    }
}
