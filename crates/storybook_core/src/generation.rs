//! crates/storybook_core/src/generation.rs
//!
//! The end-to-end book generation run: pre-check, story, scenes, images, and one
//! atomic commit. Nothing is persisted or charged unless every stage succeeded.

use crate::catalog::{BookRequest, ResolvedRequest};
use crate::domain::{Book, GenerationJob, JobStatus, LedgerEntry, NewBook, NewPage, PointReason};
use crate::illustrate::compose_prompt;
use crate::ports::{PortError, PortResult};
use crate::scenes::describe_scenes;
use crate::story::{format_story, plan_story};
use crate::studio::BookStudio;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

impl BookStudio {
    /// Issues a job identifier the client can record before submitting a generation.
    pub async fn open_generation_job(&self, user_id: Uuid) -> PortResult<GenerationJob> {
        let job = self.db.create_generation_job(user_id).await?;
        info!(job_id = %job.id, %user_id, "Generation job opened");
        Ok(job)
    }

    /// A job's current state, visible only to its owner.
    pub async fn generation_job(&self, user_id: Uuid, job_id: Uuid) -> PortResult<GenerationJob> {
        let job = self.db.get_generation_job(job_id).await?;
        if job.user_id != user_id {
            return Err(PortError::Forbidden(format!(
                "job {} belongs to another user",
                job_id
            )));
        }
        Ok(job)
    }

    /// Generates, bills and persists a complete book.
    ///
    /// With a `job_id` the job must belong to the user and still be generating. From
    /// then on the job is marked succeeded in the commit, or failed on any error.
    pub async fn generate_book(
        &self,
        user_id: Uuid,
        request: BookRequest,
        job_id: Option<Uuid>,
    ) -> PortResult<Book> {
        let start_time = Instant::now();

        if let Some(job_id) = job_id {
            let job = self.generation_job(user_id, job_id).await?;
            if job.status != JobStatus::Generating {
                return Err(PortError::Conflict(format!(
                    "job {} is already {}",
                    job_id,
                    job.status.as_str()
                )));
            }
        }

        match self.run_generation(user_id, request, job_id).await {
            Ok(book) => {
                info!(
                    book_id = %book.id,
                    %user_id,
                    elapsed_ms = start_time.elapsed().as_millis() as u64,
                    "Book generated and committed"
                );
                Ok(book)
            }
            Err(e) => {
                error!(%user_id, error = %e, "Book generation failed; nothing committed");
                if let Some(job_id) = job_id {
                    if let Err(mark_err) = self.db.fail_generation_job(job_id).await {
                        warn!(%job_id, error = %mark_err, "Could not mark job as failed");
                    }
                }
                Err(e)
            }
        }
    }

    /// Validation, pre-check, production and the commit of one run.
    async fn run_generation(
        &self,
        user_id: Uuid,
        request: BookRequest,
        job_id: Option<Uuid>,
    ) -> PortResult<Book> {
        let resolved = request.validate()?;
        let cost = self.settings.pricing.generation_cost(resolved.params.page_count);
        self.precheck_balance(user_id, cost).await?;
        info!(%user_id, cost, pages = resolved.params.page_count, "Starting book generation");

        let book_id = Uuid::new_v4();
        let new_book = self.produce_book(book_id, user_id, &resolved).await?;
        let debit =
            LedgerEntry::debit(user_id, cost, PointReason::InitialGeneration).for_book(book_id);
        self.db.commit_book(new_book, debit, job_id).await
    }

    /// Runs every AI and storage stage and assembles the unpersisted book.
    async fn produce_book(
        &self,
        book_id: Uuid,
        user_id: Uuid,
        request: &ResolvedRequest,
    ) -> PortResult<NewBook> {
        let page_count = request.params.page_count as usize;

        let rough = plan_story(self.text.as_ref(), request).await?;
        let story = format_story(
            self.text.as_ref(),
            &rough,
            page_count,
            &self.settings.formatter_retry,
        )
        .await?;
        if story.is_degraded() {
            warn!(%book_id, "Continuing with a degraded story");
        }

        let scenes = describe_scenes(self.text.as_ref(), &story.pages).await?;
        let prompts: Vec<String> = scenes
            .iter()
            .map(|scene| compose_prompt(request.character.description, scene, request.art_style))
            .collect();
        let images = self.illustrator().render_all(book_id, prompts).await?;

        let texts = std::iter::once(story.title.clone()).chain(story.pages.iter().cloned());
        let pages = texts
            .zip(images)
            .enumerate()
            .map(|(number, (text, image))| NewPage {
                page_number: number as u32,
                text,
                image,
            })
            .collect();

        Ok(NewBook {
            id: book_id,
            user_id,
            title: story.title,
            params: request.params.clone(),
            pages,
        })
    }
}
