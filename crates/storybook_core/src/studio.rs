//! crates/storybook_core/src/studio.rs
//!
//! `BookStudio` bundles the ports the pipeline talks to together with its
//! pricing and tuning settings. The pipeline stages are implemented as `impl`
//! blocks in `generation`, `variants` and `ledger`.

use crate::domain::{Book, BookDetail, PageWithVariants, SamplerParams};
use crate::illustrate::Illustrator;
use crate::ledger::Pricing;
use crate::ports::{
    DatabaseService, ImageGenerationService, ObjectStorage, PortError, PortResult,
    TextGenerationService,
};
use crate::retry::RetryPolicy;
use std::sync::Arc;
use uuid::Uuid;

/// Tunables for the generation pipeline.
#[derive(Debug, Clone)]
pub struct StudioSettings {
    pub pricing: Pricing,
    pub sampler: SamplerParams,
    /// Maximum number of image renders in flight for one book.
    pub image_concurrency: usize,
    pub formatter_retry: RetryPolicy,
}

impl Default for StudioSettings {
    fn default() -> Self {
        Self {
            pricing: Pricing::default(),
            sampler: SamplerParams::default(),
            image_concurrency: 2,
            formatter_retry: RetryPolicy::default(),
        }
    }
}

/// The generation pipeline and its accounting, wired to concrete ports.
#[derive(Clone)]
pub struct BookStudio {
    pub(crate) db: Arc<dyn DatabaseService>,
    pub(crate) text: Arc<dyn TextGenerationService>,
    pub(crate) images: Arc<dyn ImageGenerationService>,
    pub(crate) storage: Arc<dyn ObjectStorage>,
    pub(crate) settings: StudioSettings,
}

impl BookStudio {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        text: Arc<dyn TextGenerationService>,
        images: Arc<dyn ImageGenerationService>,
        storage: Arc<dyn ObjectStorage>,
        settings: StudioSettings,
    ) -> Self {
        Self {
            db,
            text,
            images,
            storage,
            settings,
        }
    }

    pub fn settings(&self) -> &StudioSettings {
        &self.settings
    }

    pub(crate) fn illustrator(&self) -> Illustrator<'_> {
        Illustrator::new(
            self.images.as_ref(),
            self.storage.as_ref(),
            &self.settings.sampler,
            self.settings.image_concurrency,
        )
    }

    /// Loads a book and checks that `user_id` owns it.
    pub(crate) async fn owned_book(&self, user_id: Uuid, book_id: Uuid) -> PortResult<Book> {
        let book = self.db.get_book(book_id).await?;
        if book.user_id != user_id {
            return Err(PortError::Forbidden(format!(
                "book {} belongs to another user",
                book_id
            )));
        }
        Ok(book)
    }

    /// The most recently created book of a user, if any.
    pub async fn latest_book(&self, user_id: Uuid) -> PortResult<Option<Book>> {
        self.db.latest_book_for_user(user_id).await
    }

    /// A book with every page and each page's variant history.
    pub async fn book_detail(&self, user_id: Uuid, book_id: Uuid) -> PortResult<BookDetail> {
        let book = self.owned_book(user_id, book_id).await?;
        let mut pages = Vec::new();
        for page in self.db.get_pages_for_book(book_id).await? {
            let variants = self.db.get_page_images(page.id).await?;
            pages.push(PageWithVariants { page, variants });
        }
        Ok(BookDetail { book, pages })
    }
}
