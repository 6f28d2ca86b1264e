//! crates/storybook_core/src/illustrate.rs
//!
//! Image synthesis: builds the final prompt for each scene, renders it through the
//! image backend and stores the result in object storage.

use crate::domain::{RenderedImage, SamplerParams};
use crate::ports::{ImageGenerationService, ObjectStorage, PortResult};
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::fmt::Display;
use tracing::{error, info};
use uuid::Uuid;

pub const IMAGE_CONTENT_TYPE: &str = "image/png";

/// `character + "\n" + scene + "\n" + style`.
pub fn compose_prompt(character: &str, scene: &str, art_style: &str) -> String {
    format!("{}\n{}\n{}", character, scene, art_style)
}

/// A globally unique storage key for one image of a book.
pub fn image_key(book_id: Uuid, page: impl Display) -> String {
    format!(
        "book_{}_page_{}_{}_{}.png",
        book_id,
        page,
        Utc::now().timestamp_millis(),
        Uuid::new_v4()
    )
}

/// Renders prompts and persists the images.
pub struct Illustrator<'a> {
    images: &'a dyn ImageGenerationService,
    storage: &'a dyn ObjectStorage,
    sampler: &'a SamplerParams,
    concurrency: usize,
}

impl<'a> Illustrator<'a> {
    pub fn new(
        images: &'a dyn ImageGenerationService,
        storage: &'a dyn ObjectStorage,
        sampler: &'a SamplerParams,
        concurrency: usize,
    ) -> Self {
        Self {
            images,
            storage,
            sampler,
            concurrency: concurrency.max(1),
        }
    }

    /// Renders one prompt and stores it under a key derived from `book_id` and `page`.
    pub async fn render(
        &self,
        book_id: Uuid,
        page: impl Display,
        prompt: String,
    ) -> PortResult<RenderedImage> {
        let key = image_key(book_id, page);
        let bytes = self.images.generate(&prompt, self.sampler).await?;
        let image_url = self.storage.put(bytes, &key, IMAGE_CONTENT_TYPE).await?;
        Ok(RenderedImage { image_url, prompt })
    }

    /// Renders every prompt; index 0 is the cover, index `i` is body page `i`.
    ///
    /// Up to `concurrency` renders run at once and the output keeps the input order.
    /// The first failure drops all in-flight renders and is returned, so callers never
    /// see a partial set.
    pub async fn render_all(
        &self,
        book_id: Uuid,
        prompts: Vec<String>,
    ) -> PortResult<Vec<RenderedImage>> {
        let total = prompts.len();
        let rendered: Vec<RenderedImage> = stream::iter(prompts.into_iter().enumerate())
            .map(|(index, prompt)| self.render(book_id, index, prompt))
            .buffered(self.concurrency)
            .try_collect()
            .await
            .map_err(|e| {
                error!(%book_id, error = %e, "Image synthesis aborted");
                e
            })?;
        info!(%book_id, count = total, "All images rendered");
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FlakyImageBackend, MemoryObjectStorage};

    #[test]
    fn prompt_joins_character_scene_and_style_by_newline() {
        assert_eq!(compose_prompt("fox", "forest", "watercolor"), "fox\nforest\nwatercolor");
    }

    #[test]
    fn image_keys_are_unique() {
        let book = Uuid::new_v4();
        let a = image_key(book, 1);
        let b = image_key(book, 1);
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("book_{}_page_1_", book)));
        assert!(a.ends_with(".png"));
    }

    #[tokio::test]
    async fn render_all_preserves_order_under_concurrency() {
        let images = FlakyImageBackend::new(None);
        let storage = MemoryObjectStorage::default();
        let sampler = SamplerParams::default();
        let illustrator = Illustrator::new(&images, &storage, &sampler, 4);

        let prompts: Vec<String> = (0..6).map(|i| format!("prompt {}", i)).collect();
        let rendered = illustrator
            .render_all(Uuid::new_v4(), prompts.clone())
            .await
            .unwrap();

        assert_eq!(rendered.len(), 6);
        for (i, image) in rendered.iter().enumerate() {
            assert_eq!(image.prompt, prompts[i]);
            assert!(image.image_url.contains(&format!("_page_{}_", i)));
        }
        assert_eq!(storage.len(), 6);
    }

    #[tokio::test]
    async fn render_all_fails_as_a_whole() {
        let images = FlakyImageBackend::new(Some(2));
        let storage = MemoryObjectStorage::default();
        let sampler = SamplerParams::default();
        let illustrator = Illustrator::new(&images, &storage, &sampler, 1);

        let prompts: Vec<String> = (0..4).map(|i| format!("prompt {}", i)).collect();
        let result = illustrator.render_all(Uuid::new_v4(), prompts).await;
        assert!(result.is_err());
    }
}
