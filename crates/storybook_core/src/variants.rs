//! crates/storybook_core/src/variants.rs
//!
//! Per-page illustration variants: paid regeneration (same prompt or refined by
//! feedback), adopting one variant as canonical, and the client-side tray of
//! pending candidates.

use crate::catalog::art_style_description;
use crate::domain::{
    LedgerEntry, NewPageImage, Page, PageContext, PageImage, PointReason, PromptMessage,
};
use crate::ports::{PortError, PortResult};
use crate::studio::BookStudio;
use tracing::info;
use uuid::Uuid;

const REFINE_TEMPERATURE: f32 = 0.4;

const REFINE_INSTRUCTIONS: &str = r#"You revise prompts for an illustrator of a children's picture book.

You receive the previous scene description of one illustration and the reader's feedback.
Rewrite the scene description so that it follows the feedback.
- Write 55 to 60 words in English.
- Describe only visible details: setting, objects, characters, actions, poses and composition.
- Never mention art style, medium, rendering technique or artists.
- Respond with the revised description only."#;

/// A freshly generated variant and the scene prompt it was refined to.
#[derive(Debug, Clone)]
pub struct RefinedImage {
    pub image: PageImage,
    pub scene_prompt: String,
}

impl BookStudio {
    /// Loads a page and checks that its book belongs to `user_id`.
    pub(crate) async fn owned_page(&self, user_id: Uuid, page_id: Uuid) -> PortResult<PageContext> {
        let context = self.db.get_page_context(page_id).await?;
        if context.book.user_id != user_id {
            return Err(PortError::Forbidden(format!(
                "page {} belongs to another user",
                page_id
            )));
        }
        Ok(context)
    }

    /// The variant of `page_id` whose image is `image_url`.
    async fn find_variant(&self, page_id: Uuid, image_url: &str) -> PortResult<PageImage> {
        self.db
            .get_page_images(page_id)
            .await?
            .into_iter()
            .find(|variant| variant.image_url == image_url)
            .ok_or_else(|| {
                PortError::NotFound(format!(
                    "page {} has no image {}",
                    page_id, image_url
                ))
            })
    }

    /// Renders a new pending variant with the exact prompt of `base_image_url`.
    pub async fn regenerate_page_image(
        &self,
        user_id: Uuid,
        page_id: Uuid,
        base_image_url: &str,
    ) -> PortResult<PageImage> {
        let context = self.owned_page(user_id, page_id).await?;
        let base = self.find_variant(page_id, base_image_url).await?;
        let cost = self.settings.pricing.regenerate_cost;
        self.precheck_balance(user_id, cost).await?;

        let image = self
            .illustrator()
            .render(context.book.id, page_id, base.prompt)
            .await?;
        let debit = LedgerEntry::debit(user_id, cost, PointReason::RegeneratePage)
            .for_book(context.book.id)
            .for_page(page_id);
        let variant = self
            .db
            .commit_page_image(NewPageImage { page_id, image }, debit)
            .await?;

        info!(%page_id, image_url = %variant.image_url, "Page image regenerated");
        Ok(variant)
    }

    /// Revises the scene prompt of `base_image_url` with `feedback`, then renders
    /// `scene + "\n" + style` as a new pending variant.
    pub async fn refine_and_regenerate_page_image(
        &self,
        user_id: Uuid,
        page_id: Uuid,
        base_image_url: &str,
        feedback: &str,
    ) -> PortResult<RefinedImage> {
        if feedback.trim().is_empty() {
            return Err(PortError::InvalidInput("feedback must not be empty".to_string()));
        }
        let context = self.owned_page(user_id, page_id).await?;
        let base = self.find_variant(page_id, base_image_url).await?;
        let cost = self.settings.pricing.regenerate_cost;
        self.precheck_balance(user_id, cost).await?;

        let art_style = art_style_description(&context.book.params.art_style).unwrap_or_default();
        let previous_scene = previous_scene_prompt(&base.prompt, art_style);
        let scene_prompt = self
            .text
            .generate(
                &[
                    PromptMessage::system(REFINE_INSTRUCTIONS),
                    PromptMessage::user(format!(
                        "PREVIOUS SCENE:\n{}\n\nFEEDBACK:\n{}",
                        previous_scene,
                        feedback.trim()
                    )),
                ],
                REFINE_TEMPERATURE,
            )
            .await?
            .trim()
            .to_string();

        let prompt = format!("{}\n{}", scene_prompt, art_style);
        let image = self
            .illustrator()
            .render(context.book.id, page_id, prompt)
            .await?;
        let debit = LedgerEntry::debit(user_id, cost, PointReason::RefineAndRegenerate)
            .for_book(context.book.id)
            .for_page(page_id);
        let variant = self
            .db
            .commit_page_image(NewPageImage { page_id, image }, debit)
            .await?;

        info!(%page_id, image_url = %variant.image_url, "Page image refined and regenerated");
        Ok(RefinedImage {
            image: variant,
            scene_prompt,
        })
    }

    /// Adopts the variant with `new_image_url` as the page's canonical image.
    pub async fn apply_new_image(
        &self,
        user_id: Uuid,
        page_id: Uuid,
        new_image_url: &str,
    ) -> PortResult<Page> {
        self.owned_page(user_id, page_id).await?;
        let page = self.db.adopt_page_image(page_id, new_image_url).await?;
        info!(%page_id, image_url = %new_image_url, version = page.version, "Page image adopted");
        Ok(page)
    }
}

/// Recovers the scene part of a stored prompt by dropping the trailing art style.
/// Prompts that do not end with the style are returned whole.
pub fn previous_scene_prompt<'a>(stored_prompt: &'a str, art_style: &str) -> &'a str {
    if art_style.is_empty() {
        return stored_prompt.trim();
    }
    stored_prompt
        .trim_end()
        .strip_suffix(art_style)
        .map(str::trim)
        .unwrap_or_else(|| stored_prompt.trim())
}

//=========================================================================================
// Candidate Tray (client-side working set)
//=========================================================================================

/// The variants a user is currently comparing for one page.
///
/// Discarding only removes a candidate from this working set; the stored variant
/// history is never deleted.
#[derive(Debug, Clone)]
pub struct CandidateTray {
    canonical_url: Option<String>,
    pending: Vec<PageImage>,
}

impl CandidateTray {
    /// Builds the tray from a page's variant history: everything not adopted is pending.
    pub fn from_history(canonical_url: Option<String>, history: Vec<PageImage>) -> Self {
        let pending = history.into_iter().filter(|v| !v.is_adopted).collect();
        Self {
            canonical_url,
            pending,
        }
    }

    pub fn canonical_url(&self) -> Option<&str> {
        self.canonical_url.as_deref()
    }

    pub fn pending(&self) -> &[PageImage] {
        &self.pending
    }

    pub fn push(&mut self, variant: PageImage) {
        if !self.pending.iter().any(|v| v.image_url == variant.image_url) {
            self.pending.push(variant);
        }
    }

    /// Removes a pending candidate. Returns false if it was not in the tray.
    pub fn discard(&mut self, image_url: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|v| v.image_url != image_url);
        self.pending.len() != before
    }

    /// Records an adoption: the adopted candidate leaves the pending list and
    /// becomes the canonical image.
    pub fn adopt(&mut self, adopted: &Page) {
        if let Some(url) = adopted.image_url.as_deref() {
            self.pending.retain(|v| v.image_url != url);
        }
        self.canonical_url = adopted.image_url.clone();
    }
}
