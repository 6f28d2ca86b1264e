//! Shared fixtures for the storybook_core integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use storybook_core::catalog::BookRequest;
use storybook_core::domain::PromptMessage;
use storybook_core::memory::{
    FlakyImageBackend, MemoryDatabase, MemoryObjectStorage, ScriptedTextBackend,
};
use storybook_core::ports::PortResult;
use storybook_core::{BookStudio, RetryPolicy, StudioSettings};

pub struct Harness {
    pub db: Arc<MemoryDatabase>,
    pub text: Arc<ScriptedTextBackend>,
    pub images: Arc<FlakyImageBackend>,
    pub storage: Arc<MemoryObjectStorage>,
    pub studio: BookStudio,
}

pub fn settings() -> StudioSettings {
    StudioSettings {
        formatter_retry: RetryPolicy::immediate(3),
        image_concurrency: 3,
        ..StudioSettings::default()
    }
}

/// Answers each pipeline stage by recognising its system prompt.
pub fn story_responder(messages: &[PromptMessage]) -> PortResult<String> {
    let system = &messages[0].content;
    let user = &messages[1].content;

    if system.contains("author of illustrated picture books") {
        let count: usize = user
            .lines()
            .find_map(|l| l.strip_prefix("Number of pages: "))
            .and_then(|n| n.trim().parse().ok())
            .unwrap_or(1);
        let mut out = String::from("Title: The Little Fox\n");
        for i in 1..=count {
            out.push_str(&format!("Page {}: The fox does thing {}.\n", i, i));
        }
        Ok(out)
    } else if system.contains("strict JSON") {
        let mut lines = user.lines();
        let title = lines
            .next()
            .and_then(|l| l.strip_prefix("Title: "))
            .unwrap_or_default()
            .to_string();
        let pages: Vec<&str> = lines.filter(|l| !l.trim().is_empty()).collect();
        Ok(format!(
            "```json\n{}\n```",
            serde_json::json!({ "title": title, "pages": pages })
        ))
    } else if system.contains("COVER") {
        Ok("The main character stands in front of a big forest.".to_string())
    } else if system.contains("revise prompts") {
        Ok("The main character holds a red balloon near a river.".to_string())
    } else {
        let text = user.rsplit("STORY TEXT:\n").next().unwrap_or_default();
        Ok(format!("The main character illustrated: {}", text))
    }
}

pub fn harness_with(text: ScriptedTextBackend, images: FlakyImageBackend) -> Harness {
    let db = Arc::new(MemoryDatabase::new());
    let text = Arc::new(text);
    let images = Arc::new(images);
    let storage = Arc::new(MemoryObjectStorage::default());
    let studio = BookStudio::new(
        db.clone(),
        text.clone(),
        images.clone(),
        storage.clone(),
        settings(),
    );
    Harness {
        db,
        text,
        images,
        storage,
        studio,
    }
}

pub fn harness() -> Harness {
    harness_with(
        ScriptedTextBackend::new(story_responder),
        FlakyImageBackend::new(None),
    )
}

pub fn request(page_count: u32) -> BookRequest {
    BookRequest {
        theme: "sharing".to_string(),
        genre: "adventure".to_string(),
        character: "fox".to_string(),
        art_style: "watercolor".to_string(),
        target_age: "3-5".to_string(),
        page_count,
        language: "en".to_string(),
    }
}
