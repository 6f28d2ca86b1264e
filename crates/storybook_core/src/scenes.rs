//! crates/storybook_core/src/scenes.rs
//!
//! Converts story text into short, purely visual English scene prompts.

use crate::domain::PromptMessage;
use crate::ports::{PortResult, TextGenerationService};
use tracing::{debug, info};

const SCENE_TEMPERATURE: f32 = 0.4;

const SCENE_INSTRUCTIONS: &str = r#"You write prompts for an illustrator of a children's picture book.

Describe what is VISIBLE in one illustration for the given story text, in English, in 30 to 40 words.
- Describe only the setting, objects, actions, poses and composition.
- Refer to the protagonist simply as "the main character"; their appearance is described elsewhere.
- Do not mention art style, colors of the medium, emotions, sounds, dialogue or text.
- Respond with the description only."#;

const COVER_INSTRUCTIONS: &str = r#"You write prompts for an illustrator of a children's picture book.

Describe a single COVER illustration that represents the whole story below, in English, in 30 to 40 words.
- Describe only the setting, objects, actions, poses and composition.
- Refer to the protagonist simply as "the main character"; their appearance is described elsewhere.
- Do not mention art style, emotions, the title or any lettering.
- Respond with the description only."#;

/// Produces `[cover, page 1, ..., page N]` scene prompts for a story.
///
/// Each body page after the first is described with the previous page's scene as
/// optional continuity context. Empty or odd outputs are passed through unchanged.
pub async fn describe_scenes(
    text: &dyn TextGenerationService,
    pages: &[String],
) -> PortResult<Vec<String>> {
    let mut scenes = Vec::with_capacity(pages.len() + 1);

    let whole_story = pages.join("\n");
    let cover = text
        .generate(
            &[
                PromptMessage::system(COVER_INSTRUCTIONS),
                PromptMessage::user(format!("STORY:\n{}", whole_story)),
            ],
            SCENE_TEMPERATURE,
        )
        .await?;
    scenes.push(cover.trim().to_string());

    let mut previous: Option<String> = None;
    for (index, page_text) in pages.iter().enumerate() {
        let scene = describe_page(text, page_text, previous.as_deref()).await?;
        debug!(page = index + 1, scene = %scene, "Scene described");
        previous = Some(scene.clone());
        scenes.push(scene);
    }

    info!(count = scenes.len(), "Scene prompts ready");
    Ok(scenes)
}

async fn describe_page(
    text: &dyn TextGenerationService,
    page_text: &str,
    previous_scene: Option<&str>,
) -> PortResult<String> {
    let user = match previous_scene {
        Some(prev) => format!(
            "PREVIOUS ILLUSTRATION (for continuity only; ignore it if it does not fit):\n{}\n\nSTORY TEXT:\n{}",
            prev, page_text
        ),
        None => format!("STORY TEXT:\n{}", page_text),
    };
    let scene = text
        .generate(
            &[PromptMessage::system(SCENE_INSTRUCTIONS), PromptMessage::user(user)],
            SCENE_TEMPERATURE,
        )
        .await?;
    Ok(scene.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ScriptedTextBackend;

    #[tokio::test]
    async fn cover_comes_first_and_pages_carry_previous_scene() {
        let backend = ScriptedTextBackend::new(|messages| {
            let user = &messages[1].content;
            if user.starts_with("STORY:") {
                Ok("cover scene".to_string())
            } else {
                let page = user.rsplit("STORY TEXT:\n").next().unwrap_or_default();
                Ok(format!("scene of {}", page))
            }
        });
        let pages = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        let scenes = describe_scenes(&backend, &pages).await.unwrap();
        assert_eq!(
            scenes,
            vec!["cover scene", "scene of a", "scene of b", "scene of c"]
        );

        let requests = backend.requests();
        assert_eq!(requests.len(), 4);
        assert!(!requests[1][1].content.contains("PREVIOUS ILLUSTRATION"));
        assert!(requests[2][1].content.contains("PREVIOUS ILLUSTRATION"));
        assert!(requests[2][1].content.contains("scene of a"));
        assert!(requests[3][1].content.contains("scene of b"));
    }

    #[tokio::test]
    async fn empty_scene_is_passed_through() {
        let backend = ScriptedTextBackend::repeating("   ");
        let scenes = describe_scenes(&backend, &["x".to_string()]).await.unwrap();
        assert_eq!(scenes, vec!["", ""]);
    }
}
