//! crates/storybook_core/src/story.rs
//!
//! Story planning and formatting: the two language-backend stages that turn the
//! user's choices into a title plus exactly one text per page.

use crate::catalog::ResolvedRequest;
use crate::domain::PromptMessage;
use crate::ports::{PortResult, TextGenerationService};
use crate::retry::{retry_or_fallback, Attempt, RetryPolicy};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use tracing::{info, warn};

const PLANNER_TEMPERATURE: f32 = 0.8;
const FORMATTER_TEMPERATURE: f32 = 0.2;

const PLANNER_INSTRUCTIONS: &str = r#"You are an author of illustrated picture books for young children.

Write a complete short story with the following structure:
- The first line is the title, written as: Title: <title>
- After the title, write exactly {page_count} lines, one line per page of the book.
- Each page line is one or two simple sentences that move the story forward.

Rules:
- The protagonist is a {species}. Never give a name to any character other than the protagonist.
- Use vocabulary suitable for children aged {target_age}.
- Write the whole story in the language with code "{language}".
- Do not add headings, numbering explanations or any text besides the title and the page lines."#;

const FORMATTER_INSTRUCTIONS: &str = r#"You convert picture book drafts into strict JSON.

Respond with a single JSON object and nothing else:
{"title": "<title>", "pages": ["<page 1 text>", "<page 2 text>", ...]}

Rules:
- "pages" must contain exactly {page_count} strings, one per page, in story order.
- If the draft has more lines than pages, merge neighbouring lines; if it has fewer, split longer lines.
- Keep the original language and wording as much as possible.
- Do not wrap the JSON in markdown."#;

/// A story with its title and page texts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoryDraft {
    pub title: String,
    pub pages: Vec<String>,
}

impl StoryDraft {
    /// The degraded result used when formatting never produced a valid story.
    pub fn empty(page_count: usize) -> Self {
        Self {
            title: String::new(),
            pages: vec![String::new(); page_count],
        }
    }

    /// True when any part of the story is empty, e.g. after the formatter fell back.
    pub fn is_degraded(&self) -> bool {
        self.title.trim().is_empty() || self.pages.iter().any(|p| p.trim().is_empty())
    }
}

//=========================================================================================
// Story Planner
//=========================================================================================

/// Asks the language backend for a rough story. The result is best-effort: the
/// number of page lines is not guaranteed to match the requested page count.
pub async fn plan_story(
    text: &dyn TextGenerationService,
    request: &ResolvedRequest,
) -> PortResult<StoryDraft> {
    let params = &request.params;
    let instructions = PLANNER_INSTRUCTIONS
        .replace("{page_count}", &params.page_count.to_string())
        .replace("{species}", request.character.species)
        .replace("{target_age}", &params.target_age)
        .replace("{language}", &params.language);

    let messages = vec![
        PromptMessage::system(instructions),
        PromptMessage::user(format!(
            "Theme: {}\nGenre: {}\nProtagonist: a {}\nNumber of pages: {}",
            params.theme, params.genre, request.character.species, params.page_count
        )),
    ];

    let raw = text.generate(&messages, PLANNER_TEMPERATURE).await?;
    let draft = parse_rough_story(&raw);
    info!(
        title = %draft.title,
        lines = draft.pages.len(),
        requested = params.page_count,
        "Story planned"
    );
    Ok(draft)
}

fn title_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^[#*\s]*title\s*[:：]\s*(.*?)[*\s]*$").expect("valid regex"))
}

fn page_label_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^[*\s]*(page\s*\d+|\d+)\s*[:.)\-]\s*[*\s]*").expect("valid regex")
    })
}

/// Splits raw planner output into a title line and page lines.
pub fn parse_rough_story(raw: &str) -> StoryDraft {
    let mut title = String::new();
    let mut pages = Vec::new();

    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if title.is_empty() {
            if let Some(caps) = title_regex().captures(line) {
                title = caps[1].trim().to_string();
                continue;
            }
        }
        let text = page_label_regex().replace(line, "").trim().to_string();
        if !text.is_empty() {
            pages.push(text);
        }
    }

    StoryDraft { title, pages }
}

//=========================================================================================
// Story Formatter
//=========================================================================================

/// Coerces a rough story into exactly `page_count` pages.
///
/// Malformed or wrongly-sized output is retried under `policy`; once the budget is
/// spent the empty fallback of `StoryDraft::empty` is returned instead of an error.
/// Backend failures are not retried and abort the run.
pub async fn format_story(
    text: &dyn TextGenerationService,
    rough: &StoryDraft,
    page_count: usize,
    policy: &RetryPolicy,
) -> PortResult<StoryDraft> {
    let messages = vec![
        PromptMessage::system(
            FORMATTER_INSTRUCTIONS.replace("{page_count}", &page_count.to_string()),
        ),
        PromptMessage::user(format!(
            "Title: {}\n\n{}",
            rough.title,
            rough.pages.join("\n")
        )),
    ];

    let formatted = retry_or_fallback(
        policy,
        "story_formatter",
        || {
            let messages = &messages;
            async move {
                let raw = text
                    .generate(messages, FORMATTER_TEMPERATURE)
                    .await
                    .map_err(Attempt::Abort)?;
                parse_formatted_story(&raw, page_count).map_err(Attempt::Retry)
            }
        },
        || StoryDraft::empty(page_count),
    )
    .await?;

    if formatted.is_degraded() {
        warn!(page_count, "Formatted story has empty title or pages");
    }
    Ok(formatted)
}

/// Parses formatter output and checks the page count.
pub fn parse_formatted_story(raw: &str, page_count: usize) -> Result<StoryDraft, String> {
    let body = strip_code_fence(raw);
    let draft: StoryDraft =
        serde_json::from_str(body).map_err(|e| format!("invalid story JSON: {}", e))?;
    if draft.pages.len() != page_count {
        return Err(format!(
            "expected {} pages, got {}",
            page_count,
            draft.pages.len()
        ));
    }
    Ok(StoryDraft {
        title: draft.title.trim().to_string(),
        pages: draft.pages.into_iter().map(|p| p.trim().to_string()).collect(),
    })
}

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*\n?(.*?)\n?\s*```\s*$").expect("valid regex"))
}

/// Removes a surrounding markdown code fence, if any.
pub fn strip_code_fence(raw: &str) -> &str {
    match fence_regex().captures(raw).and_then(|caps| caps.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => raw.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ScriptedTextBackend;
    use crate::ports::PortError;

    #[test]
    fn rough_story_takes_title_line_and_remaining_lines() {
        let raw = "**Title: The Brave Fox**\n\nPage 1: The fox wakes up.\n2. It walks to the river.\n\nIt meets a frog.\n";
        let draft = parse_rough_story(raw);
        assert_eq!(draft.title, "The Brave Fox");
        assert_eq!(
            draft.pages,
            vec!["The fox wakes up.", "It walks to the river.", "It meets a frog."]
        );
    }

    #[test]
    fn rough_story_without_title_keeps_all_lines() {
        let draft = parse_rough_story("one\ntwo");
        assert_eq!(draft.title, "");
        assert_eq!(draft.pages.len(), 2);
    }

    #[test]
    fn strips_json_code_fence() {
        let raw = "```json\n{\"title\": \"T\", \"pages\": [\"a\"]}\n```";
        assert_eq!(strip_code_fence(raw), "{\"title\": \"T\", \"pages\": [\"a\"]}");
        assert_eq!(strip_code_fence("  {}  "), "{}");
    }

    #[test]
    fn formatted_story_must_match_page_count() {
        let raw = r#"{"title": "T", "pages": ["a", "b"]}"#;
        assert!(parse_formatted_story(raw, 2).is_ok());
        assert!(parse_formatted_story(raw, 3).unwrap_err().contains("expected 3"));
        assert!(parse_formatted_story("not json", 2).is_err());
    }

    #[tokio::test]
    async fn formatter_retries_until_page_count_matches() {
        let backend = ScriptedTextBackend::sequence(vec![
            Ok("```json\n{\"title\": \"T\", \"pages\": [\"a\"]}\n```".to_string()),
            Ok(r#"{"title": "T", "pages": ["a", "b", "c"]}"#.to_string()),
        ]);
        let rough = StoryDraft {
            title: "T".to_string(),
            pages: vec!["a b c".to_string()],
        };
        let story = format_story(&backend, &rough, 3, &RetryPolicy::immediate(3))
            .await
            .unwrap();
        assert_eq!(story.pages, vec!["a", "b", "c"]);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn formatter_falls_back_to_empty_story_after_three_attempts() {
        let backend = ScriptedTextBackend::repeating("definitely not json");
        let rough = StoryDraft::empty(4);
        let story = format_story(&backend, &rough, 4, &RetryPolicy::immediate(3))
            .await
            .unwrap();
        assert_eq!(story, StoryDraft::empty(4));
        assert!(story.is_degraded());
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn formatter_aborts_on_backend_error() {
        let backend = ScriptedTextBackend::sequence(vec![Err(PortError::Upstream(
            "timeout".to_string(),
        ))]);
        let result = format_story(&backend, &StoryDraft::empty(2), 2, &RetryPolicy::immediate(3)).await;
        assert!(matches!(result, Err(PortError::Upstream(_))));
        assert_eq!(backend.calls(), 1);
    }
}
