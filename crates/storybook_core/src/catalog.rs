//! crates/storybook_core/src/catalog.rs
//!
//! The fixed set of protagonists and art styles a book can be generated with,
//! and validation of an incoming generation request.

use crate::domain::BookParams;
use crate::ports::{PortError, PortResult};

pub const MIN_PAGE_COUNT: u32 = 5;
pub const MAX_PAGE_COUNT: u32 = 30;

const CHARACTERS: &[(&str, &str, &str)] = &[
    (
        "rabbit",
        "rabbit",
        "A small white rabbit child with long floppy ears, round dark eyes and a red scarf.",
    ),
    (
        "bear",
        "bear",
        "A chubby brown bear cub with round ears, a cream-colored belly and blue overalls.",
    ),
    (
        "cat",
        "cat",
        "A little orange tabby kitten with green eyes, white paws and a yellow bell collar.",
    ),
    (
        "dog",
        "puppy",
        "A fluffy beige puppy with floppy ears, a black nose and a green bandana.",
    ),
    (
        "fox",
        "fox",
        "A young red fox with a bushy white-tipped tail, amber eyes and a small backpack.",
    ),
    (
        "penguin",
        "penguin",
        "A round baby penguin with grey fluffy down, a white face and a striped knitted hat.",
    ),
    (
        "dinosaur",
        "dinosaur",
        "A friendly little green dinosaur with small back spikes, big eyes and a short tail.",
    ),
    (
        "child",
        "child",
        "A cheerful young child with short brown hair, rosy cheeks, a yellow shirt and blue shorts.",
    ),
];

const ART_STYLES: &[(&str, &str)] = &[
    (
        "watercolor",
        "Soft watercolor children's book illustration, gentle washes, pastel palette, white paper texture.",
    ),
    (
        "crayon",
        "Hand-drawn crayon illustration, visible waxy strokes, bright primary colors, naive style.",
    ),
    (
        "pastel",
        "Chalk pastel illustration, soft blended edges, warm muted colors, dreamy atmosphere.",
    ),
    (
        "anime",
        "Clean anime-style illustration, cel shading, crisp line art, vivid colors.",
    ),
    (
        "storybook",
        "Classic picture book illustration, detailed ink lines with gouache color, warm lighting.",
    ),
    (
        "paper_cut",
        "Layered paper cut-out illustration, flat shapes, subtle drop shadows, craft texture.",
    ),
];

/// Prompt fragments for a protagonist key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Character {
    pub key: &'static str,
    /// Species name used in the narrative prompts.
    pub species: &'static str,
    /// Visual description prepended to every image prompt.
    pub description: &'static str,
}

pub fn character(key: &str) -> Option<Character> {
    CHARACTERS
        .iter()
        .find(|(k, _, _)| *k == key)
        .map(|&(key, species, description)| Character {
            key,
            species,
            description,
        })
}

/// Visual style description appended to every image prompt.
pub fn art_style_description(key: &str) -> Option<&'static str> {
    ART_STYLES
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, description)| *description)
}

/// A generation request as submitted by a user.
#[derive(Debug, Clone)]
pub struct BookRequest {
    pub theme: String,
    pub genre: String,
    pub character: String,
    pub art_style: String,
    pub target_age: String,
    pub page_count: u32,
    pub language: String,
}

/// A request that passed validation, with its catalog entries resolved.
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub params: BookParams,
    pub character: Character,
    pub art_style: &'static str,
}

impl BookRequest {
    pub fn validate(self) -> PortResult<ResolvedRequest> {
        if !(MIN_PAGE_COUNT..=MAX_PAGE_COUNT).contains(&self.page_count) {
            return Err(PortError::InvalidInput(format!(
                "page count must be between {} and {}, got {}",
                MIN_PAGE_COUNT, MAX_PAGE_COUNT, self.page_count
            )));
        }
        for (name, value) in [
            ("theme", &self.theme),
            ("genre", &self.genre),
            ("target age", &self.target_age),
        ] {
            if value.trim().is_empty() {
                return Err(PortError::InvalidInput(format!("{} must not be empty", name)));
            }
        }
        let character = character(&self.character).ok_or_else(|| {
            PortError::InvalidInput(format!("unknown character '{}'", self.character))
        })?;
        let art_style = art_style_description(&self.art_style).ok_or_else(|| {
            PortError::InvalidInput(format!("unknown art style '{}'", self.art_style))
        })?;
        let language = if self.language.trim().is_empty() {
            "en".to_string()
        } else {
            self.language.trim().to_string()
        };

        Ok(ResolvedRequest {
            params: BookParams {
                theme: self.theme.trim().to_string(),
                genre: self.genre.trim().to_string(),
                character: self.character,
                art_style: self.art_style,
                target_age: self.target_age.trim().to_string(),
                page_count: self.page_count,
                language,
            },
            character,
            art_style,
        })
    }
}
