//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use std::sync::Arc;
use storybook_core::ports::DatabaseService;
use storybook_core::BookStudio;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn DatabaseService>,
    pub config: Arc<Config>,
    /// The generation pipeline, wired to the same database as `db`.
    pub studio: Arc<BookStudio>,
}
