pub mod auth;
pub mod books;
pub mod jobs;
pub mod middleware;
pub mod pages;
pub mod rest;
pub mod state;

pub use middleware::require_auth;
pub use rest::ApiDoc;
