//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use storybook_core::{Pricing, RetryPolicy, SamplerParams, StudioSettings};
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub log_level: Level,
    pub cors_origin: String,
    pub openai_api_key: Option<String>,
    pub text_model: String,
    pub image_api_url: String,
    pub image_api_key: Option<String>,
    pub sampler: SamplerParams,
    pub image_concurrency: usize,
    pub storage_dir: PathBuf,
    pub public_base_url: String,
    pub pricing: Pricing,
}

/// Reads an optional variable and parses it, falling back to `default` when unset.
fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        // --- Load Server and Database Settings ---
        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string())
        })?;

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let cors_origin = std::env::var("CORS_ORIGIN")
            .unwrap_or_else(|_| "http://localhost:3000".to_string());

        // --- Load Backend Settings ---
        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let text_model =
            std::env::var("TEXT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let image_api_url = std::env::var("IMAGE_API_URL").unwrap_or_else(|_| {
            "https://api.stability.ai/v1/generation/stable-diffusion-xl-1024-v1-0/text-to-image"
                .to_string()
        });
        let image_api_key = std::env::var("IMAGE_API_KEY").ok();

        let defaults = SamplerParams::default();
        let sampler = SamplerParams {
            width: parse_var("IMAGE_WIDTH", defaults.width)?,
            height: parse_var("IMAGE_HEIGHT", defaults.height)?,
            steps: parse_var("IMAGE_STEPS", defaults.steps)?,
            cfg_scale: parse_var("IMAGE_CFG_SCALE", defaults.cfg_scale)?,
            ..defaults
        };
        let image_concurrency = parse_var("IMAGE_CONCURRENCY", 2usize)?;
        if image_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "IMAGE_CONCURRENCY".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        // --- Load Storage Settings ---
        let storage_dir = std::env::var("STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./media"));
        let public_base_url = std::env::var("PUBLIC_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:3000/media".to_string());

        // --- Load Pricing ---
        let base = Pricing::default();
        let pricing = Pricing {
            cost_per_page: parse_var("COST_PER_PAGE", base.cost_per_page)?,
            regenerate_cost: parse_var("REGENERATE_COST", base.regenerate_cost)?,
            signup_bonus: parse_var("SIGNUP_BONUS", base.signup_bonus)?,
            public_book_reward: parse_var("PUBLIC_BOOK_REWARD", base.public_book_reward)?,
        };

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            cors_origin,
            openai_api_key,
            text_model,
            image_api_url,
            image_api_key,
            sampler,
            image_concurrency,
            storage_dir,
            public_base_url,
            pricing,
        })
    }

    /// Pipeline settings derived from this configuration.
    pub fn studio_settings(&self) -> StudioSettings {
        StudioSettings {
            pricing: self.pricing,
            sampler: self.sampler.clone(),
            image_concurrency: self.image_concurrency,
            formatter_retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_variable_uses_default() {
        assert_eq!(parse_var("STORYBOOK_TEST_UNSET_VAR", 42u32).unwrap(), 42);
    }

    #[test]
    fn malformed_number_is_rejected() {
        std::env::set_var("STORYBOOK_TEST_BAD_NUMBER", "fifteen");
        let err = parse_var("STORYBOOK_TEST_BAD_NUMBER", 15i64).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(name, _) if name == "STORYBOOK_TEST_BAD_NUMBER"));
    }
}
