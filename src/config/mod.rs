//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod settings;

pub use settings::Settings;

use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// HMAC key for outbound signatures. Unsigned deliveries when absent.
    pub signing_secret: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Tunables for the dispatch loop and sender.
    pub settings: Settings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            signing_secret: std::env::var("HOOKQ_SIGNING_SECRET")
                .ok()
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            settings: Settings::global().clone(),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
