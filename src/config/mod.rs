//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

use std::time::Duration;

use crate::caller::DEFAULT_TIMEOUT;
use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Prefix for caller ids.
    pub namespace: Option<String>,
    /// Worker concurrency when serving a topic.
    pub concurrency: usize,
    /// Default request timeout.
    pub request_timeout: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let concurrency = parse_var("TASQ_CONCURRENCY", 1usize)?;
        if concurrency == 0 {
            return Err(Error::Config("TASQ_CONCURRENCY must be at least 1".to_string()));
        }
        let timeout_ms = parse_var("TASQ_TIMEOUT_MS", DEFAULT_TIMEOUT.as_millis() as u64)?;
        if timeout_ms == 0 {
            return Err(Error::Config("TASQ_TIMEOUT_MS must be positive".to_string()));
        }

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            namespace: std::env::var("TASQ_NAMESPACE").ok().filter(|ns| !ns.is_empty()),
            concurrency,
            request_timeout: Duration::from_millis(timeout_ms),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}"))),
        Err(_) => Ok(default),
    }
}
