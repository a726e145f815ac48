//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use secrecy::SecretString;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,

    /// Identifier stamped into lease columns. Defaults to `worker-<pid>`,
    /// which is only unique per machine; set WORKER_ID when running a
    /// fleet.
    pub worker_id: String,

    pub claim_batch_size: usize,
    pub lease_timeout: Duration,
    pub poll_interval: Duration,
    pub reconcile_interval: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,

    pub telegram_bot_token: Option<SecretString>,
    pub telegram_chat_id: Option<String>,

    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            worker_id: std::env::var("WORKER_ID")
                .unwrap_or_else(|_| format!("worker-{}", std::process::id())),
            claim_batch_size: parsed_var("CLAIM_BATCH_SIZE", 10)?,
            lease_timeout: Duration::from_secs(parsed_var("LEASE_TIMEOUT_SECS", 1800)?),
            poll_interval: Duration::from_secs(parsed_var("POLL_INTERVAL_SECS", 30)?),
            reconcile_interval: Duration::from_secs(parsed_var("RECONCILE_INTERVAL_SECS", 60)?),
            max_retries: parsed_var("MAX_RETRIES", 3)?,
            retry_base: Duration::from_millis(parsed_var("RETRY_BASE_MS", 2000)?),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN")
                .ok()
                .map(SecretString::from),
            telegram_chat_id: std::env::var("TELEGRAM_CHAT_ID").ok(),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("cannot parse {name}={raw}"))),
        Err(_) => Ok(default),
    }
}
