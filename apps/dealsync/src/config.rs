use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::migration::controller::{ControllerSettings, DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE};

/// Object storage for archived reports. MinIO locally, S3 in production.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Progress tracking and cache invalidation are skipped without Redis.
    pub redis_url: Option<String>,
    /// Reports are only logged without S3.
    pub s3: Option<S3Config>,
    pub port: u16,
    pub rust_log: String,
    pub legacy_table: String,
    pub batch_size: usize,
    pub fetch_timeout: Duration,
    pub fetch_attempts: u32,
    pub owner_timeout: Duration,
    pub write_timeout: Duration,
    pub write_retry_backoff: Duration,
    pub checkpoint_timeout: Duration,
    pub failure_window: usize,
    pub failure_min_samples: usize,
    pub max_failure_rate: f64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let batch_size: usize = env_or("BACKFILL_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if !(1..=MAX_BATCH_SIZE).contains(&batch_size) {
            anyhow::bail!("BACKFILL_BATCH_SIZE must be between 1 and {MAX_BATCH_SIZE}");
        }
        let max_failure_rate: f64 = env_or("BACKFILL_MAX_FAILURE_RATE", 0.5)?;
        if !(0.0..=1.0).contains(&max_failure_rate) {
            anyhow::bail!("BACKFILL_MAX_FAILURE_RATE must be between 0 and 1");
        }

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url: optional_env("REDIS_URL"),
            s3: s3_from_env(),
            port: env_or("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            legacy_table: std::env::var("BACKFILL_LEGACY_TABLE")
                .unwrap_or_else(|_| "zoho_deals_legacy".to_string()),
            batch_size,
            fetch_timeout: Duration::from_secs(env_or("BACKFILL_FETCH_TIMEOUT_SECS", 30)?),
            fetch_attempts: env_or("BACKFILL_FETCH_ATTEMPTS", 3)?,
            owner_timeout: Duration::from_secs(env_or("BACKFILL_OWNER_TIMEOUT_SECS", 10)?),
            write_timeout: Duration::from_secs(env_or("BACKFILL_WRITE_TIMEOUT_SECS", 10)?),
            write_retry_backoff: Duration::from_millis(env_or(
                "BACKFILL_WRITE_RETRY_BACKOFF_MS",
                500,
            )?),
            checkpoint_timeout: Duration::from_secs(env_or(
                "BACKFILL_CHECKPOINT_TIMEOUT_SECS",
                10,
            )?),
            failure_window: env_or("BACKFILL_FAILURE_WINDOW", 200)?,
            failure_min_samples: env_or("BACKFILL_FAILURE_MIN_SAMPLES", 50)?,
            max_failure_rate,
        })
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            fetch_timeout: self.fetch_timeout,
            fetch_attempts: self.fetch_attempts,
            owner_timeout: self.owner_timeout,
            write_timeout: self.write_timeout,
            write_retry_backoff: self.write_retry_backoff,
            checkpoint_timeout: self.checkpoint_timeout,
            failure_window: self.failure_window,
            failure_min_samples: self.failure_min_samples,
            max_failure_rate: self.max_failure_rate,
        }
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional_env(key) {
        Some(raw) => parse_setting(key, &raw),
        None => Ok(default),
    }
}

fn parse_setting<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("{key} has an invalid value '{raw}'"))
}

fn s3_from_env() -> Option<S3Config> {
    Some(S3Config {
        bucket: optional_env("S3_BUCKET")?,
        endpoint: optional_env("S3_ENDPOINT")?,
        access_key_id: optional_env("AWS_ACCESS_KEY_ID")?,
        secret_access_key: optional_env("AWS_SECRET_ACCESS_KEY")?,
    })
}
