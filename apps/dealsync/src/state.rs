use std::sync::Arc;

use aws_sdk_s3::Client as S3Client;
use redis::Client as RedisClient;
use sqlx::PgPool;
use tokio::sync::{watch, Mutex};

use crate::config::Config;

/// Shared application state, injected into route handlers via Axum extractors
/// and handed to CLI runs directly.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub redis: Option<RedisClient>,
    pub s3: Option<S3Client>,
    pub config: Config,
    /// Flips to `true` on Ctrl-C. Running backfills stop after their current batch.
    pub shutdown: watch::Receiver<bool>,
    /// Held for the duration of an HTTP-triggered run; one at a time per process.
    pub backfill_lock: Arc<Mutex<()>>,
}
