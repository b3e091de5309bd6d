use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::migration::controller::MigrationPhase;
use crate::migration::models::Cursor;
use crate::migration::report::Counters;

/// Progress entries expire a day after the last update.
const PROGRESS_TTL_SECS: u64 = 24 * 60 * 60;

/// Latest known status of a running or finished backfill job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub migration: String,
    pub run_id: Uuid,
    pub phase: MigrationPhase,
    pub dry_run: bool,
    pub cursor: Cursor,
    pub totals: Counters,
    pub updated_at: DateTime<Utc>,
}

/// Ephemeral per-job status store. Losing an update is harmless; the
/// checkpoint remains the source of truth for resuming.
#[async_trait]
pub trait ProgressTracker: Send + Sync {
    async fn publish(&self, progress: &JobProgress) -> Result<()>;
    async fn latest(&self, migration: &str) -> Result<Option<JobProgress>>;
}

pub struct RedisProgressTracker {
    client: redis::Client,
}

impl RedisProgressTracker {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

fn progress_key(migration: &str) -> String {
    format!("backfill:progress:{migration}")
}

#[async_trait]
impl ProgressTracker for RedisProgressTracker {
    async fn publish(&self, progress: &JobProgress) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(progress)?;
        conn.set_ex::<_, _, ()>(progress_key(&progress.migration), payload, PROGRESS_TTL_SECS)
            .await?;
        Ok(())
    }

    async fn latest(&self, migration: &str) -> Result<Option<JobProgress>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload: Option<String> = conn.get(progress_key(migration)).await?;
        payload
            .map(|p| serde_json::from_str(&p))
            .transpose()
            .map_err(Into::into)
    }
}

/// Used when no Redis is configured.
pub struct NoopProgressTracker;

#[async_trait]
impl ProgressTracker for NoopProgressTracker {
    async fn publish(&self, _progress: &JobProgress) -> Result<()> {
        Ok(())
    }

    async fn latest(&self, _migration: &str) -> Result<Option<JobProgress>> {
        Ok(None)
    }
}
