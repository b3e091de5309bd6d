use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::debug;

use crate::errors::MigrateError;
use crate::migration::models::Cursor;
use crate::migration::report::{BatchResult, Counters};
use crate::models::checkpoint::CheckpointRow;

/// Durable progress marker, keyed by migration name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub migration: String,
    pub cursor: Cursor,
    pub counters: Counters,
    pub last_run_at: DateTime<Utc>,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, migration: &str) -> Result<Option<Checkpoint>, MigrateError>;
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), MigrateError>;
}

/// Progress of one migration, threaded through the controller loop.
/// Only batches that were fully processed advance it.
#[derive(Debug, Clone)]
pub struct MigrationState {
    pub migration: String,
    pub cursor: Cursor,
    pub counters: Counters,
    pub dry_run: bool,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl MigrationState {
    pub fn fresh(migration: &str, start: Cursor, dry_run: bool) -> Self {
        MigrationState {
            migration: migration.to_string(),
            cursor: start,
            counters: Counters::default(),
            dry_run,
            last_run_at: None,
        }
    }

    pub fn resumed(checkpoint: Checkpoint) -> Self {
        MigrationState {
            migration: checkpoint.migration,
            cursor: checkpoint.cursor,
            counters: checkpoint.counters,
            dry_run: false,
            last_run_at: Some(checkpoint.last_run_at),
        }
    }

    pub fn advance(&mut self, batch: &BatchResult) {
        self.cursor = batch.cursor_after;
        self.counters.absorb(batch);
        self.last_run_at = Some(Utc::now());
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            migration: self.migration.clone(),
            cursor: self.cursor,
            counters: self.counters.clone(),
            last_run_at: self.last_run_at.unwrap_or_else(Utc::now),
        }
    }
}

pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, migration: &str) -> Result<Option<Checkpoint>, MigrateError> {
        let row: Option<CheckpointRow> =
            sqlx::query_as("SELECT * FROM migration_checkpoints WHERE migration_name = $1")
                .bind(migration)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| MigrateError::CheckpointPersist(e.to_string()))?;

        row.map(|row| -> Result<Checkpoint, MigrateError> {
            let counters = serde_json::from_value(row.counters).map_err(|e| {
                MigrateError::CheckpointPersist(format!("corrupt counters for {migration}: {e}"))
            })?;
            Ok(Checkpoint {
                migration: row.migration_name,
                cursor: row.cursor.map(Cursor::after).unwrap_or_default(),
                counters,
                last_run_at: row.last_run_at,
            })
        })
        .transpose()
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), MigrateError> {
        sqlx::query(
            r#"
            INSERT INTO migration_checkpoints (migration_name, cursor, counters, last_run_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (migration_name) DO UPDATE SET
                cursor = EXCLUDED.cursor,
                counters = EXCLUDED.counters,
                last_run_at = EXCLUDED.last_run_at
            "#,
        )
        .bind(&checkpoint.migration)
        .bind(checkpoint.cursor.last_row())
        .bind(Json(&checkpoint.counters))
        .bind(checkpoint.last_run_at)
        .execute(&self.pool)
        .await
        .map_err(|e| MigrateError::CheckpointPersist(e.to_string()))?;

        debug!(migration = %checkpoint.migration, cursor = %checkpoint.cursor, "checkpoint saved");
        Ok(())
    }
}
