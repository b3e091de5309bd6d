use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CheckpointRow {
    pub migration_name: String,
    pub cursor: Option<i64>,
    pub counters: Value,
    pub last_run_at: DateTime<Utc>,
}
