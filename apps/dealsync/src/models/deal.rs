use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Row of the legacy deals table: a primary key and the loose JSON payload
/// the old sync scripts dumped from Zoho.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LegacyDealRow {
    pub id: i64,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DealRow {
    pub id: Uuid,
    pub legacy_id: String,
    pub source_row: i64,
    pub name: String,
    pub stage: String,
    pub owner_id: Option<String>,
    pub amount: Option<f64>,
    pub closing_date: Option<NaiveDate>,
    pub created_time: Option<DateTime<Utc>>,
    pub modified_time: Option<DateTime<Utc>>,
    pub migration_warnings: Value,
    pub migrated_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CrmOwnerRow {
    pub legacy_ref: String,
    pub owner_id: String,
}
