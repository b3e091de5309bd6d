use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::debug;

use crate::errors::MigrateError;
use crate::migration::models::{MigratedDealRecord, WriteMode, WriteOutcome};
use crate::models::deal::DealRow;

/// Idempotent write side of the backfill, keyed on the legacy back-reference.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    async fn upsert(
        &self,
        record: &MigratedDealRecord,
        mode: WriteMode,
    ) -> Result<WriteOutcome, MigrateError>;

    /// Read-only lookup by back-reference. Dry runs use this instead of `upsert`.
    async fn find(&self, legacy_id: &str) -> Result<Option<MigratedDealRecord>, MigrateError>;
}

/// What `upsert` does given the row currently stored under the same
/// back-reference.
pub fn predict_outcome(
    existing: Option<&MigratedDealRecord>,
    record: &MigratedDealRecord,
    mode: WriteMode,
) -> WriteOutcome {
    match (existing, mode) {
        (None, _) => WriteOutcome::Inserted,
        (Some(_), WriteMode::InsertOnly) => WriteOutcome::AlreadyPresent,
        (Some(current), WriteMode::Force) if current.same_content(record) => {
            WriteOutcome::AlreadyPresent
        }
        (Some(_), WriteMode::Force) => WriteOutcome::Updated,
    }
}

pub struct PgDealWriter {
    pool: PgPool,
}

impl PgDealWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const INSERT_ONLY_SQL: &str = r#"
    INSERT INTO zoho_deals
        (id, legacy_id, source_row, name, stage, owner_id, amount, closing_date,
         created_time, modified_time, migration_warnings)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    ON CONFLICT (legacy_id) DO NOTHING
    RETURNING TRUE
"#;

// Rows whose content is unchanged are filtered by the WHERE clause and come
// back empty, which we report as AlreadyPresent.
const FORCE_SQL: &str = r#"
    INSERT INTO zoho_deals
        (id, legacy_id, source_row, name, stage, owner_id, amount, closing_date,
         created_time, modified_time, migration_warnings)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    ON CONFLICT (legacy_id) DO UPDATE SET
        name = EXCLUDED.name,
        stage = EXCLUDED.stage,
        owner_id = EXCLUDED.owner_id,
        amount = EXCLUDED.amount,
        closing_date = EXCLUDED.closing_date,
        created_time = EXCLUDED.created_time,
        modified_time = EXCLUDED.modified_time,
        migration_warnings = EXCLUDED.migration_warnings,
        updated_at = now()
    WHERE (zoho_deals.name, zoho_deals.stage, zoho_deals.owner_id, zoho_deals.amount,
           zoho_deals.closing_date, zoho_deals.created_time, zoho_deals.modified_time,
           zoho_deals.migration_warnings)
        IS DISTINCT FROM
          (EXCLUDED.name, EXCLUDED.stage, EXCLUDED.owner_id, EXCLUDED.amount,
           EXCLUDED.closing_date, EXCLUDED.created_time, EXCLUDED.modified_time,
           EXCLUDED.migration_warnings)
    RETURNING (xmax = 0)
"#;

#[async_trait]
impl TargetWriter for PgDealWriter {
    async fn upsert(
        &self,
        record: &MigratedDealRecord,
        mode: WriteMode,
    ) -> Result<WriteOutcome, MigrateError> {
        let sql = match mode {
            WriteMode::InsertOnly => INSERT_ONLY_SQL,
            WriteMode::Force => FORCE_SQL,
        };
        // Some(true) = fresh insert, Some(false) = updated in place, None = untouched.
        let inserted: Option<bool> = sqlx::query_scalar(sql)
            .bind(record.id)
            .bind(&record.legacy_id)
            .bind(record.source_row)
            .bind(&record.name)
            .bind(record.stage.as_str())
            .bind(&record.owner_id)
            .bind(record.amount)
            .bind(record.closing_date)
            .bind(record.created_time)
            .bind(record.modified_time)
            .bind(Json(&record.warnings))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify_write_error(e, &record.legacy_id))?;

        let outcome = match inserted {
            Some(true) => WriteOutcome::Inserted,
            Some(false) => WriteOutcome::Updated,
            None => WriteOutcome::AlreadyPresent,
        };
        debug!(legacy_id = %record.legacy_id, ?outcome, "upserted deal");
        Ok(outcome)
    }

    async fn find(&self, legacy_id: &str) -> Result<Option<MigratedDealRecord>, MigrateError> {
        let row: Option<DealRow> =
            sqlx::query_as("SELECT * FROM zoho_deals WHERE legacy_id = $1")
                .bind(legacy_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| MigrateError::WriteFailure(format!("{legacy_id}: {e}")))?;
        Ok(row.map(MigratedDealRecord::from))
    }
}

/// A unique violation means a concurrent run inserted the same deal first.
fn classify_write_error(err: sqlx::Error, legacy_id: &str) -> MigrateError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            MigrateError::WriteConflict(legacy_id.to_string())
        }
        _ => MigrateError::WriteFailure(format!("{legacy_id}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::models::DealStage;

    fn deal(name: &str) -> MigratedDealRecord {
        MigratedDealRecord {
            id: MigratedDealRecord::target_id("7"),
            legacy_id: "7".into(),
            source_row: 7,
            name: name.into(),
            stage: DealStage::Qualification,
            owner_id: None,
            amount: Some(100.0),
            closing_date: None,
            created_time: None,
            modified_time: None,
            warnings: vec![],
        }
    }

    #[test]
    fn test_absent_record_is_inserted_in_any_mode() {
        let d = deal("A");
        assert_eq!(predict_outcome(None, &d, WriteMode::InsertOnly), WriteOutcome::Inserted);
        assert_eq!(predict_outcome(None, &d, WriteMode::Force), WriteOutcome::Inserted);
    }

    #[test]
    fn test_insert_only_never_updates() {
        let stored = deal("A");
        let changed = deal("B");
        assert_eq!(
            predict_outcome(Some(&stored), &changed, WriteMode::InsertOnly),
            WriteOutcome::AlreadyPresent
        );
    }

    #[test]
    fn test_force_updates_only_changed_content() {
        let stored = deal("A");
        assert_eq!(
            predict_outcome(Some(&stored), &deal("A"), WriteMode::Force),
            WriteOutcome::AlreadyPresent
        );
        assert_eq!(
            predict_outcome(Some(&stored), &deal("B"), WriteMode::Force),
            WriteOutcome::Updated
        );
    }

    #[test]
    fn test_non_database_errors_are_write_failures() {
        let err = classify_write_error(sqlx::Error::PoolTimedOut, "7");
        assert!(matches!(err, MigrateError::WriteFailure(msg) if msg.starts_with("7:")));
    }
}
