use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::errors::MigrateError;
use crate::models::deal::CrmOwnerRow;

/// Read-only mapping from legacy owner references to canonical CRM owner ids.
#[async_trait]
pub trait OwnerDirectory: Send + Sync {
    /// Returns an entry for every reference that resolves. Unknown references
    /// are simply absent.
    async fn resolve(&self, references: &[String]) -> Result<HashMap<String, String>, MigrateError>;
}

/// Owners synced from Zoho into `crm_owners`. A legacy reference may be the
/// old user id kept in `legacy_ref` or already the canonical `owner_id`.
pub struct PgOwnerDirectory {
    pool: PgPool,
}

impl PgOwnerDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OwnerDirectory for PgOwnerDirectory {
    async fn resolve(&self, references: &[String]) -> Result<HashMap<String, String>, MigrateError> {
        if references.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<CrmOwnerRow> = sqlx::query_as(
            r#"
            SELECT legacy_ref, owner_id FROM crm_owners WHERE legacy_ref = ANY($1)
            UNION
            SELECT owner_id AS legacy_ref, owner_id FROM crm_owners WHERE owner_id = ANY($1)
            "#,
        )
        .bind(references)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MigrateError::OwnerLookup(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| (row.legacy_ref, row.owner_id))
            .collect())
    }
}
