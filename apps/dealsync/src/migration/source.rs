use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info};

use crate::errors::MigrateError;
use crate::migration::models::{Cursor, LegacyDealRecord};
use crate::models::deal::LegacyDealRow;

/// One page of legacy rows in primary-key order.
#[derive(Debug, Clone)]
pub struct Page {
    pub records: Vec<LegacyDealRecord>,
    pub next_cursor: Cursor,
    pub has_more: bool,
}

impl Page {
    /// Builds a page from up to `batch_size + 1` rows read past `cursor`.
    /// The extra row only tells us whether another page exists.
    pub fn assemble(cursor: Cursor, mut records: Vec<LegacyDealRecord>, batch_size: usize) -> Page {
        records.retain(|r| cursor.admits(r.source_row));
        let has_more = records.len() > batch_size;
        records.truncate(batch_size);
        let next_cursor = records
            .last()
            .map(|r| Cursor::after(r.source_row))
            .unwrap_or(cursor);
        Page {
            records,
            next_cursor,
            has_more,
        }
    }
}

/// Read side of the backfill. Reads never take locks beyond the store's
/// normal isolation, and failures are not retried here.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn next_batch(&self, cursor: Cursor, batch_size: usize) -> Result<Page, MigrateError>;

    /// Moves the legacy table out of the way. Returns the archived name.
    async fn archive(&self) -> Result<String, MigrateError>;
}

pub struct PgDealSource {
    pool: PgPool,
    table: String,
}

impl PgDealSource {
    pub fn new(pool: PgPool, table: &str) -> anyhow::Result<Self> {
        if !is_plain_identifier(table) {
            anyhow::bail!("legacy table name '{table}' is not a plain SQL identifier");
        }
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }
}

#[async_trait]
impl RecordSource for PgDealSource {
    async fn next_batch(&self, cursor: Cursor, batch_size: usize) -> Result<Page, MigrateError> {
        let query = format!(
            "SELECT id, data FROM {} WHERE id > $1 ORDER BY id ASC LIMIT $2",
            self.table
        );
        let rows: Vec<LegacyDealRow> = sqlx::query_as(&query)
            .bind(cursor.last_row().unwrap_or(i64::MIN))
            .bind(batch_size as i64 + 1)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MigrateError::SourceUnavailable(e.to_string()))?;

        debug!(table = %self.table, %cursor, rows = rows.len(), "fetched legacy page");
        let records = rows.into_iter().map(LegacyDealRecord::from).collect();
        Ok(Page::assemble(cursor, records, batch_size))
    }

    async fn archive(&self) -> Result<String, MigrateError> {
        let archived = archived_name(&self.table, Utc::now());
        sqlx::query(&format!("ALTER TABLE {} RENAME TO {}", self.table, archived))
            .execute(&self.pool)
            .await
            .map_err(|e| MigrateError::Archive(e.to_string()))?;
        info!("Archived legacy table {} as {}", self.table, archived);
        Ok(archived)
    }
}

/// Postgres silently truncates identifiers past this many bytes.
const MAX_IDENTIFIER_BYTES: usize = 63;
/// `_archived_` plus a `%Y%m%d%H%M%S` timestamp.
const ARCHIVE_SUFFIX_BYTES: usize = 10 + 14;

fn archived_name(table: &str, at: DateTime<Utc>) -> String {
    format!("{table}_archived_{}", at.format("%Y%m%d%H%M%S"))
}

/// Lowercase ASCII letters, digits and underscores, not starting with a digit.
/// Short enough that the archived name still fits in an identifier.
fn is_plain_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() + ARCHIVE_SUFFIX_BYTES <= MAX_IDENTIFIER_BYTES
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
