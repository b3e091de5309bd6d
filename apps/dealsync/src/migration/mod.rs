pub mod audit;
pub mod checkpoint;
pub mod controller;
#[cfg(test)]
pub mod memory;
pub mod models;
pub mod owners;
pub mod report;
pub mod source;
pub mod transform;
pub mod writer;

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::cache::{invalidate_pattern, DEALS_CACHE_PATTERN};
use crate::migration::audit::{LogReportSink, ReportSink, S3ReportSink};
use crate::migration::checkpoint::PgCheckpointStore;
use crate::migration::controller::{Collaborators, MigrationController, RunOptions};
use crate::migration::owners::PgOwnerDirectory;
use crate::migration::report::MigrationReport;
use crate::migration::source::PgDealSource;
use crate::migration::writer::PgDealWriter;
use crate::progress::{NoopProgressTracker, ProgressTracker, RedisProgressTracker};
use crate::state::AppState;

/// Checkpoint and progress key for the Zoho deals backfill.
pub const ZOHO_DEALS: &str = "zoho_deals";

pub fn progress_tracker(state: &AppState) -> Arc<dyn ProgressTracker> {
    match &state.redis {
        Some(client) => Arc::new(RedisProgressTracker::new(client.clone())),
        None => Arc::new(NoopProgressTracker),
    }
}

/// Wires the Postgres-backed collaborators, runs the deals backfill, then
/// publishes the report and drops stale API cache entries.
///
/// Only setup problems come back as `Err`; an aborted run is a report.
pub async fn run_deal_backfill(state: &AppState, options: &RunOptions) -> Result<MigrationReport> {
    let store = Arc::new(PgDealSource::new(state.db.clone(), &state.config.legacy_table)?);
    let parts = Collaborators {
        source: store,
        writer: Arc::new(PgDealWriter::new(state.db.clone())),
        owners: Arc::new(PgOwnerDirectory::new(state.db.clone())),
        checkpoints: Arc::new(PgCheckpointStore::new(state.db.clone())),
        progress: progress_tracker(state),
    };
    let controller =
        MigrationController::new(ZOHO_DEALS, parts, state.config.controller_settings());

    let report = controller.run(options, &state.shutdown).await;

    let mut sinks: Vec<Box<dyn ReportSink>> = vec![Box::new(LogReportSink)];
    if let (Some(client), Some(s3)) = (&state.s3, &state.config.s3) {
        sinks.push(Box::new(S3ReportSink::new(client.clone(), s3.bucket.clone())));
    }
    for sink in &sinks {
        if let Err(e) = sink.publish(&report).await {
            warn!(error = %e, "failed to publish backfill report");
        }
    }

    if !report.dry_run && report.totals.changed() > 0 {
        if let Some(client) = &state.redis {
            if let Err(e) = invalidate_pattern(client, DEALS_CACHE_PATTERN).await {
                warn!(error = %e, "deals cache invalidation failed");
            }
        }
    }

    Ok(report)
}
