use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{info, warn};

use crate::migration::report::{MigrationReport, RunStatus, SkipStage};

/// Operator-facing destination for finished reports.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn publish(&self, report: &MigrationReport) -> Result<()>;
}

/// Writes the summary and one line per skipped record to the `dealsync::audit`
/// log target, where operators pick them up for remediation.
pub struct LogReportSink;

#[async_trait]
impl ReportSink for LogReportSink {
    async fn publish(&self, report: &MigrationReport) -> Result<()> {
        for skipped in &report.skipped {
            let stage = match skipped.stage {
                SkipStage::Validation => "validation",
                SkipStage::Write => "write",
            };
            warn!(
                target: "dealsync::audit",
                migration = %report.migration,
                run_id = %report.run_id,
                source_row = skipped.source_row,
                legacy_id = skipped.legacy_id.as_deref().unwrap_or(""),
                stage,
                reason = %skipped.reason,
                "record skipped"
            );
        }

        let t = &report.totals;
        match report.status {
            RunStatus::Completed => info!(
                target: "dealsync::audit",
                migration = %report.migration,
                run_id = %report.run_id,
                dry_run = report.dry_run,
                read = t.read,
                inserted = t.inserted,
                already_present = t.already_present,
                updated = t.updated,
                skipped = t.skipped(),
                warnings = t.warnings,
                "backfill completed"
            ),
            RunStatus::Aborted => warn!(
                target: "dealsync::audit",
                migration = %report.migration,
                run_id = %report.run_id,
                dry_run = report.dry_run,
                read = t.read,
                resume_cursor = %report.resume_cursor,
                reason = %report.abort_reason.as_ref().map(|r| r.to_string()).unwrap_or_default(),
                "backfill aborted"
            ),
        }
        Ok(())
    }
}

/// Archives the JSON report to S3 / MinIO.
pub struct S3ReportSink {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ReportSink {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

pub fn report_key(report: &MigrationReport) -> String {
    let mode = if report.dry_run { "dry-run" } else { "live" };
    format!(
        "migrations/{}/{}-{}-{}.json",
        report.migration,
        report.started_at.format("%Y%m%dT%H%M%SZ"),
        mode,
        report.run_id
    )
}

#[async_trait]
impl ReportSink for S3ReportSink {
    async fn publish(&self, report: &MigrationReport) -> Result<()> {
        let key = report_key(report);
        let body = serde_json::to_vec_pretty(report)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("S3 upload failed: {e}"))?;

        info!("Uploaded backfill report to s3://{}/{}", self.bucket, key);
        Ok(())
    }
}
