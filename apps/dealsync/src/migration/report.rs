use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::migration::models::{Cursor, WriteOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipStage {
    Validation,
    Write,
}

/// A record that was not persisted, kept for operator remediation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub source_row: i64,
    pub legacy_id: Option<String>,
    pub stage: SkipStage,
    pub reason: String,
}

/// Outcome counters. Used per run in the report and cumulatively in the
/// checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Counters {
    pub batches: u64,
    pub read: u64,
    pub transformed: u64,
    pub inserted: u64,
    pub already_present: u64,
    pub updated: u64,
    pub skipped_validation: u64,
    pub skipped_write: u64,
    pub warnings: u64,
}

impl Counters {
    pub fn absorb(&mut self, batch: &BatchResult) {
        let c = &batch.counts;
        self.batches += 1;
        self.read += c.read;
        self.transformed += c.transformed;
        self.inserted += c.inserted;
        self.already_present += c.already_present;
        self.updated += c.updated;
        self.skipped_validation += c.skipped_validation;
        self.skipped_write += c.skipped_write;
        self.warnings += c.warnings;
    }

    pub fn skipped(&self) -> u64 {
        self.skipped_validation + self.skipped_write
    }

    /// Records whose target row was created or changed.
    pub fn changed(&self) -> u64 {
        self.inserted + self.updated
    }

    /// Every read record lands in exactly one of these buckets.
    pub fn classified(&self) -> u64 {
        self.inserted + self.updated + self.already_present + self.skipped()
    }
}

/// Per-batch outcome, folded into the report and the migration state.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub batch: u64,
    pub cursor_after: Cursor,
    /// `batches` is unused here; a batch is one unit by definition.
    pub counts: Counters,
    pub skipped: Vec<SkippedRecord>,
    pub elapsed: Duration,
}

impl BatchResult {
    pub fn new(batch: u64, cursor_after: Cursor, read: usize) -> Self {
        BatchResult {
            batch,
            cursor_after,
            counts: Counters {
                read: read as u64,
                ..Counters::default()
            },
            ..BatchResult::default()
        }
    }

    pub fn record_outcome(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Inserted => self.counts.inserted += 1,
            WriteOutcome::AlreadyPresent => self.counts.already_present += 1,
            WriteOutcome::Updated => self.counts.updated += 1,
        }
    }

    pub fn skip(&mut self, skipped: SkippedRecord) {
        match skipped.stage {
            SkipStage::Validation => self.counts.skipped_validation += 1,
            SkipStage::Write => self.counts.skipped_write += 1,
        }
        self.skipped.push(skipped);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    SourceUnavailable { message: String },
    FailureThreshold { failures: usize, samples: usize, rate: f64 },
    CheckpointPersist { message: String },
    OwnerLookup { message: String },
    Stopped,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::SourceUnavailable { message } => write!(f, "source unavailable: {message}"),
            AbortReason::FailureThreshold {
                failures,
                samples,
                rate,
            } => write!(
                f,
                "failure rate {:.1}% ({failures} of the last {samples} operations) exceeded the threshold",
                rate * 100.0
            ),
            AbortReason::CheckpointPersist { message } => {
                write!(f, "checkpoint could not be persisted: {message}")
            }
            AbortReason::OwnerLookup { message } => write!(f, "owner directory failed: {message}"),
            AbortReason::Stopped => write!(f, "stopped by operator"),
        }
    }
}

/// Machine-readable summary handed to the CLI, HTTP layer and audit sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    pub migration: String,
    pub run_id: Uuid,
    pub status: RunStatus,
    pub dry_run: bool,
    pub abort_reason: Option<AbortReason>,
    /// This run only.
    pub totals: Counters,
    /// Across resumed runs, as stored in the checkpoint.
    pub cumulative: Counters,
    pub skipped: Vec<SkippedRecord>,
    pub start_cursor: Cursor,
    /// Last fully committed position; `--resume` continues from here.
    pub resume_cursor: Cursor,
    pub archived_table: Option<String>,
    pub archive_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub records_per_sec: f64,
}

impl MigrationReport {
    /// 0 on completion, 1 on abort, 2 when the run completed but archival failed.
    pub fn exit_code(&self) -> u8 {
        match (self.status, &self.archive_error) {
            (RunStatus::Aborted, _) => 1,
            (RunStatus::Completed, Some(_)) => 2,
            (RunStatus::Completed, None) => 0,
        }
    }

    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = &self.totals;
        let status = match self.status {
            RunStatus::Completed => "COMPLETED",
            RunStatus::Aborted => "ABORTED",
        };
        let mode = if self.dry_run { "dry run" } else { "live" };
        writeln!(f, "{} backfill {status} ({mode}), run {}", self.migration, self.run_id)?;
        if let Some(reason) = &self.abort_reason {
            writeln!(f, "  abort reason     {reason}")?;
        }
        writeln!(f, "  read             {}", t.read)?;
        writeln!(f, "  inserted         {}", t.inserted)?;
        writeln!(f, "  already present  {}", t.already_present)?;
        writeln!(f, "  updated          {}", t.updated)?;
        writeln!(
            f,
            "  skipped          {} (validation {}, write {})",
            t.skipped(),
            t.skipped_validation,
            t.skipped_write
        )?;
        writeln!(f, "  warnings         {}", t.warnings)?;
        writeln!(f, "  batches          {}", t.batches)?;
        writeln!(
            f,
            "  elapsed          {} ms ({:.1} records/sec)",
            self.elapsed_ms, self.records_per_sec
        )?;
        writeln!(f, "  start cursor     {}", self.start_cursor)?;
        writeln!(f, "  resume cursor    {}", self.resume_cursor)?;
        if let Some(table) = &self.archived_table {
            writeln!(f, "  archived as      {table}")?;
        }
        if let Some(err) = &self.archive_error {
            writeln!(f, "  archive FAILED   {err}")?;
        }
        if self.status == RunStatus::Aborted && !self.dry_run {
            writeln!(f, "Re-run with --resume to continue from {}.", self.resume_cursor)?;
        }
        if !self.skipped.is_empty() {
            writeln!(f, "Skipped records:")?;
            for s in &self.skipped {
                let stage = match s.stage {
                    SkipStage::Validation => "validation",
                    SkipStage::Write => "write",
                };
                writeln!(
                    f,
                    "  row {} (legacy id {}) [{stage}] {}",
                    s.source_row,
                    s.legacy_id.as_deref().unwrap_or("?"),
                    s.reason
                )?;
            }
        }
        Ok(())
    }
}

/// Controller-side facts needed to close out a report.
pub struct RunOutcome {
    pub migration: String,
    pub run_id: Uuid,
    pub dry_run: bool,
    pub abort_reason: Option<AbortReason>,
    pub cumulative: Counters,
    pub start_cursor: Cursor,
    pub resume_cursor: Cursor,
    pub archived_table: Option<String>,
    pub archive_error: Option<String>,
}

/// Accumulates batch results for one run.
pub struct ReportBuilder {
    totals: Counters,
    skipped: Vec<SkippedRecord>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl ReportBuilder {
    pub fn new() -> Self {
        Self {
            totals: Counters::default(),
            skipped: Vec::new(),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn absorb(&mut self, batch: &BatchResult) {
        self.totals.absorb(batch);
        self.skipped.extend(batch.skipped.iter().cloned());
    }

    pub fn totals(&self) -> &Counters {
        &self.totals
    }

    pub fn finish(self, outcome: RunOutcome) -> MigrationReport {
        let elapsed = self.started.elapsed();
        let secs = elapsed.as_secs_f64();
        let records_per_sec = if secs > 0.0 {
            self.totals.read as f64 / secs
        } else {
            0.0
        };
        let status = if outcome.abort_reason.is_some() {
            RunStatus::Aborted
        } else {
            RunStatus::Completed
        };
        MigrationReport {
            migration: outcome.migration,
            run_id: outcome.run_id,
            status,
            dry_run: outcome.dry_run,
            abort_reason: outcome.abort_reason,
            totals: self.totals,
            cumulative: outcome.cumulative,
            skipped: self.skipped,
            start_cursor: outcome.start_cursor,
            resume_cursor: outcome.resume_cursor,
            archived_table: outcome.archived_table,
            archive_error: outcome.archive_error,
            started_at: self.started_at,
            elapsed_ms: elapsed.as_millis() as u64,
            records_per_sec,
        }
    }
}
