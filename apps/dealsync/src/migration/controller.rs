//! Migration controller: pages the legacy table, transforms and writes each
//! batch, checkpoints after every fully processed batch, and decides between
//! `Completed` and `Aborted`.
//!
//! Batches run strictly in order. Record-level problems (validation, a write
//! that still fails after its retry) are reported and skipped; infrastructure
//! problems (source outage, owner directory, checkpoint store) abort the run
//! with the last committed cursor as the resume point.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::MigrateError;
use crate::migration::checkpoint::{CheckpointStore, MigrationState};
use crate::migration::models::{Cursor, LegacyDealRecord, MigratedDealRecord, WriteMode, WriteOutcome};
use crate::migration::owners::OwnerDirectory;
use crate::migration::report::{
    AbortReason, BatchResult, Counters, MigrationReport, ReportBuilder, RunOutcome, SkipStage,
    SkippedRecord,
};
use crate::migration::source::{Page, RecordSource};
use crate::migration::transform::{identity_hint, owner_reference, transform};
use crate::migration::writer::{predict_outcome, TargetWriter};
use crate::progress::{JobProgress, ProgressTracker};

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const MAX_BATCH_SIZE: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Idle,
    Running,
    Completed,
    Aborted,
}

/// Per-invocation options, shared by the CLI flags and the HTTP request body.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub batch_size: usize,
    pub archive_legacy: bool,
    pub resume: bool,
    /// Overwrite already-migrated rows whose legacy data changed.
    pub force: bool,
    /// Start past this legacy row instead of the beginning.
    pub start_after: Option<i64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            batch_size: DEFAULT_BATCH_SIZE,
            archive_legacy: false,
            resume: false,
            force: false,
            start_after: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub fetch_timeout: Duration,
    /// Attempts per page when the fetch times out.
    pub fetch_attempts: u32,
    pub owner_timeout: Duration,
    pub write_timeout: Duration,
    pub write_retry_backoff: Duration,
    pub checkpoint_timeout: Duration,
    pub failure_window: usize,
    /// The guard stays quiet until the window holds this many operations.
    pub failure_min_samples: usize,
    pub max_failure_rate: f64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            fetch_attempts: 3,
            owner_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            write_retry_backoff: Duration::from_millis(500),
            checkpoint_timeout: Duration::from_secs(10),
            failure_window: 200,
            failure_min_samples: 50,
            max_failure_rate: 0.5,
        }
    }
}

/// Rolling record of the most recent operation outcomes.
#[derive(Debug)]
pub struct FailureWindow {
    outcomes: VecDeque<bool>,
    capacity: usize,
    min_samples: usize,
    max_rate: f64,
}

impl FailureWindow {
    pub fn new(capacity: usize, min_samples: usize, max_rate: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            capacity,
            min_samples: min_samples.clamp(1, capacity),
            max_rate,
        }
    }

    pub fn record(&mut self, failed: bool) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(failed);
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|f| **f).count()
    }

    pub fn rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.failures() as f64 / self.outcomes.len() as f64
    }

    pub fn tripped(&self) -> bool {
        self.outcomes.len() >= self.min_samples && self.rate() > self.max_rate
    }

    fn abort_reason(&self) -> AbortReason {
        AbortReason::FailureThreshold {
            failures: self.failures(),
            samples: self.outcomes.len(),
            rate: self.rate(),
        }
    }
}

/// A processed batch, plus the guard's verdict when it tripped partway through.
struct BatchRun {
    batch: BatchResult,
    tripped: Option<AbortReason>,
}

pub struct Collaborators {
    pub source: Arc<dyn RecordSource>,
    pub writer: Arc<dyn TargetWriter>,
    pub owners: Arc<dyn OwnerDirectory>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub progress: Arc<dyn ProgressTracker>,
}

pub struct MigrationController {
    migration: String,
    parts: Collaborators,
    settings: ControllerSettings,
}

impl MigrationController {
    pub fn new(migration: &str, parts: Collaborators, settings: ControllerSettings) -> Self {
        Self {
            migration: migration.to_string(),
            parts,
            settings,
        }
    }

    /// Runs the migration to `Completed` or `Aborted`. Fatal conditions are
    /// reported in the returned report rather than as an `Err`.
    ///
    /// `stop` is polled between batches only.
    pub async fn run(&self, options: &RunOptions, stop: &watch::Receiver<bool>) -> MigrationReport {
        let run_id = Uuid::new_v4();
        let batch_size = options.batch_size.clamp(1, MAX_BATCH_SIZE);
        let mode = if options.force {
            WriteMode::Force
        } else {
            WriteMode::InsertOnly
        };
        let mut report = ReportBuilder::new();
        let mut window = FailureWindow::new(
            self.settings.failure_window,
            self.settings.failure_min_samples,
            self.settings.max_failure_rate,
        );

        info!(
            migration = %self.migration,
            %run_id,
            dry_run = options.dry_run,
            batch_size,
            force = options.force,
            "backfill idle -> running"
        );

        let mut state = match self.initial_state(options).await {
            Ok(state) => state,
            Err(reason) => {
                let start = options.start_after.map(Cursor::after).unwrap_or_default();
                let state = MigrationState::fresh(&self.migration, start, options.dry_run);
                return self
                    .close(run_id, report, &state, start, Some(reason), options)
                    .await;
            }
        };
        let start_cursor = state.cursor;
        self.publish_progress(run_id, MigrationPhase::Running, &state, report.totals())
            .await;

        let abort_reason = loop {
            if *stop.borrow() {
                break Some(AbortReason::Stopped);
            }

            let page = match self.fetch_page(state.cursor, batch_size, &mut window).await {
                Ok(page) => page,
                Err(reason) => break Some(reason),
            };
            if page.records.is_empty() {
                break None;
            }

            let batch_no = state.counters.batches + 1;
            let BatchRun { batch, tripped } = match self
                .process_batch(batch_no, &page, options.dry_run, mode, &mut window)
                .await
            {
                Ok(run) => run,
                Err(reason) => break Some(reason),
            };
            report.absorb(&batch);

            let c = &batch.counts;
            info!(
                batch = batch_no,
                read = c.read,
                inserted = c.inserted,
                already_present = c.already_present,
                updated = c.updated,
                skipped = c.skipped(),
                warnings = c.warnings,
                cursor = %batch.cursor_after,
                elapsed_ms = batch.elapsed.as_millis() as u64,
                "batch processed"
            );

            // The tripping batch is not checkpointed so a resumed run looks at it again.
            if let Some(reason) = tripped {
                break Some(reason);
            }

            let mut next = state.clone();
            next.advance(&batch);
            if !options.dry_run {
                if let Err(e) = self.save_checkpoint(&next).await {
                    break Some(AbortReason::CheckpointPersist {
                        message: e.to_string(),
                    });
                }
            }
            state = next;

            self.publish_progress(run_id, MigrationPhase::Running, &state, report.totals())
                .await;

            if !page.has_more {
                break None;
            }
        };

        self.close(run_id, report, &state, start_cursor, abort_reason, options)
            .await
    }

    async fn initial_state(&self, options: &RunOptions) -> Result<MigrationState, AbortReason> {
        let start = options.start_after.map(Cursor::after).unwrap_or_default();

        if options.dry_run {
            if options.resume {
                warn!("--resume is ignored for dry runs; starting from {start}");
            }
            return Ok(MigrationState::fresh(&self.migration, start, true));
        }
        if !options.resume {
            return Ok(MigrationState::fresh(&self.migration, start, false));
        }

        let loaded = match timeout(
            self.settings.checkpoint_timeout,
            self.parts.checkpoints.load(&self.migration),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(MigrateError::Timeout {
                operation: "checkpoint load",
                after: self.settings.checkpoint_timeout,
            }),
        };

        match loaded {
            Ok(Some(checkpoint)) => {
                info!(cursor = %checkpoint.cursor, "Resuming {} from checkpoint", self.migration);
                Ok(MigrationState::resumed(checkpoint))
            }
            Ok(None) => {
                info!("No checkpoint for {}; starting from {start}", self.migration);
                Ok(MigrationState::fresh(&self.migration, start, false))
            }
            Err(e) => Err(AbortReason::CheckpointPersist {
                message: e.to_string(),
            }),
        }
    }

    /// Fetches one page. Timeouts are retried up to `fetch_attempts` and count
    /// against the failure window; any other source error is fatal.
    async fn fetch_page(
        &self,
        cursor: Cursor,
        batch_size: usize,
        window: &mut FailureWindow,
    ) -> Result<Page, AbortReason> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match timeout(
                self.settings.fetch_timeout,
                self.parts.source.next_batch(cursor, batch_size),
            )
            .await
            {
                Ok(Ok(page)) => return Ok(page),
                Ok(Err(e)) => {
                    error!(%cursor, error = %e, "legacy source failed");
                    return Err(AbortReason::SourceUnavailable {
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    let err = MigrateError::Timeout {
                        operation: "source page fetch",
                        after: self.settings.fetch_timeout,
                    };
                    warn!(%cursor, attempt, "{err}");
                    window.record(true);
                    if window.tripped() {
                        return Err(window.abort_reason());
                    }
                    if attempt >= self.settings.fetch_attempts.max(1) {
                        return Err(AbortReason::SourceUnavailable {
                            message: err.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Transforms and writes one page in source order. The failure guard is
    /// consulted after every record, so a batch larger than the window still
    /// trips it; processing stops at the record that tripped it.
    async fn process_batch(
        &self,
        batch_no: u64,
        page: &Page,
        dry_run: bool,
        mode: WriteMode,
        window: &mut FailureWindow,
    ) -> Result<BatchRun, AbortReason> {
        let started = Instant::now();
        let mut result = BatchResult::new(batch_no, page.next_cursor, page.records.len());
        let owners = self.resolve_owners(&page.records).await?;

        for (index, record) in page.records.iter().enumerate() {
            self.process_record(record, &owners, dry_run, mode, window, &mut result)
                .await;
            if window.tripped() {
                result.counts.read = index as u64 + 1;
                result.elapsed = started.elapsed();
                return Ok(BatchRun {
                    batch: result,
                    tripped: Some(window.abort_reason()),
                });
            }
        }

        result.elapsed = started.elapsed();
        Ok(BatchRun {
            batch: result,
            tripped: None,
        })
    }

    async fn process_record(
        &self,
        record: &LegacyDealRecord,
        owners: &HashMap<String, String>,
        dry_run: bool,
        mode: WriteMode,
        window: &mut FailureWindow,
        result: &mut BatchResult,
    ) {
        let migrated = match transform(record, owners) {
            Ok(migrated) => migrated,
            Err(e) => {
                debug!(source_row = record.source_row, error = %e, "record failed validation");
                window.record(true);
                result.skip(SkippedRecord {
                    source_row: record.source_row,
                    legacy_id: identity_hint(record),
                    stage: SkipStage::Validation,
                    reason: e.to_string(),
                });
                return;
            }
        };
        result.counts.transformed += 1;
        result.counts.warnings += migrated.warnings.len() as u64;

        let outcome = if dry_run {
            self.preview(&migrated, mode).await
        } else {
            self.write(&migrated, mode, window).await
        };
        match outcome {
            Ok(outcome) => {
                window.record(false);
                result.record_outcome(outcome);
            }
            Err(e) => {
                window.record(true);
                result.skip(SkippedRecord {
                    source_row: record.source_row,
                    legacy_id: Some(migrated.legacy_id.clone()),
                    stage: SkipStage::Write,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// One lookup per batch for every distinct owner reference in it.
    async fn resolve_owners(
        &self,
        records: &[LegacyDealRecord],
    ) -> Result<HashMap<String, String>, AbortReason> {
        let mut references: Vec<String> = records.iter().filter_map(owner_reference).collect();
        references.sort();
        references.dedup();
        if references.is_empty() {
            return Ok(HashMap::new());
        }

        match timeout(
            self.settings.owner_timeout,
            self.parts.owners.resolve(&references),
        )
        .await
        {
            Ok(Ok(resolved)) => Ok(resolved),
            Ok(Err(e)) => Err(AbortReason::OwnerLookup {
                message: e.to_string(),
            }),
            Err(_) => Err(AbortReason::OwnerLookup {
                message: MigrateError::Timeout {
                    operation: "owner lookup",
                    after: self.settings.owner_timeout,
                }
                .to_string(),
            }),
        }
    }

    /// Live write with a single retry after a backoff.
    async fn write(
        &self,
        record: &MigratedDealRecord,
        mode: WriteMode,
        window: &mut FailureWindow,
    ) -> Result<WriteOutcome, MigrateError> {
        match self.write_once(record, mode).await {
            Ok(outcome) => Ok(outcome),
            Err(first) => {
                if matches!(first, MigrateError::Timeout { .. }) {
                    window.record(true);
                }
                warn!(
                    legacy_id = %record.legacy_id,
                    error = %first,
                    backoff_ms = self.settings.write_retry_backoff.as_millis() as u64,
                    "write failed, retrying once"
                );
                tokio::time::sleep(self.settings.write_retry_backoff).await;
                self.write_once(record, mode).await
            }
        }
    }

    async fn write_once(
        &self,
        record: &MigratedDealRecord,
        mode: WriteMode,
    ) -> Result<WriteOutcome, MigrateError> {
        match timeout(
            self.settings.write_timeout,
            self.parts.writer.upsert(record, mode),
        )
        .await
        {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(MigrateError::WriteConflict(legacy_id))) => {
                debug!(%legacy_id, "lost insert race, treating as already present");
                Ok(WriteOutcome::AlreadyPresent)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MigrateError::Timeout {
                operation: "target write",
                after: self.settings.write_timeout,
            }),
        }
    }

    /// Dry-run stand-in for `write`: classifies without touching the target.
    async fn preview(
        &self,
        record: &MigratedDealRecord,
        mode: WriteMode,
    ) -> Result<WriteOutcome, MigrateError> {
        let existing = match timeout(
            self.settings.write_timeout,
            self.parts.writer.find(&record.legacy_id),
        )
        .await
        {
            Ok(found) => found?,
            Err(_) => {
                return Err(MigrateError::Timeout {
                    operation: "target lookup",
                    after: self.settings.write_timeout,
                })
            }
        };
        let outcome = predict_outcome(existing.as_ref(), record, mode);
        debug!(legacy_id = %record.legacy_id, ?outcome, "dry run: would write");
        Ok(outcome)
    }

    async fn save_checkpoint(&self, state: &MigrationState) -> Result<(), MigrateError> {
        match timeout(
            self.settings.checkpoint_timeout,
            self.parts.checkpoints.save(&state.checkpoint()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(MigrateError::Timeout {
                operation: "checkpoint save",
                after: self.settings.checkpoint_timeout,
            }),
        }
    }

    async fn publish_progress(
        &self,
        run_id: Uuid,
        phase: MigrationPhase,
        state: &MigrationState,
        totals: &Counters,
    ) {
        let progress = JobProgress {
            migration: self.migration.clone(),
            run_id,
            phase,
            dry_run: state.dry_run,
            cursor: state.cursor,
            totals: totals.clone(),
            updated_at: Utc::now(),
        };
        match timeout(
            self.settings.checkpoint_timeout,
            self.parts.progress.publish(&progress),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to publish backfill progress"),
            Err(_) => warn!("publishing backfill progress timed out"),
        }
    }

    async fn close(
        &self,
        run_id: Uuid,
        report: ReportBuilder,
        state: &MigrationState,
        start_cursor: Cursor,
        abort_reason: Option<AbortReason>,
        options: &RunOptions,
    ) -> MigrationReport {
        let mut archived_table = None;
        let mut archive_error = None;

        match &abort_reason {
            Some(reason) => {
                error!(
                    migration = %self.migration,
                    %run_id,
                    %reason,
                    resume_cursor = %state.cursor,
                    "backfill running -> aborted"
                );
            }
            None => {
                info!(migration = %self.migration, %run_id, "backfill running -> completed");
                if options.archive_legacy {
                    if options.dry_run {
                        info!("dry run: would archive the legacy table");
                    } else {
                        match self.parts.source.archive().await {
                            Ok(name) => archived_table = Some(name),
                            Err(e) => {
                                error!(error = %e, "legacy table archival failed");
                                archive_error = Some(e.to_string());
                            }
                        }
                    }
                }
            }
        }

        let phase = if abort_reason.is_some() {
            MigrationPhase::Aborted
        } else {
            MigrationPhase::Completed
        };
        self.publish_progress(run_id, phase, state, report.totals())
            .await;

        report.finish(RunOutcome {
            migration: self.migration.clone(),
            run_id,
            dry_run: options.dry_run,
            abort_reason,
            cumulative: state.counters.clone(),
            start_cursor,
            resume_cursor: state.cursor,
            archived_table,
            archive_error,
        })
    }
}
