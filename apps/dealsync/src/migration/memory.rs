//! In-memory collaborators for driving the controller in tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use crate::errors::MigrateError;
use crate::migration::checkpoint::{Checkpoint, CheckpointStore};
use crate::migration::controller::MigrationPhase;
use crate::migration::models::{Cursor, LegacyDealRecord, MigratedDealRecord, WriteMode, WriteOutcome};
use crate::migration::owners::OwnerDirectory;
use crate::migration::source::{Page, RecordSource};
use crate::migration::writer::{predict_outcome, TargetWriter};
use crate::progress::{JobProgress, ProgressTracker};

pub fn legacy(source_row: i64, fields: Value) -> LegacyDealRecord {
    LegacyDealRecord { source_row, fields }
}

#[derive(Default)]
struct StoreState {
    legacy: Vec<LegacyDealRecord>,
    target: BTreeMap<String, MigratedDealRecord>,
    archived: Option<String>,
    source_down: bool,
    failing_writes: HashMap<String, u32>,
    racing: HashSet<String>,
}

/// Legacy table and target table in one, so a test can inspect both sides.
pub struct MemoryDealStore {
    state: Mutex<StoreState>,
}

impl MemoryDealStore {
    pub fn new(mut rows: Vec<LegacyDealRecord>) -> Arc<Self> {
        rows.sort_by_key(|r| r.source_row);
        Arc::new(Self {
            state: Mutex::new(StoreState {
                legacy: rows,
                ..StoreState::default()
            }),
        })
    }

    pub fn target(&self) -> BTreeMap<String, MigratedDealRecord> {
        self.state.lock().unwrap().target.clone()
    }

    pub fn target_len(&self) -> usize {
        self.state.lock().unwrap().target.len()
    }

    pub fn archived(&self) -> Option<String> {
        self.state.lock().unwrap().archived.clone()
    }

    /// The next `times` writes for `legacy_id` fail.
    pub fn fail_writes(&self, legacy_id: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .failing_writes
            .insert(legacy_id.to_string(), times);
    }

    /// Another writer inserts `legacy_id` just before our insert lands.
    pub fn race_insert(&self, legacy_id: &str) {
        self.state.lock().unwrap().racing.insert(legacy_id.to_string());
    }

    pub fn take_down_source(&self) {
        self.state.lock().unwrap().source_down = true;
    }

    pub fn replace_row(&self, record: LegacyDealRecord) {
        let mut state = self.state.lock().unwrap();
        match state.legacy.iter_mut().find(|r| r.source_row == record.source_row) {
            Some(row) => *row = record,
            None => {
                state.legacy.push(record);
                state.legacy.sort_by_key(|r| r.source_row);
            }
        }
    }
}

#[async_trait]
impl RecordSource for MemoryDealStore {
    async fn next_batch(&self, cursor: Cursor, batch_size: usize) -> Result<Page, MigrateError> {
        let state = self.state.lock().unwrap();
        if state.source_down {
            return Err(MigrateError::SourceUnavailable("connection refused".into()));
        }
        let records = state
            .legacy
            .iter()
            .filter(|r| cursor.admits(r.source_row))
            .take(batch_size + 1)
            .cloned()
            .collect();
        Ok(Page::assemble(cursor, records, batch_size))
    }

    async fn archive(&self) -> Result<String, MigrateError> {
        let mut state = self.state.lock().unwrap();
        let name = "zoho_deals_legacy_archived".to_string();
        state.archived = Some(name.clone());
        Ok(name)
    }
}

#[async_trait]
impl TargetWriter for MemoryDealStore {
    async fn upsert(
        &self,
        record: &MigratedDealRecord,
        mode: WriteMode,
    ) -> Result<WriteOutcome, MigrateError> {
        let mut state = self.state.lock().unwrap();
        let key = record.legacy_id.clone();

        if let Some(remaining) = state.failing_writes.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MigrateError::WriteFailure(format!("{key}: connection reset")));
            }
        }
        if state.racing.remove(&key) {
            state.target.insert(key.clone(), record.clone());
            return Err(MigrateError::WriteConflict(key));
        }

        let outcome = predict_outcome(state.target.get(&key), record, mode);
        if outcome != WriteOutcome::AlreadyPresent {
            state.target.insert(key, record.clone());
        }
        Ok(outcome)
    }

    async fn find(&self, legacy_id: &str) -> Result<Option<MigratedDealRecord>, MigrateError> {
        Ok(self.state.lock().unwrap().target.get(legacy_id).cloned())
    }
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    saved: Mutex<HashMap<String, Checkpoint>>,
    history: Mutex<Vec<Checkpoint>>,
    fail_after: Option<usize>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accepts `saves` checkpoints, then fails every save.
    pub fn failing_after(saves: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_after: Some(saves),
            ..Self::default()
        })
    }

    /// Stores a checkpoint without recording it as a save.
    pub fn seed(&self, checkpoint: Checkpoint) {
        self.saved
            .lock()
            .unwrap()
            .insert(checkpoint.migration.clone(), checkpoint);
    }

    pub fn get(&self, migration: &str) -> Option<Checkpoint> {
        self.saved.lock().unwrap().get(migration).cloned()
    }

    pub fn history(&self) -> Vec<Checkpoint> {
        self.history.lock().unwrap().clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, migration: &str) -> Result<Option<Checkpoint>, MigrateError> {
        Ok(self.get(migration))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), MigrateError> {
        let mut history = self.history.lock().unwrap();
        if self.fail_after.is_some_and(|limit| history.len() >= limit) {
            return Err(MigrateError::CheckpointPersist("disk full".into()));
        }
        history.push(checkpoint.clone());
        self.saved
            .lock()
            .unwrap()
            .insert(checkpoint.migration.clone(), checkpoint.clone());
        Ok(())
    }
}

/// Resolves exactly the listed owner ids to themselves.
pub struct StaticOwnerDirectory {
    known: HashSet<String>,
}

impl StaticOwnerDirectory {
    pub fn new(owner_ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            known: owner_ids.iter().map(|s| s.to_string()).collect(),
        })
    }
}

#[async_trait]
impl OwnerDirectory for StaticOwnerDirectory {
    async fn resolve(&self, references: &[String]) -> Result<HashMap<String, String>, MigrateError> {
        Ok(references
            .iter()
            .filter(|r| self.known.contains(*r))
            .map(|r| (r.clone(), r.clone()))
            .collect())
    }
}

/// Keeps every published progress entry. Optionally raises the stop signal
/// once a run has committed a given number of batches.
#[derive(Default)]
pub struct RecordingProgress {
    published: Mutex<Vec<JobProgress>>,
    stop_after: Option<(u64, watch::Sender<bool>)>,
}

impl RecordingProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stopping_after(batches: u64, stop: watch::Sender<bool>) -> Arc<Self> {
        Arc::new(Self {
            stop_after: Some((batches, stop)),
            ..Self::default()
        })
    }

    pub fn phases(&self) -> Vec<MigrationPhase> {
        self.published.lock().unwrap().iter().map(|p| p.phase).collect()
    }
}

#[async_trait]
impl ProgressTracker for RecordingProgress {
    async fn publish(&self, progress: &JobProgress) -> anyhow::Result<()> {
        self.published.lock().unwrap().push(progress.clone());
        if let Some((batches, stop)) = &self.stop_after {
            if progress.phase == MigrationPhase::Running && progress.totals.batches >= *batches {
                let _ = stop.send(true);
            }
        }
        Ok(())
    }

    async fn latest(&self, migration: &str) -> anyhow::Result<Option<JobProgress>> {
        Ok(self
            .published
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|p| p.migration == migration)
            .cloned())
    }
}
