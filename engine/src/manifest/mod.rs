//! Batch manifest: the single source of truth for what has been committed.
//!
//! Each batch moves through a finite state machine:
//!
//! ```text
//! DISCOVERED ─▶ BRONZE_COMMITTED ─▶ SILVER_COMMITTED ─▶ GOLD_COMMITTED
//!      │               │                    │
//!      ▼               ▼                    ▼
//! FAILED_BRONZE   FAILED_SILVER        FAILED_GOLD
//! ```
//!
//! Every transition is a read-check-write against the stored manifest,
//! published with a conditional write on the version that was read. A writer
//! that loses the race reloads and re-checks its own transition; if the stage
//! is already committed by the winner it aborts with [`ManifestError::Conflict`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ManifestError, ManifestResult, StorageError};
use crate::source::SourceEntry;
use crate::store::{with_retry, RetryPolicy, Storage, Versioned, WriteCondition};

/// Storage key of the manifest document.
pub const MANIFEST_KEY: &str = "manifest/batches.json";

/// Optimistic attempts before giving up on a contended manifest.
const MAX_COMMIT_ATTEMPTS: u32 = 8;

// =============================================================================
// Stages and states
// =============================================================================

/// A materialized stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Bronze,
    Silver,
    Gold,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Bronze, Stage::Silver, Stage::Gold];

    /// The stage that must be committed before this one may start.
    pub fn previous(self) -> Option<Stage> {
        match self {
            Stage::Bronze => None,
            Stage::Silver => Some(Stage::Bronze),
            Stage::Gold => Some(Stage::Silver),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Bronze => "bronze",
            Stage::Silver => "silver",
            Stage::Gold => "gold",
        })
    }
}

/// Outcome of one stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Committed,
    Failed,
}

/// Derived lifecycle state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Discovered,
    Committed(Stage),
    Failed(Stage),
}

impl BatchState {
    /// Terminal success.
    pub fn is_complete(self) -> bool {
        self == BatchState::Committed(Stage::Gold)
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchState::Discovered => f.write_str("DISCOVERED"),
            BatchState::Committed(stage) => {
                write!(f, "{}_COMMITTED", stage.to_string().to_uppercase())
            }
            BatchState::Failed(stage) => write!(f, "FAILED_{}", stage.to_string().to_uppercase()),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// What happened the last time a stage ran for a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub status: StageStatus,
    pub row_count: usize,
    #[serde(default)]
    pub rejected_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Silver only: grouping keys whose Gold rows must be recomputed.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub affected_groups: BTreeSet<String>,
    #[serde(default)]
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl StageOutcome {
    pub fn committed(row_count: usize) -> Self {
        Self {
            status: StageStatus::Committed,
            row_count,
            rejected_count: 0,
            error: None,
            affected_groups: BTreeSet::new(),
            attempts: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Failed,
            row_count: 0,
            rejected_count: 0,
            error: Some(error.into()),
            affected_groups: BTreeSet::new(),
            attempts: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn with_rejected(mut self, rejected_count: usize) -> Self {
        self.rejected_count = rejected_count;
        self
    }

    pub fn with_affected_groups(mut self, groups: BTreeSet<String>) -> Self {
        self.affected_groups = groups;
        self
    }
}

/// One raw file's journey through the stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: u64,
    pub source_file: String,
    pub checksum: String,
    /// Size and modification time of the file when it was registered.
    #[serde(default)]
    pub source_size: u64,
    #[serde(default)]
    pub source_modified_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub stages: BTreeMap<Stage, StageOutcome>,
}

impl BatchRecord {
    pub fn state(&self) -> BatchState {
        let mut state = BatchState::Discovered;
        for stage in Stage::ALL {
            match self.stages.get(&stage).map(|o| o.status) {
                Some(StageStatus::Committed) => state = BatchState::Committed(stage),
                Some(StageStatus::Failed) => return BatchState::Failed(stage),
                None => break,
            }
        }
        state
    }

    pub fn is_committed(&self, stage: Stage) -> bool {
        self.stages
            .get(&stage)
            .is_some_and(|o| o.status == StageStatus::Committed)
    }

    /// First stage not yet committed, `None` once Gold is committed.
    pub fn next_stage(&self) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| !self.is_committed(*s))
    }

    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages.get(&stage)
    }
}

/// Flattened manifest row, the operational status table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub batch_id: u64,
    pub source_file: String,
    pub stage: Stage,
    pub status: StageStatus,
    pub row_count: usize,
    pub rejected_count: usize,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// How a discovered file relates to what the manifest already knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First time this checksum is seen.
    New(u64),
    /// Known checksum whose Bronze stage never committed.
    Resume(u64),
    /// Already in Bronze; re-ingesting is a no-op.
    AlreadyIngested(u64),
}

impl Registration {
    pub fn batch_id(self) -> u64 {
        match self {
            Registration::New(id) | Registration::Resume(id) | Registration::AlreadyIngested(id) => id,
        }
    }
}

// =============================================================================
// Manifest document
// =============================================================================

/// The whole manifest, persisted as one versioned object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub next_batch_id: u64,
    #[serde(default)]
    pub batches: BTreeMap<u64, BatchRecord>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            next_batch_id: 1,
            batches: BTreeMap::new(),
        }
    }
}

impl Manifest {
    pub fn get(&self, batch_id: u64) -> Option<&BatchRecord> {
        self.batches.get(&batch_id)
    }

    pub fn find_by_checksum(&self, checksum: &str) -> Option<&BatchRecord> {
        self.batches.values().find(|b| b.checksum == checksum)
    }

    /// Batch already holding this exact file in Bronze, judged by name, size
    /// and modification time. Files without a modification time never match.
    pub fn ingested_unchanged(&self, entry: &SourceEntry) -> Option<u64> {
        entry.modified_at?;
        self.batches
            .values()
            .find(|b| {
                b.source_file == entry.name
                    && b.source_size == entry.size
                    && b.source_modified_at == entry.modified_at
                    && b.is_committed(Stage::Bronze)
            })
            .map(|b| b.batch_id)
    }

    /// Register a file, allocating a monotonic batch id for unseen checksums.
    pub fn register(&mut self, entry: &SourceEntry, checksum: &str) -> Registration {
        if let Some(existing) = self.find_by_checksum(checksum) {
            return if existing.is_committed(Stage::Bronze) {
                Registration::AlreadyIngested(existing.batch_id)
            } else {
                Registration::Resume(existing.batch_id)
            };
        }

        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        self.batches.insert(
            batch_id,
            BatchRecord {
                batch_id,
                source_file: entry.name.clone(),
                checksum: checksum.to_string(),
                source_size: entry.size,
                source_modified_at: entry.modified_at,
                discovered_at: Utc::now(),
                stages: BTreeMap::new(),
            },
        );
        Registration::New(batch_id)
    }

    /// Transition guard: prior stage committed, this stage not yet committed.
    pub fn check_transition(&self, batch_id: u64, stage: Stage) -> ManifestResult<()> {
        let batch = self
            .batches
            .get(&batch_id)
            .ok_or(ManifestError::UnknownBatch(batch_id))?;

        if batch.is_committed(stage) {
            return Err(ManifestError::Conflict { batch_id, stage });
        }
        if let Some(prev) = stage.previous() {
            if !batch.is_committed(prev) {
                return Err(ManifestError::GuardViolated {
                    batch_id,
                    stage,
                    reason: format!("{} is {}", prev, batch.state()),
                });
            }
        }
        Ok(())
    }

    fn record(&mut self, batch_id: u64, stage: Stage, mut outcome: StageOutcome) -> ManifestResult<()> {
        let batch = self
            .batches
            .get_mut(&batch_id)
            .ok_or(ManifestError::UnknownBatch(batch_id))?;
        outcome.attempts = batch.stages.get(&stage).map(|o| o.attempts).unwrap_or(0) + 1;
        batch.stages.insert(stage, outcome);
        Ok(())
    }

    /// Batch ids in ascending order whose lifecycle is not complete.
    pub fn pending(&self) -> Vec<u64> {
        self.batches
            .values()
            .filter(|b| !b.state().is_complete())
            .map(|b| b.batch_id)
            .collect()
    }

    /// Flattened status rows, ordered by batch then stage.
    pub fn entries(&self) -> Vec<ManifestEntry> {
        self.batches
            .values()
            .flat_map(|batch| {
                batch.stages.iter().map(move |(stage, outcome)| ManifestEntry {
                    batch_id: batch.batch_id,
                    source_file: batch.source_file.clone(),
                    stage: *stage,
                    status: outcome.status,
                    row_count: outcome.row_count,
                    rejected_count: outcome.rejected_count,
                    error: outcome.error.clone(),
                    updated_at: outcome.updated_at,
                })
            })
            .collect()
    }
}

// =============================================================================
// Store
// =============================================================================

/// Reads and conditionally writes the manifest document.
#[derive(Clone)]
pub struct ManifestStore {
    storage: Arc<dyn Storage>,
    retry: RetryPolicy,
}

impl ManifestStore {
    pub fn new(storage: Arc<dyn Storage>, retry: RetryPolicy) -> Self {
        Self { storage, retry }
    }

    pub fn load(&self) -> ManifestResult<Versioned<Manifest>> {
        let object = with_retry(&self.retry, "manifest.load", || self.storage.get(MANIFEST_KEY))?;
        match object {
            None => Ok(Versioned {
                value: Manifest::default(),
                version: 0,
            }),
            Some(obj) => {
                let value = serde_json::from_slice(&obj.bytes)
                    .map_err(|e| StorageError::corrupt(MANIFEST_KEY, e))?;
                Ok(Versioned {
                    value,
                    version: obj.version,
                })
            }
        }
    }

    /// Optimistic read-modify-write. `apply` runs against a fresh copy on every attempt.
    pub fn update<T, F>(&self, mut apply: F) -> ManifestResult<T>
    where
        F: FnMut(&mut Manifest) -> ManifestResult<T>,
    {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let current = self.load()?;
            let mut manifest = current.value;
            let result = apply(&mut manifest)?;

            let bytes = serde_json::to_vec_pretty(&manifest)
                .map_err(|e| StorageError::corrupt(MANIFEST_KEY, e))?;
            let write = with_retry(&self.retry, "manifest.commit", || {
                self.storage
                    .put(MANIFEST_KEY, &bytes, WriteCondition::IfVersion(current.version))
            });

            match write {
                Ok(_) => return Ok(result),
                Err(StorageError::Conflict { .. }) => {
                    tracing::debug!(attempt, "Manifest changed concurrently, re-checking transition");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ManifestError::Contended(MAX_COMMIT_ATTEMPTS))
    }

    /// Register a discovered file (filename + checksum).
    pub fn register(&self, entry: &SourceEntry, checksum: &str) -> ManifestResult<Registration> {
        self.update(|m| Ok(m.register(entry, checksum)))
    }

    /// Commit a stage for a batch, guarded by the transition rules.
    pub fn commit(&self, batch_id: u64, stage: Stage, outcome: StageOutcome) -> ManifestResult<()> {
        self.update(|m| {
            m.check_transition(batch_id, stage)?;
            m.record(batch_id, stage, outcome.clone())
        })
    }

    /// Record a stage failure. Never overwrites a committed stage.
    pub fn fail(&self, batch_id: u64, stage: Stage, error: &str) -> ManifestResult<()> {
        self.update(|m| {
            let batch = m.get(batch_id).ok_or(ManifestError::UnknownBatch(batch_id))?;
            if batch.is_committed(stage) {
                return Err(ManifestError::Conflict { batch_id, stage });
            }
            m.record(batch_id, stage, StageOutcome::failed(error))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    fn store() -> ManifestStore {
        ManifestStore::new(Arc::new(MemoryStorage::new()), RetryPolicy::none())
    }

    fn entry(name: &str) -> SourceEntry {
        SourceEntry {
            name: name.into(),
            size: 10,
            modified_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_batch_ids_are_monotonic_and_checksum_dedupes() {
        let store = store();
        assert_eq!(store.register(&entry("a.csv"), "aaa").unwrap(), Registration::New(1));
        assert_eq!(store.register(&entry("b.csv"), "bbb").unwrap(), Registration::New(2));
        assert_eq!(store.register(&entry("a-copy.csv"), "aaa").unwrap(), Registration::Resume(1));

        store.commit(1, Stage::Bronze, StageOutcome::committed(3)).unwrap();
        assert_eq!(
            store.register(&entry("a.csv"), "aaa").unwrap(),
            Registration::AlreadyIngested(1)
        );
    }

    #[test]
    fn test_state_machine_progression() {
        let store = store();
        store.register(&entry("a.csv"), "aaa").unwrap();

        let state = |s: &ManifestStore| s.load().unwrap().value.get(1).unwrap().state();
        assert_eq!(state(&store), BatchState::Discovered);

        store.commit(1, Stage::Bronze, StageOutcome::committed(2)).unwrap();
        assert_eq!(state(&store), BatchState::Committed(Stage::Bronze));

        store.fail(1, Stage::Silver, "disk full").unwrap();
        assert_eq!(state(&store), BatchState::Failed(Stage::Silver));
        assert_eq!(state(&store).to_string(), "FAILED_SILVER");

        store.commit(1, Stage::Silver, StageOutcome::committed(2)).unwrap();
        store.commit(1, Stage::Gold, StageOutcome::committed(1)).unwrap();
        assert!(state(&store).is_complete());
        assert_eq!(state(&store).to_string(), "GOLD_COMMITTED");

        let manifest = store.load().unwrap().value;
        assert_eq!(manifest.get(1).unwrap().outcome(Stage::Silver).unwrap().attempts, 2);
        assert!(manifest.pending().is_empty());
    }

    #[test]
    fn test_guard_requires_prior_stage() {
        let store = store();
        store.register(&entry("a.csv"), "aaa").unwrap();

        let err = store
            .commit(1, Stage::Silver, StageOutcome::committed(0))
            .unwrap_err();
        assert!(matches!(err, ManifestError::GuardViolated { stage: Stage::Silver, .. }));
    }

    #[test]
    fn test_double_commit_is_conflict() {
        let store = store();
        store.register(&entry("a.csv"), "aaa").unwrap();
        store.commit(1, Stage::Bronze, StageOutcome::committed(1)).unwrap();

        let err = store
            .commit(1, Stage::Bronze, StageOutcome::committed(1))
            .unwrap_err();
        assert!(matches!(err, ManifestError::Conflict { batch_id: 1, stage: Stage::Bronze }));

        // A late failure report cannot clobber the committed stage either.
        assert!(store.fail(1, Stage::Bronze, "late").is_err());
    }

    #[test]
    fn test_concurrent_commits_have_one_winner() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let seed = ManifestStore::new(storage.clone(), RetryPolicy::none());
        seed.register(&entry("a.csv"), "aaa").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = ManifestStore::new(storage.clone(), RetryPolicy::none());
                std::thread::spawn(move || store.commit(1, Stage::Bronze, StageOutcome::committed(5)))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, ManifestError::Conflict { .. })));

        let manifest = seed.load().unwrap().value;
        assert_eq!(manifest.get(1).unwrap().outcome(Stage::Bronze).unwrap().attempts, 1);
    }

    #[test]
    fn test_entries_flatten_stages() {
        let store = store();
        store.register(&entry("a.csv"), "aaa").unwrap();
        store.commit(1, Stage::Bronze, StageOutcome::committed(4)).unwrap();
        store.fail(1, Stage::Silver, "schema").unwrap();

        let entries = store.load().unwrap().value.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].stage, Stage::Bronze);
        assert_eq!(entries[0].row_count, 4);
        assert_eq!(entries[1].status, StageStatus::Failed);
        assert_eq!(entries[1].error.as_deref(), Some("schema"));
    }

    #[test]
    fn test_unchanged_file_recognized_without_checksum() {
        let store = store();
        let seen = entry("a.csv");
        store.register(&seen, "aaa").unwrap();

        let manifest = store.load().unwrap().value;
        assert_eq!(manifest.ingested_unchanged(&seen), None, "Bronze not committed yet");

        store.commit(1, Stage::Bronze, StageOutcome::committed(3)).unwrap();
        let manifest = store.load().unwrap().value;
        assert_eq!(manifest.ingested_unchanged(&seen), Some(1));

        let grown = SourceEntry { size: 11, ..seen.clone() };
        assert_eq!(manifest.ingested_unchanged(&grown), None);
        let untimed = SourceEntry { modified_at: None, ..seen };
        assert_eq!(manifest.ingested_unchanged(&untimed), None);
    }
}
