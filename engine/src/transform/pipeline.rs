//! Run orchestration: discovery, then Bronze → Silver → Gold per batch.
//!
//! The manifest drives everything. A run registers whatever the source offers,
//! then advances every unfinished batch in ascending `batch_id` order from the
//! first stage it has not committed. A failing stage marks its batch
//! `FAILED_<STAGE>` and the run moves on to the next batch; the next run resumes
//! from that stage. Nothing is retried automatically.
//!
//! # Example
//!
//! ```rust,ignore
//! use refinery::{CancelFlag, Pipeline, PipelineConfig, RunOptions};
//!
//! let pipeline = Pipeline::from_config(PipelineConfig::default())?;
//! let result = pipeline.run(&RunOptions::default(), &CancelFlag::new())?;
//! println!("committed {:?}", result.committed_batches);
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{ConfigError, ManifestError, PipelineResult, StageError, StageResult, StorageError};
use crate::ingest::RawIngestor;
use crate::manifest::{BatchRecord, Manifest, ManifestStore, Registration, Stage, StageOutcome};
use crate::source::{DirectorySource, RawSource, SourceFile};
use crate::store::{FileStorage, Storage, TableName, Warehouse};

use super::aggregator::{AggregateOutcome, Aggregator};
use super::cleaner::Cleaner;

// =============================================================================
// Run inputs and outputs
// =============================================================================

/// Cooperative cancellation, checked before each batch and each stage.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Inclusive batch id range for backfills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRange {
    pub first: u64,
    pub last: u64,
}

impl BatchRange {
    pub fn contains(&self, batch_id: u64) -> bool {
        (self.first..=self.last).contains(&batch_id)
    }
}

/// Scheduler knobs for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Recompute every Gold row from Silver once the batches are done.
    pub full_gold_rebuild: bool,
    /// Only advance batches in this range. Discovery is skipped.
    pub batch_range: Option<BatchRange>,
}

/// A batch that stopped at a stage during this run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedBatch {
    pub batch_id: u64,
    pub stage: Stage,
    pub reason: String,
}

/// Summary returned to the caller (CLI, HTTP trigger, scheduler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    /// Batches that reached `GOLD_COMMITTED` in this run.
    pub committed_batches: Vec<u64>,
    pub failed_batches: Vec<FailedBatch>,
    /// Discovered files that were not registered (outside the window or already ingested).
    pub skipped_files: Vec<String>,
    /// Batches where a concurrent run committed a stage first.
    pub contended_batches: Vec<u64>,
    /// The run stopped early on cancellation.
    pub aborted: bool,
    pub gold_rebuilt: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    fn started() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            committed_batches: Vec::new(),
            failed_batches: Vec::new(),
            skipped_files: Vec::new(),
            contended_batches: Vec::new(),
            aborted: false,
            gold_rebuilt: false,
            started_at: now,
            finished_at: now,
        }
    }

    /// No batch failed and the run was not cut short.
    pub fn is_success(&self) -> bool {
        self.failed_batches.is_empty() && !self.aborted
    }
}

/// How far one batch got.
enum Progress {
    /// `raced` is set when a concurrent run committed one of the stages.
    Complete { raced: bool },
    Cancelled,
}

struct BatchFailure {
    stage: Stage,
    error: StageError,
}

// =============================================================================
// Pipeline
// =============================================================================

/// The idempotent "process new data" entry point.
pub struct Pipeline {
    config: PipelineConfig,
    warehouse: Warehouse,
    manifest: ManifestStore,
    source: Arc<dyn RawSource>,
    pool: Arc<ThreadPool>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        storage: Arc<dyn Storage>,
        source: Arc<dyn RawSource>,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("refinery-clean-{}", i))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("cannot start cleaning workers: {}", e)))?;

        Ok(Self {
            warehouse: Warehouse::new(storage.clone(), config.retry),
            manifest: ManifestStore::new(storage, config.retry),
            config,
            source,
            pool: Arc::new(pool),
        })
    }

    /// File-backed storage and a landing directory, both taken from the config.
    pub fn from_config(config: PipelineConfig) -> PipelineResult<Self> {
        let storage = Arc::new(FileStorage::with_dir(&config.storage.data_dir));
        let source = Arc::new(DirectorySource::new(&config.storage.landing_dir));
        Self::new(config, storage, source)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    /// Discover new files and advance every unfinished batch.
    ///
    /// Batch-level failures are recorded in the manifest and reported in the
    /// result. Only run-level failures (storage outage, unreadable manifest or
    /// source) return `Err`.
    pub fn run(&self, options: &RunOptions, cancel: &CancelFlag) -> PipelineResult<RunResult> {
        let mut result = RunResult::started();
        let span = tracing::info_span!("run", run_id = %result.run_id);
        let _guard = span.enter();

        let mut discovered = BTreeMap::new();
        if options.batch_range.is_none() {
            discovered = self.discover(&mut result)?;
        }

        let pending: Vec<u64> = self
            .manifest
            .load()?
            .value
            .pending()
            .into_iter()
            .filter(|id| options.batch_range.map_or(true, |r| r.contains(*id)))
            .collect();
        tracing::info!(pending = pending.len(), "Advancing batches");

        for batch_id in pending {
            if cancel.is_cancelled() {
                result.aborted = true;
                break;
            }
            match self.advance(batch_id, discovered.get(&batch_id), cancel) {
                Ok(Progress::Complete { raced }) => {
                    if raced {
                        result.contended_batches.push(batch_id);
                    }
                    result.committed_batches.push(batch_id);
                }
                Ok(Progress::Cancelled) => {
                    result.aborted = true;
                    break;
                }
                Err(failure) if failure.error.is_run_fatal() => {
                    tracing::error!(batch_id, stage = %failure.stage, error = %failure.error, "Run aborted");
                    return Err(failure.error.into());
                }
                Err(failure) => result.failed_batches.push(self.record_failure(batch_id, failure)?),
            }
        }

        if result.aborted {
            tracing::warn!("Run cancelled between stages");
        } else if options.full_gold_rebuild {
            self.rebuild_gold()?;
            result.gold_rebuilt = true;
        }

        result.finished_at = Utc::now();
        tracing::info!(
            committed = result.committed_batches.len(),
            failed = result.failed_batches.len(),
            skipped = result.skipped_files.len(),
            aborted = result.aborted,
            "Run finished"
        );
        Ok(result)
    }

    /// Register files inside the discovery window. Returns the freshly read
    /// files by batch id so Bronze does not read them twice.
    fn discover(&self, result: &mut RunResult) -> PipelineResult<BTreeMap<u64, SourceFile>> {
        let window = &self.config.batch_discovery_window;
        let manifest = self.manifest.load()?.value;

        let mut unread = Vec::new();
        for entry in self.source.list()? {
            if !window.contains(entry.modified_at) {
                tracing::debug!(file = %entry.name, "Outside discovery window");
                result.skipped_files.push(entry.name);
            } else if let Some(batch_id) = manifest.ingested_unchanged(&entry) {
                tracing::debug!(batch_id, file = %entry.name, "Unchanged since ingestion, not re-reading");
                result.skipped_files.push(entry.name);
            } else {
                unread.push(entry);
            }
        }

        let files = unread
            .iter()
            .map(|entry| self.source.fetch(&entry.name))
            .collect::<Result<Vec<SourceFile>, _>>()?;
        let registrations = RawIngestor::new(&self.warehouse, &self.manifest).register(&files)?;
        let mut fresh = BTreeMap::new();
        for (file, (name, registration)) in files.into_iter().zip(registrations) {
            match registration {
                Registration::AlreadyIngested(_) => result.skipped_files.push(name),
                Registration::New(id) | Registration::Resume(id) => {
                    fresh.insert(id, file);
                }
            }
        }
        Ok(fresh)
    }

    fn batch(&self, batch_id: u64) -> StageResult<BatchRecord> {
        self.manifest
            .load()?
            .value
            .get(batch_id)
            .cloned()
            .ok_or(StageError::Manifest(ManifestError::UnknownBatch(batch_id)))
    }

    /// Run stages for one batch until it is complete, fails or is cancelled.
    fn advance(
        &self,
        batch_id: u64,
        file: Option<&SourceFile>,
        cancel: &CancelFlag,
    ) -> Result<Progress, BatchFailure> {
        let span = tracing::info_span!("batch", batch_id);
        let _guard = span.enter();

        let mut stage = Stage::Bronze;
        let mut raced = false;
        loop {
            let batch = self
                .batch(batch_id)
                .map_err(|error| BatchFailure { stage, error })?;
            let Some(next) = batch.next_stage() else {
                return Ok(Progress::Complete { raced });
            };
            stage = next;
            if cancel.is_cancelled() {
                return Ok(Progress::Cancelled);
            }

            match self.run_stage(&batch, stage, file) {
                Ok(()) => {}
                Err(error) if error.is_lost_race() => {
                    // The batch only moves on once its earlier stage is committed,
                    // so picking up from the reloaded record keeps batch order.
                    tracing::info!(batch_id, %stage, "Stage committed by a concurrent run, reloading");
                    raced = true;
                }
                Err(error) => return Err(BatchFailure { stage, error }),
            }
        }
    }

    fn run_stage(&self, batch: &BatchRecord, stage: Stage, file: Option<&SourceFile>) -> StageResult<()> {
        let batch_id = batch.batch_id;
        match stage {
            Stage::Bronze => {
                let file = match file {
                    Some(file) => file.clone(),
                    None => self.source.fetch(&batch.source_file)?,
                };
                RawIngestor::new(&self.warehouse, &self.manifest).ingest(batch_id, &file, &batch.checksum)?;
            }
            Stage::Silver => {
                let cleaner = Cleaner::new(&self.config, &self.warehouse, self.pool.clone())?;
                let outcome = cleaner.clean(batch_id)?;
                tracing::info!(
                    batch_id,
                    written = outcome.written,
                    superseded = outcome.superseded,
                    rejected = outcome.rejected,
                    fallbacks = outcome.fallbacks,
                    snapshot = outcome.snapshot_version,
                    "Silver committed"
                );
                self.manifest.commit(
                    batch_id,
                    Stage::Silver,
                    StageOutcome::committed(outcome.accepted)
                        .with_rejected(outcome.rejected)
                        .with_affected_groups(outcome.affected_groups),
                )?;
            }
            Stage::Gold => {
                let groups = batch
                    .outcome(Stage::Silver)
                    .map(|o| o.affected_groups.clone())
                    .unwrap_or_default();
                let outcome = self.aggregator().aggregate(&groups)?;
                tracing::info!(batch_id, groups = outcome.groups, written = outcome.written, "Gold committed");
                self.manifest
                    .commit(batch_id, Stage::Gold, StageOutcome::committed(outcome.written))?;
            }
        }
        Ok(())
    }

    /// Mark the batch failed at its stage. A failure report never beats a commit.
    fn record_failure(&self, batch_id: u64, failure: BatchFailure) -> PipelineResult<FailedBatch> {
        let reason = failure.error.to_string();
        tracing::warn!(batch_id, stage = %failure.stage, error = %reason, "Batch failed");

        match self.manifest.fail(batch_id, failure.stage, &reason) {
            Ok(()) | Err(ManifestError::Conflict { .. }) | Err(ManifestError::UnknownBatch(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(FailedBatch {
            batch_id,
            stage: failure.stage,
            reason,
        })
    }

    fn aggregator(&self) -> Aggregator<'_> {
        Aggregator::new(
            &self.warehouse,
            &self.config.grouping_key_for_aggregation,
            &self.config.metric_column,
        )
    }

    /// Replace Gold from the current Silver table.
    pub fn rebuild_gold(&self) -> PipelineResult<AggregateOutcome> {
        let outcome = self.aggregator().rebuild()?;
        tracing::info!(
            groups = outcome.groups,
            written = outcome.written,
            removed = outcome.removed,
            "Gold rebuilt"
        );
        Ok(outcome)
    }

    /// Current manifest.
    pub fn status(&self) -> PipelineResult<Manifest> {
        Ok(self.manifest.load()?.value)
    }

    /// A table's rows as JSON.
    pub fn table(&self, name: TableName) -> PipelineResult<Value> {
        let wh = &self.warehouse;
        let rows = match name {
            TableName::Bronze => {
                let mut rows = Vec::new();
                for batch_id in wh.bronze_batches()? {
                    rows.extend(wh.read_bronze(batch_id)?.unwrap_or_default());
                }
                serde_json::to_value(rows)
            }
            TableName::Silver => serde_json::to_value(wh.load_silver()?.value.into_values().collect::<Vec<_>>()),
            TableName::Gold => serde_json::to_value(wh.load_gold()?.value.into_values().collect::<Vec<_>>()),
            TableName::Quarantine => {
                let mut rows = Vec::new();
                for batch_id in wh.quarantined_batches()? {
                    rows.extend(wh.read_quarantine(batch_id)?);
                }
                serde_json::to_value(rows)
            }
            TableName::Manifest => serde_json::to_value(self.status()?.entries()),
        };
        Ok(rows.map_err(|e| StorageError::corrupt(name.to_string(), e))?)
    }
}
