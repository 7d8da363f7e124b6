//! Silver stage: standardize, impute, enforce the cleaned contract, upsert.
//!
//! Rules run in a fixed order on every row:
//!
//! ```text
//! Bronze row ─▶ raw schema ─▶ standardize ─▶ impute ─▶ cleaned contract ─▶ upsert
//!                   │                           │             │
//!                   └────────── quarantine ◀────┴─────────────┘
//! ```
//!
//! Rows are independent, so they are cleaned on a bounded rayon pool. The
//! upsert itself is sequential and in natural-key order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::config::PipelineConfig;
use crate::error::{RowValidationError, StageError, StageResult, StorageError};
use crate::manifest::Stage;
use crate::models::{CleanRecord, NaturalKey, RejectedRow};
use crate::schema::{SchemaRegistry, TypedRow};
use crate::store::{SilverTable, Warehouse};
use crate::validation::Contract;

use super::imputation::{ImputationSnapshot, Imputer};
use super::rules::Standardizer;

/// Optimistic attempts for the Silver table write.
const MAX_UPSERT_ATTEMPTS: u32 = 8;

/// What one `clean` call did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanOutcome {
    /// Valid distinct keys produced by the batch.
    pub accepted: usize,
    /// Rows inserted or replaced in Silver.
    pub written: usize,
    /// Rows skipped because Silver already holds a newer batch for the key.
    pub superseded: usize,
    pub rejected: usize,
    /// Rows filled from a configured fallback instead of context statistics.
    pub fallbacks: usize,
    /// Grouping keys whose Gold rows must be recomputed.
    pub affected_groups: BTreeSet<String>,
    pub snapshot_version: u64,
}

/// Cleans one Bronze batch into Silver.
pub struct Cleaner<'a> {
    config: &'a PipelineConfig,
    registry: SchemaRegistry,
    standardizer: Standardizer,
    contract: Contract,
    warehouse: &'a Warehouse,
    pool: Arc<ThreadPool>,
}

/// Outcome of cleaning one row.
type RowResult = Result<(CleanRecord, usize), (TypedRow, RowValidationError)>;

impl<'a> Cleaner<'a> {
    pub fn new(config: &'a PipelineConfig, warehouse: &'a Warehouse, pool: Arc<ThreadPool>) -> StageResult<Self> {
        let registry = config.registry();
        let standardizer = Standardizer::compile(&config.standardization)
            .map_err(|e| StageError::Contract(e.to_string()))?;
        let contract =
            Contract::compile(&registry.cleaned.to_json_schema()).map_err(StageError::Contract)?;

        Ok(Self {
            config,
            registry,
            standardizer,
            contract,
            warehouse,
            pool,
        })
    }

    /// Clean a batch and merge it into Silver. Safe to call again for the same batch.
    pub fn clean(&self, batch_id: u64) -> StageResult<CleanOutcome> {
        let raw = self
            .warehouse
            .read_bronze(batch_id)?
            .ok_or(StageError::BronzeDataMissing(batch_id))?;

        let (typed, invalid) = self.registry.validate(&raw, &self.registry.raw)?;
        let mut rejected: Vec<RejectedRow> = invalid
            .into_iter()
            .map(|row| reject(&row.source, &row.error))
            .collect();

        let snapshot = self.snapshot_for(batch_id)?;
        let imputer = Imputer::new(
            &self.config.imputation,
            &self.config.imputation_fallback,
            &self.registry.cleaned,
            &snapshot,
        )
        .map_err(|e| StageError::Contract(e.to_string()))?;

        let results: Vec<RowResult> = self.pool.install(|| {
            typed
                .into_par_iter()
                .map(|row| self.clean_row(row, &imputer, snapshot.version()))
                .collect()
        });

        // Within a batch the last valid row in file order wins.
        let mut incoming: BTreeMap<NaturalKey, CleanRecord> = BTreeMap::new();
        let mut fallbacks = 0;
        for result in results {
            match result {
                Ok((record, fallback_count)) => {
                    fallbacks += fallback_count.min(1);
                    incoming.insert(record.key.clone(), record);
                }
                Err((row, error)) => rejected.push(reject(&row.source, &error)),
            }
        }
        rejected.sort_by_key(|r| r.row_number);

        self.warehouse.write_quarantine(batch_id, &rejected)?;
        if !rejected.is_empty() {
            tracing::warn!(batch_id, rejected = rejected.len(), "Rows quarantined");
        }

        let mut outcome = self.upsert(&incoming)?;
        outcome.accepted = incoming.len();
        outcome.rejected = rejected.len();
        outcome.fallbacks = fallbacks;
        outcome.snapshot_version = snapshot.version();
        Ok(outcome)
    }

    /// Reuse the batch's persisted snapshot or compute it from earlier Silver rows.
    fn snapshot_for(&self, batch_id: u64) -> StageResult<ImputationSnapshot> {
        if let Some(existing) = self.warehouse.load_snapshot(batch_id)? {
            tracing::debug!(batch_id, "Reusing persisted imputation snapshot");
            return Ok(existing);
        }

        let silver = self.warehouse.load_silver()?;
        let snapshot = ImputationSnapshot::compute(
            batch_id,
            silver.value.values(),
            &self.config.imputation,
            &self.registry.cleaned,
        );
        tracing::debug!(
            batch_id,
            history_rows = snapshot.source_rows,
            history_through = snapshot.history_through,
            "Computed imputation snapshot"
        );
        Ok(self.warehouse.save_snapshot(batch_id, snapshot)?)
    }

    fn clean_row(&self, row: TypedRow, imputer: &Imputer<'_>, snapshot_version: u64) -> RowResult {
        let mut fields = row.fields.clone();
        self.standardizer.apply(&mut fields);

        let imputed = match imputer.impute(&mut fields) {
            Ok(imputed) => imputed,
            Err(e) => return Err((row, e)),
        };
        for missing in &imputed.missing_context {
            tracing::warn!(
                batch_id = row.source.batch_id,
                row = row.source.row_number,
                "{}",
                missing
            );
        }

        if let Err(e) = self.registry.cleaned.check_typed(&fields) {
            return Err((row, e));
        }
        let record_json = serde_json::Value::Object(
            fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
        );
        if let Err(errors) = self.contract.check(&record_json) {
            return Err((row, RowValidationError::Contract { errors }));
        }

        let Some(key) = NaturalKey::from_fields(&self.config.natural_key, &fields) else {
            let column = self.config.natural_key.join("+");
            return Err((row, RowValidationError::MissingRequired { column }));
        };

        let record = CleanRecord {
            key,
            fields,
            imputed: imputed.columns,
            batch_id: row.source.batch_id,
            source_file: row.source.source_file.clone(),
            row_number: row.source.row_number,
            ingested_at: row.source.ingested_at,
            snapshot_version,
        };
        Ok((record, imputed.missing_context.len()))
    }

    /// Merge into Silver with an optimistic write, reloading on conflict.
    fn upsert(&self, incoming: &BTreeMap<NaturalKey, CleanRecord>) -> StageResult<CleanOutcome> {
        for attempt in 1..=MAX_UPSERT_ATTEMPTS {
            let silver = self.warehouse.load_silver()?;
            let mut table = silver.value;
            let outcome = merge(&mut table, incoming, &self.config.grouping_key_for_aggregation);

            if outcome.written == 0 {
                return Ok(outcome);
            }
            match self.warehouse.save_silver(&table, silver.version) {
                Ok(_) => return Ok(outcome),
                Err(StorageError::Conflict { .. }) => {
                    tracing::debug!(attempt, "Silver changed concurrently, re-applying upsert");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StageError::Contended("silver", MAX_UPSERT_ATTEMPTS))
    }
}

/// Upsert keyed by natural key. A row never replaces one from a newer batch.
pub fn merge(
    table: &mut SilverTable,
    incoming: &BTreeMap<NaturalKey, CleanRecord>,
    grouping_key: &str,
) -> CleanOutcome {
    let mut outcome = CleanOutcome::default();

    for (key, record) in incoming {
        if let Some(existing) = table.get(key) {
            if existing.batch_id > record.batch_id {
                outcome.superseded += 1;
                continue;
            }
            // A replay still reports its groups so a resumed Gold stage recomputes them.
            outcome.affected_groups.extend(group_of(existing, grouping_key));
            if existing == record {
                continue;
            }
        }
        outcome.affected_groups.extend(group_of(record, grouping_key));
        table.insert(key.clone(), record.clone());
        outcome.written += 1;
    }

    outcome
}

/// Grouping key of a record; `None` when the column is null.
pub fn group_of(record: &CleanRecord, grouping_key: &str) -> Option<String> {
    let value = record.get(grouping_key);
    (!value.is_null()).then(|| value.to_string())
}

fn reject(source: &crate::models::RawRecord, error: &RowValidationError) -> RejectedRow {
    RejectedRow {
        batch_id: source.batch_id,
        row_number: source.row_number,
        stage: Stage::Silver,
        reason: error.to_string(),
        fields: source.fields.clone(),
    }
}
