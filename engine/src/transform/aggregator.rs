//! Gold stage: grouped metrics over the current Silver table.
//!
//! Metrics are a pure function of the Silver rows in a group. Only groups
//! touched by a Silver upsert are recomputed unless a full rebuild is asked for.

use std::collections::BTreeSet;

use crate::error::{StageError, StageResult, StorageError};
use crate::models::{AggregateRecord, CleanRecord};
use crate::store::{GoldTable, SilverTable, Warehouse};

use super::cleaner::group_of;

const MAX_MERGE_ATTEMPTS: u32 = 8;

/// What one aggregation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateOutcome {
    /// Gold rows inserted or changed.
    pub written: usize,
    /// Gold rows dropped (full rebuild only).
    pub removed: usize,
    /// Groups recomputed.
    pub groups: usize,
}

/// Metrics for one group. Sums run in the iterator's order.
pub fn compute_group<'r>(
    group: &str,
    records: impl IntoIterator<Item = &'r CleanRecord>,
    metric_column: &str,
) -> AggregateRecord {
    let mut total = 0.0;
    let mut count = 0u64;
    let mut last_batch_id = 0;

    for record in records {
        total += record.get(metric_column).as_f64().unwrap_or(0.0);
        count += 1;
        last_batch_id = last_batch_id.max(record.batch_id);
    }

    AggregateRecord {
        group: group.to_string(),
        total_sales: total,
        avg_sales: (count > 0).then(|| total / count as f64),
        record_count: count,
        last_batch_id,
    }
}

/// Every group present in Silver, recomputed from scratch.
pub fn compute_all(silver: &SilverTable, grouping_key: &str, metric_column: &str) -> GoldTable {
    let groups: BTreeSet<String> = silver
        .values()
        .filter_map(|r| group_of(r, grouping_key))
        .collect();
    groups
        .into_iter()
        .map(|group| {
            let record = compute_group(&group, members(silver, grouping_key, &group), metric_column);
            (group, record)
        })
        .collect()
}

/// Silver rows of one group, in natural-key order.
fn members<'s>(
    silver: &'s SilverTable,
    grouping_key: &'s str,
    group: &'s str,
) -> impl Iterator<Item = &'s CleanRecord> {
    silver
        .values()
        .filter(move |r| group_of(r, grouping_key).as_deref() == Some(group))
}

/// Writes Gold from Silver.
pub struct Aggregator<'a> {
    warehouse: &'a Warehouse,
    grouping_key: &'a str,
    metric_column: &'a str,
}

impl<'a> Aggregator<'a> {
    pub fn new(warehouse: &'a Warehouse, grouping_key: &'a str, metric_column: &'a str) -> Self {
        Self {
            warehouse,
            grouping_key,
            metric_column,
        }
    }

    /// Recompute only the given groups and merge them into Gold.
    pub fn aggregate(&self, keys_affected: &BTreeSet<String>) -> StageResult<AggregateOutcome> {
        if keys_affected.is_empty() {
            return Ok(AggregateOutcome::default());
        }
        self.write(|silver, gold| {
            let mut outcome = AggregateOutcome {
                groups: keys_affected.len(),
                ..Default::default()
            };
            for group in keys_affected {
                let record = compute_group(
                    group,
                    members(silver, self.grouping_key, group),
                    self.metric_column,
                );
                if gold.get(group) != Some(&record) {
                    gold.insert(group.clone(), record);
                    outcome.written += 1;
                }
            }
            outcome
        })
    }

    /// Replace Gold entirely from the current Silver table.
    pub fn rebuild(&self) -> StageResult<AggregateOutcome> {
        self.write(|silver, gold| {
            let fresh = compute_all(silver, self.grouping_key, self.metric_column);
            let outcome = AggregateOutcome {
                written: fresh
                    .iter()
                    .filter(|(group, record)| gold.get(*group) != Some(*record))
                    .count(),
                removed: gold.keys().filter(|g| !fresh.contains_key(*g)).count(),
                groups: fresh.len(),
            };
            *gold = fresh;
            outcome
        })
    }

    /// Apply a change to Gold with an optimistic write.
    ///
    /// Gold is read before Silver on every attempt. A Silver writer always
    /// follows up with its own Gold write, so a stale Silver read either loses
    /// the race here or is overwritten by that follow-up.
    fn write<F>(&self, mut apply: F) -> StageResult<AggregateOutcome>
    where
        F: FnMut(&SilverTable, &mut GoldTable) -> AggregateOutcome,
    {
        for attempt in 1..=MAX_MERGE_ATTEMPTS {
            let gold = self.warehouse.load_gold()?;
            let silver = self.warehouse.load_silver()?.value;
            let mut table = gold.value;
            let outcome = apply(&silver, &mut table);

            if outcome.written == 0 && outcome.removed == 0 {
                return Ok(outcome);
            }
            match self.warehouse.save_gold(&table, gold.version) {
                Ok(_) => return Ok(outcome),
                Err(StorageError::Conflict { .. }) => {
                    tracing::debug!(attempt, "Gold changed concurrently, recomputing from Silver");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StageError::Contended("gold", MAX_MERGE_ATTEMPTS))
    }
}
