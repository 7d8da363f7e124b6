//! Typed access to the stage tables on top of a [`Storage`] backend.
//!
//! Layout:
//!
//! ```text
//! bronze/batch-000001.jsonl        raw rows, one file per batch (JSON Lines)
//! silver/records.json              cleaned table, one row per natural key
//! gold/aggregates.json             one row per grouping key
//! quarantine/batch-000001.jsonl    rejected rows of a batch
//! stats/snapshot-000001.json       imputation snapshot used for a batch
//! manifest/batches.json            see `crate::manifest`
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{with_retry, RetryPolicy, Storage, WriteCondition};
use crate::error::{StorageError, StorageResult};
use crate::models::{AggregateRecord, CleanRecord, NaturalKey, RawRecord, RejectedRow};
use crate::transform::imputation::ImputationSnapshot;

const BRONZE_PREFIX: &str = "bronze/";
const QUARANTINE_PREFIX: &str = "quarantine/";
const SILVER_KEY: &str = "silver/records.json";
const GOLD_KEY: &str = "gold/aggregates.json";

/// Silver rows by natural key.
pub type SilverTable = BTreeMap<NaturalKey, CleanRecord>;

/// Gold rows by grouping key.
pub type GoldTable = BTreeMap<String, AggregateRecord>;

/// A value together with the storage version it was read at (0 = absent).
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// The named output tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableName {
    Bronze,
    Silver,
    Gold,
    Quarantine,
    Manifest,
}

impl FromStr for TableName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bronze" => Ok(TableName::Bronze),
            "silver" => Ok(TableName::Silver),
            "gold" => Ok(TableName::Gold),
            "quarantine" => Ok(TableName::Quarantine),
            "manifest" => Ok(TableName::Manifest),
            other => Err(format!(
                "unknown table '{}' (expected bronze, silver, gold, quarantine or manifest)",
                other
            )),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TableName::Bronze => "bronze",
            TableName::Silver => "silver",
            TableName::Gold => "gold",
            TableName::Quarantine => "quarantine",
            TableName::Manifest => "manifest",
        })
    }
}

fn bronze_key(batch_id: u64) -> String {
    format!("{}batch-{:06}.jsonl", BRONZE_PREFIX, batch_id)
}

fn quarantine_key(batch_id: u64) -> String {
    format!("{}batch-{:06}.jsonl", QUARANTINE_PREFIX, batch_id)
}

fn snapshot_key(batch_id: u64) -> String {
    format!("stats/snapshot-{:06}.json", batch_id)
}

/// Typed table store shared by every stage.
#[derive(Clone)]
pub struct Warehouse {
    storage: Arc<dyn Storage>,
    retry: RetryPolicy,
}

impl Warehouse {
    pub fn new(storage: Arc<dyn Storage>, retry: RetryPolicy) -> Self {
        Self { storage, retry }
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    // =========================================================================
    // Raw object helpers
    // =========================================================================

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<Versioned<T>>> {
        let object = with_retry(&self.retry, key, || self.storage.get(key))?;
        object
            .map(|obj| {
                let value = serde_json::from_slice(&obj.bytes)
                    .map_err(|e| StorageError::corrupt(key, e))?;
                Ok(Versioned {
                    value,
                    version: obj.version,
                })
            })
            .transpose()
    }

    fn put_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        condition: WriteCondition,
    ) -> StorageResult<u64> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| StorageError::corrupt(key, e))?;
        with_retry(&self.retry, key, || self.storage.put(key, &bytes, condition))
    }

    fn get_lines<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<Vec<T>>> {
        let Some(obj) = with_retry(&self.retry, key, || self.storage.get(key))? else {
            return Ok(None);
        };
        let text = String::from_utf8(obj.bytes).map_err(|e| StorageError::corrupt(key, e))?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .map_err(|e| StorageError::corrupt(key, format!("line {}: {}", idx + 1, e)))
            })
            .collect::<StorageResult<Vec<T>>>()
            .map(Some)
    }

    fn put_lines<T: Serialize>(&self, key: &str, rows: &[T], condition: WriteCondition) -> StorageResult<u64> {
        let mut bytes = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut bytes, row).map_err(|e| StorageError::corrupt(key, e))?;
            bytes.push(b'\n');
        }
        with_retry(&self.retry, key, || {
            self.storage.put(key, &bytes, condition)
        })
    }

    fn batch_ids(&self, prefix: &str) -> StorageResult<Vec<u64>> {
        let keys = with_retry(&self.retry, prefix, || self.storage.list(prefix))?;
        let mut ids: Vec<u64> = keys
            .iter()
            .filter_map(|k| {
                k.strip_prefix(prefix)?
                    .strip_prefix("batch-")?
                    .strip_suffix(".jsonl")?
                    .parse()
                    .ok()
            })
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    // =========================================================================
    // Bronze
    // =========================================================================

    /// Persist the raw rows of a batch once. If the batch file already exists
    /// (an earlier attempt or a concurrent run) it is kept as is. Returns the
    /// number of rows stored.
    pub fn write_bronze(&self, batch_id: u64, rows: &[RawRecord]) -> StorageResult<usize> {
        match self.put_lines(&bronze_key(batch_id), rows, WriteCondition::IfVersion(0)) {
            Ok(_) => Ok(rows.len()),
            Err(StorageError::Conflict { .. }) => {
                tracing::debug!(batch_id, "Bronze batch already written, keeping it");
                Ok(self.read_bronze(batch_id)?.map_or(0, |rows| rows.len()))
            }
            Err(e) => Err(e),
        }
    }

    /// Raw rows of a batch, `None` when the batch file is gone.
    pub fn read_bronze(&self, batch_id: u64) -> StorageResult<Option<Vec<RawRecord>>> {
        self.get_lines(&bronze_key(batch_id))
    }

    pub fn bronze_batches(&self) -> StorageResult<Vec<u64>> {
        self.batch_ids(BRONZE_PREFIX)
    }

    // =========================================================================
    // Silver
    // =========================================================================

    pub fn load_silver(&self) -> StorageResult<Versioned<SilverTable>> {
        let stored: Option<Versioned<Vec<CleanRecord>>> = self.get_json(SILVER_KEY)?;
        Ok(match stored {
            Some(v) => Versioned {
                value: v.value.into_iter().map(|r| (r.key.clone(), r)).collect(),
                version: v.version,
            },
            None => Versioned {
                value: SilverTable::new(),
                version: 0,
            },
        })
    }

    /// Write the Silver table only if nobody replaced it since `expected_version`.
    pub fn save_silver(&self, table: &SilverTable, expected_version: u64) -> StorageResult<u64> {
        let rows: Vec<&CleanRecord> = table.values().collect();
        self.put_json(SILVER_KEY, &rows, WriteCondition::IfVersion(expected_version))
    }

    // =========================================================================
    // Gold
    // =========================================================================

    pub fn load_gold(&self) -> StorageResult<Versioned<GoldTable>> {
        let stored: Option<Versioned<Vec<AggregateRecord>>> = self.get_json(GOLD_KEY)?;
        Ok(match stored {
            Some(v) => Versioned {
                value: v.value.into_iter().map(|r| (r.group.clone(), r)).collect(),
                version: v.version,
            },
            None => Versioned {
                value: GoldTable::new(),
                version: 0,
            },
        })
    }

    pub fn save_gold(&self, table: &GoldTable, expected_version: u64) -> StorageResult<u64> {
        let rows: Vec<&AggregateRecord> = table.values().collect();
        self.put_json(GOLD_KEY, &rows, WriteCondition::IfVersion(expected_version))
    }

    // =========================================================================
    // Quarantine
    // =========================================================================

    /// Replace the quarantine file of a batch as a whole.
    pub fn write_quarantine(&self, batch_id: u64, rows: &[RejectedRow]) -> StorageResult<()> {
        self.put_lines(&quarantine_key(batch_id), rows, WriteCondition::Any)
            .map(|_| ())
    }

    pub fn read_quarantine(&self, batch_id: u64) -> StorageResult<Vec<RejectedRow>> {
        Ok(self.get_lines(&quarantine_key(batch_id))?.unwrap_or_default())
    }

    pub fn quarantined_batches(&self) -> StorageResult<Vec<u64>> {
        self.batch_ids(QUARANTINE_PREFIX)
    }

    // =========================================================================
    // Imputation snapshots
    // =========================================================================

    pub fn load_snapshot(&self, batch_id: u64) -> StorageResult<Option<ImputationSnapshot>> {
        Ok(self
            .get_json::<ImputationSnapshot>(&snapshot_key(batch_id))?
            .map(|v| v.value))
    }

    /// Persist the snapshot for a batch once. If one already exists, it wins and is returned.
    pub fn save_snapshot(
        &self,
        batch_id: u64,
        snapshot: ImputationSnapshot,
    ) -> StorageResult<ImputationSnapshot> {
        let key = snapshot_key(batch_id);
        match self.put_json(&key, &snapshot, WriteCondition::IfVersion(0)) {
            Ok(_) => Ok(snapshot),
            Err(StorageError::Conflict { .. }) => self
                .load_snapshot(batch_id)?
                .ok_or_else(|| StorageError::corrupt(key, "snapshot vanished after conflict")),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Stage;
    use crate::models::FieldValue;
    use crate::store::MemoryStorage;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn warehouse() -> Warehouse {
        Warehouse::new(Arc::new(MemoryStorage::new()), RetryPolicy::none())
    }

    fn raw(batch_id: u64, row_number: usize, item: &str) -> RawRecord {
        RawRecord {
            batch_id,
            source_file: "sales.csv".into(),
            ingested_at: Utc::now(),
            row_number,
            fields: BTreeMap::from([("item".to_string(), item.to_string())]),
        }
    }

    fn clean(item: &str, batch_id: u64) -> CleanRecord {
        CleanRecord {
            key: NaturalKey(vec![item.to_string(), "O1".to_string()]),
            fields: BTreeMap::from([("item".to_string(), FieldValue::Text(item.into()))]),
            imputed: BTreeSet::new(),
            batch_id,
            source_file: "sales.csv".into(),
            row_number: 1,
            ingested_at: Utc::now(),
            snapshot_version: 0,
        }
    }

    #[test]
    fn test_bronze_roundtrip_and_listing() {
        let wh = warehouse();
        assert!(wh.read_bronze(1).unwrap().is_none());

        wh.write_bronze(2, &[raw(2, 1, "A"), raw(2, 2, "B")]).unwrap();
        wh.write_bronze(1, &[raw(1, 1, "C")]).unwrap();

        let rows = wh.read_bronze(2).unwrap().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].fields["item"], "B");
        assert_eq!(wh.bronze_batches().unwrap(), vec![1, 2]);

        // A second write of the same batch keeps the first one.
        assert_eq!(wh.write_bronze(1, &[raw(1, 1, "X"), raw(1, 2, "Y")]).unwrap(), 1);
        assert_eq!(wh.read_bronze(1).unwrap().unwrap()[0].fields["item"], "C");
    }

    #[test]
    fn test_silver_save_is_conditional() {
        let wh = warehouse();
        let loaded = wh.load_silver().unwrap();
        assert_eq!(loaded.version, 0);

        let mut table = loaded.value;
        let rec = clean("A", 1);
        table.insert(rec.key.clone(), rec);
        let v1 = wh.save_silver(&table, 0).unwrap();
        assert_eq!(v1, 1);

        // A writer still holding version 0 loses.
        let err = wh.save_silver(&table, 0).unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));

        let reloaded = wh.load_silver().unwrap();
        assert_eq!(reloaded.version, 1);
        assert_eq!(reloaded.value.len(), 1);
    }

    #[test]
    fn test_quarantine_is_replaced_not_appended() {
        let wh = warehouse();
        let row = RejectedRow {
            batch_id: 3,
            row_number: 7,
            stage: Stage::Silver,
            reason: "Missing required field 'item'".into(),
            fields: BTreeMap::new(),
        };
        wh.write_quarantine(3, &[row.clone()]).unwrap();
        wh.write_quarantine(3, &[row]).unwrap();

        assert_eq!(wh.read_quarantine(3).unwrap().len(), 1);
        assert!(wh.read_quarantine(4).unwrap().is_empty());
        assert_eq!(wh.quarantined_batches().unwrap(), vec![3]);
    }

    #[test]
    fn test_first_snapshot_wins() {
        let wh = warehouse();
        let first = ImputationSnapshot::empty(5);
        let mut second = ImputationSnapshot::empty(5);
        second.source_rows = 99;

        let saved = wh.save_snapshot(5, first.clone()).unwrap();
        assert_eq!(saved, first);

        let again = wh.save_snapshot(5, second).unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn test_table_name_parse() {
        assert_eq!("Gold".parse::<TableName>().unwrap(), TableName::Gold);
        assert!("platinum".parse::<TableName>().is_err());
        assert_eq!(TableName::Quarantine.to_string(), "quarantine");
    }
}
