//! Domain models for the Refinery batch engine.
//!
//! This module contains the records that flow through the three stages:
//!
//! - [`RawRecord`] - one source row plus lineage, as appended to Bronze
//! - [`CleanRecord`] - a typed, standardized row keyed by [`NaturalKey`] in Silver
//! - [`AggregateRecord`] - one row per grouping key in Gold
//! - [`RejectedRow`] - a quarantined row and the reason it was rejected
//! - [`FieldValue`] - a typed cell value

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::Stage;

// =============================================================================
// Field Values
// =============================================================================

/// A typed cell value after schema coercion.
///
/// Serialized untagged so tables read as plain JSON (`null`, numbers, strings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum FieldValue {
    #[default]
    Null,
    Integer(i64),
    Decimal(f64),
    Text(String),
}

static NULL: FieldValue = FieldValue::Null;

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Numeric view of integer and decimal values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert to a JSON value for contract validation.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Integer(i) => serde_json::Value::from(*i),
            FieldValue::Decimal(d) => serde_json::Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            FieldValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => Ok(()),
            FieldValue::Integer(i) => write!(f, "{}", i),
            FieldValue::Decimal(d) => write!(f, "{}", d),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

// =============================================================================
// Natural Key
// =============================================================================

/// Business identity of a cleaned record (e.g. item + outlet).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(pub Vec<String>);

impl NaturalKey {
    /// Build a key from the given columns. `None` if any part is null or blank.
    pub fn from_fields(columns: &[String], fields: &BTreeMap<String, FieldValue>) -> Option<Self> {
        let mut parts = Vec::with_capacity(columns.len());
        for column in columns {
            let part = fields.get(column)?.to_string();
            if part.trim().is_empty() {
                return None;
            }
            parts.push(part);
        }
        Some(Self(parts))
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("|"))
    }
}

// =============================================================================
// Bronze
// =============================================================================

/// One raw source row with ingestion lineage. Never mutated after write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub batch_id: u64,
    pub source_file: String,
    pub ingested_at: DateTime<Utc>,
    /// 1-based data row index within the source file.
    pub row_number: usize,
    /// Cells exactly as read, keyed by header.
    pub fields: BTreeMap<String, String>,
}

// =============================================================================
// Silver
// =============================================================================

/// A normalized record, unique by natural key in the Silver table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanRecord {
    pub key: NaturalKey,
    pub fields: BTreeMap<String, FieldValue>,
    /// Fields whose value was imputed rather than read.
    #[serde(default)]
    pub imputed: BTreeSet<String>,
    pub batch_id: u64,
    pub source_file: String,
    pub row_number: usize,
    pub ingested_at: DateTime<Utc>,
    /// Version of the imputation snapshot used while cleaning.
    pub snapshot_version: u64,
}

impl CleanRecord {
    /// Value of a column, `Null` when absent.
    pub fn get(&self, column: &str) -> &FieldValue {
        self.fields.get(column).unwrap_or(&NULL)
    }

    /// True when any field was defaulted.
    pub fn is_imputed(&self) -> bool {
        !self.imputed.is_empty()
    }

    pub fn is_field_imputed(&self, column: &str) -> bool {
        self.imputed.contains(column)
    }

    /// Fields as a JSON object, the shape checked against the cleaned contract.
    pub fn fields_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}

// =============================================================================
// Gold
// =============================================================================

/// Metrics for one grouping key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub group: String,
    pub total_sales: f64,
    /// `None` when `record_count` is zero.
    pub avg_sales: Option<f64>,
    pub record_count: u64,
    /// Highest batch id among the contributing records.
    pub last_batch_id: u64,
}

// =============================================================================
// Quarantine
// =============================================================================

/// A row routed to the quarantine sink with its violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub batch_id: u64,
    pub row_number: usize,
    pub stage: Stage,
    pub reason: String,
    pub fields: BTreeMap<String, String>,
}
