//! Declared dataset shapes and batch validation.
//!
//! A [`DatasetSchema`] maps column names to a semantic type and nullability.
//! The [`SchemaRegistry`] holds the raw and cleaned schemas plus the drift
//! policy, and splits a Bronze batch into typed rows and rejected rows.
//!
//! Validation is pure: nothing is written, rejected rows are returned to the
//! caller with their reason.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{RowValidationError, SchemaViolation};
use crate::models::{FieldValue, RawRecord};

// =============================================================================
// Schema declaration
// =============================================================================

/// Semantic type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    String,
    Integer,
    Decimal,
    Categorical,
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SemanticType::String => "string",
            SemanticType::Integer => "integer",
            SemanticType::Decimal => "decimal",
            SemanticType::Categorical => "categorical",
        })
    }
}

/// One declared column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub semantic_type: SemanticType,
    #[serde(default)]
    pub nullable: bool,
    /// Categorical only. Empty means any value is accepted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<String>,
}

impl ColumnSpec {
    pub fn new(name: &str, semantic_type: SemanticType, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            semantic_type,
            nullable,
            allowed: Vec::new(),
        }
    }

    pub fn categorical(name: &str, nullable: bool, allowed: &[&str]) -> Self {
        Self {
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
            ..Self::new(name, SemanticType::Categorical, nullable)
        }
    }

    /// Coerce a raw cell into a typed value.
    pub fn coerce(&self, raw: Option<&str>) -> Result<FieldValue, RowValidationError> {
        let value = raw.map(str::trim).unwrap_or("");
        if value.is_empty() {
            return if self.nullable {
                Ok(FieldValue::Null)
            } else {
                Err(RowValidationError::MissingRequired {
                    column: self.name.clone(),
                })
            };
        }

        let mismatch = || RowValidationError::TypeMismatch {
            column: self.name.clone(),
            value: value.to_string(),
            expected: self.semantic_type.to_string(),
        };

        match self.semantic_type {
            SemanticType::String => Ok(FieldValue::Text(value.to_string())),
            SemanticType::Integer => parse_integer(value).map(FieldValue::Integer).ok_or_else(mismatch),
            SemanticType::Decimal => parse_decimal(value).map(FieldValue::Decimal).ok_or_else(mismatch),
            SemanticType::Categorical => {
                self.check_allowed(value)?;
                Ok(FieldValue::Text(value.to_string()))
            }
        }
    }

    /// Check an already-typed value against this column.
    pub fn check(&self, value: &FieldValue) -> Result<(), RowValidationError> {
        let mismatch = || RowValidationError::TypeMismatch {
            column: self.name.clone(),
            value: value.to_string(),
            expected: self.semantic_type.to_string(),
        };

        match (self.semantic_type, value) {
            (_, FieldValue::Null) if self.nullable => Ok(()),
            (_, FieldValue::Null) => Err(RowValidationError::MissingRequired {
                column: self.name.clone(),
            }),
            (SemanticType::String, FieldValue::Text(_)) => Ok(()),
            (SemanticType::Categorical, FieldValue::Text(s)) => self.check_allowed(s),
            (SemanticType::Integer, FieldValue::Integer(_)) => Ok(()),
            (SemanticType::Decimal, FieldValue::Decimal(d)) if d.is_finite() => Ok(()),
            (SemanticType::Decimal, FieldValue::Integer(_)) => Ok(()),
            _ => Err(mismatch()),
        }
    }

    fn check_allowed(&self, value: &str) -> Result<(), RowValidationError> {
        if self.allowed.is_empty() || self.allowed.iter().any(|a| a == value) {
            Ok(())
        } else {
            Err(RowValidationError::NotAllowed {
                column: self.name.clone(),
                value: value.to_string(),
            })
        }
    }

    fn json_type(&self) -> Value {
        let base = match self.semantic_type {
            SemanticType::String => json!({ "type": "string" }),
            SemanticType::Integer => json!({ "type": "integer" }),
            SemanticType::Decimal => json!({ "type": "number" }),
            SemanticType::Categorical if self.allowed.is_empty() => json!({ "type": "string" }),
            SemanticType::Categorical => {
                let mut allowed: Vec<Value> = self.allowed.iter().map(|a| json!(a)).collect();
                if self.nullable {
                    allowed.push(Value::Null);
                }
                return json!({ "enum": allowed });
            }
        };
        if self.nullable {
            json!({ "anyOf": [base, { "type": "null" }] })
        } else {
            base
        }
    }
}

/// Integers, also accepting an integral decimal spelling (`"12.0"`).
fn parse_integer(value: &str) -> Option<i64> {
    if let Ok(i) = value.parse::<i64>() {
        return Some(i);
    }
    let f = value.parse::<f64>().ok()?;
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

fn parse_decimal(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|f| f.is_finite())
}

/// An ordered set of declared columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
}

impl DatasetSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Check a typed row: every declared column present and valid.
    pub fn check_typed(&self, fields: &BTreeMap<String, FieldValue>) -> Result<(), RowValidationError> {
        for column in &self.columns {
            column.check(fields.get(&column.name).unwrap_or(&FieldValue::Null))?;
        }
        Ok(())
    }

    /// Export as a draft 7 JSON Schema over the typed field map.
    pub fn to_json_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.json_type()))
            .collect();
        let required: Vec<&str> = self
            .columns
            .iter()
            .filter(|c| !c.nullable)
            .map(|c| c.name.as_str())
            .collect();

        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": self.name,
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false
        })
    }
}

// =============================================================================
// Drift policy
// =============================================================================

/// How far a batch's column set may diverge from the declared schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftPolicy {
    /// Nullable columns that may be absent; they read as null.
    pub drift_tolerance: BTreeSet<String>,
    /// Extra columns accepted and dropped without complaint.
    pub ignored_columns: BTreeSet<String>,
    /// Distinct unknown columns tolerated before the batch fails.
    pub max_unrecognized_columns: usize,
}

impl Default for DriftPolicy {
    fn default() -> Self {
        Self {
            drift_tolerance: BTreeSet::new(),
            ignored_columns: BTreeSet::new(),
            max_unrecognized_columns: 3,
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// A raw row that passed raw-schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRow {
    pub source: RawRecord,
    pub fields: BTreeMap<String, FieldValue>,
}

/// A raw row that failed raw-schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidRow {
    pub source: RawRecord,
    pub error: RowValidationError,
}

/// Expected shapes of the raw and cleaned datasets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRegistry {
    pub raw: DatasetSchema,
    pub cleaned: DatasetSchema,
    #[serde(default)]
    pub drift: DriftPolicy,
}

impl SchemaRegistry {
    pub fn new(raw: DatasetSchema, cleaned: DatasetSchema, drift: DriftPolicy) -> Self {
        Self { raw, cleaned, drift }
    }

    /// Compare a batch's column set with a schema under the drift policy.
    pub fn check_columns(
        &self,
        columns: &BTreeSet<String>,
        schema: &DatasetSchema,
    ) -> Result<Vec<String>, SchemaViolation> {
        let missing: Vec<String> = schema
            .columns
            .iter()
            .filter(|c| !columns.contains(&c.name))
            .filter(|c| !(c.nullable && self.drift.drift_tolerance.contains(&c.name)))
            .map(|c| c.name.clone())
            .collect();

        let unrecognized: Vec<String> = columns
            .iter()
            .filter(|c| schema.column(c).is_none() && !self.drift.ignored_columns.contains(*c))
            .cloned()
            .collect();

        if !missing.is_empty() || unrecognized.len() > self.drift.max_unrecognized_columns {
            return Err(SchemaViolation {
                schema: schema.name.clone(),
                missing,
                unrecognized,
            });
        }
        Ok(unrecognized)
    }

    /// Split a batch into typed rows and rejected rows.
    ///
    /// Fails with [`SchemaViolation`] when the column set is beyond the drift
    /// threshold; row-level problems never fail the batch.
    pub fn validate(
        &self,
        batch: &[RawRecord],
        schema: &DatasetSchema,
    ) -> Result<(Vec<TypedRow>, Vec<InvalidRow>), SchemaViolation> {
        let columns: BTreeSet<String> = batch
            .iter()
            .flat_map(|r| r.fields.keys().cloned())
            .collect();
        if batch.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let unrecognized = self.check_columns(&columns, schema)?;

        let mut valid = Vec::with_capacity(batch.len());
        let mut rejected = Vec::new();

        for record in batch {
            match Self::type_row(record, schema, &unrecognized) {
                Ok(fields) => valid.push(TypedRow {
                    source: record.clone(),
                    fields,
                }),
                Err(error) => rejected.push(InvalidRow {
                    source: record.clone(),
                    error,
                }),
            }
        }

        Ok((valid, rejected))
    }

    fn type_row(
        record: &RawRecord,
        schema: &DatasetSchema,
        unrecognized: &[String],
    ) -> Result<BTreeMap<String, FieldValue>, RowValidationError> {
        for column in unrecognized {
            if let Some(value) = record.fields.get(column).filter(|v| !v.trim().is_empty()) {
                return Err(RowValidationError::UnrecognizedColumn {
                    column: column.clone(),
                    value: value.clone(),
                });
            }
        }

        schema
            .columns
            .iter()
            .map(|c| {
                c.coerce(record.fields.get(&c.name).map(String::as_str))
                    .map(|v| (c.name.clone(), v))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn raw_schema() -> DatasetSchema {
        DatasetSchema {
            name: "raw_sales".into(),
            columns: vec![
                ColumnSpec::new("item", SemanticType::String, false),
                ColumnSpec::new("outlet", SemanticType::String, false),
                ColumnSpec::new("weight", SemanticType::Decimal, true),
                ColumnSpec::new("established", SemanticType::Integer, true),
                ColumnSpec::categorical("fat_content", true, &[]),
                ColumnSpec::new("sales", SemanticType::Decimal, true),
            ],
        }
    }

    fn registry(drift: DriftPolicy) -> SchemaRegistry {
        let mut cleaned = raw_schema();
        cleaned.name = "clean_sales".into();
        cleaned.columns[4] = ColumnSpec::categorical("fat_content", false, &["Low Fat", "Regular"]);
        SchemaRegistry::new(raw_schema(), cleaned, drift)
    }

    fn row(n: usize, cells: &[(&str, &str)]) -> RawRecord {
        RawRecord {
            batch_id: 1,
            source_file: "sales.csv".into(),
            ingested_at: Utc::now(),
            row_number: n,
            fields: cells
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn full(n: usize, item: &str, weight: &str) -> RawRecord {
        row(
            n,
            &[
                ("item", item),
                ("outlet", "O1"),
                ("weight", weight),
                ("established", "1999"),
                ("fat_content", "low fat"),
                ("sales", "100"),
            ],
        )
    }

    #[test]
    fn test_coercion() {
        let dec = ColumnSpec::new("mrp", SemanticType::Decimal, false);
        assert_eq!(dec.coerce(Some("12")).unwrap(), FieldValue::Decimal(12.0));
        assert_eq!(dec.coerce(Some(" 3.1 ")).unwrap(), FieldValue::Decimal(3.1));
        assert!(dec.coerce(Some("NaN")).is_err());

        let int = ColumnSpec::new("year", SemanticType::Integer, false);
        assert_eq!(int.coerce(Some("12.0")).unwrap(), FieldValue::Integer(12));
        assert!(matches!(
            int.coerce(Some("12.5")),
            Err(RowValidationError::TypeMismatch { .. })
        ));
        assert!(matches!(
            int.coerce(None),
            Err(RowValidationError::MissingRequired { .. })
        ));
    }

    #[test]
    fn test_valid_and_rejected_rows() {
        let reg = registry(DriftPolicy::default());
        let batch = vec![full(1, "A", "9.3"), full(2, "", "9.3"), full(3, "C", "heavy")];

        let (valid, rejected) = reg.validate(&batch, &reg.raw).unwrap();
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].fields["weight"], FieldValue::Decimal(9.3));
        assert_eq!(rejected.len(), 2);
        assert_eq!(rejected[0].source.row_number, 2);
        assert!(matches!(rejected[1].error, RowValidationError::TypeMismatch { .. }));
    }

    #[test]
    fn test_tolerated_missing_column_reads_null() {
        let drift = DriftPolicy {
            drift_tolerance: BTreeSet::from(["weight".to_string()]),
            ..DriftPolicy::default()
        };
        let reg = registry(drift);
        let batch = vec![row(
            1,
            &[("item", "A"), ("outlet", "O1"), ("established", ""), ("fat_content", "LF"), ("sales", "")],
        )];

        let (valid, rejected) = reg.validate(&batch, &reg.raw).unwrap();
        assert!(rejected.is_empty());
        assert_eq!(valid[0].fields["weight"], FieldValue::Null);
    }

    #[test]
    fn test_missing_required_column_is_violation() {
        let reg = registry(DriftPolicy::default());
        let batch = vec![row(1, &[("outlet", "O1"), ("weight", "1"), ("established", "1"), ("fat_content", "x"), ("sales", "1")])];

        let err = reg.validate(&batch, &reg.raw).unwrap_err();
        assert_eq!(err.missing, vec!["item".to_string()]);
    }

    #[test]
    fn test_unrecognized_columns() {
        let reg = registry(DriftPolicy {
            max_unrecognized_columns: 1,
            ignored_columns: BTreeSet::from(["_loaded_by".to_string()]),
            ..DriftPolicy::default()
        });

        let mut with_extra = full(1, "A", "1");
        with_extra.fields.insert("promo".into(), "yes".into());
        with_extra.fields.insert("_loaded_by".into(), "etl".into());
        let mut blank_extra = full(2, "B", "1");
        blank_extra.fields.insert("promo".into(), "".into());

        let (valid, rejected) = reg.validate(&[with_extra, blank_extra], &reg.raw).unwrap();
        assert_eq!(valid.len(), 1);
        assert!(!valid[0].fields.contains_key("promo"));
        assert!(matches!(
            rejected[0].error,
            RowValidationError::UnrecognizedColumn { .. }
        ));

        let mut too_many = full(1, "A", "1");
        too_many.fields.insert("promo".into(), "".into());
        too_many.fields.insert("channel".into(), "".into());
        let err = reg.validate(&[too_many], &reg.raw).unwrap_err();
        assert_eq!(err.unrecognized.len(), 2);
    }

    #[test]
    fn test_cleaned_check_and_json_schema_agree() {
        let reg = registry(DriftPolicy::default());
        let schema = reg.cleaned.to_json_schema();

        let mut fields = BTreeMap::from([
            ("item".to_string(), FieldValue::Text("A".into())),
            ("outlet".to_string(), FieldValue::Text("O1".into())),
            ("weight".to_string(), FieldValue::Null),
            ("established".to_string(), FieldValue::Integer(1999)),
            ("fat_content".to_string(), FieldValue::Text("Low Fat".into())),
            ("sales".to_string(), FieldValue::Decimal(100.0)),
        ]);
        let as_json = |f: &BTreeMap<String, FieldValue>| {
            Value::Object(f.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
        };

        assert!(reg.cleaned.check_typed(&fields).is_ok());
        assert!(crate::validation::is_valid(&schema, &as_json(&fields)));

        fields.insert("fat_content".into(), FieldValue::Text("LF".into()));
        assert!(matches!(
            reg.cleaned.check_typed(&fields),
            Err(RowValidationError::NotAllowed { .. })
        ));
        assert!(!crate::validation::is_valid(&schema, &as_json(&fields)));
    }
}
