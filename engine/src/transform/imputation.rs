//! Imputation of missing values from historical Silver data.
//!
//! Statistics are computed once per batch into an [`ImputationSnapshot`] from
//! Silver rows of strictly earlier batches, using only values that were read
//! rather than imputed. The snapshot is persisted next to the batch so a replay
//! fills exactly the same values.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ImputationContextMissing, RowValidationError};
use crate::models::{CleanRecord, FieldValue};
use crate::schema::{DatasetSchema, SemanticType};

/// Statistic used to fill a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Mean,
    Median,
    /// Most frequent value; ties go to the lexicographically smallest.
    Mode,
}

/// How one column is imputed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImputationRule {
    pub column: String,
    pub strategy: Strategy,
    /// Grouping context column (e.g. `category`). `None` uses global statistics.
    #[serde(default)]
    pub context: Option<String>,
}

/// Statistics for one column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    #[serde(default)]
    pub by_context: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub global: Option<FieldValue>,
}

/// Versioned statistics used while cleaning one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImputationSnapshot {
    /// The batch this snapshot was computed for; also its version.
    pub batch_id: u64,
    /// Highest Silver batch id that contributed, 0 when history was empty.
    pub history_through: u64,
    pub source_rows: usize,
    pub stats: BTreeMap<String, FieldStats>,
}

impl ImputationSnapshot {
    pub fn empty(batch_id: u64) -> Self {
        Self {
            batch_id,
            history_through: 0,
            source_rows: 0,
            stats: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.batch_id
    }

    /// Compute statistics for `batch_id` from Silver rows of earlier batches.
    ///
    /// `history` must iterate in natural-key order so float sums are reproducible.
    pub fn compute<'a>(
        batch_id: u64,
        history: impl IntoIterator<Item = &'a CleanRecord>,
        rules: &[ImputationRule],
        schema: &DatasetSchema,
    ) -> Self {
        let rows: Vec<&CleanRecord> = history
            .into_iter()
            .filter(|r| r.batch_id < batch_id)
            .collect();

        let stats = rules
            .iter()
            .map(|rule| {
                let integral = schema
                    .column(&rule.column)
                    .is_some_and(|c| c.semantic_type == SemanticType::Integer);
                (rule.column.clone(), column_stats(&rows, rule, integral))
            })
            .collect();

        Self {
            batch_id,
            history_through: rows.iter().map(|r| r.batch_id).max().unwrap_or(0),
            source_rows: rows.len(),
            stats,
        }
    }
}

fn column_stats(rows: &[&CleanRecord], rule: &ImputationRule, integral: bool) -> FieldStats {
    let observed = rows
        .iter()
        .filter(|r| !r.is_field_imputed(&rule.column))
        .filter(|r| !r.get(&rule.column).is_null());

    let mut global: Vec<&FieldValue> = Vec::new();
    let mut grouped: BTreeMap<String, Vec<&FieldValue>> = BTreeMap::new();
    for row in observed {
        let value = row.get(&rule.column);
        global.push(value);
        if let Some(context) = &rule.context {
            let ctx = row.get(context);
            if !ctx.is_null() {
                grouped.entry(ctx.to_string()).or_default().push(value);
            }
        }
    }

    FieldStats {
        by_context: grouped
            .into_iter()
            .filter_map(|(ctx, values)| Some((ctx, statistic(rule.strategy, &values, integral)?)))
            .collect(),
        global: statistic(rule.strategy, &global, integral),
    }
}

fn statistic(strategy: Strategy, values: &[&FieldValue], integral: bool) -> Option<FieldValue> {
    let numeric = |x: f64| {
        if integral {
            FieldValue::Integer(x.round() as i64)
        } else {
            FieldValue::Decimal(x)
        }
    };

    match strategy {
        Strategy::Mean => {
            let nums: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
            if nums.is_empty() {
                return None;
            }
            Some(numeric(nums.iter().sum::<f64>() / nums.len() as f64))
        }
        Strategy::Median => {
            let mut nums: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
            if nums.is_empty() {
                return None;
            }
            nums.sort_by(f64::total_cmp);
            let mid = nums.len() / 2;
            let median = if nums.len() % 2 == 0 {
                (nums[mid - 1] + nums[mid]) / 2.0
            } else {
                nums[mid]
            };
            Some(numeric(median))
        }
        Strategy::Mode => {
            let mut counts: BTreeMap<String, (usize, &FieldValue)> = BTreeMap::new();
            for &value in values {
                counts.entry(value.to_string()).or_insert((0, value)).0 += 1;
            }
            // BTreeMap iterates keys ascending, so the first maximum is the smallest key.
            let mut best: Option<(usize, &FieldValue)> = None;
            for (count, value) in counts.into_values() {
                if best.map_or(true, |(c, _)| count > c) {
                    best = Some((count, value));
                }
            }
            best.map(|(_, v)| v.clone())
        }
    }
}

/// What imputation did to one row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Imputed {
    pub columns: BTreeSet<String>,
    pub missing_context: Vec<ImputationContextMissing>,
}

/// Fills nulls in a row from a snapshot.
///
/// A row whose context has no statistics gets the column's global statistic,
/// then the configured fallback. A column with none of these stays null when
/// the cleaned schema allows it; otherwise the row is rejected.
pub struct Imputer<'a> {
    rules: &'a [ImputationRule],
    fallback: BTreeMap<String, FieldValue>,
    required: BTreeSet<String>,
    snapshot: &'a ImputationSnapshot,
}

impl<'a> Imputer<'a> {
    /// `fallback` values are coerced with the cleaned schema up front.
    pub fn new(
        rules: &'a [ImputationRule],
        fallback: &BTreeMap<String, String>,
        schema: &DatasetSchema,
        snapshot: &'a ImputationSnapshot,
    ) -> Result<Self, ConfigError> {
        let fallback = fallback
            .iter()
            .map(|(column, raw)| {
                let spec = schema.column(column).ok_or_else(|| {
                    ConfigError::Invalid(format!("imputation fallback for unknown column '{}'", column))
                })?;
                let value = spec.coerce(Some(raw)).map_err(|e| {
                    ConfigError::Invalid(format!("imputation fallback for '{}': {}", column, e))
                })?;
                Ok((column.clone(), value))
            })
            .collect::<Result<_, ConfigError>>()?;

        let required = schema
            .columns
            .iter()
            .filter(|c| !c.nullable)
            .map(|c| c.name.clone())
            .collect();

        Ok(Self {
            rules,
            fallback,
            required,
            snapshot,
        })
    }

    pub fn impute(&self, fields: &mut BTreeMap<String, FieldValue>) -> Result<Imputed, RowValidationError> {
        let mut outcome = Imputed::default();

        for rule in self.rules {
            if !fields.get(&rule.column).map_or(true, FieldValue::is_null) {
                continue;
            }

            let stats = self.snapshot.stats.get(&rule.column);
            let context_value = rule
                .context
                .as_ref()
                .and_then(|c| fields.get(c))
                .filter(|v| !v.is_null())
                .map(ToString::to_string);

            let global = stats.and_then(|s| s.global.clone());
            let in_context = match (&rule.context, &context_value) {
                (None, _) => global.clone(),
                (Some(_), Some(ctx)) => stats.and_then(|s| s.by_context.get(ctx).cloned()),
                (Some(_), None) => None,
            };

            // Context statistic, then the column's global statistic, then the configured default.
            let recovered = match in_context {
                Some(v) => Some(v),
                None => global.or_else(|| self.fallback.get(&rule.column).cloned()).map(|v| {
                    outcome.missing_context.push(ImputationContextMissing {
                        column: rule.column.clone(),
                        context_column: rule.context.clone().unwrap_or_default(),
                        context_value: context_value.clone(),
                    });
                    v
                }),
            };

            let value = match recovered {
                Some(v) => v,
                None if self.required.contains(&rule.column) => {
                    return Err(RowValidationError::NoImputation {
                        column: rule.column.clone(),
                    });
                }
                None => continue,
            };

            fields.insert(rule.column.clone(), value);
            outcome.columns.insert(rule.column.clone());
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NaturalKey;
    use crate::schema::ColumnSpec;
    use chrono::Utc;

    fn schema() -> DatasetSchema {
        DatasetSchema {
            name: "clean".into(),
            columns: vec![
                ColumnSpec::new("item", SemanticType::String, false),
                ColumnSpec::new("category", SemanticType::Categorical, true),
                ColumnSpec::new("sales", SemanticType::Decimal, false),
                ColumnSpec::new("established", SemanticType::Integer, true),
                ColumnSpec::new("outlet_size", SemanticType::Categorical, true),
            ],
        }
    }

    fn history(item: &str, batch_id: u64, cells: &[(&str, FieldValue)]) -> CleanRecord {
        CleanRecord {
            key: NaturalKey(vec![item.into()]),
            fields: cells.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            imputed: BTreeSet::new(),
            batch_id,
            source_file: "old.csv".into(),
            row_number: 1,
            ingested_at: Utc::now(),
            snapshot_version: 0,
        }
    }

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.into())
    }

    fn sales_rule() -> Vec<ImputationRule> {
        vec![ImputationRule {
            column: "sales".into(),
            strategy: Strategy::Mean,
            context: Some("category".into()),
        }]
    }

    #[test]
    fn test_mean_by_context_from_earlier_batches_only() {
        let rows = vec![
            history("A", 1, &[("category", text("Snacks")), ("sales", FieldValue::Decimal(40.0))]),
            history("B", 2, &[("category", text("Snacks")), ("sales", FieldValue::Decimal(60.0))]),
            history("C", 5, &[("category", text("Snacks")), ("sales", FieldValue::Decimal(900.0))]),
        ];
        let snapshot = ImputationSnapshot::compute(5, &rows, &sales_rule(), &schema());

        assert_eq!(snapshot.source_rows, 2);
        assert_eq!(snapshot.history_through, 2);
        assert_eq!(
            snapshot.stats["sales"].by_context["Snacks"],
            FieldValue::Decimal(50.0)
        );
    }

    #[test]
    fn test_imputed_values_excluded_from_statistics() {
        let mut imputed = history("B", 1, &[("category", text("Dairy")), ("sales", FieldValue::Decimal(1000.0))]);
        imputed.imputed.insert("sales".into());
        let rows = vec![
            history("A", 1, &[("category", text("Dairy")), ("sales", FieldValue::Decimal(10.0))]),
            imputed,
        ];
        let snapshot = ImputationSnapshot::compute(2, &rows, &sales_rule(), &schema());
        assert_eq!(snapshot.stats["sales"].by_context["Dairy"], FieldValue::Decimal(10.0));
    }

    #[test]
    fn test_median_and_mode() {
        let rows = vec![
            history("A", 1, &[("established", FieldValue::Integer(1985)), ("outlet_size", text("Small"))]),
            history("B", 1, &[("established", FieldValue::Integer(1999)), ("outlet_size", text("Medium"))]),
            history("C", 1, &[("established", FieldValue::Integer(2004)), ("outlet_size", text("Medium"))]),
            history("D", 1, &[("established", FieldValue::Integer(2009)), ("outlet_size", text("Small"))]),
        ];
        let rules = vec![
            ImputationRule {
                column: "established".into(),
                strategy: Strategy::Median,
                context: None,
            },
            ImputationRule {
                column: "outlet_size".into(),
                strategy: Strategy::Mode,
                context: None,
            },
        ];
        let snapshot = ImputationSnapshot::compute(2, &rows, &rules, &schema());

        // (1999 + 2004) / 2 = 2001.5, rounded for an integer column.
        assert_eq!(snapshot.stats["established"].global, Some(FieldValue::Integer(2002)));
        // Tie between Medium and Small goes to the smaller string.
        assert_eq!(snapshot.stats["outlet_size"].global, Some(text("Medium")));
    }

    #[test]
    fn test_impute_marks_fields() {
        let rows = vec![history("A", 1, &[("category", text("Snacks")), ("sales", FieldValue::Decimal(50.0))])];
        let rules = sales_rule();
        let snapshot = ImputationSnapshot::compute(2, &rows, &rules, &schema());
        let imputer = Imputer::new(&rules, &BTreeMap::new(), &schema(), &snapshot).unwrap();

        let mut fields = BTreeMap::from([
            ("category".to_string(), text("Snacks")),
            ("sales".to_string(), FieldValue::Null),
        ]);
        let outcome = imputer.impute(&mut fields).unwrap();
        assert_eq!(fields["sales"], FieldValue::Decimal(50.0));
        assert!(outcome.columns.contains("sales"));
        assert!(outcome.missing_context.is_empty());

        let mut present = BTreeMap::from([
            ("category".to_string(), text("Snacks")),
            ("sales".to_string(), FieldValue::Decimal(7.0)),
        ]);
        assert!(imputer.impute(&mut present).unwrap().columns.is_empty());
    }

    #[test]
    fn test_missing_context_uses_fallback_or_rejects() {
        let rules = sales_rule();
        let snapshot = ImputationSnapshot::empty(1);
        let fallback = BTreeMap::from([("sales".to_string(), "0".to_string())]);
        let with_fallback = Imputer::new(&rules, &fallback, &schema(), &snapshot).unwrap();

        let mut fields = BTreeMap::from([
            ("category".to_string(), text("Frozen")),
            ("sales".to_string(), FieldValue::Null),
        ]);
        let outcome = with_fallback.impute(&mut fields).unwrap();
        assert_eq!(fields["sales"], FieldValue::Decimal(0.0));
        assert_eq!(outcome.missing_context.len(), 1);
        assert_eq!(outcome.missing_context[0].context_value.as_deref(), Some("Frozen"));

        let strict = Imputer::new(&rules, &BTreeMap::new(), &schema(), &snapshot).unwrap();
        let mut fields = BTreeMap::from([("sales".to_string(), FieldValue::Null)]);
        assert!(matches!(
            strict.impute(&mut fields),
            Err(RowValidationError::NoImputation { .. })
        ));
    }

    #[test]
    fn test_nullable_column_left_null_without_stats() {
        let rules = vec![ImputationRule {
            column: "outlet_size".into(),
            strategy: Strategy::Mode,
            context: Some("category".into()),
        }];
        let snapshot = ImputationSnapshot::empty(1);
        let imputer = Imputer::new(&rules, &BTreeMap::new(), &schema(), &snapshot).unwrap();

        let mut fields = BTreeMap::from([("outlet_size".to_string(), FieldValue::Null)]);
        let outcome = imputer.impute(&mut fields).unwrap();
        assert!(outcome.columns.is_empty());
        assert_eq!(fields["outlet_size"], FieldValue::Null);
    }

    #[test]
    fn test_invalid_fallback_is_config_error() {
        let rules = sales_rule();
        let snapshot = ImputationSnapshot::empty(1);
        let fallback = BTreeMap::from([("sales".to_string(), "lots".to_string())]);
        assert!(Imputer::new(&rules, &fallback, &schema(), &snapshot).is_err());
    }

    #[test]
    fn test_unseen_context_uses_global_statistic_before_fallback() {
        let rows = vec![history("A", 1, &[("category", text("Snacks")), ("sales", FieldValue::Decimal(40.0))])];
        let rules = sales_rule();
        let snapshot = ImputationSnapshot::compute(2, &rows, &rules, &schema());
        let fallback = BTreeMap::from([("sales".to_string(), "0".to_string())]);

        for configured in [BTreeMap::new(), fallback] {
            let imputer = Imputer::new(&rules, &configured, &schema(), &snapshot).unwrap();
            let mut fields = BTreeMap::from([
                ("category".to_string(), text("Frozen")),
                ("sales".to_string(), FieldValue::Null),
            ]);
            let outcome = imputer.impute(&mut fields).unwrap();
            assert_eq!(fields["sales"], FieldValue::Decimal(40.0));
            assert!(outcome.columns.contains("sales"));
            assert_eq!(outcome.missing_context[0].context_value.as_deref(), Some("Frozen"));
        }
    }
}
