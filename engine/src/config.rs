//! Pipeline configuration.
//!
//! Loaded from a TOML file; every section has a default describing the retail
//! sales dataset, so an empty file (or none at all) is a valid configuration.
//!
//! ```toml
//! grouping_key_for_aggregation = "outlet"
//! drift_tolerance = ["outlet_size"]
//!
//! [imputation_fallback]
//! outlet_size = "Medium"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::schema::{ColumnSpec, DatasetSchema, DriftPolicy, SchemaRegistry, SemanticType};
use crate::source::DiscoveryWindow;
use crate::store::RetryPolicy;
use crate::transform::imputation::{ImputationRule, Strategy};
use crate::transform::rules::{ColumnRule, Operation};

/// Where data lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the bronze/silver/gold/manifest objects.
    pub data_dir: PathBuf,
    /// Landing directory scanned for raw files.
    pub landing_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".refinery/data"),
            landing_dir: PathBuf::from("landing"),
        }
    }
}

/// Everything a run needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub storage: StorageConfig,

    #[serde(flatten)]
    pub drift: DriftPolicy,

    pub raw_schema: DatasetSchema,
    pub cleaned_schema: DatasetSchema,

    /// Columns forming the Silver merge key.
    pub natural_key: Vec<String>,

    pub standardization: Vec<ColumnRule>,
    pub imputation: Vec<ImputationRule>,
    /// Per-column value used when no grouping context statistics exist.
    pub imputation_fallback: BTreeMap<String, String>,

    pub grouping_key_for_aggregation: String,
    /// Numeric column summed into Gold.
    pub metric_column: String,

    pub batch_discovery_window: DiscoveryWindow,

    /// Cleaning worker threads; 0 uses one per core.
    pub workers: usize,

    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            drift: DriftPolicy::default(),
            raw_schema: default_raw_schema(),
            cleaned_schema: default_cleaned_schema(),
            natural_key: vec!["item".into(), "outlet".into()],
            standardization: default_standardization(),
            imputation: default_imputation(),
            imputation_fallback: BTreeMap::new(),
            grouping_key_for_aggregation: "outlet".into(),
            metric_column: "sales".into(),
            batch_discovery_window: DiscoveryWindow::default(),
            workers: 0,
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded pipeline config");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cleaned = &self.cleaned_schema;
        let require = |column: &str, what: &str| {
            cleaned.column(column).ok_or_else(|| {
                ConfigError::Invalid(format!("{} '{}' is not in the cleaned schema", what, column))
            })
        };

        if self.natural_key.is_empty() {
            return Err(ConfigError::Invalid("natural_key must name at least one column".into()));
        }
        for column in &self.natural_key {
            if require(column, "natural key column")?.nullable {
                return Err(ConfigError::Invalid(format!(
                    "natural key column '{}' must not be nullable",
                    column
                )));
            }
        }

        require(&self.grouping_key_for_aggregation, "grouping key")?;
        let metric = require(&self.metric_column, "metric column")?;
        if !matches!(metric.semantic_type, SemanticType::Decimal | SemanticType::Integer) {
            return Err(ConfigError::Invalid(format!(
                "metric column '{}' must be numeric",
                self.metric_column
            )));
        }

        for rule in &self.imputation {
            let column = require(&rule.column, "imputed column")?;
            if matches!(rule.strategy, Strategy::Mean | Strategy::Median)
                && !matches!(column.semantic_type, SemanticType::Decimal | SemanticType::Integer)
            {
                return Err(ConfigError::Invalid(format!(
                    "{:?} imputation needs a numeric column, '{}' is {}",
                    rule.strategy, rule.column, column.semantic_type
                )));
            }
            if let Some(context) = &rule.context {
                require(context, "imputation context")?;
            }
        }

        for column in self.drift.drift_tolerance.iter() {
            if self.raw_schema.column(column).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "drift_tolerance names unknown raw column '{}'",
                    column
                )));
            }
        }

        Ok(())
    }

    pub fn registry(&self) -> SchemaRegistry {
        SchemaRegistry::new(
            self.raw_schema.clone(),
            self.cleaned_schema.clone(),
            self.drift.clone(),
        )
    }
}

// =============================================================================
// Retail sales defaults
// =============================================================================

fn default_raw_schema() -> DatasetSchema {
    DatasetSchema {
        name: "raw_sales".into(),
        columns: vec![
            ColumnSpec::new("item", SemanticType::String, false),
            ColumnSpec::new("outlet", SemanticType::String, false),
            ColumnSpec::categorical("category", true, &[]),
            ColumnSpec::categorical("fat_content", true, &[]),
            ColumnSpec::new("weight", SemanticType::Decimal, true),
            ColumnSpec::new("mrp", SemanticType::Decimal, true),
            ColumnSpec::categorical("outlet_size", true, &[]),
            ColumnSpec::categorical("outlet_type", true, &[]),
            ColumnSpec::new("established", SemanticType::Integer, true),
            ColumnSpec::new("sales", SemanticType::Decimal, true),
        ],
    }
}

fn default_cleaned_schema() -> DatasetSchema {
    DatasetSchema {
        name: "clean_sales".into(),
        columns: vec![
            ColumnSpec::new("item", SemanticType::String, false),
            ColumnSpec::new("outlet", SemanticType::String, false),
            ColumnSpec::categorical("category", true, &[]),
            ColumnSpec::categorical("fat_content", false, &["Low Fat", "Regular"]),
            ColumnSpec::new("weight", SemanticType::Decimal, true),
            ColumnSpec::new("mrp", SemanticType::Decimal, true),
            ColumnSpec::categorical("outlet_size", true, &["Small", "Medium", "High"]),
            ColumnSpec::categorical("outlet_type", true, &[]),
            ColumnSpec::new("established", SemanticType::Integer, true),
            ColumnSpec::new("sales", SemanticType::Decimal, false),
        ],
    }
}

fn alias_map(pairs: &[(&str, &str)]) -> Operation {
    Operation::Map {
        mapping: pairs
            .iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect(),
        case_insensitive: true,
        default_unmapped: None,
    }
}

fn default_standardization() -> Vec<ColumnRule> {
    let tidy = || vec![Operation::Trim, Operation::CollapseWhitespace];
    vec![
        ColumnRule {
            column: "fat_content".into(),
            operations: [
                tidy(),
                vec![alias_map(&[
                    ("low fat", "Low Fat"),
                    ("low_fat", "Low Fat"),
                    ("lf", "Low Fat"),
                    ("reg", "Regular"),
                    ("regular", "Regular"),
                ])],
            ]
            .concat(),
        },
        ColumnRule {
            column: "outlet_size".into(),
            operations: [
                tidy(),
                vec![alias_map(&[("small", "Small"), ("medium", "Medium"), ("high", "High")])],
            ]
            .concat(),
        },
        ColumnRule {
            column: "category".into(),
            operations: tidy(),
        },
        ColumnRule {
            column: "outlet_type".into(),
            operations: tidy(),
        },
    ]
}

fn default_imputation() -> Vec<ImputationRule> {
    vec![
        ImputationRule {
            column: "sales".into(),
            strategy: Strategy::Mean,
            context: Some("category".into()),
        },
        ImputationRule {
            column: "weight".into(),
            strategy: Strategy::Mean,
            context: Some("category".into()),
        },
        ImputationRule {
            column: "outlet_size".into(),
            strategy: Strategy::Mode,
            context: Some("outlet_type".into()),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.drift.max_unrecognized_columns, 3);
        assert_eq!(config.grouping_key_for_aggregation, "outlet");
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = PipelineConfig::from_toml_str(
            r#"
            drift_tolerance = ["outlet_size"]
            max_unrecognized_columns = 0
            workers = 2

            [imputation_fallback]
            sales = "0"

            [batch_discovery_window]
            since = "2024-01-01T00:00:00Z"

            [retry]
            max_attempts = 2
            "#,
        )
        .unwrap();

        assert!(config.drift.drift_tolerance.contains("outlet_size"));
        assert_eq!(config.drift.max_unrecognized_columns, 0);
        assert_eq!(config.workers, 2);
        assert_eq!(config.imputation_fallback["sales"], "0");
        assert!(config.batch_discovery_window.since.is_some());
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_backoff_ms, 50);
    }

    #[test]
    fn test_unknown_grouping_key_rejected() {
        let err = PipelineConfig::from_toml_str(r#"grouping_key_for_aggregation = "region""#)
            .unwrap_err();
        assert!(err.to_string().contains("region"));
    }

    #[test]
    fn test_mean_on_text_column_rejected() {
        let err = PipelineConfig::from_toml_str(
            r#"
            [[imputation]]
            column = "outlet_type"
            strategy = "mean"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_sample_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../config/pipeline.toml");
        let config = PipelineConfig::load(&path).unwrap();

        assert_eq!(config.raw_schema, PipelineConfig::default().raw_schema);
        assert_eq!(config.cleaned_schema, PipelineConfig::default().cleaned_schema);
        assert_eq!(config.standardization, PipelineConfig::default().standardization);
        assert!(config.drift.ignored_columns.contains("notes"));
        assert_eq!(config.imputation_fallback["outlet_size"], "Medium");
    }

    #[test]
    fn test_bad_toml_is_reported() {
        assert!(matches!(
            PipelineConfig::from_toml_str("workers = \"many\""),
            Err(ConfigError::Toml(_))
        ));
    }
}
