//! Standardization rules for text columns.
//!
//! Rules are ordered operation lists per column, applied to text values before
//! imputation. Numeric and null values pass through untouched. A value that
//! becomes blank turns into `null`.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::FieldValue;

/// One text operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    /// Remove leading and trailing whitespace
    Trim,

    /// Replace runs of whitespace with a single space
    CollapseWhitespace,

    /// Convert to lowercase
    Lowercase,

    /// Convert to uppercase
    Uppercase,

    /// Capitalize the first letter of every word, lowercase the rest
    TitleCase,

    /// Replace using regex pattern
    Replace {
        pattern: String,
        #[serde(default)]
        value: String,
    },

    /// Collapse known aliases onto a canonical value
    Map {
        mapping: BTreeMap<String, String>,
        #[serde(default)]
        case_insensitive: bool,
        /// Value used when nothing matches; `None` keeps the input.
        #[serde(default)]
        default_unmapped: Option<String>,
    },
}

/// Operations for one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRule {
    pub column: String,
    pub operations: Vec<Operation>,
}

enum Step {
    Trim,
    CollapseWhitespace,
    Lowercase,
    Uppercase,
    TitleCase,
    Replace(Regex, String),
    Map {
        mapping: BTreeMap<String, String>,
        case_insensitive: bool,
        default_unmapped: Option<String>,
    },
}

impl Step {
    fn compile(op: &Operation) -> Result<Self, ConfigError> {
        Ok(match op {
            Operation::Trim => Step::Trim,
            Operation::CollapseWhitespace => Step::CollapseWhitespace,
            Operation::Lowercase => Step::Lowercase,
            Operation::Uppercase => Step::Uppercase,
            Operation::TitleCase => Step::TitleCase,
            Operation::Replace { pattern, value } => {
                let re = Regex::new(pattern)
                    .map_err(|e| ConfigError::Invalid(format!("bad pattern '{}': {}", pattern, e)))?;
                Step::Replace(re, value.clone())
            }
            Operation::Map {
                mapping,
                case_insensitive,
                default_unmapped,
            } => Step::Map {
                mapping: if *case_insensitive {
                    mapping.iter().map(|(k, v)| (k.to_lowercase(), v.clone())).collect()
                } else {
                    mapping.clone()
                },
                case_insensitive: *case_insensitive,
                default_unmapped: default_unmapped.clone(),
            },
        })
    }

    fn apply(&self, s: &str) -> String {
        match self {
            Step::Trim => s.trim().to_string(),
            Step::CollapseWhitespace => s.split_whitespace().collect::<Vec<_>>().join(" "),
            Step::Lowercase => s.to_lowercase(),
            Step::Uppercase => s.to_uppercase(),
            Step::TitleCase => title_case(s),
            Step::Replace(re, replacement) => re.replace_all(s, replacement.as_str()).into_owned(),
            Step::Map {
                mapping,
                case_insensitive,
                default_unmapped,
            } => {
                let key = if *case_insensitive { s.to_lowercase() } else { s.to_string() };
                match mapping.get(&key) {
                    Some(v) => v.clone(),
                    None => default_unmapped.clone().unwrap_or_else(|| s.to_string()),
                }
            }
        }
    }
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if c.is_alphanumeric() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    out
}

/// Compiled rules for every configured column.
pub struct Standardizer {
    columns: Vec<(String, Vec<Step>)>,
}

impl Standardizer {
    pub fn compile(rules: &[ColumnRule]) -> Result<Self, ConfigError> {
        let columns = rules
            .iter()
            .map(|rule| {
                let steps = rule
                    .operations
                    .iter()
                    .map(Step::compile)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((rule.column.clone(), steps))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { columns })
    }

    /// Apply all rules to one row in place.
    pub fn apply(&self, fields: &mut BTreeMap<String, FieldValue>) {
        for (column, steps) in &self.columns {
            let Some(FieldValue::Text(text)) = fields.get(column) else {
                continue;
            };
            let result = steps.iter().fold(text.clone(), |acc, step| step.apply(&acc));
            let value = if result.trim().is_empty() {
                FieldValue::Null
            } else {
                FieldValue::Text(result)
            };
            fields.insert(column.clone(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fat_content_rule() -> ColumnRule {
        ColumnRule {
            column: "fat_content".into(),
            operations: vec![
                Operation::Trim,
                Operation::CollapseWhitespace,
                Operation::Map {
                    mapping: BTreeMap::from([
                        ("low fat".to_string(), "Low Fat".to_string()),
                        ("lf".to_string(), "Low Fat".to_string()),
                        ("reg".to_string(), "Regular".to_string()),
                        ("regular".to_string(), "Regular".to_string()),
                    ]),
                    case_insensitive: true,
                    default_unmapped: None,
                },
            ],
        }
    }

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.to_string())
    }

    fn standardize(rules: &Standardizer, value: FieldValue) -> FieldValue {
        let mut fields = BTreeMap::from([("fat_content".to_string(), value)]);
        rules.apply(&mut fields);
        fields.remove("fat_content").unwrap_or_default()
    }

    #[test]
    fn test_alias_collapsing() {
        let rules = Standardizer::compile(&[fat_content_rule()]).unwrap();
        assert_eq!(standardize(&rules, text("low fat")), text("Low Fat"));
        assert_eq!(standardize(&rules, text("  LF ")), text("Low Fat"));
        assert_eq!(standardize(&rules, text("low   FAT")), text("Low Fat"));
        assert_eq!(standardize(&rules, text("reg")), text("Regular"));
        // Unknown values survive so the cleaned contract can report them.
        assert_eq!(standardize(&rules, text("Extra Fat")), text("Extra Fat"));
        assert_eq!(standardize(&rules, FieldValue::Null), FieldValue::Null);
    }

    #[test]
    fn test_rules_are_idempotent() {
        let rules = Standardizer::compile(&[fat_content_rule()]).unwrap();
        for raw in ["low fat", "LF", " Regular ", "reg", "odd"] {
            let once = standardize(&rules, text(raw));
            let twice = standardize(&rules, once.clone());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_title_case_and_replace() {
        let rule = ColumnRule {
            column: "fat_content".into(),
            operations: vec![
                Operation::Replace {
                    pattern: "[_-]+".into(),
                    value: " ".into(),
                },
                Operation::TitleCase,
            ],
        };
        let rules = Standardizer::compile(&[rule]).unwrap();
        assert_eq!(standardize(&rules, text("supermarket_type-1")), text("Supermarket Type 1"));
    }

    #[test]
    fn test_blank_becomes_null() {
        let rule = ColumnRule {
            column: "fat_content".into(),
            operations: vec![Operation::Trim],
        };
        let rules = Standardizer::compile(&[rule]).unwrap();
        assert_eq!(standardize(&rules, text("   ")), FieldValue::Null);
    }

    #[test]
    fn test_bad_pattern_is_config_error() {
        let rule = ColumnRule {
            column: "x".into(),
            operations: vec![Operation::Replace {
                pattern: "(".into(),
                value: String::new(),
            }],
        };
        assert!(matches!(Standardizer::compile(&[rule]), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_operation_toml_shape() {
        let rule: ColumnRule = toml::from_str(
            r#"
            column = "outlet_size"
            operations = [
                { type = "trim" },
                { type = "map", mapping = { small = "Small", high = "High" }, case_insensitive = true },
            ]
            "#,
        )
        .unwrap();
        assert_eq!(rule.operations.len(), 2);
        assert!(matches!(rule.operations[1], Operation::Map { case_insensitive: true, .. }));
    }
}
