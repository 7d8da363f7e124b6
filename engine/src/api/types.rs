//! REST API types for the HTTP trigger.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::manifest::{Manifest, ManifestEntry};
use crate::transform::pipeline::{BatchRange, RunOptions, RunResult};

/// Body of `POST /api/run`. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunRequest {
    pub full_gold_rebuild: bool,
    /// Inclusive `[first, last]` batch ids for a backfill.
    pub batch_range: Option<[u64; 2]>,
}

impl RunRequest {
    pub fn into_options(self) -> Result<RunOptions, String> {
        let batch_range = match self.batch_range {
            Some([first, last]) if first > last => {
                return Err(format!("batchRange start {} is after end {}", first, last));
            }
            Some([first, last]) => Some(BatchRange { first, last }),
            None => None,
        };
        Ok(RunOptions {
            full_gold_rebuild: self.full_gold_rebuild,
            batch_range,
        })
    }
}

/// Response to `POST /api/run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    /// "ok", "partial" (some batches failed) or "aborted"
    pub status: String,
    pub result: RunResult,
}

impl From<RunResult> for RunResponse {
    fn from(result: RunResult) -> Self {
        let status = if result.aborted {
            "aborted"
        } else if result.failed_batches.is_empty() {
            "ok"
        } else {
            "partial"
        };
        Self {
            status: status.to_string(),
            result,
        }
    }
}

/// Response to `GET /api/manifest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestResponse {
    pub next_batch_id: u64,
    /// Unfinished batch ids, ascending.
    pub pending: Vec<u64>,
    pub entries: Vec<ManifestEntry>,
}

impl From<Manifest> for ManifestResponse {
    fn from(manifest: Manifest) -> Self {
        Self {
            next_batch_id: manifest.next_batch_id,
            pending: manifest.pending(),
            entries: manifest.entries(),
        }
    }
}

/// Response to `GET /api/tables/{name}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableResponse {
    pub table: String,
    pub row_count: usize,
    pub rows: Value,
}

impl TableResponse {
    pub fn new(table: impl Into<String>, rows: Value) -> Self {
        let row_count = rows.as_array().map_or(0, Vec::len);
        Self {
            table: table.into(),
            row_count,
            rows,
        }
    }
}

/// Create an error response
pub fn error_response(error: &str) -> Value {
    json!({
        "status": "error",
        "error": error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result(aborted: bool, failed: bool) -> RunResult {
        RunResult {
            run_id: "r".into(),
            committed_batches: vec![1],
            failed_batches: if failed {
                vec![crate::transform::pipeline::FailedBatch {
                    batch_id: 2,
                    stage: crate::manifest::Stage::Silver,
                    reason: "schema".into(),
                }]
            } else {
                Vec::new()
            },
            skipped_files: Vec::new(),
            contended_batches: Vec::new(),
            aborted,
            gold_rebuilt: false,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_run_request_defaults() {
        let req: RunRequest = serde_json::from_str("{}").unwrap();
        let options = req.into_options().unwrap();
        assert!(!options.full_gold_rebuild);
        assert!(options.batch_range.is_none());
    }

    #[test]
    fn test_run_request_range() {
        let req: RunRequest =
            serde_json::from_value(json!({ "fullGoldRebuild": true, "batchRange": [3, 7] })).unwrap();
        let options = req.into_options().unwrap();
        assert!(options.full_gold_rebuild);
        assert!(options.batch_range.unwrap().contains(7));

        let backwards = RunRequest {
            batch_range: Some([7, 3]),
            ..Default::default()
        };
        assert!(backwards.into_options().is_err());
    }

    #[test]
    fn test_run_status_labels() {
        assert_eq!(RunResponse::from(result(false, false)).status, "ok");
        assert_eq!(RunResponse::from(result(false, true)).status, "partial");
        assert_eq!(RunResponse::from(result(true, false)).status, "aborted");
    }

    #[test]
    fn test_table_row_count() {
        let resp = TableResponse::new("gold", json!([{ "group": "O1" }, { "group": "O2" }]));
        assert_eq!(resp.row_count, 2);
        assert_eq!(TableResponse::new("gold", json!({})).row_count, 0);
    }
}
