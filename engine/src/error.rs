//! Error types for the Refinery batch engine.
//!
//! The hierarchy mirrors how failures propagate through a run:
//!
//! - [`RowValidationError`] - one row is quarantined, the batch continues
//! - [`ImputationContextMissing`] - recoverable, a configured fallback is used
//! - [`SchemaViolation`] - fatal for one batch (halts Bronze → Silver)
//! - [`ManifestError`] - manifest guard failures and concurrent-commit conflicts
//! - [`StorageError`] - storage layer failures; `Unavailable` is transient
//! - [`StageError`] - everything that can stop one batch at one stage
//! - [`PipelineError`] - run-level failures surfaced to the scheduler
//!
//! Error conversion is automatic via `From` implementations,
//! allowing `?` to work across error boundaries.

use std::path::PathBuf;

use thiserror::Error;

use crate::manifest::Stage;

// =============================================================================
// File Parsing Errors
// =============================================================================

/// Errors while decoding and splitting a raw delimited file.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Bytes could not be decoded with the detected encoding.
    #[error("Failed to decode file: {0}")]
    Encoding(String),

    /// A record could not be read.
    #[error("Invalid delimited data at line {line}: {message}")]
    Malformed { line: usize, message: String },

    /// The file has no content at all.
    #[error("File is empty")]
    EmptyFile,

    /// The header line is blank.
    #[error("No headers found")]
    NoHeaders,
}

// =============================================================================
// Source Errors
// =============================================================================

/// Errors from the landing-zone collaborator.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Failed to read the landing location.
    #[error("Failed to read source '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file registered in the manifest is no longer offered by the source.
    #[error("Source file '{0}' is not available")]
    NotFound(String),

    /// The file content no longer matches the recorded checksum.
    #[error("Source file '{name}' changed: expected checksum {expected}, found {found}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        found: String,
    },
}

// =============================================================================
// Storage Errors
// =============================================================================

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Transient failure (I/O, lock contention, network). Retried with a bound.
    #[error("Storage unavailable for '{key}': {message}")]
    Unavailable { key: String, message: String },

    /// A conditional write lost against a concurrent writer.
    #[error("Version conflict on '{key}': expected {expected}, found {found}")]
    Conflict { key: String, expected: u64, found: u64 },

    /// The stored object cannot be decoded.
    #[error("Corrupt object '{key}': {message}")]
    Corrupt { key: String, message: String },
}

impl StorageError {
    pub fn unavailable(key: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            key: key.into(),
            message: message.to_string(),
        }
    }

    pub fn corrupt(key: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Only `Unavailable` is worth retrying; conflicts and corruption are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

// =============================================================================
// Schema Errors
// =============================================================================

/// The column set of a batch diverges beyond the tolerated drift.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error(
    "Schema violation in '{schema}': missing required columns {missing:?}, unrecognized columns {unrecognized:?}"
)]
pub struct SchemaViolation {
    pub schema: String,
    pub missing: Vec<String>,
    pub unrecognized: Vec<String>,
}

/// A single row failed validation. The row is quarantined, never dropped.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RowValidationError {
    /// A non-nullable column is empty.
    #[error("Missing required field '{column}'")]
    MissingRequired { column: String },

    /// The value cannot be coerced to the declared type.
    #[error("Invalid value for '{column}' (value '{value}'): expected {expected}")]
    TypeMismatch {
        column: String,
        value: String,
        expected: String,
    },

    /// A categorical value outside the declared set.
    #[error("Value '{value}' is not allowed for '{column}'")]
    NotAllowed { column: String, value: String },

    /// The row carries data in a column the schema does not know.
    #[error("Unrecognized column '{column}' (value '{value}')")]
    UnrecognizedColumn { column: String, value: String },

    /// Imputation had neither context statistics nor a fallback.
    #[error("Cannot impute '{column}': no statistics and no fallback configured")]
    NoImputation { column: String },

    /// The cleaned record broke the exported JSON Schema contract.
    #[error("Cleaned contract violated: {}", errors.join("; "))]
    Contract { errors: Vec<String> },
}

/// Imputation found no historical statistics for the row's grouping context.
///
/// Recoverable: the configured per-field fallback is used instead.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("No imputation context for '{column}' ({context_column}={context_value:?}), using fallback")]
pub struct ImputationContextMissing {
    pub column: String,
    pub context_column: String,
    pub context_value: Option<String>,
}

// =============================================================================
// Manifest Errors
// =============================================================================

/// Errors from the batch manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Another writer committed this stage first. The loser aborts its transition.
    #[error("Manifest conflict: batch {batch_id} stage {stage} already committed by another writer")]
    Conflict { batch_id: u64, stage: Stage },

    /// The prior stage is not committed, or this stage already is.
    #[error("Transition guard for batch {batch_id} stage {stage}: {reason}")]
    GuardViolated {
        batch_id: u64,
        stage: Stage,
        reason: String,
    },

    /// Batch id not present in the manifest.
    #[error("Unknown batch {0}")]
    UnknownBatch(u64),

    /// Optimistic retries exhausted without a successful write.
    #[error("Manifest still contended after {0} attempts")]
    Contended(u32),

    /// Underlying storage failure.
    #[error("Manifest storage error: {0}")]
    Storage(#[from] StorageError),
}

// =============================================================================
// Stage Errors (batch-level)
// =============================================================================

/// Failures that stop one batch at one stage.
#[derive(Debug, Error)]
pub enum StageError {
    /// The batch's column set is beyond the drift tolerance.
    #[error(transparent)]
    SchemaViolation(#[from] SchemaViolation),

    /// The Bronze file for the batch is gone.
    #[error("Bronze data for batch {0} is missing")]
    BronzeDataMissing(u64),

    /// The raw file could not be parsed.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// The landing zone could not provide the file.
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Storage failure while reading or writing stage output.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Manifest guard or conflict.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// The cleaned schema or rules could not be compiled.
    #[error("Invalid cleaned-schema contract: {0}")]
    Contract(String),

    /// A table kept changing under us for every optimistic attempt.
    #[error("Table '{0}' still contended after {1} attempts")]
    Contended(&'static str, u32),
}

impl StageError {
    /// Storage outages escalate to the whole run instead of one batch.
    pub fn is_run_fatal(&self) -> bool {
        match self {
            StageError::Storage(e) => e.is_transient(),
            StageError::Manifest(ManifestError::Storage(e)) => e.is_transient(),
            _ => false,
        }
    }

    /// Another orchestrator already committed this batch/stage.
    pub fn is_lost_race(&self) -> bool {
        matches!(self, StageError::Manifest(ManifestError::Conflict { .. }))
    }
}

// =============================================================================
// Configuration Errors
// =============================================================================

/// Errors while loading pipeline configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema.
    #[error("Invalid config: {0}")]
    Toml(#[from] toml::de::Error),

    /// Semantically invalid configuration.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

// =============================================================================
// Pipeline Errors (run-level)
// =============================================================================

/// Run-level failures. The whole invocation is reported as failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Storage stayed unavailable after bounded retries.
    #[error("Storage unavailable, run aborted: {0}")]
    StorageUnavailable(StorageError),

    /// Manifest could not be read or written.
    #[error("Manifest error: {0}")]
    Manifest(ManifestError),

    /// The landing zone could not be enumerated.
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Configuration is unusable.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A table could not be read or written.
    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// A stage failed outside of any batch (e.g. a forced Gold rebuild).
    #[error("Stage error: {0}")]
    Stage(StageError),
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        if err.is_transient() {
            PipelineError::StorageUnavailable(err)
        } else {
            PipelineError::Storage(err)
        }
    }
}

impl From<ManifestError> for PipelineError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::Storage(e) => e.into(),
            other => PipelineError::Manifest(other),
        }
    }
}

impl From<StageError> for PipelineError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::Storage(e) => e.into(),
            StageError::Manifest(e) => e.into(),
            StageError::Source(e) => PipelineError::Source(e),
            other => PipelineError::Stage(other),
        }
    }
}

// =============================================================================
// Server Errors
// =============================================================================

/// HTTP trigger errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Pipeline error.
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Invalid request.
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Another run holds the pipeline.
    #[error("Busy: {0}")]
    Busy(String),

    /// Server internal error.
    #[error("Internal server error: {0}")]
    Internal(String),
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for manifest operations.
pub type ManifestResult<T> = Result<T, ManifestError>;

/// Result type for stage operations.
pub type StageResult<T> = Result<T, StageError>;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_escalation() {
        let outage = StorageError::unavailable("silver/table.json", "connection reset");
        let pipeline_err: PipelineError = outage.into();
        assert!(matches!(pipeline_err, PipelineError::StorageUnavailable(_)));

        let corrupt = StorageError::corrupt("gold/table.json", "trailing bytes");
        let pipeline_err: PipelineError = corrupt.into();
        assert!(matches!(pipeline_err, PipelineError::Storage(_)));
    }

    #[test]
    fn test_stage_error_classification() {
        let err: StageError = StorageError::unavailable("bronze/x", "timeout").into();
        assert!(err.is_run_fatal());

        let err: StageError = ManifestError::Conflict {
            batch_id: 4,
            stage: Stage::Silver,
        }
        .into();
        assert!(!err.is_run_fatal());
        assert!(err.is_lost_race());

        let err: StageError = SchemaViolation {
            schema: "raw".into(),
            missing: vec!["sales".into()],
            unrecognized: vec![],
        }
        .into();
        assert!(!err.is_run_fatal());
        assert!(err.to_string().contains("sales"));
    }

    #[test]
    fn test_manifest_outage_escalates_to_run() {
        let err: PipelineError = ManifestError::Storage(StorageError::unavailable("manifest/batches.json", "down")).into();
        assert!(matches!(err, PipelineError::StorageUnavailable(_)));

        let err: PipelineError = StageError::BronzeDataMissing(3).into();
        assert!(matches!(err, PipelineError::Stage(StageError::BronzeDataMissing(3))));
    }

    #[test]
    fn test_row_error_format() {
        let err = RowValidationError::TypeMismatch {
            column: "weight".into(),
            value: "heavy".into(),
            expected: "decimal".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("weight"));
        assert!(msg.contains("heavy"));
        assert!(msg.contains("decimal"));
    }
}
