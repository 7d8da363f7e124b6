//! # Refinery - layered batch transformation engine
//!
//! Refinery turns raw, schema-drifting delimited files into trusted tables
//! through three materialized stages.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Raw files  │────▶│   Bronze    │────▶│   Silver    │────▶│    Gold     │
//! │ (landing)   │     │ (as-is +    │     │ (cleaned,   │     │ (grouped    │
//! │             │     │  lineage)   │     │  by key)    │     │  metrics)   │
//! └─────────────┘     └─────────────┘     └──────┬──────┘     └─────────────┘
//!                                                │
//!                                          quarantine
//! ```
//!
//! Every stage transition of every batch is recorded in a manifest with a
//! conditional write, so any run can be repeated or resumed safely.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use refinery::{CancelFlag, Pipeline, PipelineConfig, RunOptions};
//!
//! let config = PipelineConfig::load("config/pipeline.toml".as_ref())?;
//! let pipeline = Pipeline::from_config(config)?;
//! let result = pipeline.run(&RunOptions::default(), &CancelFlag::new())?;
//! ```
//!
//! ## Modules
//!
//! - [`error`] - Hierarchical error types
//! - [`models`] - Bronze, Silver, Gold and quarantine records
//! - [`schema`] - Declared schemas, coercion and drift policy
//! - [`parser`] - Delimited file parsing with auto-detection
//! - [`validation`] - JSON Schema contracts
//! - [`source`] - Raw file enumeration
//! - [`store`] - Versioned object storage and the typed warehouse
//! - [`manifest`] - Batch state machine
//! - [`ingest`] - Bronze stage
//! - [`transform`] - Silver and Gold stages and the orchestrator
//! - [`config`] - TOML configuration
//! - [`logging`] - tracing setup
//! - [`api`] - HTTP trigger

// Core modules
pub mod error;
pub mod models;

// Contracts
pub mod schema;
pub mod validation;

// I/O
pub mod parser;
pub mod source;
pub mod store;

// Stages
pub mod manifest;
pub mod ingest;
pub mod transform;

// Ambient
pub mod config;
pub mod logging;

// HTTP API
pub mod api;

// =============================================================================
// Re-exports - Error types
// =============================================================================

pub use error::{
    ConfigError,
    ManifestError,
    ParseError,
    PipelineError,
    RowValidationError,
    SchemaViolation,
    ServerError,
    SourceError,
    StageError,
    StorageError,
};

// =============================================================================
// Re-exports - Models
// =============================================================================

pub use models::{AggregateRecord, CleanRecord, FieldValue, NaturalKey, RawRecord, RejectedRow};

// =============================================================================
// Re-exports - Schema and contracts
// =============================================================================

pub use schema::{ColumnSpec, DatasetSchema, DriftPolicy, SchemaRegistry, SemanticType};
pub use validation::Contract;

// =============================================================================
// Re-exports - Parsing and sources
// =============================================================================

pub use parser::{decode_content, detect_delimiter, detect_encoding, parse_bytes_auto, ParsedFile};
pub use source::{DirectorySource, DiscoveryWindow, MemorySource, RawSource, SourceEntry, SourceFile};

// =============================================================================
// Re-exports - Storage and manifest
// =============================================================================

pub use manifest::{BatchRecord, BatchState, Manifest, ManifestStore, Stage};
pub use store::{FileStorage, MemoryStorage, RetryPolicy, Storage, TableName, Warehouse};

// =============================================================================
// Re-exports - Pipeline
// =============================================================================

pub use config::PipelineConfig;
pub use transform::pipeline::{BatchRange, CancelFlag, FailedBatch, Pipeline, RunOptions, RunResult};

// Server
pub mod server {
    pub use crate::api::server::start_server;
}
