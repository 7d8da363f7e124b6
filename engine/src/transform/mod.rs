//! Stage transformations.
//!
//! - [`rules`]: per-column standardization operations
//! - [`imputation`]: versioned statistics snapshots and the imputer
//! - [`cleaner`]: Bronze → Silver
//! - [`aggregator`]: Silver → Gold
//! - [`pipeline`]: the orchestrator sequencing the stages per batch

pub mod aggregator;
pub mod cleaner;
pub mod imputation;
pub mod pipeline;
pub mod rules;

pub use aggregator::{AggregateOutcome, Aggregator};
pub use cleaner::{CleanOutcome, Cleaner};
pub use imputation::{ImputationRule, ImputationSnapshot, Imputer, Strategy};
pub use pipeline::{BatchRange, CancelFlag, FailedBatch, Pipeline, RunOptions, RunResult};
pub use rules::{ColumnRule, Operation, Standardizer};
