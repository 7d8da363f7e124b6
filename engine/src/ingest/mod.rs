//! Bronze stage: raw files appended as-is with lineage.
//!
//! Files are registered by name and checksum first, which is what allocates
//! monotonic batch ids. A file is then parsed and every data row is written to
//! the batch's Bronze object without any transformation.

use chrono::Utc;

use crate::error::{SourceError, StageResult};
use crate::manifest::{ManifestStore, Registration, Stage, StageOutcome};
use crate::models::RawRecord;
use crate::parser;
use crate::source::SourceFile;
use crate::store::Warehouse;

/// Appends raw batches to Bronze.
pub struct RawIngestor<'a> {
    warehouse: &'a Warehouse,
    manifest: &'a ManifestStore,
}

impl<'a> RawIngestor<'a> {
    pub fn new(warehouse: &'a Warehouse, manifest: &'a ManifestStore) -> Self {
        Self { warehouse, manifest }
    }

    /// Register newly discovered files. Already ingested checksums are no-ops.
    pub fn register(&self, files: &[SourceFile]) -> StageResult<Vec<(String, Registration)>> {
        let mut registrations = Vec::with_capacity(files.len());
        for file in files {
            let registration = self.manifest.register(&file.entry(), &file.checksum)?;
            match registration {
                Registration::New(batch_id) => {
                    tracing::info!(batch_id, file = %file.name, "Discovered new batch");
                }
                Registration::Resume(batch_id) => {
                    tracing::info!(batch_id, file = %file.name, "Resuming unfinished batch");
                }
                Registration::AlreadyIngested(batch_id) => {
                    tracing::debug!(batch_id, file = %file.name, "Checksum already ingested, skipping");
                }
            }
            registrations.push((file.name.clone(), registration));
        }
        Ok(registrations)
    }

    /// Parse a registered file into Bronze and commit the stage. Returns the row count.
    pub fn ingest(&self, batch_id: u64, file: &SourceFile, expected_checksum: &str) -> StageResult<usize> {
        if file.checksum != expected_checksum {
            return Err(SourceError::ChecksumMismatch {
                name: file.name.clone(),
                expected: expected_checksum.to_string(),
                found: file.checksum.clone(),
            }
            .into());
        }

        let parsed = parser::parse_bytes_auto(&file.bytes)?;
        tracing::debug!(
            batch_id,
            encoding = %parsed.encoding,
            delimiter = ?parsed.delimiter,
            columns = parsed.headers.len(),
            "Parsed raw file"
        );

        let ingested_at = Utc::now();
        let rows: Vec<RawRecord> = parsed
            .rows
            .into_iter()
            .enumerate()
            .map(|(idx, fields)| RawRecord {
                batch_id,
                source_file: file.name.clone(),
                ingested_at,
                row_number: idx + 1,
                fields,
            })
            .collect();

        let stored = self.warehouse.write_bronze(batch_id, &rows)?;
        self.manifest
            .commit(batch_id, Stage::Bronze, StageOutcome::committed(stored))?;

        tracing::info!(batch_id, rows = stored, file = %file.name, "Bronze committed");
        Ok(stored)
    }
}
