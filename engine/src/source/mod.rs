//! Raw file sources (the landing zone).
//!
//! The landing zone is append-only: files appear, they are never edited in
//! place. Each file is identified by name and SHA-256 checksum.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SourceError;

/// One raw file offered by a source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    pub name: String,
    pub checksum: String,
    pub modified_at: Option<DateTime<Utc>>,
    pub bytes: Vec<u8>,
}

/// What a source knows about a file without reading it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub name: String,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>, modified_at: Option<DateTime<Utc>>) -> Self {
        Self {
            name: name.into(),
            checksum: checksum(&bytes),
            modified_at,
            bytes,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn entry(&self) -> SourceEntry {
        SourceEntry {
            name: self.name.clone(),
            size: self.size(),
            modified_at: self.modified_at,
        }
    }
}

/// SHA-256 of the content, hex encoded.
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Only files modified inside the window are discovered. Open bounds are unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryWindow {
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

impl DiscoveryWindow {
    /// Files without a modification time are always inside.
    pub fn contains(&self, modified_at: Option<DateTime<Utc>>) -> bool {
        let Some(at) = modified_at else {
            return true;
        };
        self.since.map_or(true, |s| at >= s) && self.until.map_or(true, |u| at <= u)
    }
}

/// Enumerable raw files.
pub trait RawSource: Send + Sync {
    /// Every file currently offered, sorted by name. Reads metadata only.
    fn list(&self) -> Result<Vec<SourceEntry>, SourceError>;

    /// Read one file by name.
    fn fetch(&self, name: &str) -> Result<SourceFile, SourceError>;

    /// Every file with its content.
    fn files(&self) -> Result<Vec<SourceFile>, SourceError> {
        self.list()?.iter().map(|e| self.fetch(&e.name)).collect()
    }
}

// =============================================================================
// Directory source
// =============================================================================

/// A landing directory on a local or mounted filesystem.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
    extensions: Vec<String>,
}

impl DirectorySource {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            extensions: vec!["csv".into(), "tsv".into(), "txt".into()],
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(ext)))
    }

    fn read(&self, path: &Path) -> Result<SourceFile, SourceError> {
        let io_err = |source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        };
        let bytes = fs::read(path).map_err(io_err)?;
        let modified_at = fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        Ok(SourceFile::new(name, bytes, modified_at))
    }
}

impl RawSource for DirectorySource {
    fn list(&self) -> Result<Vec<SourceEntry>, SourceError> {
        let entries = fs::read_dir(&self.root).map_err(|source| SourceError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut listed: Vec<SourceEntry> = entries
            .flatten()
            .filter(|e| self.accepts(&e.path()))
            .filter_map(|e| {
                let meta = e.metadata().ok().filter(|m| m.is_file())?;
                Some(SourceEntry {
                    name: e.file_name().to_str()?.to_string(),
                    size: meta.len(),
                    modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
                })
            })
            .collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listed)
    }

    fn fetch(&self, name: &str) -> Result<SourceFile, SourceError> {
        let path = self.root.join(name);
        if !path.is_file() || Path::new(name).components().count() != 1 {
            return Err(SourceError::NotFound(name.to_string()));
        }
        self.read(&path)
    }
}

// =============================================================================
// In-memory source
// =============================================================================

/// A source held in memory; useful for embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySource {
    files: Mutex<BTreeMap<String, SourceFile>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a file into the landing zone.
    pub fn add(&self, name: &str, content: impl Into<Vec<u8>>) {
        let file = SourceFile::new(name, content.into(), Some(Utc::now()));
        if let Ok(mut files) = self.files.lock() {
            files.insert(name.to_string(), file);
        }
    }
}

impl MemorySource {
    fn locked(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, SourceFile>>, SourceError> {
        self.files.lock().map_err(|e| SourceError::Io {
            path: PathBuf::from("<memory>"),
            source: std::io::Error::other(e.to_string()),
        })
    }
}

impl RawSource for MemorySource {
    fn list(&self) -> Result<Vec<SourceEntry>, SourceError> {
        Ok(self.locked()?.values().map(SourceFile::entry).collect())
    }

    fn fetch(&self, name: &str) -> Result<SourceFile, SourceError> {
        self.locked()?
            .get(name)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_checksum_known_value() {
        assert_eq!(
            checksum(b"Hello, World!"),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[test]
    fn test_directory_source_lists_sorted_csv_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.csv"), "item\nB").unwrap();
        fs::write(dir.path().join("a.csv"), "item\nA").unwrap();
        fs::write(dir.path().join("notes.md"), "ignore me").unwrap();

        let source = DirectorySource::new(dir.path());
        let files = source.files().unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.csv", "b.csv"]);
        assert_eq!(files[0].checksum, checksum(b"item\nA"));
        assert!(files[0].modified_at.is_some());

        let listed = source.list().unwrap();
        assert_eq!(listed[0], files[0].entry());
        assert_eq!(listed[1].size, 6);
    }

    #[test]
    fn test_fetch_missing_file() {
        let dir = tempdir().unwrap();
        let source = DirectorySource::new(dir.path());
        assert!(matches!(source.fetch("gone.csv"), Err(SourceError::NotFound(_))));
        assert!(matches!(source.fetch("../etc/passwd"), Err(SourceError::NotFound(_))));
    }

    #[test]
    fn test_discovery_window() {
        let now = Utc::now();
        let window = DiscoveryWindow {
            since: Some(now - Duration::hours(1)),
            until: None,
        };
        assert!(window.contains(Some(now)));
        assert!(!window.contains(Some(now - Duration::hours(2))));
        assert!(window.contains(None));
        assert!(DiscoveryWindow::default().contains(Some(now)));
    }

    #[test]
    fn test_memory_source() {
        let source = MemorySource::new();
        source.add("day1.csv", "item\nA");
        assert_eq!(source.files().unwrap().len(), 1);
        assert_eq!(source.fetch("day1.csv").unwrap().bytes, b"item\nA");
        assert!(source.fetch("day2.csv").is_err());
    }
}
