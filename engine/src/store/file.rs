//! Directory-backed storage.
//!
//! Each object version is a file next to its siblings:
//!
//! ```text
//! <root>/silver/records.json.v0000000003
//! <root>/silver/records.json.v0000000004   <- current
//! ```
//!
//! A write goes to a temporary file first and is then hard-linked to the next
//! version name. Linking fails if the name exists, so two writers can never
//! claim the same version and readers never see a half-written file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

use super::{Storage, StoredObject, WriteCondition};
use crate::error::{StorageError, StorageResult};

const VERSION_MARKER: &str = ".v";
const VERSION_DIGITS: usize = 10;

/// Storage rooted at a local (or mounted) directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Storage under a custom directory
    pub fn with_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            root: dir.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to its directory and file stem, refusing escapes from the root.
    fn locate(&self, key: &str) -> StorageResult<(PathBuf, String)> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(StorageError::corrupt(key, "invalid object key"));
        }

        let path = self.root.join(relative);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::corrupt(key, "invalid object key"))?
            .to_string();
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        Ok((dir, name))
    }

    fn version_path(dir: &Path, name: &str, version: u64) -> PathBuf {
        dir.join(format!(
            "{}{}{:0width$}",
            name,
            VERSION_MARKER,
            version,
            width = VERSION_DIGITS
        ))
    }

    /// Split `records.json.v0000000004` into (`records.json`, 4).
    fn parse_version(file_name: &str) -> Option<(&str, u64)> {
        let idx = file_name.rfind(VERSION_MARKER)?;
        let digits = &file_name[idx + VERSION_MARKER.len()..];
        if digits.len() != VERSION_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some((&file_name[..idx], digits.parse().ok()?))
    }

    /// All stored versions of an object, ascending.
    fn versions(&self, key: &str, dir: &Path, name: &str) -> StorageResult<Vec<u64>> {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::unavailable(key, e)),
        };

        let mut versions: Vec<u64> = entries
            .flatten()
            .filter_map(|entry| {
                let file_name = entry.file_name().to_str()?.to_string();
                let (stem, version) = Self::parse_version(&file_name)?;
                (stem == name).then_some(version)
            })
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// Remove versions older than `keep`. Best effort; readers tolerate races.
    fn prune(&self, dir: &Path, name: &str, versions: &[u64], keep: u64) {
        for &v in versions.iter().filter(|&&v| v < keep) {
            let _ = fs::remove_file(Self::version_path(dir, name, v));
        }
    }

    fn collect_keys(&self, dir: &Path, keys: &mut Vec<String>) -> std::io::Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                self.collect_keys(&path, keys)?;
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((stem, _)) = Self::parse_version(file_name) else {
                continue;
            };
            let logical = path.with_file_name(stem);
            if let Ok(relative) = logical.strip_prefix(&self.root) {
                let key = relative
                    .components()
                    .filter_map(|c| c.as_os_str().to_str())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> StorageResult<Option<StoredObject>> {
        let (dir, name) = self.locate(key)?;

        // A concurrent writer may prune the version we just listed; rescan.
        for _ in 0..3 {
            let Some(&version) = self.versions(key, &dir, &name)?.last() else {
                return Ok(None);
            };
            match fs::read(Self::version_path(&dir, &name, version)) {
                Ok(bytes) => return Ok(Some(StoredObject { bytes, version })),
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::unavailable(key, e)),
            }
        }
        Err(StorageError::unavailable(key, "object kept changing while reading"))
    }

    fn put(&self, key: &str, bytes: &[u8], condition: WriteCondition) -> StorageResult<u64> {
        let (dir, name) = self.locate(key)?;
        fs::create_dir_all(&dir).map_err(|e| StorageError::unavailable(key, e))?;

        let tmp = dir.join(format!(".{}.tmp-{}", name, Uuid::new_v4()));
        fs::write(&tmp, bytes).map_err(|e| StorageError::unavailable(key, e))?;

        let result = loop {
            let versions = match self.versions(key, &dir, &name) {
                Ok(v) => v,
                Err(e) => break Err(e),
            };
            let current = versions.last().copied().unwrap_or(0);

            if let WriteCondition::IfVersion(expected) = condition {
                if expected != current {
                    break Err(StorageError::Conflict {
                        key: key.to_string(),
                        expected,
                        found: current,
                    });
                }
            }

            let next = current + 1;
            match fs::hard_link(&tmp, Self::version_path(&dir, &name, next)) {
                Ok(()) => {
                    self.prune(&dir, &name, &versions, next);
                    break Ok(next);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match condition {
                    // Someone else claimed `next`; an unconditional write just goes after it.
                    WriteCondition::Any => continue,
                    WriteCondition::IfVersion(expected) => {
                        break Err(StorageError::Conflict {
                            key: key.to_string(),
                            expected,
                            found: next,
                        })
                    }
                },
                Err(e) => break Err(StorageError::unavailable(key, e)),
            }
        };

        let _ = fs::remove_file(&tmp);
        result
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, &mut keys)
            .map_err(|e| StorageError::unavailable(prefix, e))?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
