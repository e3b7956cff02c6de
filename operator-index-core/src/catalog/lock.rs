//! Release log (.operator-index/releases.jsonl) and the single-release lock
//!
//! The log is append-only: one JSON record per published catalog version.
//! Its last record is the baseline every new release is diffed against.

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::index::{BundleEntry, IndexDescriptor};
use crate::error::{IndexError, Result};

/// One published catalog version; never modified once written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRecord {
    pub version: Version,
    pub committed_at: DateTime<Utc>,
    pub git_revision: String,
    /// Catalog image repository
    #[serde(default)]
    pub image: Option<String>,
    /// Every tag applied to the catalog image
    #[serde(default)]
    pub tags: Vec<String>,
    /// Resolved bundle snapshot released under this version
    #[serde(default)]
    pub entries: Vec<BundleEntry>,
}

impl ReleaseRecord {
    /// The released state as a descriptor, for diffing
    pub fn descriptor(&self) -> IndexDescriptor {
        IndexDescriptor {
            version: self.version.clone(),
            catalog_image: self.image.clone(),
            entries: self.entries.clone(),
        }
    }
}

/// Append-only JSON Lines log of releases
#[derive(Debug, Clone)]
pub struct ReleaseLog {
    path: PathBuf,
}

impl ReleaseLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records, oldest first; a missing log is empty
    pub fn records(&self) -> Result<Vec<ReleaseRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path).map_err(|e| IndexError::io(&self.path, e))?;
        let mut records = Vec::new();

        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| IndexError::io(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: ReleaseRecord =
                serde_json::from_str(&line).map_err(|e| IndexError::ReleaseLog {
                    path: self.path.clone(),
                    message: format!("line {} is not a valid release record: {e}", number + 1),
                })?;
            records.push(record);
        }

        Ok(records)
    }

    /// Most recent release, if any
    pub fn latest(&self) -> Result<Option<ReleaseRecord>> {
        Ok(self.records()?.pop())
    }

    /// Append a record; its version must exceed every recorded version
    pub fn append(&self, record: &ReleaseRecord) -> Result<()> {
        if let Some(latest) = self.latest()? {
            if record.version <= latest.version {
                return Err(IndexError::VersionRegression {
                    previous: latest.version,
                    next: record.version.clone(),
                });
            }
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| IndexError::io(parent, e))?;
            }
        }

        let mut line = serde_json::to_string(record).map_err(|e| IndexError::ReleaseLog {
            path: self.path.clone(),
            message: format!("failed to serialize record: {e}"),
        })?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| IndexError::io(&self.path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| IndexError::io(&self.path, e))?;
        file.sync_all().map_err(|e| IndexError::io(&self.path, e))?;

        tracing::info!(
            "Recorded release {} ({}) in {}",
            record.version,
            record.git_revision,
            self.path.display()
        );
        Ok(())
    }
}

/// Exclusive lock held for the duration of one release; released on drop
#[derive(Debug)]
pub struct ReleaseLock {
    path: PathBuf,
}

impl ReleaseLock {
    /// Take the lock, failing immediately if another release holds it
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| IndexError::io(parent, e))?;
            }
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(IndexError::ReleaseLocked { path });
            }
            Err(e) => return Err(IndexError::io(&path, e)),
        };

        // Holder details for whoever finds a stale lock
        let holder = format!("pid {} since {}\n", std::process::id(), Utc::now().to_rfc3339());
        file.write_all(holder.as_bytes())
            .map_err(|e| IndexError::io(&path, e))?;

        tracing::debug!("Acquired release lock {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ReleaseLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove release lock {}: {}", self.path.display(), e);
        } else {
            tracing::debug!("Released release lock {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn make_record(version: &str) -> ReleaseRecord {
        ReleaseRecord {
            version: Version::parse(version).unwrap(),
            committed_at: Utc::now(),
            git_revision: "0123abcd".to_string(),
            image: Some("quay.io/acme/operator-index".to_string()),
            tags: vec![version.to_string(), "latest".to_string()],
            entries: vec![BundleEntry::new("quay.io/acme/a-bundle", "latest")
                .with_digest(format!("sha256:{}", "a".repeat(64)))],
        }
    }

    #[test]
    fn test_missing_log_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let log = ReleaseLog::new(temp_dir.path().join("releases.jsonl"));
        assert!(log.records().unwrap().is_empty());
        assert!(log.latest().unwrap().is_none());
    }

    #[test]
    fn test_append_and_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let log = ReleaseLog::new(temp_dir.path().join("state/releases.jsonl"));

        let first = make_record("1.0.0");
        let second = make_record("1.1.0");
        log.append(&first).unwrap();
        log.append(&second).unwrap();

        let records = log.records().unwrap();
        assert_eq!(records, vec![first, second.clone()]);
        assert_eq!(log.latest().unwrap(), Some(second));

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("\"committedAt\""));
        assert!(content.contains("\"gitRevision\":\"0123abcd\""));
    }

    #[test]
    fn test_append_rejects_non_increasing_version() {
        let temp_dir = TempDir::new().unwrap();
        let log = ReleaseLog::new(temp_dir.path().join("releases.jsonl"));

        log.append(&make_record("1.1.0")).unwrap();

        let err = log.append(&make_record("1.1.0")).unwrap_err();
        assert!(matches!(err, IndexError::VersionRegression { .. }));
        let err = log.append(&make_record("1.0.9")).unwrap_err();
        assert!(matches!(err, IndexError::VersionRegression { .. }));

        assert_eq!(log.records().unwrap().len(), 1);
    }

    #[test]
    fn test_malformed_line_names_line_number() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("releases.jsonl");
        let log = ReleaseLog::new(&path);
        log.append(&make_record("1.0.0")).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();

        let err = log.records().unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_record_descriptor() {
        let record = make_record("2.3.4");
        let descriptor = record.descriptor();
        assert_eq!(descriptor.version, Version::new(2, 3, 4));
        assert_eq!(descriptor.entries, record.entries);
    }

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("release.lock");

        let lock = ReleaseLock::acquire(&lock_path).unwrap();
        assert!(lock.path().exists());

        let err = ReleaseLock::acquire(&lock_path).unwrap_err();
        assert!(matches!(err, IndexError::ReleaseLocked { .. }));

        drop(lock);
        assert!(!lock_path.exists());
        let _again = ReleaseLock::acquire(&lock_path).unwrap();
    }
}
