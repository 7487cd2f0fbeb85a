//! Backup persistence with checksum sidecars.
//!
//! Every location receives the full read region and the staging subregion,
//! each as `<stem>.bin` plus `<stem>.json`. A copy only counts once it has
//! been read back from disk and its checksum matches the sidecar.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use crc::{CRC_32_ISO_HDLC, Crc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{FlashError, IntegrityError};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 (ISO-HDLC) of `data`.
pub fn checksum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Staging,
}

impl BackupKind {
    fn suffix(self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Staging => "staging",
        }
    }
}

/// Sidecar contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub timestamp: DateTime<Utc>,
    pub size: usize,
    /// CRC-32 as 8 upper-case hex digits.
    pub checksum: String,
    pub kind: BackupKind,
}

impl BackupRecord {
    fn new(data: &[u8], kind: BackupKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            size: data.len(),
            checksum: format!("{:08X}", checksum(data)),
            kind,
        }
    }

    fn checksum_value(&self, path: &Path) -> Result<u32, IntegrityError> {
        u32::from_str_radix(&self.checksum, 16).map_err(|e| IntegrityError::Unreadable {
            path: path.to_path_buf(),
            reason: format!("bad checksum field: {}", e),
        })
    }
}

/// One verified backup at one location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupCopy {
    pub full_path: PathBuf,
    pub staging_path: PathBuf,
    pub checksum: u32,
}

/// Result of writing to every location.
#[derive(Debug, Default)]
pub struct BackupOutcome {
    pub copies: Vec<BackupCopy>,
    pub failures: Vec<(PathBuf, String)>,
}

impl BackupOutcome {
    pub fn verified(&self) -> usize {
        self.copies.len()
    }

    /// First verified full-region backup.
    pub fn primary(&self) -> Option<&Path> {
        self.copies.first().map(|c| c.full_path.as_path())
    }
}

/// Sidecar path for a backup file.
pub fn sidecar_path(path: &Path) -> PathBuf {
    path.with_extension("json")
}

/// Read a backup back and check it against its sidecar.
pub fn verify_file(path: &Path) -> Result<Vec<u8>, IntegrityError> {
    let unreadable = |reason: String| IntegrityError::Unreadable {
        path: path.to_path_buf(),
        reason,
    };
    let data = fs::read(path).map_err(|e| unreadable(e.to_string()))?;
    let sidecar = sidecar_path(path);
    let text = fs::read_to_string(&sidecar).map_err(|e| unreadable(format!("sidecar: {}", e)))?;
    let record: BackupRecord =
        serde_json::from_str(&text).map_err(|e| unreadable(format!("sidecar: {}", e)))?;

    if record.size != data.len() {
        return Err(IntegrityError::SizeMismatch {
            expected: record.size,
            actual: data.len(),
        });
    }
    let expected = record.checksum_value(&sidecar)?;
    let actual = checksum(&data);
    if expected != actual {
        return Err(IntegrityError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(data)
}

/// Writes backups to a list of directories.
#[derive(Debug, Clone)]
pub struct BackupStore {
    locations: Vec<PathBuf>,
}

impl BackupStore {
    pub fn new(locations: Vec<PathBuf>) -> Self {
        Self { locations }
    }

    pub fn locations(&self) -> &[PathBuf] {
        &self.locations
    }

    /// Persist both artifacts to every location and verify each copy.
    ///
    /// Location failures are collected, not raised; the caller decides
    /// whether enough copies survived. Locations resolving to a directory
    /// already used count as failures, so one physical copy is never
    /// reported twice.
    pub fn save(&self, full: &[u8], staging: &[u8], timestamp: DateTime<Utc>) -> BackupOutcome {
        let stem = format!("backup_{}", timestamp.format("%Y%m%d_%H%M%S"));
        let mut outcome = BackupOutcome::default();
        let mut used = HashSet::new();

        for dir in &self.locations {
            let resolved = match fs::create_dir_all(dir).and_then(|_| fs::canonicalize(dir)) {
                Ok(path) => path,
                Err(e) => {
                    warn!(location = %dir.display(), error = %e, "Backup location failed");
                    outcome.failures.push((dir.clone(), e.to_string()));
                    continue;
                }
            };
            if !used.insert(resolved.clone()) {
                warn!(location = %dir.display(), "Duplicate backup location skipped");
                outcome.failures.push((
                    dir.clone(),
                    format!("same directory as an earlier location ({})", resolved.display()),
                ));
                continue;
            }

            match Self::save_one(dir, &stem, full, staging, timestamp) {
                Ok(copy) => {
                    info!(path = %copy.full_path.display(), checksum = %format!("{:08X}", copy.checksum), "Backup verified");
                    outcome.copies.push(copy);
                }
                Err(e) => {
                    warn!(location = %dir.display(), error = %e, "Backup location failed");
                    outcome.failures.push((dir.clone(), e.to_string()));
                }
            }
        }
        outcome
    }

    fn save_one(
        dir: &Path,
        stem: &str,
        full: &[u8],
        staging: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<BackupCopy, FlashError> {
        fs::create_dir_all(dir)?;
        let full_path = Self::write_artifact(dir, stem, full, BackupKind::Full, timestamp)?;
        let staging_path =
            Self::write_artifact(dir, stem, staging, BackupKind::Staging, timestamp)?;

        verify_file(&full_path)?;
        verify_file(&staging_path)?;
        Ok(BackupCopy {
            full_path,
            staging_path,
            checksum: checksum(full),
        })
    }

    fn write_artifact(
        dir: &Path,
        stem: &str,
        data: &[u8],
        kind: BackupKind,
        timestamp: DateTime<Utc>,
    ) -> Result<PathBuf, FlashError> {
        let path = dir.join(format!("{}_{}.bin", stem, kind.suffix()));
        fs::write(&path, data)?;
        let record = BackupRecord::new(data, kind, timestamp);
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| FlashError::Io(std::io::Error::other(e)))?;
        fs::write(sidecar_path(&path), json)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_reference_value() {
        assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_save_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(vec![dir.path().join("a"), dir.path().join("b")]);
        let full: Vec<u8> = (0..=255).collect();
        let outcome = store.save(&full, &full[16..32], Utc::now());
        assert_eq!(outcome.verified(), 2);
        assert!(outcome.failures.is_empty());

        let copy = &outcome.copies[0];
        assert_eq!(verify_file(&copy.full_path).unwrap(), full);
        assert_eq!(verify_file(&copy.staging_path).unwrap(), &full[16..32]);

        let sidecar = fs::read_to_string(sidecar_path(&copy.staging_path)).unwrap();
        let record: BackupRecord = serde_json::from_str(&sidecar).unwrap();
        assert_eq!(record.kind, BackupKind::Staging);
        assert_eq!(record.size, 16);
        assert!(sidecar.contains("\"kind\": \"staging\""));
    }

    #[test]
    fn test_unusable_location_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"not a directory").unwrap();
        let store = BackupStore::new(vec![blocker, dir.path().join("ok")]);
        let outcome = store.save(&[1, 2, 3], &[2], Utc::now());
        assert_eq!(outcome.verified(), 1);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.primary().unwrap().starts_with(dir.path().join("ok")));
    }

    #[test]
    fn test_duplicate_location_counts_once() {
        let dir = tempfile::tempdir().unwrap();
        let same = dir.path().join("same");
        let store = BackupStore::new(vec![
            same.clone(),
            same.clone(),
            dir.path().join(".").join("same"),
            dir.path().join("other"),
        ]);
        let outcome = store.save(&[5; 32], &[5; 4], Utc::now());
        assert_eq!(outcome.verified(), 2);
        assert_eq!(outcome.failures.len(), 2);
        assert!(outcome.failures[0].1.contains("same directory"));
        assert_ne!(
            outcome.copies[0].full_path.parent(),
            outcome.copies[1].full_path.parent()
        );
    }

    #[test]
    fn test_tampered_backup_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(vec![dir.path().to_path_buf()]);
        let outcome = store.save(&[9; 64], &[9; 8], Utc::now());
        let path = outcome.copies[0].full_path.clone();

        let mut data = fs::read(&path).unwrap();
        data[10] ^= 1;
        fs::write(&path, &data).unwrap();
        assert!(matches!(
            verify_file(&path),
            Err(IntegrityError::ChecksumMismatch { .. })
        ));

        fs::write(&path, &data[..10]).unwrap();
        assert!(matches!(
            verify_file(&path),
            Err(IntegrityError::SizeMismatch {
                expected: 64,
                actual: 10
            })
        ));
    }
}
