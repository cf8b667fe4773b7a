// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only receipt ledger and artifact tree.
//!
//! The ledger directory is the single shared resource between invocations.
//! Receipts append to `receipts.jsonl`; per-kind state and artifact files
//! live in a deterministic tree below the runs root. State files are
//! written temp-file-first and atomically renamed so concurrent invocations
//! never observe a torn write. A run that cannot persist its receipt fails
//! loudly; disk errors always bubble.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod paths;

pub use paths::safe_component;

use ger_core::{Receipt, verify_receipt_hash};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Errors from ledger persistence.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Filesystem failure; fatal for the run.
    #[error("ledger I/O failed at {path}: {source}")]
    Io {
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A ledger file held malformed JSON.
    #[error("ledger entry at {path} is corrupt: {source}")]
    Corrupt {
        /// Path of the corrupt file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
    /// A value could not be serialized for persistence.
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result of verifying every receipt hash in the ledger.
#[derive(Debug, Clone)]
pub struct LedgerVerification {
    /// Receipts with a valid hash.
    pub valid_count: usize,
    /// Execution ids of receipts whose hash did not match.
    pub invalid: Vec<String>,
}

impl LedgerVerification {
    /// True when every receipt verified.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.invalid.is_empty()
    }
}

/// File-backed ledger rooted at the runs directory.
#[derive(Debug, Clone)]
pub struct Ledger {
    root: PathBuf,
}

impl Ledger {
    /// Create a ledger rooted at `root`. Directories are created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The runs root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    // -- receipts -----------------------------------------------------------

    /// Append one receipt as a single JSONL line.
    ///
    /// # Errors
    ///
    /// Any I/O failure is returned; the caller must treat it as fatal.
    pub fn append_receipt(&self, receipt: &Receipt) -> Result<(), LedgerError> {
        let path = self.receipts_path();
        ensure_parent(&path)?;
        let mut line = serde_json::to_string(receipt)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LedgerError::Io {
                path: path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .map_err(|source| LedgerError::Io {
                path: path.clone(),
                source,
            })?;
        debug!(execution_id = %receipt.execution_id, status = ?receipt.status, "receipt appended");
        Ok(())
    }

    /// Read every receipt in append order.
    ///
    /// # Errors
    ///
    /// Fails on unreadable files or corrupt lines.
    pub fn read_receipts(&self) -> Result<Vec<Receipt>, LedgerError> {
        let path = self.receipts_path();
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(LedgerError::Io { path, source }),
        };
        let mut receipts = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let receipt =
                serde_json::from_str(line).map_err(|source| LedgerError::Corrupt {
                    path: path.clone(),
                    source,
                })?;
            receipts.push(receipt);
        }
        Ok(receipts)
    }

    /// Most recent receipt for an execution id.
    ///
    /// # Errors
    ///
    /// Propagates read failures.
    pub fn last_receipt_by_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<Receipt>, LedgerError> {
        Ok(self
            .read_receipts()?
            .into_iter()
            .filter(|r| r.execution_id == execution_id)
            .next_back())
    }

    /// Most recent receipt for a fingerprint.
    ///
    /// # Errors
    ///
    /// Propagates read failures.
    pub fn last_receipt_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<Receipt>, LedgerError> {
        Ok(self
            .read_receipts()?
            .into_iter()
            .filter(|r| r.fingerprint == fingerprint)
            .next_back())
    }

    /// Verify every stored receipt hash.
    ///
    /// # Errors
    ///
    /// Propagates read failures.
    pub fn verify(&self) -> Result<LedgerVerification, LedgerError> {
        let mut valid_count = 0;
        let mut invalid = Vec::new();
        for receipt in self.read_receipts()? {
            if verify_receipt_hash(&receipt) {
                valid_count += 1;
            } else {
                invalid.push(receipt.execution_id);
            }
        }
        Ok(LedgerVerification {
            valid_count,
            invalid,
        })
    }

    // -- artifacts ----------------------------------------------------------

    /// Write an artifact under `artifacts/<kind>/<execution_id>/<step_id>.json`
    /// and return its path.
    ///
    /// # Errors
    ///
    /// Any I/O failure is returned.
    pub fn write_artifact<T: Serialize>(
        &self,
        kind: &str,
        execution_id: &str,
        step_id: &str,
        payload: &T,
    ) -> Result<PathBuf, LedgerError> {
        let path = self.artifact_path(kind, execution_id, step_id);
        self.write_json_atomic(&path, payload)?;
        Ok(path)
    }

    /// List artifact paths for one execution, sorted for determinism.
    ///
    /// # Errors
    ///
    /// Propagates directory read failures (missing directories are empty).
    pub fn list_artifacts(&self, execution_id: &str) -> Result<Vec<PathBuf>, LedgerError> {
        let base = self.root.join("artifacts");
        let mut found = Vec::new();
        let kinds = match fs::read_dir(&base) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(source) => return Err(LedgerError::Io { path: base, source }),
        };
        for kind in kinds {
            let kind = kind.map_err(|source| LedgerError::Io {
                path: base.clone(),
                source,
            })?;
            let dir = kind.path().join(safe_component(execution_id));
            let entries = match fs::read_dir(&dir) {
                Ok(d) => d,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(LedgerError::Io { path: dir, source }),
            };
            for entry in entries {
                let entry = entry.map_err(|source| LedgerError::Io {
                    path: dir.clone(),
                    source,
                })?;
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }

    // -- generic JSON state -------------------------------------------------

    /// Atomically write a JSON value: temp file in the target directory,
    /// then rename over the destination.
    ///
    /// # Errors
    ///
    /// Any I/O failure is returned.
    pub fn write_json_atomic<T: Serialize>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<(), LedgerError> {
        ensure_parent(path)?;
        let json = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|source| LedgerError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Read a JSON state file; `None` when it does not exist.
    ///
    /// # Errors
    ///
    /// Fails on unreadable or corrupt files.
    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, LedgerError> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let value = serde_json::from_str(&text).map_err(|source| LedgerError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(value))
    }

    /// Remove a state file if present.
    ///
    /// # Errors
    ///
    /// Any I/O failure other than absence is returned.
    pub fn remove(&self, path: &Path) -> Result<(), LedgerError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LedgerError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// List files in a directory under the root, sorted by filename.
    ///
    /// # Errors
    ///
    /// Propagates directory read failures (a missing directory is empty).
    pub fn list_dir(&self, rel: &str) -> Result<Vec<PathBuf>, LedgerError> {
        let dir = self.root.join(rel);
        let entries = match fs::read_dir(&dir) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(LedgerError::Io { path: dir, source }),
        };
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| LedgerError::Io {
                path: dir.clone(),
                source,
            })?;
            if entry.path().is_file() {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    // -- layout -------------------------------------------------------------

    /// `receipts.jsonl` under the root.
    #[must_use]
    pub fn receipts_path(&self) -> PathBuf {
        self.root.join("receipts.jsonl")
    }

    /// `requalification/state/<safe_fingerprint>.json`.
    #[must_use]
    pub fn requalification_state_path(&self, fingerprint: &str) -> PathBuf {
        self.root
            .join("requalification")
            .join("state")
            .join(format!("{}.json", safe_component(fingerprint)))
    }

    /// `requalification/events/<safe_fingerprint>.<epoch_millis>.json`.
    #[must_use]
    pub fn requalification_event_path(&self, fingerprint: &str, epoch_millis: i64) -> PathBuf {
        self.root
            .join("requalification")
            .join("events")
            .join(format!(
                "{}.{epoch_millis}.json",
                safe_component(fingerprint)
            ))
    }

    /// `prestate/<execution_id>.<step_id>.json`.
    #[must_use]
    pub fn prestate_path(&self, execution_id: &str, step_id: &str) -> PathBuf {
        self.root.join("prestate").join(format!(
            "{}.{}.json",
            safe_component(execution_id),
            safe_component(step_id)
        ))
    }

    /// `approval/<execution_id>.json`.
    #[must_use]
    pub fn approval_path(&self, execution_id: &str) -> PathBuf {
        self.root
            .join("approval")
            .join(format!("{}.json", safe_component(execution_id)))
    }

    /// `idempotency/<key>.json`.
    #[must_use]
    pub fn idempotency_path(&self, key: &str) -> PathBuf {
        self.root
            .join("idempotency")
            .join(format!("{}.json", safe_component(key)))
    }

    /// `governor/<safe_fingerprint>.json`.
    #[must_use]
    pub fn governor_path(&self, fingerprint: &str) -> PathBuf {
        self.root
            .join("governor")
            .join(format!("{}.json", safe_component(fingerprint)))
    }

    /// `confidence/<safe_fingerprint>.json`.
    #[must_use]
    pub fn confidence_path(&self, fingerprint: &str) -> PathBuf {
        self.root
            .join("confidence")
            .join(format!("{}.json", safe_component(fingerprint)))
    }

    /// `audit/<execution_id>.json`.
    #[must_use]
    pub fn audit_path(&self, execution_id: &str) -> PathBuf {
        self.root
            .join("audit")
            .join(format!("{}.json", safe_component(execution_id)))
    }

    /// `artifacts/<kind>/<execution_id>/<step_id>.json`.
    #[must_use]
    pub fn artifact_path(&self, kind: &str, execution_id: &str, step_id: &str) -> PathBuf {
        self.root
            .join("artifacts")
            .join(safe_component(kind))
            .join(safe_component(execution_id))
            .join(format!("{}.json", safe_component(step_id)))
    }
}

fn ensure_parent(path: &Path) -> Result<(), LedgerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ger_core::{AutonomyMode, ReceiptBuilder, ReceiptStatus};
    use tempfile::TempDir;

    fn receipt(execution_id: &str, fingerprint: &str, status: ReceiptStatus) -> Receipt {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        ReceiptBuilder::new("execution", execution_id, fingerprint)
            .status(status)
            .autonomy(AutonomyMode::Full, AutonomyMode::Full)
            .window(t0, t0)
            .build()
    }

    #[test]
    fn append_and_read_back_in_order() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path());
        ledger
            .append_receipt(&receipt("e1", "f1", ReceiptStatus::Success))
            .unwrap();
        ledger
            .append_receipt(&receipt("e2", "f1", ReceiptStatus::Failed))
            .unwrap();

        let receipts = ledger.read_receipts().unwrap();
        assert_eq!(receipts.len(), 2);
        assert_eq!(receipts[0].execution_id, "e1");
        assert_eq!(receipts[1].execution_id, "e2");
    }

    #[test]
    fn lookup_by_execution_and_fingerprint() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path());
        ledger
            .append_receipt(&receipt("e1", "f1", ReceiptStatus::Failed))
            .unwrap();
        ledger
            .append_receipt(&receipt("e1", "f1", ReceiptStatus::Success))
            .unwrap();

        let by_exec = ledger.last_receipt_by_execution("e1").unwrap().unwrap();
        assert_eq!(by_exec.status, ReceiptStatus::Success);
        let by_fp = ledger.last_receipt_by_fingerprint("f1").unwrap().unwrap();
        assert_eq!(by_fp.status, ReceiptStatus::Success);
        assert!(ledger.last_receipt_by_execution("nope").unwrap().is_none());
    }

    #[test]
    fn empty_ledger_reads_empty() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path().join("missing"));
        assert!(ledger.read_receipts().unwrap().is_empty());
        assert!(ledger.verify().unwrap().is_valid());
    }

    #[test]
    fn verify_flags_tampered_receipts() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path());
        ledger
            .append_receipt(&receipt("e1", "f1", ReceiptStatus::Success))
            .unwrap();
        let mut bad = receipt("e2", "f1", ReceiptStatus::Success);
        bad.goal = "rewritten after hashing".into();
        ledger.append_receipt(&bad).unwrap();

        let verification = ledger.verify().unwrap();
        assert_eq!(verification.valid_count, 1);
        assert_eq!(verification.invalid, vec!["e2".to_string()]);
        assert!(!verification.is_valid());
    }

    #[test]
    fn artifact_tree_layout() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path());
        let path = ledger
            .write_artifact("notion.write", "e1", "s1", &serde_json::json!({"ok": true}))
            .unwrap();
        assert!(path.ends_with("artifacts/notion.write/e1/s1.json"));
        assert!(path.exists());

        let listed = ledger.list_artifacts("e1").unwrap();
        assert_eq!(listed, vec![path]);
        assert!(ledger.list_artifacts("other").unwrap().is_empty());
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path());
        let path = ledger.governor_path("fp");
        ledger
            .write_json_atomic(&path, &serde_json::json!({"tokens": 3.0}))
            .unwrap();
        let names: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["fp.json"]);
    }

    #[test]
    fn read_json_absent_is_none() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path());
        let missing: Option<serde_json::Value> =
            ledger.read_json(&ledger.governor_path("nope")).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn corrupt_state_file_is_an_error_not_silence() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path());
        let path = ledger.governor_path("fp");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();
        let err = ledger.read_json::<serde_json::Value>(&path).unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt { .. }));
    }

    #[test]
    fn event_filenames_sort_by_timestamp() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path());
        let a = ledger.requalification_event_path("fp", 1_700_000_000_000);
        let b = ledger.requalification_event_path("fp", 1_700_000_000_001);
        assert!(a < b);
    }
}
