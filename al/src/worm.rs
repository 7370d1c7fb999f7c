//! WORM (Write-Once-Read-Many) append-only log
//!
//! The log owns two directories: a live directory holding JSONL streams
//! and a digest directory holding Merkle checkpoints and finalization
//! digests. The only legal mutation of a stream is a byte-append
//! followed by fsync; finalized streams additionally have their write
//! permission bits revoked.
//!
//! Content framing is the caller's responsibility. The log stores one
//! opaque line per append; callers are expected to write one JSON object
//! per line (`ts`, `trace_id`, `span_id`, `level`, `actor`, `event`).

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::merkle::{MerkleTree, sha256_hex};

/// Errors raised while setting up a WORM log
#[derive(Debug, thiserror::Error)]
pub enum WormError {
    #[error("failed to create log directory {dir}: {source}")]
    CreateDir {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Merkle checkpoint for a log stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub file: String,
    pub timestamp: String,
    pub root_hash: String,
    /// Same value as `root_hash`; kept as the stable field name consumers read
    pub merkle_root: String,
    pub num_entries: usize,
    pub line_count: usize,
}

/// Finalization digest for a sealed log stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizationDigest {
    pub finalization_id: String,
    pub log_file: String,
    pub timestamp: String,
    pub algorithm: String,
    pub sha256: String,
    pub merkle_root: String,
    pub num_entries: usize,
    pub compliance: ComplianceMetadata,
}

/// Compliance metadata attached to every finalization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceMetadata {
    pub standard: String,
    pub immutable: bool,
    pub tamper_evident: String,
}

impl Default for ComplianceMetadata {
    fn default() -> Self {
        Self {
            standard: "WORM".to_string(),
            immutable: true,
            tamper_evident: "merkle+sha256".to_string(),
        }
    }
}

/// Append-only JSONL log with Merkle checkpointing
///
/// A single mutex serializes appends, checkpoints and finalizations, so
/// a checkpoint always observes a clean prefix of the stream: an
/// in-flight append is either fully included or not at all.
pub struct WormLog {
    log_dir: PathBuf,
    digest_dir: PathBuf,
    archive_dir: PathBuf,
    default_log: PathBuf,
    lock: Mutex<()>,
}

impl WormLog {
    /// Create a log rooted at `log_dir` with digests in `digest_dir`
    ///
    /// The default stream is a date-stamped `events-YYYY-MM-DD.jsonl`
    /// inside `log_dir`. Finalized streams archive into `audit/signed`
    /// beside the log directory unless overridden.
    pub fn new(log_dir: impl Into<PathBuf>, digest_dir: impl Into<PathBuf>) -> Result<Self, WormError> {
        let log_dir = log_dir.into();
        let digest_dir = digest_dir.into();

        for dir in [&log_dir, &digest_dir] {
            fs::create_dir_all(dir).map_err(|source| WormError::CreateDir {
                dir: dir.clone(),
                source,
            })?;
        }

        let default_log = log_dir.join(format!("events-{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let archive_dir = log_dir
            .parent()
            .map(|p| p.join("audit").join("signed"))
            .unwrap_or_else(|| PathBuf::from("audit/signed"));

        debug!(?log_dir, ?digest_dir, "WormLog::new");
        Ok(Self {
            log_dir,
            digest_dir,
            archive_dir,
            default_log,
            lock: Mutex::new(()),
        })
    }

    /// Override the archive directory used by finalization
    pub fn with_archive_dir(mut self, archive_dir: impl Into<PathBuf>) -> Self {
        self.archive_dir = archive_dir.into();
        self
    }

    /// Path of the default stream
    pub fn log_path(&self) -> &Path {
        &self.default_log
    }

    /// Directory holding checkpoints and finalization digests
    pub fn digest_dir(&self) -> &Path {
        &self.digest_dir
    }

    /// Append one line to the default stream
    ///
    /// Returns false only on I/O error. A failed audit write degrades
    /// auditability but must not abort the caller; the error is logged
    /// and the caller continues.
    pub fn append(&self, line: &str) -> bool {
        self.append_to(&self.default_log, line)
    }

    /// Append one line to a specific stream inside the log directory
    pub fn append_to(&self, log_file: &Path, line: &str) -> bool {
        let _guard = self.lock.lock().expect("worm lock poisoned");

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .and_then(|mut file| {
                writeln!(file, "{line}")?;
                file.flush()?;
                file.sync_all()
            });

        match result {
            Ok(()) => true,
            Err(e) => {
                error!(file = %log_file.display(), error = %e, "WORM append failed");
                false
            }
        }
    }

    /// Create a Merkle checkpoint of the default stream
    pub fn create_checkpoint(&self) -> Option<String> {
        self.create_checkpoint_for(&self.default_log)
    }

    /// Create a Merkle checkpoint of a specific stream
    ///
    /// Reads every line, rebuilds the tree from scratch and writes
    /// `<digest_dir>/<stem>-checkpoint.json`. Returns the root hash.
    pub fn create_checkpoint_for(&self, log_file: &Path) -> Option<String> {
        let _guard = self.lock.lock().expect("worm lock poisoned");
        self.checkpoint_locked(log_file)
    }

    fn checkpoint_locked(&self, log_file: &Path) -> Option<String> {
        let lines = read_lines(log_file)?;
        let tree = MerkleTree::build(&lines);
        let root = tree.root_hash()?.to_string();

        let checkpoint = Checkpoint {
            file: log_file.display().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            root_hash: root.clone(),
            merkle_root: root.clone(),
            num_entries: lines.len(),
            line_count: lines.len(),
        };

        let checkpoint_path = self.digest_dir.join(format!("{}-checkpoint.json", stem(log_file)));
        if let Err(e) = write_json(&checkpoint_path, &checkpoint) {
            error!(path = %checkpoint_path.display(), error = %e, "failed to write checkpoint");
            return None;
        }

        debug!(file = %log_file.display(), %root, entries = lines.len(), "checkpoint created");
        Some(root)
    }

    /// Verify the default stream against a hash or its last checkpoint
    pub fn verify_integrity(&self, expected_hash: Option<&str>) -> bool {
        self.verify_integrity_of(&self.default_log, expected_hash)
    }

    /// Verify a stream's Merkle root against `expected_hash`, or against
    /// the stream's stored checkpoint when no hash is supplied
    pub fn verify_integrity_of(&self, log_file: &Path, expected_hash: Option<&str>) -> bool {
        let _guard = self.lock.lock().expect("worm lock poisoned");

        let expected = match expected_hash {
            Some(h) => h.to_string(),
            None => {
                let checkpoint_path = self.digest_dir.join(format!("{}-checkpoint.json", stem(log_file)));
                match read_json::<Checkpoint>(&checkpoint_path) {
                    Some(cp) => cp.merkle_root,
                    None => return false,
                }
            }
        };

        let Some(lines) = read_lines(log_file) else {
            return false;
        };

        let tree = MerkleTree::build(&lines);
        tree.root_hash() == Some(expected.as_str())
    }

    /// Finalize the default stream
    pub fn finalize_current_log(&self, archive: bool) -> Option<String> {
        self.finalize_log(&self.default_log, archive)
    }

    /// Finalize a stream: checkpoint it, compute SHA-256 over the file
    /// bytes, write a finalization digest and optionally archive the
    /// stream read-only
    ///
    /// Returns the finalization id, or None when the stream does not
    /// exist. The stream content itself is never modified.
    pub fn finalize_log(&self, log_file: &Path, archive: bool) -> Option<String> {
        let _guard = self.lock.lock().expect("worm lock poisoned");

        if !log_file.exists() {
            warn!(file = %log_file.display(), "finalize requested for missing log");
            return None;
        }

        // Checkpoint first so future integrity checks have a reference
        let merkle_root = self.checkpoint_locked(log_file)?;

        let bytes = match fs::read(log_file) {
            Ok(b) => b,
            Err(e) => {
                error!(file = %log_file.display(), error = %e, "failed to read log for finalization");
                return None;
            }
        };
        let file_sha = sha256_hex(&bytes);
        let num_entries = bytes.split(|b| *b == b'\n').filter(|l| !l.is_empty()).count();

        let now = Utc::now();
        let finalization_id = format!(
            "FINAL-{}-{}",
            now.format("%Y%m%d%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..6]
        );

        let digest = FinalizationDigest {
            finalization_id: finalization_id.clone(),
            log_file: log_file.display().to_string(),
            timestamp: now.to_rfc3339(),
            algorithm: "sha256".to_string(),
            sha256: file_sha,
            merkle_root,
            num_entries,
            compliance: ComplianceMetadata::default(),
        };

        let digest_path = self.digest_dir.join(format!(
            "{}-finalization-{}.json",
            stem(log_file),
            now.format("%Y%m%d%H%M%S")
        ));
        if let Err(e) = write_json(&digest_path, &digest) {
            error!(path = %digest_path.display(), error = %e, "failed to write finalization digest");
            return None;
        }

        if archive && let Err(e) = self.archive_locked(log_file, &finalization_id, &digest) {
            error!(error = %e, "failed to archive finalized log");
            return None;
        }

        debug!(%finalization_id, file = %log_file.display(), "log finalized");
        Some(finalization_id)
    }

    fn archive_locked(
        &self,
        log_file: &Path,
        finalization_id: &str,
        digest: &FinalizationDigest,
    ) -> std::io::Result<()> {
        fs::create_dir_all(&self.archive_dir)?;

        let archived_log = self
            .archive_dir
            .join(format!("{}-{}.jsonl", finalization_id, stem(log_file)));
        fs::copy(log_file, &archived_log)?;

        let archived_digest = self.archive_dir.join(format!("{finalization_id}-digest.json"));
        write_json(&archived_digest, digest)?;

        // Revoke write permissions on the archived copies
        for path in [&archived_log, &archived_digest] {
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_readonly(true);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "log".to_string())
}

fn read_lines(path: &Path) -> Option<Vec<String>> {
    if !path.exists() {
        return None;
    }
    match fs::read_to_string(path) {
        Ok(content) => Some(content.lines().map(str::to_owned).collect()),
        Err(e) => {
            error!(file = %path.display(), error = %e, "failed to read log");
            None
        }
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                error!(file = %path.display(), error = %e, "failed to parse json");
                None
            }
        },
        Err(e) => {
            error!(file = %path.display(), error = %e, "failed to read json");
            None
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let mut file = File::create(path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()
}

// Process-wide instance. Tests reset it via `reset_global`.
static GLOBAL: Mutex<Option<Arc<WormLog>>> = Mutex::new(None);

/// Initialize the process-wide WORM log
pub fn init_global(log_dir: impl Into<PathBuf>, digest_dir: impl Into<PathBuf>) -> Result<Arc<WormLog>, WormError> {
    let log = Arc::new(WormLog::new(log_dir, digest_dir)?);
    *GLOBAL.lock().expect("worm global lock poisoned") = Some(log.clone());
    Ok(log)
}

/// The process-wide WORM log, if initialized
pub fn global() -> Option<Arc<WormLog>> {
    GLOBAL.lock().expect("worm global lock poisoned").clone()
}

/// Drop the process-wide WORM log
pub fn reset_global() {
    *GLOBAL.lock().expect("worm global lock poisoned") = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_log(dir: &Path) -> WormLog {
        WormLog::new(dir.join("logs/events"), dir.join("logs/digests"))
            .unwrap()
            .with_archive_dir(dir.join("audit/signed"))
    }

    #[test]
    fn test_append_writes_one_line() {
        let temp = tempdir().unwrap();
        let log = test_log(temp.path());

        assert!(log.append(r#"{"event":"started"}"#));
        assert!(log.append(r#"{"event":"finished"}"#));

        let content = fs::read_to_string(log.log_path()).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let temp = tempdir().unwrap();
        let log = test_log(temp.path());

        log.append("a");
        log.append("b");
        log.append("c");

        let root = log.create_checkpoint().unwrap();
        assert!(log.verify_integrity(Some(&root)));
        assert!(log.verify_integrity(None));
    }

    #[test]
    fn test_checkpoint_idempotent_without_appends() {
        let temp = tempdir().unwrap();
        let log = test_log(temp.path());

        log.append("a");
        log.append("b");

        let first = log.create_checkpoint().unwrap();
        let second = log.create_checkpoint().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_append_invalidates_old_checkpoint() {
        let temp = tempdir().unwrap();
        let log = test_log(temp.path());

        log.append("a");
        log.append("b");
        log.append("c");
        let root = log.create_checkpoint().unwrap();

        log.append("d");
        assert!(!log.verify_integrity(Some(&root)));

        // Recreating the file without "d" restores the old root
        fs::write(log.log_path(), "a\nb\nc\n").unwrap();
        assert!(log.verify_integrity(Some(&root)));
    }

    #[test]
    fn test_tampering_detected_via_stored_checkpoint() {
        let temp = tempdir().unwrap();
        let log = test_log(temp.path());

        log.append("untouched");
        log.create_checkpoint().unwrap();
        assert!(log.verify_integrity(None));

        fs::write(log.log_path(), "tampered\n").unwrap();
        assert!(!log.verify_integrity(None));
    }

    #[test]
    fn test_verify_without_checkpoint_fails() {
        let temp = tempdir().unwrap();
        let log = test_log(temp.path());

        log.append("a");
        assert!(!log.verify_integrity(None));
    }

    #[test]
    fn test_finalize_writes_digest() {
        let temp = tempdir().unwrap();
        let log = test_log(temp.path());

        log.append("event 1");
        log.append("event 2");

        let id = log.finalize_current_log(false).unwrap();
        assert!(id.starts_with("FINAL-"));

        let digests: Vec<_> = fs::read_dir(log.digest_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("finalization"))
            .collect();
        assert_eq!(digests.len(), 1);

        let digest: FinalizationDigest =
            serde_json::from_str(&fs::read_to_string(digests[0].path()).unwrap()).unwrap();
        assert_eq!(digest.finalization_id, id);
        assert_eq!(digest.algorithm, "sha256");
        assert_eq!(digest.num_entries, 2);
        assert!(digest.compliance.immutable);
        assert!(!digest.merkle_root.is_empty());
        assert!(!digest.sha256.is_empty());
    }

    #[test]
    fn test_finalize_missing_log_returns_none() {
        let temp = tempdir().unwrap();
        let log = test_log(temp.path());
        assert!(log.finalize_current_log(false).is_none());
    }

    #[test]
    fn test_finalize_preserves_log_content() {
        let temp = tempdir().unwrap();
        let log = test_log(temp.path());

        log.append("original entry");
        let before = fs::read_to_string(log.log_path()).unwrap();

        log.finalize_current_log(false).unwrap();
        let after = fs::read_to_string(log.log_path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_finalize_archives_read_only() {
        let temp = tempdir().unwrap();
        let log = test_log(temp.path());

        log.append("audit event");
        let id = log.finalize_current_log(true).unwrap();

        let archive = temp.path().join("audit/signed");
        let archived: Vec<_> = fs::read_dir(&archive)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(&id))
            .collect();
        // Log copy plus digest
        assert_eq!(archived.len(), 2);

        for entry in archived {
            assert!(fs::metadata(entry.path()).unwrap().permissions().readonly());
        }
    }

    #[test]
    #[serial_test::serial]
    fn test_global_lifecycle() {
        let temp = tempdir().unwrap();
        let log = init_global(temp.path().join("events"), temp.path().join("digests")).unwrap();
        assert!(global().is_some());
        assert!(log.append("shared entry"));

        reset_global();
        assert!(global().is_none());
    }

    #[test]
    fn test_concurrent_appends_all_land() {
        let temp = tempdir().unwrap();
        let log = Arc::new(test_log(temp.path()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for j in 0..10 {
                        assert!(log.append(&format!("worker-{i}-line-{j}")));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let content = fs::read_to_string(log.log_path()).unwrap();
        assert_eq!(content.lines().count(), 80);
    }
}
