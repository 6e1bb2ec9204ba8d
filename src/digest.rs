//! On-disk digest store: absolute file path -> recorded SHA-256.
//!
//! Entries live in a single root directory fixed at compile time. The
//! production constructor takes no arguments on purpose: a caller-chosen
//! hash directory would let an attacker point verification at digests they
//! control. Test builds get an override constructor behind the `testing`
//! feature.
//!
//! Entry filenames are derived from the verified file's absolute path.
//! Short paths use a substitution encoding (`/` -> `~`) that stays readable
//! in an audit; paths too long for the filesystem fall back to a truncated
//! SHA-256 of the path itself.

use crate::errors::{VerificationError, VerifyFailure};
use crate::safefile::{self, SafeOpenError};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Compile-time root for digest entries. Created by the installer with
/// mode 0750; the runner itself never creates it.
pub const HASH_DIR: &str = "/usr/local/etc/saferun/hashes";

/// Substitution-encoded names longer than this use the hashed fallback.
/// Stays under common NAME_MAX (255) with headroom for the suffix.
const MAX_ENCODED_NAME: usize = 250;

/// Length of the base64url path-hash prefix in fallback filenames.
const FALLBACK_HASH_LEN: usize = 12;

/// A single digest entry as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DigestRecord {
    algorithm: String,
    digest: String,
    path: String,
}

/// Read/verify interface over the digest directory.
#[derive(Debug, Clone)]
pub struct DigestStore {
    root: PathBuf,
}

impl DigestStore {
    /// Open the store at the compile-time root.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: PathBuf::from(HASH_DIR),
        }
    }

    /// Open a store rooted at an arbitrary directory. Test builds only.
    #[cfg(any(test, feature = "testing"))]
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The entry filename for an absolute path: substitution encoding when
    /// it fits, hashed fallback otherwise.
    fn entry_path(&self, path: &Path) -> PathBuf {
        let encoded = path.to_string_lossy().replace('/', "~");
        if encoded.len() <= MAX_ENCODED_NAME {
            return self.root.join(encoded);
        }
        let hash = Sha256::digest(path.to_string_lossy().as_bytes());
        let name = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hash);
        self.root.join(format!("{}.json", &name[..FALLBACK_HASH_LEN]))
    }

    /// Compute and store the digest of `path`. Refuses to overwrite an
    /// existing entry unless `force` is set. Returns the entry location.
    pub fn record(&self, path: &Path, force: bool) -> Result<PathBuf, VerificationError> {
        if !self.root.is_dir() {
            return Err(VerificationError::StoreUnavailable {
                root: self.root.clone(),
            });
        }

        let entry = self.entry_path(path);
        if entry.exists() && !force {
            return Err(VerificationError::EntryExists {
                path: path.to_path_buf(),
            });
        }

        let content = read_file_contents(path)?;
        let record = DigestRecord {
            algorithm: "sha256".to_string(),
            digest: hex::encode(Sha256::digest(&content)),
            path: path.to_string_lossy().into_owned(),
        };

        write_entry(&entry, &record).map_err(|e| VerificationError::Io {
            path: entry.clone(),
            source: e,
        })?;
        Ok(entry)
    }

    /// Re-read `path` and compare its digest to the stored entry.
    pub fn verify(&self, path: &Path) -> Result<(), VerificationError> {
        let content = read_file_contents(path)?;
        self.verify_content(path, &content)
    }

    /// Compare already-buffered content against the stored entry. The
    /// config loader uses this so the bytes that were hashed are the exact
    /// bytes that get parsed.
    pub fn verify_content(&self, path: &Path, content: &[u8]) -> Result<(), VerificationError> {
        let record = self.load_entry(path)?;
        let actual = hex::encode(Sha256::digest(content));
        if actual != record.digest {
            return Err(VerificationError::Failed {
                path: path.to_path_buf(),
                cause: VerifyFailure::Mismatch,
            });
        }
        Ok(())
    }

    fn load_entry(&self, path: &Path) -> Result<DigestRecord, VerificationError> {
        let entry = self.entry_path(path);
        let text = match std::fs::read_to_string(&entry) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VerificationError::Failed {
                    path: path.to_path_buf(),
                    cause: VerifyFailure::Missing,
                });
            }
            Err(e) => {
                return Err(VerificationError::Io {
                    path: entry,
                    source: e,
                });
            }
        };
        let record: DigestRecord =
            serde_json::from_str(&text).map_err(|e| VerificationError::CorruptEntry {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if record.algorithm != "sha256" {
            return Err(VerificationError::CorruptEntry {
                path: path.to_path_buf(),
                reason: format!("unsupported algorithm '{}'", record.algorithm),
            });
        }
        Ok(record)
    }
}

impl Default for DigestStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a file for hashing through safe open, mapping refusals to the
/// verification taxonomy.
fn read_file_contents(path: &Path) -> Result<Vec<u8>, VerificationError> {
    let mut file = safefile::safe_open(path).map_err(|e| match e {
        SafeOpenError::Io(source) if source.kind() == std::io::ErrorKind::NotFound => {
            VerificationError::Failed {
                path: path.to_path_buf(),
                cause: VerifyFailure::ReadError,
            }
        }
        other => VerificationError::UnsafePath {
            path: path.to_path_buf(),
            reason: other.to_string(),
        },
    })?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|source| VerificationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(buf)
}

/// Write an entry file with mode 0640.
fn write_entry(entry: &Path, record: &DigestRecord) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let json = serde_json::to_string_pretty(record)?;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o640)
        .open(entry)?;
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, DigestStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DigestStore::with_root(dir.path());
        (dir, store)
    }

    fn write_target(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_record_then_verify_succeeds() {
        let (dir, store) = store();
        let target = write_target(&dir, "file.txt", b"hello");

        store.record(&target, false).unwrap();
        store.verify(&target).unwrap();
    }

    #[test]
    fn test_verify_detects_tampering() {
        let (dir, store) = store();
        let target = write_target(&dir, "file.txt", b"hello");
        store.record(&target, false).unwrap();

        std::fs::write(&target, b"tampered").unwrap();
        let err = store.verify(&target).unwrap_err();
        assert!(matches!(
            err,
            VerificationError::Failed {
                cause: VerifyFailure::Mismatch,
                ..
            }
        ));
    }

    #[test]
    fn test_verify_missing_entry() {
        let (dir, store) = store();
        let target = write_target(&dir, "file.txt", b"hello");

        let err = store.verify(&target).unwrap_err();
        assert!(matches!(
            err,
            VerificationError::Failed {
                cause: VerifyFailure::Missing,
                ..
            }
        ));
    }

    #[test]
    fn test_record_refuses_overwrite_without_force() {
        let (dir, store) = store();
        let target = write_target(&dir, "file.txt", b"hello");
        store.record(&target, false).unwrap();

        let err = store.record(&target, false).unwrap_err();
        assert!(matches!(err, VerificationError::EntryExists { .. }));
    }

    #[test]
    fn test_record_force_overwrites_and_verifies() {
        let (dir, store) = store();
        let target = write_target(&dir, "file.txt", b"v1");
        store.record(&target, false).unwrap();

        std::fs::write(&target, b"v2").unwrap();
        store.record(&target, true).unwrap();
        store.verify(&target).unwrap();
    }

    #[test]
    fn test_record_fails_when_root_missing() {
        let store = DigestStore::with_root("/nonexistent/saferun-hash-root");
        let err = store.record(Path::new("/etc/hostname"), false).unwrap_err();
        assert!(matches!(err, VerificationError::StoreUnavailable { .. }));
    }

    #[test]
    fn test_entry_name_is_substitution_encoded() {
        let store = DigestStore::with_root("/hashes");
        let entry = store.entry_path(Path::new("/opt/app/run.toml"));
        assert_eq!(entry, Path::new("/hashes/~opt~app~run.toml"));
    }

    #[test]
    fn test_entry_name_falls_back_to_hash_for_long_paths() {
        let store = DigestStore::with_root("/hashes");
        let long = format!("/{}", "a/".repeat(200));
        let entry = store.entry_path(Path::new(&long));
        let name = entry.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with(".json"));
        assert_eq!(name.len(), FALLBACK_HASH_LEN + ".json".len());
    }

    #[test]
    fn test_entry_file_mode_is_0640() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, store) = store();
        let target = write_target(&dir, "file.txt", b"hello");
        let entry = store.record(&target, false).unwrap();

        let mode = std::fs::metadata(&entry).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn test_verify_content_matches_buffered_bytes() {
        let (dir, store) = store();
        let target = write_target(&dir, "file.txt", b"buffered");
        store.record(&target, false).unwrap();

        store.verify_content(&target, b"buffered").unwrap();
        let err = store.verify_content(&target, b"swapped").unwrap_err();
        assert!(matches!(
            err,
            VerificationError::Failed {
                cause: VerifyFailure::Mismatch,
                ..
            }
        ));
    }

    #[test]
    fn test_verify_refuses_symlinked_target() {
        let (dir, store) = store();
        let target = write_target(&dir, "file.txt", b"hello");
        store.record(&target, false).unwrap();

        let link = dir.path().join("link.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        let err = store.verify(&link).unwrap_err();
        assert!(matches!(err, VerificationError::UnsafePath { .. }));
    }
}
