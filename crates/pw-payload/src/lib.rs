// crates/pw-payload/src/lib.rs
// ============================================================================
// Crate: pw-payload
// Description: Content-addressed filesystem payload store (§4.1).
// Purpose: Back every large audited value (request/response bodies, routing
// reasons, source row snapshots) with a store keyed by the SHA-256 digest of
// its bytes, so duplicate writes are free and a partially written payload is
// never visible under its final name.
// Dependencies: pw-core (canonical hashing), sha2, thiserror
// ============================================================================

//! ## Overview
//! Layout mirrors the content-addressed object stores threaded throughout
//! the retrieved pack: the digest's first two hex characters name a shard
//! directory, the remaining characters name the file within it. `store`
//! writes to a sibling temp file (named from the process id and a counter,
//! so two threads never collide) and atomically renames it into place —
//! `rename` within the same filesystem is the crash-safety boundary: a
//! reader either sees the old absence or the complete new file, never a
//! partial write. `retrieve` re-hashes what it reads and refuses to return
//! bytes whose digest no longer matches their filename.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::io;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use pw_core::core::canonical::HashAlgorithm;
use pw_core::core::canonical::hash_bytes;
use pw_core::core::error::EngineError;
use pw_core::protocol::PayloadStore as PayloadStoreTrait;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by [`FilesystemPayloadStore`].
#[derive(Debug, Error)]
pub enum PayloadStoreError {
    /// The store's root directory, or a shard directory beneath it, could
    /// not be created or accessed.
    #[error("payload store io error: {0}")]
    Io(String),
    /// No payload exists under the requested digest.
    #[error("payload not found: {0}")]
    NotFound(String),
    /// A stored payload's bytes no longer hash to the digest that names it.
    #[error("payload corrupt: digest '{digest}' expected, content hashes to '{actual}'")]
    Corrupt {
        /// The digest the payload was requested under.
        digest: String,
        /// The digest the content on disk actually hashes to.
        actual: String,
    },
}

impl From<PayloadStoreError> for EngineError {
    fn from(err: PayloadStoreError) -> Self {
        match err {
            PayloadStoreError::Io(msg) => Self::AuditIntegrity(format!("payload store io: {msg}")),
            PayloadStoreError::NotFound(digest) => {
                Self::AuditIntegrity(format!("payload not found: {digest}"))
            }
            PayloadStoreError::Corrupt { digest, actual } => {
                Self::AuditIntegrity(format!("payload '{digest}' corrupt, hashes to '{actual}'"))
            }
        }
    }
}

// ============================================================================
// SECTION: Filesystem Payload Store
// ============================================================================

/// A content-addressed payload store rooted at a directory on disk.
///
/// # Invariants
/// - A file named by digest `d` under this root, if it exists, always
///   contains bytes whose SHA-256 hex digest is `d`; [`Self::retrieve`]
///   enforces this on every read rather than trusting the filename alone.
#[derive(Debug, Clone)]
pub struct FilesystemPayloadStore {
    root: PathBuf,
    tmp_counter: std::sync::Arc<AtomicU64>,
}

impl FilesystemPayloadStore {
    /// Opens (creating if absent) a payload store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadStoreError::Io`] if `root` cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PayloadStoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| PayloadStoreError::Io(err.to_string()))?;
        Ok(Self { root, tmp_counter: std::sync::Arc::new(AtomicU64::new(0)) })
    }

    /// The shard subdirectory and final path for a given hex digest.
    fn shard_path(&self, digest: &str) -> PathBuf {
        let shard = if digest.len() >= 2 { &digest[..2] } else { digest };
        self.root.join(shard).join(digest)
    }

    /// Stores `bytes`, returning the hex digest they are keyed under.
    ///
    /// Idempotent: if a payload under the computed digest already exists,
    /// its content is trusted (by construction, content-addressing means
    /// it must already match) and no write occurs.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadStoreError::Io`] if the write, its containing shard
    /// directory, or the final rename fails.
    pub fn store(&self, bytes: &[u8]) -> Result<String, PayloadStoreError> {
        let digest = hash_bytes(HashAlgorithm::Sha256, bytes).value;
        let final_path = self.shard_path(&digest);
        if final_path.is_file() {
            return Ok(digest);
        }
        let shard_dir = final_path.parent().ok_or_else(|| {
            PayloadStoreError::Io(format!("digest '{digest}' resolved to a path with no parent"))
        })?;
        fs::create_dir_all(shard_dir).map_err(|err| PayloadStoreError::Io(err.to_string()))?;

        let tmp_path = self.tmp_path(shard_dir);
        write_then_rename(&tmp_path, &final_path, bytes).map_err(|err| PayloadStoreError::Io(err.to_string()))?;
        Ok(digest)
    }

    /// Retrieves the bytes stored under `digest`, re-verifying their hash.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadStoreError::NotFound`] if no payload exists under
    /// `digest`, or [`PayloadStoreError::Corrupt`] if the content on disk no
    /// longer hashes to `digest`.
    pub fn retrieve(&self, digest: &str) -> Result<Vec<u8>, PayloadStoreError> {
        let path = self.shard_path(digest);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(PayloadStoreError::NotFound(digest.to_owned()));
            }
            Err(err) => return Err(PayloadStoreError::Io(err.to_string())),
        };
        let actual = hash_bytes(HashAlgorithm::Sha256, &bytes).value;
        if actual != digest {
            return Err(PayloadStoreError::Corrupt { digest: digest.to_owned(), actual });
        }
        Ok(bytes)
    }

    /// Builds a unique temp-file path within `dir`, distinct per thread and
    /// call so concurrent writers never collide before their rename.
    fn tmp_path(&self, dir: &Path) -> PathBuf {
        let counter = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        dir.join(format!(".tmp-{}-{counter}", std::process::id()))
    }
}

impl PayloadStoreTrait for FilesystemPayloadStore {
    fn store(&self, bytes: &[u8]) -> Result<String, EngineError> {
        self.store(bytes).map_err(EngineError::from)
    }

    fn retrieve(&self, digest: &str) -> Result<Vec<u8>, EngineError> {
        self.retrieve(digest).map_err(EngineError::from)
    }
}

/// Writes `bytes` to `tmp_path`, flushes and syncs it, then atomically
/// renames it to `final_path`. A crash before the rename leaves only the
/// temp file behind; `final_path` never observes a partial write.
fn write_then_rename(tmp_path: &Path, final_path: &Path, bytes: &[u8]) -> io::Result<()> {
    {
        let mut file = fs::File::create(tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, final_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    //! Test-only lint relaxations for panic-based assertions and debug output.
    #![allow(
        clippy::panic,
        clippy::print_stdout,
        clippy::print_stderr,
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::use_debug,
        clippy::dbg_macro,
        clippy::panic_in_result_fn,
        clippy::unwrap_in_result,
        reason = "Test-only output and panic-based assertions are permitted."
    )]

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn store_then_retrieve_round_trips() {
        let dir = tempdir().unwrap();
        let store = FilesystemPayloadStore::open(dir.path()).unwrap();
        let digest = store.store(b"hello world").unwrap();
        assert_eq!(store.retrieve(&digest).unwrap(), b"hello world");
    }

    #[test]
    fn store_is_idempotent_on_digest() {
        let dir = tempdir().unwrap();
        let store = FilesystemPayloadStore::open(dir.path()).unwrap();
        let first = store.store(b"payload").unwrap();
        let second = store.store(b"payload").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn retrieve_missing_digest_is_not_found() {
        let dir = tempdir().unwrap();
        let store = FilesystemPayloadStore::open(dir.path()).unwrap();
        let err = store.retrieve("0000000000000000000000000000000000000000000000000000000000000000").unwrap_err();
        assert!(matches!(err, PayloadStoreError::NotFound(_)));
    }

    #[test]
    fn retrieve_detects_tampered_content() {
        let dir = tempdir().unwrap();
        let store = FilesystemPayloadStore::open(dir.path()).unwrap();
        let digest = store.store(b"original").unwrap();
        let path = store.shard_path(&digest);
        fs::write(&path, b"tampered").unwrap();
        let err = store.retrieve(&digest).unwrap_err();
        assert!(matches!(err, PayloadStoreError::Corrupt { .. }));
    }

    #[test]
    fn different_content_yields_different_digests() {
        let dir = tempdir().unwrap();
        let store = FilesystemPayloadStore::open(dir.path()).unwrap();
        let a = store.store(b"a").unwrap();
        let b = store.store(b"b").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn concurrent_stores_of_same_content_do_not_corrupt() {
        use std::sync::Arc;
        use std::thread;

        let dir = tempdir().unwrap();
        let store = Arc::new(FilesystemPayloadStore::open(dir.path()).unwrap());
        let handles: Vec<_> = (0 .. 8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.store(b"shared content").unwrap())
            })
            .collect();
        let digests: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(digests.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(store.retrieve(&digests[0]).unwrap(), b"shared content");
    }
}
