// crates/pw-store/src/readpool.rs
// ============================================================================
// Module: Read Connection Pool
// Description: A small round-robin pool of read-only connections (§5:
// "reads never block behind the writer, and never block each other").
// Purpose: WAL mode lets readers proceed concurrently with the single
// writer; a fixed pool of already-open connections avoids paying
// connection-open cost per query while still bounding how many concurrent
// readers contend for OS file handles.
// Dependencies: rusqlite
// ============================================================================

//! ## Overview
//! A file-backed store opens [`ReadPool::Pooled`] connections directly
//! against the database file, in `SQLITE_OPEN_READ_ONLY` mode, bypassing
//! the writer thread entirely for reads. An in-memory store has no file a
//! second connection could open, so it falls back to [`ReadPool::ViaWriter`],
//! routing reads through the same writer thread as writes — still correct,
//! just without the read/write concurrency a file-backed store gets.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use rusqlite::Connection;
use rusqlite::OpenFlags;

use crate::error::StoreError;
use crate::writer;
use crate::writer::Writer;

/// A pool of connections (or a writer-thread fallback) used for reads.
pub enum ReadPool {
    /// Dedicated read-only connections, selected round-robin.
    Pooled {
        /// The open connections.
        connections: Vec<Mutex<Connection>>,
        /// Round-robin cursor.
        cursor: AtomicUsize,
    },
    /// Routes reads through the writer thread (in-memory databases only).
    ViaWriter(Arc<Writer>),
}

impl ReadPool {
    /// Opens `size` read-only connections against the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if any connection fails to open.
    pub fn open(path: &std::path::Path, size: usize) -> Result<Self, StoreError> {
        let size = size.max(1);
        let mut connections = Vec::with_capacity(size);
        for _ in 0 .. size {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(StoreError::from)?;
            conn.pragma_update(None, "busy_timeout", 5_000).map_err(StoreError::from)?;
            connections.push(Mutex::new(conn));
        }
        Ok(Self::Pooled { connections, cursor: AtomicUsize::new(0) })
    }

    /// Builds a read pool that routes every read through `writer`.
    #[must_use]
    pub const fn via_writer(writer: Arc<Writer>) -> Self {
        Self::ViaWriter(writer)
    }

    /// Runs `query` against a connection chosen from this pool.
    ///
    /// # Errors
    ///
    /// Propagates whatever error `query` returns, or [`StoreError::Io`] if
    /// a pooled connection's lock is poisoned, or
    /// [`StoreError::WriterUnavailable`] if routed through a writer thread
    /// that has shut down.
    pub fn with_connection<T>(
        &self,
        query: impl FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    ) -> Result<T, StoreError>
    where
        T: Send + 'static,
    {
        match self {
            Self::Pooled { connections, cursor } => {
                let index = cursor.fetch_add(1, Ordering::Relaxed) % connections.len();
                let guard = connections[index]
                    .lock()
                    .map_err(|_unused| StoreError::Io("read connection lock poisoned".to_owned()))?;
                query(&guard)
            }
            Self::ViaWriter(writer) => writer::call(writer, move |tx| query(tx)),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only panic-based assertions are permitted.")]

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn round_robins_across_connections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("landscape.sqlite3");
        {
            let mut conn = Connection::open(&path).unwrap();
            crate::schema::initialize(&mut conn).unwrap();
        }
        let pool = ReadPool::open(&path, 3).unwrap();
        for _ in 0 .. 10 {
            let count: i64 = pool
                .with_connection(|conn| {
                    conn.query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0)).map_err(StoreError::from)
                })
                .unwrap();
            assert_eq!(count, 0);
        }
    }
}
