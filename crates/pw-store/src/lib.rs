// crates/pw-store/src/lib.rs
// ============================================================================
// Crate: pw-store
// Description: The Landscape audit store (§4.3): a `SQLite`-backed
// relational recorder for every entity in `pw_core::core::model`.
// Purpose: Give the orchestrator and every plugin a durable, queryable audit
// trail with a single-writer discipline and a round-robin read pool.
// Dependencies: pw-core, rusqlite (bundled), serde_json, thiserror, time,
// tracing, rand
// ============================================================================

//! ## Overview
//! [`SqliteLandscape`] owns one dedicated writer thread (see [`writer`]) that
//! is the only thing in the process holding the write connection, and a
//! small pool of read-only connections (see [`readpool`]) selected
//! round-robin for concurrent reads. Every public method either submits one
//! job to the writer and blocks for its reply, or borrows one pooled
//! connection for the duration of a query — no method ever holds both at
//! once.
//!
//! Operation modules are split by the subject they touch, mirroring the
//! table groups in [`schema`]: [`store::runs`], [`store::topology`],
//! [`store::lineage`], [`store::states`], [`store::batches`],
//! [`store::outcomes`], [`store::artifacts`], [`store::checkpoints`]. Each
//! is an `impl SqliteLandscape` block in its own file; together they cover
//! every operation named in §4.3. [`store::recorder`] implements
//! `pw_core::protocol::LandscapeRecorder` on top of the `states` and
//! `outcomes` primitives, the seam a running `PluginContext` calls into.

mod codec;
pub mod error;
mod ids;
mod readpool;
pub mod schema;
mod store;
mod timefmt;
mod writer;

use std::path::Path;
use std::sync::Arc;

use readpool::ReadPool;
use rusqlite::Connection;
use writer::Writer;

pub use error::StoreError;
pub use store::NewArtifact;
pub use store::NewCall;
pub use store::NewCheckpoint;
pub use store::NewNode;
pub use store::NewNodeState;
pub use store::NewToken;
pub use store::NodeStateCompletion;
pub use store::RoutingDecision;

/// Default number of read-only connections held open by a [`SqliteLandscape`].
pub const DEFAULT_READ_POOL_SIZE: usize = 4;

/// The `SQLite`-backed Landscape audit store.
pub struct SqliteLandscape {
    writer: Arc<Writer>,
    read_pool: ReadPool,
}

impl SqliteLandscape {
    /// Opens (creating if absent) a Landscape store at `path`, initializing
    /// its schema and spawning its writer thread.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the database cannot be opened or its
    /// schema cannot be initialized.
    pub fn open(path: &Path, read_pool_size: usize) -> Result<Self, StoreError> {
        let mut write_conn = Connection::open(path).map_err(StoreError::from)?;
        schema::initialize(&mut write_conn).map_err(StoreError::from)?;
        let writer = Writer::spawn(write_conn);
        let read_pool = ReadPool::open(path, read_pool_size)?;
        Ok(Self { writer, read_pool })
    }

    /// Opens an in-memory Landscape store, useful for tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the schema cannot be initialized.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut write_conn = Connection::open_in_memory().map_err(StoreError::from)?;
        schema::initialize(&mut write_conn).map_err(StoreError::from)?;
        let writer = Writer::spawn(write_conn);
        let read_pool = ReadPool::via_writer(Arc::clone(&writer));
        Ok(Self { writer, read_pool })
    }
}
