// crates/pw-store/src/error.rs
// ============================================================================
// Module: Landscape Store Errors
// Description: The error type every Landscape operation returns, and its
// conversion into `pw_core::core::error::EngineError`.
// Purpose: Distinguish I/O failures, constraint violations, and code-level
// invariant checks the recorder runs before ever touching SQLite (§4.3:
// "validate invariants in code ... rely on database constraints as a second
// line of defense").
// Dependencies: thiserror, rusqlite, pw-core
// ============================================================================

use pw_core::core::error::EngineError;
use thiserror::Error;

/// Errors raised by the Landscape store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A code-level invariant check failed before any SQL was issued (e.g.
    /// completing a node state that is not `open`, or a routing event whose
    /// group size doesn't match its ordinals).
    #[error("landscape invariant violated: {0}")]
    Invariant(String),
    /// A `SQLite` constraint (foreign key, unique index, check) rejected the
    /// write — the database's second line of defense, per §4.3.
    #[error("landscape constraint violated: {0}")]
    Constraint(String),
    /// The requested row does not exist.
    #[error("landscape record not found: {0}")]
    NotFound(String),
    /// An underlying `SQLite` or filesystem error.
    #[error("landscape io error: {0}")]
    Io(String),
    /// The writer thread's channel is closed (the writer has shut down or
    /// panicked); no further writes can be accepted.
    #[error("landscape writer unavailable")]
    WriterUnavailable,
    /// A stored payload failed to parse back into its expected shape.
    #[error("landscape decode error: {0}")]
    Decode(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(sqlite_err, _)
                if sqlite_err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Constraint(err.to_string())
            }
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Invariant(msg) => Self::OrchestrationInvariant(msg),
            StoreError::Constraint(msg) | StoreError::Decode(msg) => Self::AuditIntegrity(msg),
            StoreError::NotFound(msg) => Self::AuditIntegrity(format!("not found: {msg}")),
            StoreError::Io(msg) => Self::AuditIntegrity(format!("io: {msg}")),
            StoreError::WriterUnavailable => {
                Self::AuditIntegrity("landscape writer unavailable".to_owned())
            }
        }
    }
}
