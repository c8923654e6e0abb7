// crates/pw-orchestrator/src/checkpoint.rs
// ============================================================================
// Module: Checkpoint Manager
// Description: Binds every checkpoint row to a hash over the upstream
// topology and the checkpointing node's own configuration, and enforces
// that checkpoints are only ever written after pending sinks are flushed
// (§4.11).
// Dependencies: pw-core, pw-store, serde_json
// Grounding: original `core/landscape/_node_state_recording.py`'s checkpoint
// write path, and `pw-store::store::checkpoints::write_checkpoint`, which
// already persists the two hashes this module computes.
// ============================================================================

//! ## Overview
//! [`CheckpointManager::upstream_topology_hash`] and
//! [`CheckpointManager::node_config_hash`] produce the two hashes recovery
//! later recomputes and compares before trusting a checkpoint row.
//! [`CheckpointManager::write`] takes a [`SinksFlushed`] token as proof the
//! orchestrator has already flushed every pending sink for this run — the
//! only way to obtain that token is [`mark_sinks_flushed`], called once the
//! orchestrator has actually done so, turning the ordering requirement into
//! a compile-time constraint rather than a runtime assertion.

use pw_core::core::canonical::stable_hash;
use pw_core::core::error::EngineError;
use pw_core::core::identifiers::CheckpointId;
use pw_core::core::identifiers::NodeId;
use pw_core::core::identifiers::RunId;
use pw_core::core::identifiers::TokenId;
use pw_core::core::model::Checkpoint;
use pw_store::NewCheckpoint;
use pw_store::SqliteLandscape;
use pw_store::StoreError;
use serde::Serialize;
use serde_json::Value;

/// Failures raised while writing or resolving a checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointManagerError {
    /// The underlying Landscape write or read failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Hashing the upstream topology or node configuration failed.
    #[error(transparent)]
    Canonical(#[from] pw_core::core::canonical::CanonicalError),
}

impl From<CheckpointManagerError> for EngineError {
    fn from(err: CheckpointManagerError) -> Self {
        match err {
            CheckpointManagerError::Store(store_err) => store_err.into(),
            CheckpointManagerError::Canonical(canonical_err) => canonical_err.into(),
        }
    }
}

/// Proof that every sink pending at the time a checkpoint is written has
/// been flushed. Constructible only via [`mark_sinks_flushed`].
#[derive(Debug, Clone, Copy)]
pub struct SinksFlushed(());

/// Asserts that every pending sink has been flushed, producing the token
/// [`CheckpointManager::write`] requires. Callers must not call this before
/// actually flushing every sink a checkpoint could otherwise outrun.
#[must_use]
pub const fn mark_sinks_flushed() -> SinksFlushed {
    SinksFlushed(())
}

/// Writes checkpoints bound to the topology and configuration hashes
/// recovery later verifies against.
pub struct CheckpointManager<'a> {
    /// The Landscape store checkpoints are persisted to.
    store: &'a SqliteLandscape,
}

impl<'a> CheckpointManager<'a> {
    /// Builds a checkpoint manager over `store`.
    #[must_use]
    pub const fn new(store: &'a SqliteLandscape) -> Self {
        Self { store }
    }

    /// Hashes the canonical encoding of every upstream node's spec, in
    /// topological order, binding a checkpoint to the exact upstream
    /// topology it was produced under.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointManagerError::Canonical`] if canonicalization
    /// fails (a non-finite float smuggled into a node spec).
    pub fn upstream_topology_hash<T: Serialize>(&self, upstream_specs: &[T]) -> Result<String, CheckpointManagerError> {
        Ok(stable_hash(&upstream_specs)?.to_string())
    }

    /// Hashes the canonical encoding of a checkpointing node's own
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointManagerError::Canonical`] if canonicalization
    /// fails.
    pub fn node_config_hash<T: Serialize>(&self, node_config: &T) -> Result<String, CheckpointManagerError> {
        Ok(stable_hash(node_config)?.to_string())
    }

    /// Writes a checkpoint, requiring proof (`_sinks_flushed`) that every
    /// pending sink has already been flushed.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointManagerError`] if the write fails.
    #[allow(clippy::too_many_arguments, reason = "each argument is a distinct, independently-sourced checkpoint field")]
    pub fn write(
        &self,
        run_id: &RunId,
        token_id: TokenId,
        node_id: NodeId,
        upstream_topology_hash: String,
        checkpoint_node_config_hash: String,
        aggregation_state_json: Option<Value>,
        _sinks_flushed: SinksFlushed,
    ) -> Result<Checkpoint, CheckpointManagerError> {
        Ok(self.store.write_checkpoint(
            run_id,
            NewCheckpoint { token_id, node_id, upstream_topology_hash, checkpoint_node_config_hash, aggregation_state_json },
        )?)
    }

    /// Returns the most recent checkpoint for `(run_id, node_id)`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointManagerError`] if the read fails.
    pub fn latest(&self, run_id: &RunId, node_id: &NodeId) -> Result<Option<Checkpoint>, CheckpointManagerError> {
        Ok(self.store.latest_checkpoint(run_id, node_id)?)
    }

    /// Returns `checkpoint` if its recorded hashes both match the hashes
    /// recomputed for the current topology and node configuration,
    /// otherwise `None` — the checkpoint was produced under a topology or
    /// configuration that has since changed and cannot be trusted.
    #[must_use]
    pub fn verify(checkpoint: Checkpoint, current_upstream_topology_hash: &str, current_node_config_hash: &str) -> Option<Checkpoint> {
        if checkpoint.upstream_topology_hash == current_upstream_topology_hash && checkpoint.checkpoint_node_config_hash == current_node_config_hash {
            Some(checkpoint)
        } else {
            None
        }
    }
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

    use pw_core::core::identifiers::NodeId;
    use pw_core::core::identifiers::TokenId;
    use serde_json::json;

    use super::mark_sinks_flushed;
    use super::CheckpointManager;

    fn store() -> pw_store::SqliteLandscape {
        pw_store::SqliteLandscape::open_in_memory().expect("opens")
    }

    #[test]
    fn topology_hash_is_stable_across_equivalent_specs() {
        let store = store();
        let manager = CheckpointManager::new(&store);
        let specs = vec![json!({"id": "a", "config": {"x": 1}})];
        let first = manager.upstream_topology_hash(&specs).expect("hashes");
        let second = manager.upstream_topology_hash(&specs).expect("hashes");
        assert_eq!(first, second);
    }

    #[test]
    fn write_and_latest_round_trip() {
        let store = store();
        let run = store.begin_run("cfg-hash".to_owned(), "v1".to_owned()).expect("begins run");
        let manager = CheckpointManager::new(&store);
        let node_id = NodeId::new("aggregate");

        let written = manager
            .write(
                &run.run_id,
                TokenId::new("tok-1"),
                node_id.clone(),
                "topo-hash".to_owned(),
                "node-hash".to_owned(),
                Some(json!({"count": 3})),
                mark_sinks_flushed(),
            )
            .expect("writes checkpoint");

        let latest = manager.latest(&run.run_id, &node_id).expect("reads latest").expect("has a checkpoint");
        assert_eq!(latest.checkpoint_id, written.checkpoint_id);
        assert_eq!(latest.sequence_number, 0);
    }

    #[test]
    fn verify_rejects_a_mismatched_hash() {
        let store = store();
        let run = store.begin_run("cfg-hash".to_owned(), "v1".to_owned()).expect("begins run");
        let manager = CheckpointManager::new(&store);
        let node_id = NodeId::new("aggregate");

        let written = manager
            .write(&run.run_id, TokenId::new("tok-1"), node_id, "topo-hash".to_owned(), "node-hash".to_owned(), None, mark_sinks_flushed())
            .expect("writes checkpoint");

        assert!(CheckpointManager::verify(written.clone(), "topo-hash", "node-hash").is_some());
        assert!(CheckpointManager::verify(written, "different-topo-hash", "node-hash").is_none());
    }
}
