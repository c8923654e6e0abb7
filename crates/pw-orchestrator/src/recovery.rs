// crates/pw-orchestrator/src/recovery.rs
// ============================================================================
// Module: Recovery Manager
// Description: Reconstructs a crashed run's in-flight state before
// `engine::Orchestrator` resumes it (§4.12): validates the resuming config
// against the topology the run was actually started under, recomputes and
// verifies every node's checkpoint, and marks in-flight batches failed so
// they re-assemble from scratch.
// Dependencies: pw-core, pw-dag, pw-store, serde_json, thiserror, tracing
// Grounding: `checkpoint.rs`'s `verify`, which this module calls for every
// checkpointed node, and `pw-store::store::batches::list_executing_batches`,
// whose own doc comment already describes this exact use.
// ============================================================================

//! ## Overview
//! [`RecoveryManager::resume`] is the only entry point: it loads the crashed
//! run, rejects a config whose hash no longer matches the one the run was
//! started under, recomputes the topology and per-node configuration hashes
//! from the freshly-constructed DAG, and keeps only the checkpoints whose
//! recorded hashes still match. Row payload data is never reconstructed
//! here — `TokenManager`'s row-data cache is purely in-memory and is
//! genuinely lost on crash. A resumed run must re-invoke its source plugin;
//! [`RecoveryPlan`] carries the original run's resolved source schema so a
//! caller can remap the re-read rows against it.

use std::collections::BTreeMap;

use pw_core::core::canonical::CanonicalError;
use pw_core::core::canonical::stable_hash;
use pw_core::core::identifiers::NodeId;
use pw_core::core::identifiers::RunId;
use pw_core::core::model::BatchMember;
use pw_core::core::model::BatchStatus;
use pw_core::core::model::Checkpoint;
use pw_core::core::model::Run;
use pw_core::core::model::RunStatus;
use pw_dag::ConstructionError;
use pw_dag::PipelineConfig;
use pw_store::SqliteLandscape;
use pw_store::StoreError;

use crate::checkpoint::CheckpointManager;
use crate::engine::node_spec_for_hash;

/// Failures raised while resuming a crashed run.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// The underlying Landscape store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Hashing the resuming config or a node spec failed.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    /// The resuming config fails DAG construction.
    #[error("resuming config failed construction with {} error(s): {0:?}", .0.len())]
    Construction(Vec<ConstructionError>),
    /// The run is not in a resumable status.
    #[error("run '{0}' is in status {1:?}, which cannot be resumed")]
    NotResumable(RunId, RunStatus),
    /// The resuming config's hash does not match the run's original config
    /// hash — resuming under a changed pipeline would silently corrupt
    /// lineage.
    #[error("resuming config hash '{resuming}' does not match run's original config hash '{original}'")]
    TopologyMismatch {
        /// Hash of the config the caller is attempting to resume with.
        resuming: String,
        /// Hash of the config the run was originally started under.
        original: String,
    },
}

/// A batch that was `executing` when the run crashed, reset to `failed` and
/// bumped to a new attempt so it re-assembles from its surviving members.
#[derive(Debug, Clone)]
pub struct RestoredBatch {
    /// The aggregation node this batch belongs to.
    pub aggregation_node_id: NodeId,
    /// Members recorded against the batch before the crash. Their row
    /// payload data is not recoverable; a caller must re-derive it from a
    /// re-run of the upstream nodes that fed this aggregation.
    pub members: Vec<BatchMember>,
}

/// The reconstructed state a caller needs to resume a crashed run.
#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    /// The run being resumed.
    pub run: Run,
    /// Checkpoints that verified clean against the current topology and
    /// node configuration, keyed by the node that wrote them.
    pub checkpoints: BTreeMap<NodeId, Checkpoint>,
    /// Batches that were mid-assembly or mid-processing when the run
    /// crashed.
    pub restored_batches: Vec<RestoredBatch>,
}

/// Reconstructs a crashed run's in-flight state ahead of resumption.
pub struct RecoveryManager<'a> {
    store: &'a SqliteLandscape,
}

impl<'a> RecoveryManager<'a> {
    /// Builds a recovery manager over `store`.
    #[must_use]
    pub const fn new(store: &'a SqliteLandscape) -> Self {
        Self { store }
    }

    /// Validates `config` against `run_id`'s recorded topology, recomputes
    /// and verifies every node's latest checkpoint, and resets every
    /// in-flight batch to `failed` so it reassembles on resume.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::NotResumable`] if the run is `running` or
    /// `completed`; [`RecoveryError::TopologyMismatch`] if `config`'s hash
    /// does not match the run's original config hash; otherwise whatever
    /// the first store or construction failure was.
    pub fn resume(&self, run_id: &RunId, config: &PipelineConfig) -> Result<RecoveryPlan, RecoveryError> {
        let run = self.store.get_run(run_id)?;
        if !matches!(run.status, RunStatus::Failed | RunStatus::Cancelled) {
            return Err(RecoveryError::NotResumable(run_id.clone(), run.status));
        }

        let resuming_hash = stable_hash(config)?.to_string();
        if resuming_hash != run.config_hash {
            return Err(RecoveryError::TopologyMismatch { resuming: resuming_hash, original: run.config_hash });
        }

        let construction = pw_dag::construct(config).map_err(RecoveryError::Construction)?;
        let dag = construction.dag;
        let all_specs: Vec<serde_json::Value> = dag.nodes().map(node_spec_for_hash).collect();
        let upstream_topology_hash = stable_hash(&all_specs)?.to_string();

        let checkpoint_manager = CheckpointManager::new(self.store);
        let mut checkpoints = BTreeMap::new();
        for node in dag.nodes() {
            let Some(checkpoint) = checkpoint_manager.latest(run_id, &node.node_id)? else {
                continue;
            };
            let node_config_hash = stable_hash(&node_spec_for_hash(node))?.to_string();
            match CheckpointManager::verify(checkpoint, &upstream_topology_hash, &node_config_hash) {
                Some(verified) => {
                    checkpoints.insert(node.node_id.clone(), verified);
                }
                None => {
                    tracing::warn!(run_id = %run_id, node_id = %node.node_id, "discarding checkpoint written under a different topology or configuration");
                }
            }
        }

        let mut restored_batches = Vec::new();
        for batch in self.store.list_executing_batches(run_id)? {
            self.store.update_batch_status(&batch.batch_id, BatchStatus::Failed)?;
            self.store.increment_batch_attempt(&batch.batch_id)?;
            let members = self.store.list_batch_members(&batch.batch_id)?;
            restored_batches.push(RestoredBatch { aggregation_node_id: batch.aggregation_node_id, members });
        }

        Ok(RecoveryPlan { run, checkpoints, restored_batches })
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

    use std::collections::BTreeMap;

    use pw_core::core::model::RunStatus;
    use pw_dag::PipelineConfig;
    use pw_dag::config::SinkSpec;
    use pw_dag::config::SourceSpec;

    use super::RecoveryError;
    use super::RecoveryManager;

    fn minimal_config() -> PipelineConfig {
        PipelineConfig {
            source: SourceSpec { plugin: "test".to_owned(), options: serde_json::Value::Null, on_success: "sink".to_owned(), schema: None },
            transforms: Vec::new(),
            gates: Vec::new(),
            aggregations: Vec::new(),
            coalesce: Vec::new(),
            sinks: BTreeMap::from([("sink".to_owned(), SinkSpec { plugin: "test".to_owned(), options: serde_json::Value::Null })]),
            default_sink: None,
        }
    }

    #[test]
    fn refuses_to_resume_a_still_running_run() {
        let store = pw_store::SqliteLandscape::open_in_memory().expect("opens store");
        let config = minimal_config();
        let config_hash = pw_core::core::canonical::stable_hash(&config).expect("hashes").to_string();
        let run = store.begin_run(config_hash, "v1".to_owned()).expect("begins run");

        let manager = RecoveryManager::new(&store);
        let result = manager.resume(&run.run_id, &config);
        assert!(matches!(result, Err(RecoveryError::NotResumable(_, RunStatus::Running))));
    }

    #[test]
    fn refuses_to_resume_with_a_changed_config() {
        let store = pw_store::SqliteLandscape::open_in_memory().expect("opens store");
        let run = store.begin_run("stale-hash".to_owned(), "v1".to_owned()).expect("begins run");
        store.finalize_run(&run.run_id, RunStatus::Failed).expect("finalizes as failed");

        let manager = RecoveryManager::new(&store);
        let result = manager.resume(&run.run_id, &minimal_config());
        assert!(matches!(result, Err(RecoveryError::TopologyMismatch { .. })));
    }

    #[test]
    fn resumes_a_failed_run_with_matching_config() {
        let store = pw_store::SqliteLandscape::open_in_memory().expect("opens store");
        let config = minimal_config();
        let config_hash = pw_core::core::canonical::stable_hash(&config).expect("hashes").to_string();
        let run = store.begin_run(config_hash, "v1".to_owned()).expect("begins run");
        store.finalize_run(&run.run_id, RunStatus::Failed).expect("finalizes as failed");

        let manager = RecoveryManager::new(&store);
        let plan = manager.resume(&run.run_id, &config).expect("resumes");
        assert_eq!(plan.run.status, RunStatus::Failed);
        assert!(plan.checkpoints.is_empty());
        assert!(plan.restored_batches.is_empty());
    }
}
