// crates/pw-orchestrator/src/lib.rs
// ============================================================================
// Crate: pw-orchestrator
// Description: The token-based orchestrator that drives a validated DAG to
// completion (§4.7, §4.9-§4.12): lineage management, the pooled executor a
// pooled node dispatches through, checkpoint writing, crash recovery, and
// the engine loop tying all of it to `pw-dag`'s navigator and `pw-store`'s
// Landscape recorder.
// Dependencies: pw-core, pw-dag, pw-condition, pw-store, serde_json,
// thiserror, tracing
// ============================================================================

//! ## Overview
//! [`token`] owns fork/expand/coalesce lineage and the in-memory row data a
//! live token carries between node visits. [`pool`] is the bounded
//! worker-pool subsystem a pooled transform or aggregation dispatches
//! through. [`checkpoint`] binds a checkpoint to the topology and
//! configuration it was produced under. [`recovery`] reconstructs a crashed
//! run's in-flight state before [`engine::Orchestrator`] resumes it.
//! [`engine`] is the cooperative work-queue loop that ties all of the above,
//! plus `pw_dag::navigator::DagNavigator` and `pw_store::SqliteLandscape`,
//! into one driver a host process calls `run`/`resume` on.

pub mod checkpoint;
pub mod engine;
pub mod ids;
pub mod pool;
pub mod recovery;
pub mod token;

pub use checkpoint::CheckpointManager;
pub use checkpoint::CheckpointManagerError;
pub use checkpoint::SinksFlushed;
pub use checkpoint::mark_sinks_flushed;
pub use engine::Orchestrator;
pub use engine::OrchestratorError;
pub use engine::PluginRegistry;
pub use engine::RunSummary;
pub use recovery::RecoveryError;
pub use recovery::RecoveryManager;
pub use recovery::RecoveryPlan;
pub use recovery::RestoredBatch;
pub use token::TokenManager;
pub use token::TokenManagerError;
