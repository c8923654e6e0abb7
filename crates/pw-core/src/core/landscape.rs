// crates/pw-core/src/core/landscape.rs
// ============================================================================
// Module: Landscape Trait
// Description: The full audit-recording surface the orchestrator itself
// writes through (§4.3, §4.12), as opposed to `protocol::LandscapeRecorder`
// (the narrow seam a running plugin sees).
// Purpose: `pw-orchestrator` depends on this trait, not on `pw-store`'s
// `SqliteLandscape` concretely — `pw-cli` is the only crate that wires a
// real `SqliteLandscape` in, behind an `Arc<dyn Landscape>`.
// Dependencies: serde_json, crate::core::{identifiers, model}, crate::protocol
// ============================================================================

//! ## Overview
//! Every table group in §4.3 has one method here, grouped the same way
//! `pw-store`'s `store/*.rs` files are grouped: runs, topology, lineage,
//! states/routing/calls, batches, outcomes, artifacts, checkpoints. The
//! `New*` parameter structs mirror `pw-store`'s own, kept here so neither
//! crate needs to depend on the other to share them.

use serde_json::Value;

use crate::core::error::EngineError;
use crate::core::identifiers::BatchId;
use crate::core::identifiers::EdgeId;
use crate::core::identifiers::ExpandGroupId;
use crate::core::identifiers::ForkGroupId;
use crate::core::identifiers::JoinGroupId;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::RowId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;
use crate::core::model::Artifact;
use crate::core::model::Batch;
use crate::core::model::BatchMember;
use crate::core::model::BatchOutput;
use crate::core::model::BatchStatus;
use crate::core::model::Checkpoint;
use crate::core::model::Determinism;
use crate::core::model::Edge;
use crate::core::model::EdgeMode;
use crate::core::model::Node;
use crate::core::model::NodeState;
use crate::core::model::NodeStateStatus;
use crate::core::model::NodeType;
use crate::core::model::Row as AuditRow;
use crate::core::model::RoutingEvent;
use crate::core::model::RoutingMode;
use crate::core::model::Run;
use crate::core::model::RunStatus;
use crate::core::model::SchemaMode;
use crate::core::model::Token;
use crate::core::model::TokenOutcome;
use crate::core::model::TokenOutcomeKind;
use crate::protocol::LandscapeRecorder;

/// Every field needed to register a node, grouped to keep
/// [`Landscape::register_node`] under clippy's argument-count limit.
#[derive(Debug, Clone)]
pub struct NewNode {
    /// Caller-assigned node identifier, unique within the run.
    pub node_id: NodeId,
    /// Name of the plugin implementing this node.
    pub plugin_name: String,
    /// Structural role of this node.
    pub node_type: NodeType,
    /// Version string of the plugin implementation.
    pub plugin_version: String,
    /// Replay-determinism classification.
    pub determinism: Determinism,
    /// SHA-256 hash of this node's canonical configuration.
    pub config_hash: String,
    /// Canonical JSON of this node's configuration.
    pub config_json: Value,
    /// How this node's schema is established.
    pub schema_mode: SchemaMode,
    /// Declared or observed schema fields, if any.
    pub schema_fields: Option<Value>,
}

/// Every field needed to create a token, grouped to keep
/// [`Landscape::create_token`] under clippy's argument-count limit.
#[derive(Debug, Clone)]
pub struct NewToken {
    /// Row this token's lineage originates from.
    pub row_id: RowId,
    /// Parent tokens consumed to produce this token (zero for an initial
    /// token, one for fork/expand, more than one for coalesce).
    pub parents: Vec<TokenId>,
    /// Group shared by every sibling produced by the same fork.
    pub fork_group_id: Option<ForkGroupId>,
    /// Group shared by every sibling produced by the same expansion.
    pub expand_group_id: Option<ExpandGroupId>,
    /// Group shared by every parent merged into this token by a coalesce.
    pub join_group_id: Option<JoinGroupId>,
    /// Name of the fork branch this token is traversing, if any.
    pub branch_name: Option<String>,
}

/// Every field needed to open a node state, grouped to keep
/// [`Landscape::begin_node_state`] under clippy's argument-count limit.
#[derive(Debug, Clone)]
pub struct NewNodeState {
    /// Token visiting the node.
    pub token_id: TokenId,
    /// Node being visited.
    pub node_id: NodeId,
    /// Position of this visit in the token's execution path.
    pub step_index: u64,
    /// Attempt number; `0` for the first attempt.
    pub attempt: u32,
    /// SHA-256 hash of the canonical encoding of the input.
    pub input_hash: String,
    /// Canonical JSON snapshot of context before processing.
    pub context_before: Option<Value>,
}

/// Every field needed to complete a node state, grouped to keep
/// [`Landscape::complete_node_state`] under clippy's argument-count limit.
#[derive(Debug, Clone)]
pub struct NodeStateCompletion {
    /// Final status; must be `completed` or `failed`.
    pub status: NodeStateStatus,
    /// SHA-256 hash of the canonical encoding of the output, if produced.
    pub output_hash: Option<String>,
    /// Canonical JSON snapshot of context after processing.
    pub context_after: Option<Value>,
    /// Processing duration in milliseconds. Required at completion.
    pub duration_ms: f64,
    /// Canonical JSON of the error, if the outcome was a failure.
    pub error_json: Option<Value>,
    /// Canonical JSON of the success reason, if one was supplied.
    pub success_reason_json: Option<Value>,
}

/// One routing decision to record, before `routing_group_id` and `ordinal`
/// are assigned by [`Landscape::record_routing_events`].
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// Edge this route takes.
    pub edge_id: EdgeId,
    /// Mode this route is taken in.
    pub mode: RoutingMode,
}

/// Every field needed to register an artifact, grouped to keep
/// [`Landscape::register_artifact`] under clippy's argument-count limit.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    /// Node state that produced this artifact.
    pub state_id: StateId,
    /// Sink node that wrote this artifact.
    pub sink_node_id: NodeId,
    /// Sink-defined artifact type (e.g. `"csv_file"`).
    pub artifact_type: String,
    /// Path or URI where the artifact was written.
    pub path_or_uri: String,
    /// SHA-256 hash of the artifact's bytes on disk.
    pub content_hash: String,
    /// Size of the artifact in bytes.
    pub size_bytes: u64,
    /// Idempotency key allowing safe retry without duplicate artifacts.
    pub idempotency_key: Option<String>,
}

/// Every field needed to write a checkpoint, grouped to keep
/// [`Landscape::write_checkpoint`] under clippy's argument-count limit.
#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    /// Token this checkpoint is written for.
    pub token_id: TokenId,
    /// Node this checkpoint is written for.
    pub node_id: NodeId,
    /// SHA-256 hash over the canonical encoding of every upstream node spec.
    pub upstream_topology_hash: String,
    /// SHA-256 hash of this checkpoint node's canonical configuration.
    pub checkpoint_node_config_hash: String,
    /// Canonical JSON of aggregation state, if this checkpoint belongs to
    /// an aggregation node.
    pub aggregation_state_json: Option<Value>,
}

/// The full Landscape audit store surface the orchestrator engine writes
/// through. A supertrait of [`LandscapeRecorder`] so any `Landscape`
/// implementation is usable wherever a plugin context needs the narrower
/// seam.
pub trait Landscape: LandscapeRecorder {
    /// Inserts a new run in `running` status.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the write fails.
    fn begin_run(&self, config_hash: String, canonical_version: String) -> Result<Run, EngineError>;

    /// Records the source node's resolved schema and field-resolution
    /// mapping for a run.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the write fails.
    fn record_source_schema(&self, run_id: &RunId, schema_json: Value, field_resolution: Value) -> Result<(), EngineError>;

    /// Finalizes a run, computing its reproducibility grade.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the run does not exist or is already
    /// finalized.
    fn finalize_run(&self, run_id: &RunId, status: RunStatus) -> Result<Run, EngineError>;

    /// Downgrades a finalized run's reproducibility grade after purge.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the write fails.
    fn downgrade_to_attributable_only(&self, run_id: &RunId) -> Result<(), EngineError>;

    /// Reads a run by id.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if it does not exist.
    fn get_run(&self, run_id: &RunId) -> Result<Run, EngineError>;

    /// Registers a node's topology and resolved configuration.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if `node_id` is already registered.
    fn register_node(&self, run_id: &RunId, node: NewNode) -> Result<Node, EngineError>;

    /// Registers an edge's topology.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the write fails.
    fn register_edge(&self, run_id: &RunId, from_node_id: NodeId, to_node_id: NodeId, label: String, default_mode: EdgeMode) -> Result<Edge, EngineError>;

    /// Lists every node registered in a run, in registration order.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the read fails.
    fn list_nodes(&self, run_id: &RunId) -> Result<Vec<Node>, EngineError>;

    /// Lists every edge registered in a run.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the read fails.
    fn list_edges(&self, run_id: &RunId) -> Result<Vec<Edge>, EngineError>;

    /// Records a row read from a source node.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the write fails.
    fn create_row(&self, run_id: &RunId, source_node_id: &NodeId, row_index: u64, source_data_hash: String, source_data_ref: Option<String>) -> Result<AuditRow, EngineError>;

    /// Reads a row by id.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if it does not exist.
    fn get_row(&self, row_id: &RowId) -> Result<AuditRow, EngineError>;

    /// Creates a token and records its parent lineage.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the write fails.
    fn create_token(&self, run_id: &RunId, new: NewToken) -> Result<Token, EngineError>;

    /// Returns every parent recorded for `token_id`.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the read fails.
    fn token_parents(&self, token_id: &TokenId) -> Result<Vec<TokenId>, EngineError>;

    /// Opens a new node-state record in `open` status.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the write fails.
    fn begin_node_state(&self, run_id: &RunId, new: NewNodeState) -> Result<NodeState, EngineError>;

    /// Completes an open node state.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the state is not `open`, or if
    /// `completion.status` is not `completed`/`failed`.
    fn complete_node_state(&self, state_id: &StateId, completion: NodeStateCompletion) -> Result<NodeState, EngineError>;

    /// Reads a node state by id.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if it does not exist.
    fn get_node_state(&self, state_id: &StateId) -> Result<NodeState, EngineError>;

    /// Records a group of routing decisions made by one node state.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the write fails.
    fn record_routing_events(&self, state_id: &StateId, decisions: Vec<RoutingDecision>, reason_hash: Option<String>, reason_ref: Option<String>) -> Result<Vec<RoutingEvent>, EngineError>;

    /// Creates a new batch in `draft` status.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the write fails.
    fn create_batch(&self, run_id: &RunId, aggregation_node_id: &NodeId, trigger_type: String) -> Result<Batch, EngineError>;

    /// Updates a batch's lifecycle status.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the batch does not exist.
    fn update_batch_status(&self, batch_id: &BatchId, status: BatchStatus) -> Result<(), EngineError>;

    /// Re-registers a batch under a new attempt number after crash recovery.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the batch does not exist.
    fn increment_batch_attempt(&self, batch_id: &BatchId) -> Result<(), EngineError>;

    /// Adds a token as a member of a batch.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the write fails.
    fn add_batch_member(&self, batch_id: &BatchId, token_id: &TokenId, ordinal: u32) -> Result<BatchMember, EngineError>;

    /// Records a token produced by processing a batch.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the write fails.
    fn add_batch_output(&self, batch_id: &BatchId, token_id: &TokenId, parent_token_ids: Vec<TokenId>) -> Result<BatchOutput, EngineError>;

    /// Reads a batch by id.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if it does not exist.
    fn get_batch(&self, batch_id: &BatchId) -> Result<Batch, EngineError>;

    /// Lists the member tokens of a batch, in ordinal order.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the read fails.
    fn list_batch_members(&self, batch_id: &BatchId) -> Result<Vec<BatchMember>, EngineError>;

    /// Records a token's disposition.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if a terminal outcome already exists for
    /// this token.
    fn record_token_outcome(
        &self,
        run_id: &RunId,
        token_id: &TokenId,
        outcome: TokenOutcomeKind,
        sink_name: Option<String>,
        batch_id: Option<BatchId>,
        context_json: Value,
    ) -> Result<TokenOutcome, EngineError>;

    /// Returns the terminal outcome recorded for a token, if any.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the read fails.
    fn terminal_outcome(&self, token_id: &TokenId) -> Result<Option<TokenOutcome>, EngineError>;

    /// Registers an artifact, idempotently when a key is supplied.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the write fails.
    fn register_artifact(&self, run_id: &RunId, new: NewArtifact) -> Result<Artifact, EngineError>;

    /// Writes a new checkpoint, assigning the next sequence number.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the write fails.
    fn write_checkpoint(&self, run_id: &RunId, new: NewCheckpoint) -> Result<Checkpoint, EngineError>;

    /// Returns the most recent checkpoint written for `(run_id, node_id)`.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the read fails.
    fn latest_checkpoint(&self, run_id: &RunId, node_id: &NodeId) -> Result<Option<Checkpoint>, EngineError>;
}
