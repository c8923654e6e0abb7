// crates/pw-core/src/core/model.rs
// ============================================================================
// Module: Audit Data Model
// Description: Every entity recorded by the Landscape audit trail (§3).
// Purpose: Give every other crate a single, shared vocabulary for runs,
// nodes, edges, rows, tokens, node states, routing events, calls, batches,
// token outcomes, artifacts, and checkpoints.
// Dependencies: serde, time, crate::core::identifiers
// ============================================================================

//! ## Overview
//! These types are pure data: no crate in this workspace attaches behavior
//! to them beyond what their own invariants describe in doc comments. The
//! orchestrator constructs and threads them; the Landscape store persists
//! them; nothing reaches back into a running pipeline through one of these
//! records.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::core::identifiers::ArtifactId;
use crate::core::identifiers::BatchId;
use crate::core::identifiers::CheckpointId;
use crate::core::identifiers::EdgeId;
use crate::core::identifiers::EventId;
use crate::core::identifiers::ExpandGroupId;
use crate::core::identifiers::ForkGroupId;
use crate::core::identifiers::JoinGroupId;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::OutcomeId;
use crate::core::identifiers::RoutingGroupId;
use crate::core::identifiers::RowId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;

// ============================================================================
// SECTION: Run
// ============================================================================

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run is actively processing work items.
    Running,
    /// The run finished all work and was finalized successfully.
    Completed,
    /// The run aborted due to a fatal error.
    Failed,
    /// The run was cooperatively cancelled.
    Cancelled,
}

/// Reproducibility grade assigned at `finalize_run` (§4.12, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReproducibilityGrade {
    /// Every node touched was deterministic or seeded; replay is exact.
    FullReproducible,
    /// Some nodes are `io_read`/`io_write`/`external_call`/`non_deterministic`,
    /// but their payloads were captured and allow replay.
    ReplayReproducible,
    /// Replay payloads for non-deterministic nodes were purged, or were
    /// never captured; only the audit trail's attribution remains.
    AttributableOnly,
}

/// A single pipeline run.
///
/// # Invariants
/// - `completed_at` is `Some` iff `status != Running`.
/// - Once `status != Running`, the run is immutable: no further writes to
///   any table keyed by this `run_id` are permitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique run identifier.
    pub run_id: RunId,
    /// SHA-256 hash of the canonical pipeline configuration.
    pub config_hash: String,
    /// Canonical encoder version used to produce every hash in this run.
    pub canonical_version: String,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// Timestamp the run began.
    pub started_at: OffsetDateTime,
    /// Timestamp the run was finalized, if it has been.
    pub completed_at: Option<OffsetDateTime>,
    /// Reproducibility grade, set at finalization.
    pub reproducibility_grade: Option<ReproducibilityGrade>,
    /// Canonical JSON of the source node's resolved schema.
    pub source_schema_json: Option<Value>,
    /// Mapping of raw source field names to normalized field names, used to
    /// re-derive header mappings on resume.
    pub source_field_resolution: Option<Value>,
}

// ============================================================================
// SECTION: Node & Edge
// ============================================================================

/// The structural role a node plays in the DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Produces rows into the pipeline.
    Source,
    /// Transforms one row (or a batch of rows) into zero or more rows.
    Transform,
    /// Routes a row to one of several outgoing edges based on a condition.
    Gate,
    /// Buffers tokens until a trigger fires, then processes them as a batch.
    Aggregation,
    /// Merges multiple parent tokens into one child token.
    Coalesce,
    /// Terminal node that writes rows to durable storage.
    Sink,
}

/// Replay-determinism classification of a node (§3, §4.12 grading rule).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Determinism {
    /// Pure function of its input; replay always reproduces the same output.
    Deterministic,
    /// Uses a recorded random seed; replay reproduces the same output given
    /// the seed.
    Seeded,
    /// Reads external state (filesystem, clock, environment).
    IoRead,
    /// Writes external state.
    IoWrite,
    /// Calls an external service (LLM, HTTP, SQL) whose response may vary.
    ExternalCall,
    /// No determinism guarantee can be made.
    NonDeterministic,
}

/// How a node's schema is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaMode {
    /// Schema is inferred from the first row(s) observed.
    Observed,
    /// Schema is declared up front and enforced strictly.
    Fixed,
    /// No schema is enforced; any fields are accepted.
    Free,
    /// Schema varies per row and is validated per row.
    Dynamic,
}

/// A node in a run's DAG.
///
/// # Invariants
/// - `node_id` is unique within `run_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node identifier, unique within the run.
    pub node_id: NodeId,
    /// Run this node belongs to.
    pub run_id: RunId,
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
    /// Timestamp this node was registered at DAG construction.
    pub registered_at: OffsetDateTime,
}

/// How rows move along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeMode {
    /// The token is moved to the destination; no copy remains upstream.
    Move,
    /// The token is copied; an independent sibling continues downstream.
    Copy,
    /// The token is diverted, typically to an error-handling path.
    Divert,
}

/// An edge connecting two nodes in a run's DAG.
///
/// # Invariants
/// - `(from_node_id, to_node_id, label)` is unique within `run_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Edge identifier.
    pub edge_id: EdgeId,
    /// Run this edge belongs to.
    pub run_id: RunId,
    /// Upstream node.
    pub from_node_id: NodeId,
    /// Downstream node.
    pub to_node_id: NodeId,
    /// Named connection this edge represents.
    pub label: String,
    /// Default routing mode for this edge.
    pub default_mode: EdgeMode,
}

// ============================================================================
// SECTION: Row & Token
// ============================================================================

/// A row read from a source node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Row identifier.
    pub row_id: RowId,
    /// Run this row belongs to.
    pub run_id: RunId,
    /// Source node that produced this row.
    pub source_node_id: NodeId,
    /// Index of this row within the source's iteration order.
    pub row_index: u64,
    /// SHA-256 hash of the canonical encoding of the row's data.
    pub source_data_hash: String,
    /// Optional payload-store reference to the row's raw data.
    pub source_data_ref: Option<String>,
    /// Timestamp this row was read.
    pub created_at: OffsetDateTime,
}

/// A token tracing one lineage of row data through the DAG.
///
/// # Invariants
/// - At most one of `fork_group_id`, `expand_group_id`, `join_group_id` is
///   set (a token is produced by exactly one of fork, expand, or coalesce —
///   or by none, if it is an initial token).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Token identifier.
    pub token_id: TokenId,
    /// Row this token's lineage originates from.
    pub row_id: RowId,
    /// Parent token, if this token was produced by fork/expand/coalesce.
    pub parent_token_id: Option<TokenId>,
    /// Group shared by every sibling produced by the same fork.
    pub fork_group_id: Option<ForkGroupId>,
    /// Group shared by every sibling produced by the same expansion.
    pub expand_group_id: Option<ExpandGroupId>,
    /// Group shared by every parent merged into this token by a coalesce.
    pub join_group_id: Option<JoinGroupId>,
    /// Name of the fork branch this token is traversing, if any.
    pub branch_name: Option<String>,
    /// Timestamp this token was created.
    pub created_at: OffsetDateTime,
}

// ============================================================================
// SECTION: Node State
// ============================================================================

/// Lifecycle status of a node-state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStateStatus {
    /// The node has begun processing but has not yet completed.
    Open,
    /// The node is waiting on external work (a batch transform checkpointed).
    Pending,
    /// The node finished successfully.
    Completed,
    /// The node finished with an error.
    Failed,
}

/// A single node-state record: one token visiting one node, one attempt.
///
/// # Invariants
/// - `started_at <= completed_at`, when `completed_at` is set.
/// - `completed_at` is `Some` iff `status` is `Pending`, `Completed`, or
///   `Failed` (never for `Open`).
/// - `duration_ms` is required whenever completing a node state (enforced
///   by the recorder, not representable as a type-level invariant here
///   since it is only required at the completion boundary).
/// - Retrying a node re-records a new `NodeState` with `attempt` incremented;
///   a `NodeState` is terminal exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// State identifier.
    pub state_id: StateId,
    /// Token being processed.
    pub token_id: TokenId,
    /// Node processing the token.
    pub node_id: NodeId,
    /// Run this state belongs to (composite key with `node_id`).
    pub run_id: RunId,
    /// Position of this node visit in the token's execution path.
    pub step_index: u64,
    /// Attempt number; `0` for the first attempt.
    pub attempt: u32,
    /// Current status.
    pub status: NodeStateStatus,
    /// SHA-256 hash of the canonical encoding of the input.
    pub input_hash: String,
    /// SHA-256 hash of the canonical encoding of the output, once known.
    pub output_hash: Option<String>,
    /// Canonical JSON snapshot of context before processing.
    pub context_before: Option<Value>,
    /// Canonical JSON snapshot of context after processing.
    pub context_after: Option<Value>,
    /// Processing duration in milliseconds.
    pub duration_ms: Option<f64>,
    /// Canonical JSON of the error, if the outcome was a failure.
    pub error_json: Option<Value>,
    /// Canonical JSON of the success reason, if one was supplied.
    pub success_reason_json: Option<Value>,
    /// Timestamp processing began.
    pub started_at: OffsetDateTime,
    /// Timestamp processing ended, once terminal.
    pub completed_at: Option<OffsetDateTime>,
}

// ============================================================================
// SECTION: Routing Event
// ============================================================================

/// How a routing decision moved a token along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// The token moved along the edge.
    Move,
    /// The token was copied along the edge.
    Copy,
    /// The token was diverted along the edge.
    Divert,
}

/// A single routing decision recorded for a node state.
///
/// # Invariants
/// - Events produced by the same decision point share `routing_group_id`
///   with `ordinal` values `0..k-1`, in the order the routes were decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingEvent {
    /// Event identifier.
    pub event_id: EventId,
    /// Node state that made this routing decision.
    pub state_id: StateId,
    /// Edge that was taken.
    pub edge_id: EdgeId,
    /// Group shared by every event from the same routing decision.
    pub routing_group_id: RoutingGroupId,
    /// Position of this event within its routing group.
    pub ordinal: u32,
    /// Routing mode for this event.
    pub mode: RoutingMode,
    /// SHA-256 hash of the canonical encoding of the reason, if any.
    pub reason_hash: Option<String>,
    /// Payload-store reference to the reason, shared across the group.
    pub reason_ref: Option<String>,
    /// Timestamp this event was recorded.
    pub created_at: OffsetDateTime,
}

// ============================================================================
// SECTION: Call
// ============================================================================

/// The kind of external call a plugin made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    /// A call to a large language model provider.
    Llm,
    /// An HTTP request.
    Http,
    /// A SQL query.
    Sql,
    /// A filesystem operation.
    Filesystem,
}

/// The outcome of an external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// The call succeeded.
    Success,
    /// The call failed.
    Error,
}

/// A single external call made while processing a node state.
///
/// # Invariants
/// - `call_index` is monotonic per `state_id`, starting at `0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Node state this call was made on behalf of.
    pub state_id: StateId,
    /// Position of this call within its node state.
    pub call_index: u32,
    /// Kind of call made.
    pub call_type: CallType,
    /// Outcome of the call.
    pub status: CallStatus,
    /// SHA-256 hash of the canonical encoding of the request.
    pub request_hash: String,
    /// SHA-256 hash of the canonical encoding of the response, if any.
    pub response_hash: Option<String>,
    /// Canonical JSON of the error, if the call failed.
    pub error_json: Option<Value>,
    /// Call duration in milliseconds.
    pub latency_ms: f64,
    /// Whether the orchestrator may retry this kind of failure.
    pub retryable: bool,
}

// ============================================================================
// SECTION: Batch
// ============================================================================

/// Lifecycle status of an aggregation batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// The batch has been created but is not yet accepting members.
    Draft,
    /// The batch is accumulating members, waiting for a trigger.
    Assembling,
    /// The batch's trigger fired and it is being processed.
    Executing,
    /// The batch finished processing successfully.
    Completed,
    /// The batch finished processing with an error.
    Failed,
}

/// An aggregation batch: a set of tokens buffered for combined processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Batch identifier.
    pub batch_id: BatchId,
    /// Run this batch belongs to.
    pub run_id: RunId,
    /// Aggregation node this batch belongs to.
    pub aggregation_node_id: NodeId,
    /// Attempt number; incremented on crash-recovery retry.
    pub attempt: u32,
    /// Current status.
    pub status: BatchStatus,
    /// The trigger condition that will fire (or fired) this batch.
    pub trigger_type: String,
    /// Timestamp this batch was created.
    pub created_at: OffsetDateTime,
}

/// A token buffered as a member of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMember {
    /// Batch this token is a member of.
    pub batch_id: BatchId,
    /// Member token.
    pub token_id: TokenId,
    /// Position of this token within the batch.
    pub ordinal: u32,
}

/// A token produced by processing a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutput {
    /// Batch that produced this output.
    pub batch_id: BatchId,
    /// Produced token.
    pub token_id: TokenId,
    /// Parent tokens consumed to produce this output.
    pub parent_token_ids: Vec<TokenId>,
}

// ============================================================================
// SECTION: Token Outcome
// ============================================================================

/// The terminal or non-terminal disposition of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenOutcomeKind {
    /// The token reached a sink and was written successfully.
    Completed,
    /// The token was routed elsewhere (including a late quorum arrival).
    Routed,
    /// The token is buffered in an aggregation batch, awaiting the trigger.
    Buffered,
    /// The token was consumed as a member of a completed batch.
    ConsumedInBatch,
    /// The token's processing failed terminally.
    Failed,
    /// The token was discarded (e.g. quarantined at the source).
    Discarded,
}

impl TokenOutcomeKind {
    /// Returns true when this outcome ends the token's lineage permanently.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Discarded | Self::ConsumedInBatch
        )
    }
}

/// The recorded disposition of a token.
///
/// # Invariants
/// - At most one terminal `TokenOutcome` exists per `token_id` (enforced by
///   a partial unique index in the Landscape store).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenOutcome {
    /// Outcome identifier.
    pub outcome_id: OutcomeId,
    /// Run this outcome belongs to.
    pub run_id: RunId,
    /// Token this outcome describes.
    pub token_id: TokenId,
    /// Kind of outcome.
    pub outcome: TokenOutcomeKind,
    /// Whether this outcome is terminal for the token's lineage.
    pub is_terminal: bool,
    /// Sink that produced this outcome, if any.
    pub sink_name: Option<String>,
    /// Batch this outcome relates to, if any.
    pub batch_id: Option<BatchId>,
    /// Canonical JSON context explaining the outcome.
    pub context_json: Value,
}

// ============================================================================
// SECTION: Artifact
// ============================================================================

/// An artifact emitted by a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact identifier.
    pub artifact_id: ArtifactId,
    /// Run this artifact belongs to.
    pub run_id: RunId,
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
    /// Timestamp this artifact was registered.
    pub created_at: OffsetDateTime,
}

// ============================================================================
// SECTION: Checkpoint
// ============================================================================

/// A checkpoint binding in-flight state to the DAG topology that produced it.
///
/// # Invariants
/// - `(run_id, node_id, token_id)` identifies at most one latest checkpoint;
///   `sequence_number` is monotonic per node.
/// - `upstream_topology_hash` and `checkpoint_node_config_hash` are both
///   non-null; resume recomputes and compares both before trusting the
///   checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint identifier.
    pub checkpoint_id: CheckpointId,
    /// Run this checkpoint belongs to.
    pub run_id: RunId,
    /// Token this checkpoint was written for.
    pub token_id: TokenId,
    /// Node this checkpoint was written for.
    pub node_id: NodeId,
    /// Monotonic sequence number, per node.
    pub sequence_number: u64,
    /// SHA-256 hash over the canonical encoding of every upstream node spec.
    pub upstream_topology_hash: String,
    /// SHA-256 hash of this checkpoint node's canonical configuration.
    pub checkpoint_node_config_hash: String,
    /// Canonical JSON of aggregation state (buffer, sums, row mapping,
    /// batch id), if this checkpoint belongs to an aggregation node.
    pub aggregation_state_json: Option<Value>,
    /// Timestamp this checkpoint was written.
    pub created_at: OffsetDateTime,
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

    use super::*;

    #[test]
    fn token_outcome_kind_terminality_matches_spec() {
        assert!(TokenOutcomeKind::Completed.is_terminal());
        assert!(TokenOutcomeKind::Failed.is_terminal());
        assert!(TokenOutcomeKind::Discarded.is_terminal());
        assert!(TokenOutcomeKind::ConsumedInBatch.is_terminal());
        assert!(!TokenOutcomeKind::Routed.is_terminal());
        assert!(!TokenOutcomeKind::Buffered.is_terminal());
    }

    #[test]
    fn node_state_status_serializes_snake_case() {
        let json = serde_json::to_string(&NodeStateStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }

    #[test]
    fn reproducibility_grade_serializes_snake_case() {
        let json = serde_json::to_string(&ReproducibilityGrade::FullReproducible).unwrap();
        assert_eq!(json, "\"full_reproducible\"");
    }
}
