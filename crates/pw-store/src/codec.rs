// crates/pw-store/src/codec.rs
// ============================================================================
// Module: Enum Codec
// Description: String encode/decode for every `pw_core::core::model` enum
// stored as `TEXT` in the Landscape schema.
// Purpose: One shared conversion per enum so every table agrees on its
// spelling; `serde`'s own `rename_all = "snake_case"` already fixes the
// wire spelling, so this module just mirrors it in a form `rusqlite` can
// bind directly without going through a JSON round trip for a single atom.
// Dependencies: pw-core
// ============================================================================

use pw_core::core::model::BatchStatus;
use pw_core::core::model::CallStatus;
use pw_core::core::model::CallType;
use pw_core::core::model::Determinism;
use pw_core::core::model::EdgeMode;
use pw_core::core::model::NodeStateStatus;
use pw_core::core::model::NodeType;
use pw_core::core::model::ReproducibilityGrade;
use pw_core::core::model::RoutingMode;
use pw_core::core::model::RunStatus;
use pw_core::core::model::SchemaMode;
use pw_core::core::model::TokenOutcomeKind;

use crate::error::StoreError;

fn unknown(kind: &str, text: &str) -> StoreError {
    StoreError::Decode(format!("unknown {kind} '{text}'"))
}

/// Encodes/decodes [`RunStatus`].
pub fn run_status_str(value: RunStatus) -> &'static str {
    match value {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

/// Decodes a stored [`RunStatus`].
///
/// # Errors
///
/// Returns [`StoreError::Decode`] if `text` is not a recognized value.
pub fn parse_run_status(text: &str) -> Result<RunStatus, StoreError> {
    match text {
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        other => Err(unknown("run status", other)),
    }
}

/// Encodes [`ReproducibilityGrade`].
pub fn reproducibility_grade_str(value: ReproducibilityGrade) -> &'static str {
    match value {
        ReproducibilityGrade::FullReproducible => "full_reproducible",
        ReproducibilityGrade::ReplayReproducible => "replay_reproducible",
        ReproducibilityGrade::AttributableOnly => "attributable_only",
    }
}

/// Decodes a stored [`ReproducibilityGrade`].
///
/// # Errors
///
/// Returns [`StoreError::Decode`] if `text` is not a recognized value.
pub fn parse_reproducibility_grade(text: &str) -> Result<ReproducibilityGrade, StoreError> {
    match text {
        "full_reproducible" => Ok(ReproducibilityGrade::FullReproducible),
        "replay_reproducible" => Ok(ReproducibilityGrade::ReplayReproducible),
        "attributable_only" => Ok(ReproducibilityGrade::AttributableOnly),
        other => Err(unknown("reproducibility grade", other)),
    }
}

/// Encodes [`NodeType`].
pub fn node_type_str(value: NodeType) -> &'static str {
    match value {
        NodeType::Source => "source",
        NodeType::Transform => "transform",
        NodeType::Gate => "gate",
        NodeType::Aggregation => "aggregation",
        NodeType::Coalesce => "coalesce",
        NodeType::Sink => "sink",
    }
}

/// Decodes a stored [`NodeType`].
///
/// # Errors
///
/// Returns [`StoreError::Decode`] if `text` is not a recognized value.
pub fn parse_node_type(text: &str) -> Result<NodeType, StoreError> {
    match text {
        "source" => Ok(NodeType::Source),
        "transform" => Ok(NodeType::Transform),
        "gate" => Ok(NodeType::Gate),
        "aggregation" => Ok(NodeType::Aggregation),
        "coalesce" => Ok(NodeType::Coalesce),
        "sink" => Ok(NodeType::Sink),
        other => Err(unknown("node type", other)),
    }
}

/// Encodes [`Determinism`].
pub fn determinism_str(value: Determinism) -> &'static str {
    match value {
        Determinism::Deterministic => "deterministic",
        Determinism::Seeded => "seeded",
        Determinism::IoRead => "io_read",
        Determinism::IoWrite => "io_write",
        Determinism::ExternalCall => "external_call",
        Determinism::NonDeterministic => "non_deterministic",
    }
}

/// Decodes a stored [`Determinism`].
///
/// # Errors
///
/// Returns [`StoreError::Decode`] if `text` is not a recognized value.
pub fn parse_determinism(text: &str) -> Result<Determinism, StoreError> {
    match text {
        "deterministic" => Ok(Determinism::Deterministic),
        "seeded" => Ok(Determinism::Seeded),
        "io_read" => Ok(Determinism::IoRead),
        "io_write" => Ok(Determinism::IoWrite),
        "external_call" => Ok(Determinism::ExternalCall),
        "non_deterministic" => Ok(Determinism::NonDeterministic),
        other => Err(unknown("determinism", other)),
    }
}

/// Encodes [`SchemaMode`].
pub fn schema_mode_str(value: SchemaMode) -> &'static str {
    match value {
        SchemaMode::Observed => "observed",
        SchemaMode::Fixed => "fixed",
        SchemaMode::Free => "free",
        SchemaMode::Dynamic => "dynamic",
    }
}

/// Decodes a stored [`SchemaMode`].
///
/// # Errors
///
/// Returns [`StoreError::Decode`] if `text` is not a recognized value.
pub fn parse_schema_mode(text: &str) -> Result<SchemaMode, StoreError> {
    match text {
        "observed" => Ok(SchemaMode::Observed),
        "fixed" => Ok(SchemaMode::Fixed),
        "free" => Ok(SchemaMode::Free),
        "dynamic" => Ok(SchemaMode::Dynamic),
        other => Err(unknown("schema mode", other)),
    }
}

/// Encodes [`EdgeMode`].
pub fn edge_mode_str(value: EdgeMode) -> &'static str {
    match value {
        EdgeMode::Move => "move",
        EdgeMode::Copy => "copy",
        EdgeMode::Divert => "divert",
    }
}

/// Decodes a stored [`EdgeMode`].
///
/// # Errors
///
/// Returns [`StoreError::Decode`] if `text` is not a recognized value.
pub fn parse_edge_mode(text: &str) -> Result<EdgeMode, StoreError> {
    match text {
        "move" => Ok(EdgeMode::Move),
        "copy" => Ok(EdgeMode::Copy),
        "divert" => Ok(EdgeMode::Divert),
        other => Err(unknown("edge mode", other)),
    }
}

/// Encodes [`NodeStateStatus`].
pub fn node_state_status_str(value: NodeStateStatus) -> &'static str {
    match value {
        NodeStateStatus::Open => "open",
        NodeStateStatus::Pending => "pending",
        NodeStateStatus::Completed => "completed",
        NodeStateStatus::Failed => "failed",
    }
}

/// Decodes a stored [`NodeStateStatus`].
///
/// # Errors
///
/// Returns [`StoreError::Decode`] if `text` is not a recognized value.
pub fn parse_node_state_status(text: &str) -> Result<NodeStateStatus, StoreError> {
    match text {
        "open" => Ok(NodeStateStatus::Open),
        "pending" => Ok(NodeStateStatus::Pending),
        "completed" => Ok(NodeStateStatus::Completed),
        "failed" => Ok(NodeStateStatus::Failed),
        other => Err(unknown("node state status", other)),
    }
}

/// Encodes [`RoutingMode`].
pub fn routing_mode_str(value: RoutingMode) -> &'static str {
    match value {
        RoutingMode::Move => "move",
        RoutingMode::Copy => "copy",
        RoutingMode::Divert => "divert",
    }
}

/// Decodes a stored [`RoutingMode`].
///
/// # Errors
///
/// Returns [`StoreError::Decode`] if `text` is not a recognized value.
pub fn parse_routing_mode(text: &str) -> Result<RoutingMode, StoreError> {
    match text {
        "move" => Ok(RoutingMode::Move),
        "copy" => Ok(RoutingMode::Copy),
        "divert" => Ok(RoutingMode::Divert),
        other => Err(unknown("routing mode", other)),
    }
}

/// Encodes [`CallType`].
pub fn call_type_str(value: CallType) -> &'static str {
    match value {
        CallType::Llm => "llm",
        CallType::Http => "http",
        CallType::Sql => "sql",
        CallType::Filesystem => "filesystem",
    }
}

/// Decodes a stored [`CallType`].
///
/// # Errors
///
/// Returns [`StoreError::Decode`] if `text` is not a recognized value.
pub fn parse_call_type(text: &str) -> Result<CallType, StoreError> {
    match text {
        "llm" => Ok(CallType::Llm),
        "http" => Ok(CallType::Http),
        "sql" => Ok(CallType::Sql),
        "filesystem" => Ok(CallType::Filesystem),
        other => Err(unknown("call type", other)),
    }
}

/// Encodes [`CallStatus`].
pub fn call_status_str(value: CallStatus) -> &'static str {
    match value {
        CallStatus::Success => "success",
        CallStatus::Error => "error",
    }
}

/// Decodes a stored [`CallStatus`].
///
/// # Errors
///
/// Returns [`StoreError::Decode`] if `text` is not a recognized value.
pub fn parse_call_status(text: &str) -> Result<CallStatus, StoreError> {
    match text {
        "success" => Ok(CallStatus::Success),
        "error" => Ok(CallStatus::Error),
        other => Err(unknown("call status", other)),
    }
}

/// Encodes [`BatchStatus`].
pub fn batch_status_str(value: BatchStatus) -> &'static str {
    match value {
        BatchStatus::Draft => "draft",
        BatchStatus::Assembling => "assembling",
        BatchStatus::Executing => "executing",
        BatchStatus::Completed => "completed",
        BatchStatus::Failed => "failed",
    }
}

/// Decodes a stored [`BatchStatus`].
///
/// # Errors
///
/// Returns [`StoreError::Decode`] if `text` is not a recognized value.
pub fn parse_batch_status(text: &str) -> Result<BatchStatus, StoreError> {
    match text {
        "draft" => Ok(BatchStatus::Draft),
        "assembling" => Ok(BatchStatus::Assembling),
        "executing" => Ok(BatchStatus::Executing),
        "completed" => Ok(BatchStatus::Completed),
        "failed" => Ok(BatchStatus::Failed),
        other => Err(unknown("batch status", other)),
    }
}

/// Encodes [`TokenOutcomeKind`].
pub fn token_outcome_kind_str(value: TokenOutcomeKind) -> &'static str {
    match value {
        TokenOutcomeKind::Completed => "completed",
        TokenOutcomeKind::Routed => "routed",
        TokenOutcomeKind::Buffered => "buffered",
        TokenOutcomeKind::ConsumedInBatch => "consumed_in_batch",
        TokenOutcomeKind::Failed => "failed",
        TokenOutcomeKind::Discarded => "discarded",
    }
}

/// Decodes a stored [`TokenOutcomeKind`].
///
/// # Errors
///
/// Returns [`StoreError::Decode`] if `text` is not a recognized value.
pub fn parse_token_outcome_kind(text: &str) -> Result<TokenOutcomeKind, StoreError> {
    match text {
        "completed" => Ok(TokenOutcomeKind::Completed),
        "routed" => Ok(TokenOutcomeKind::Routed),
        "buffered" => Ok(TokenOutcomeKind::Buffered),
        "consumed_in_batch" => Ok(TokenOutcomeKind::ConsumedInBatch),
        "failed" => Ok(TokenOutcomeKind::Failed),
        "discarded" => Ok(TokenOutcomeKind::Discarded),
        other => Err(unknown("token outcome kind", other)),
    }
}
