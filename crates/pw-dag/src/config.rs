// crates/pw-dag/src/config.rs
// ============================================================================
// Module: Pipeline Configuration Schema
// Description: The deserializable shape of a pipeline configuration
// document (§6): source, transforms, gates, aggregations, coalesce points,
// sinks, and the default sink.
// Purpose: Give `pw-cli`'s loader (TOML or YAML) and `pw-dag::construct` a
// single, shared schema, so the on-disk document and the construction pass
// never drift apart.
// Dependencies: serde, serde_json, pw-core (schema contracts)
// ============================================================================

//! ## Overview
//! Every node kind reuses [`pw_core::core::schema::SchemaContract`] directly
//! for its optional `schema` declaration rather than a parallel type, since
//! a contract is already the exact shape `register_node` needs. `options`
//! fields are left as an opaque `serde_json::Value`: a plugin's option
//! schema is plugin-defined and explicitly out of this engine's scope.

use std::collections::BTreeMap;

use pw_core::core::schema::SchemaContract;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// A full pipeline configuration document (§6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// The pipeline's single source.
    pub source: SourceSpec,
    /// Row-wise and batch-aware transforms.
    #[serde(default)]
    pub transforms: Vec<TransformSpec>,
    /// Conditional routing nodes.
    #[serde(default)]
    pub gates: Vec<GateSpec>,
    /// Buffering/triggered aggregation nodes.
    #[serde(default)]
    pub aggregations: Vec<AggregationSpec>,
    /// Multi-parent merge points.
    #[serde(default)]
    pub coalesce: Vec<CoalesceSpec>,
    /// Named sinks, keyed by sink name.
    pub sinks: BTreeMap<String, SinkSpec>,
    /// The sink used when a node's `on_success` names no explicit route.
    #[serde(default)]
    pub default_sink: Option<String>,
}

/// The pipeline's source node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Name of the plugin implementing this source.
    pub plugin: String,
    /// Plugin-defined configuration options.
    #[serde(default)]
    pub options: Value,
    /// Connection name or sink name this source's rows flow into.
    pub on_success: String,
    /// Declared schema contract, if any.
    #[serde(default)]
    pub schema: Option<SchemaContract>,
}

/// A row-wise or batch-aware transform node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformSpec {
    /// Node name, unique within the pipeline.
    pub name: String,
    /// Name of the plugin implementing this transform.
    pub plugin: String,
    /// Connection name this transform consumes.
    pub input: String,
    /// Connection name or sink name this transform's output flows into.
    pub on_success: String,
    /// Plugin-defined configuration options.
    #[serde(default)]
    pub options: Value,
    /// Declared schema contract, if any.
    #[serde(default)]
    pub schema: Option<SchemaContract>,
}

/// A conditional routing node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSpec {
    /// Node name, unique within the pipeline.
    pub name: String,
    /// Connection name this gate consumes.
    pub input: String,
    /// Restricted condition expression (§6) evaluated against each row.
    pub condition: String,
    /// Outcome label to destination connection/sink name.
    pub routes: BTreeMap<String, String>,
}

/// How an aggregation's buffered output replaces or augments its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// The plugin's output replaces the buffered rows.
    Transform,
    /// The plugin's output is appended to the buffered rows.
    Passthrough,
}

/// The condition under which a buffered batch is flushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Flush once this many tokens are buffered.
    #[serde(default)]
    pub count: Option<u64>,
    /// Flush once this many seconds have elapsed since the first buffered
    /// token arrived.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Flush once this restricted condition expression (§6) evaluates
    /// true against the batch's accumulated field map.
    #[serde(default)]
    pub condition: Option<String>,
}

/// A buffering/triggered aggregation node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    /// Node name, unique within the pipeline.
    pub name: String,
    /// Name of the plugin implementing this aggregation's batch processing.
    pub plugin: String,
    /// Connection name this aggregation consumes.
    pub input: String,
    /// Connection name or sink name this aggregation's output flows into.
    pub on_success: String,
    /// The trigger that flushes the buffered batch.
    pub trigger: TriggerSpec,
    /// Whether the plugin's output replaces or augments the buffer.
    pub output_mode: OutputMode,
    /// Plugin-defined configuration options.
    #[serde(default)]
    pub options: Value,
    /// Declared schema contract, if any.
    #[serde(default)]
    pub schema: Option<SchemaContract>,
}

/// The policy governing how many coalesce branches must arrive before a
/// merge proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalescePolicy {
    /// Every branch must arrive.
    RequireAll,
    /// A configured minimum count of branches must arrive.
    Quorum,
    /// Whatever branches have arrived by `timeout_seconds` are merged.
    BestEffort,
}

/// How arrived branches are merged into one child token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Field-wise union of every arrived branch's row data.
    Union,
    /// The first branch to arrive is used; the rest are discarded.
    FirstComplete,
}

/// A multi-parent merge point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoalesceSpec {
    /// Node name, unique within the pipeline. Each entry in `branches` of
    /// a gate's `routes` that targets this coalesce point must spell this
    /// name exactly.
    pub name: String,
    /// Connection names this coalesce point consumes, one per branch.
    pub branches: Vec<String>,
    /// How many branches must arrive before merging.
    pub policy: CoalescePolicy,
    /// Required arrival count under `policy: quorum`.
    #[serde(default)]
    pub quorum_count: Option<u32>,
    /// Maximum wait under `policy: best_effort`.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// How arrived branches are combined.
    pub merge: MergeStrategy,
    /// Connection name or sink name the merged token flows into.
    pub on_success: String,
}

/// A terminal sink node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkSpec {
    /// Name of the plugin implementing this sink.
    pub plugin: String,
    /// Plugin-defined configuration options.
    #[serde(default)]
    pub options: Value,
}
