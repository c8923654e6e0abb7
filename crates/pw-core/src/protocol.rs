// crates/pw-core/src/protocol.rs
// ============================================================================
// Module: Plugin Protocols
// Description: The traits a host process implements plugins against
// (`Source`, `Transform`, `BatchTransform`, `Gate`, `Sink`), their result
// types, and the `PluginContext` every plugin call receives (§4.6).
// Purpose: Plugins see the engine only through this surface; nothing here
// depends on `pw-store` or `pw-payload` concretely, so plugin authors never
// need either crate, and `pw-core` stays dependency-free of its siblings.
// Dependencies: serde_json, crate::core::{identifiers, model, schema}
// ============================================================================

//! ## Overview
//! §4.6 describes five plugin kinds talking to the engine through five
//! narrow traits, plus a context object threading the recorder, payload
//! store, tracer hook, and checkpoint slot through every call without the
//! plugin ever holding a concrete store type. `LandscapeRecorder`,
//! `PayloadStore`, `Tracer`, and `SinkRouter` are the trait-object seams:
//! `pw-store` and `pw-payload` implement the first two, the orchestrator
//! implements the rest, and `pw-core` names only the interfaces.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::core::error::EngineError;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;
use crate::core::model::CallStatus;
use crate::core::model::CallType;
use crate::core::schema::SchemaContract;

// ============================================================================
// SECTION: Rows
// ============================================================================

/// A row produced by a source, before or after passing validation.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRow {
    /// A row that passed validation, carrying its locked schema contract.
    Valid {
        /// The row's field data.
        data: Value,
        /// The schema contract this row is pinned to for its lifetime.
        contract: Arc<SchemaContract>,
    },
    /// A row that failed validation, quarantined with a reason.
    Quarantined {
        /// The offending row data.
        data: Value,
        /// Human-readable reason the row was quarantined.
        reason: String,
    },
}

/// A row flowing between plugins downstream of the source, always carrying
/// its pinned contract.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRow {
    /// The row's field data.
    pub data: Value,
    /// The schema contract this row is pinned to.
    pub contract: Arc<SchemaContract>,
}

// ============================================================================
// SECTION: Transform Result
// ============================================================================

/// The outcome of a transform's `process` call (§4.6).
#[derive(Debug, Clone, PartialEq)]
pub enum TransformResult {
    /// The row was transformed successfully.
    Success {
        /// The transformed row.
        row: PipelineRow,
        /// Optional human-readable reason recorded with the success.
        success_reason: Option<Value>,
    },
    /// The transform produced multiple rows from one input (deaggregation).
    SuccessMulti {
        /// The produced rows.
        rows: Vec<PipelineRow>,
        /// Optional human-readable reason recorded with the success.
        success_reason: Option<Value>,
    },
    /// The transform failed.
    Error {
        /// Human-readable failure reason.
        reason: Value,
        /// Whether the orchestrator's retry policy applies to this failure.
        retryable: bool,
    },
    /// The transform is a batch transform awaiting external completion; the
    /// orchestrator writes the given checkpoint and enqueues a resume.
    Pending {
        /// Opaque checkpoint state the transform will need on resume.
        checkpoint: Value,
    },
}

// ============================================================================
// SECTION: Artifact Descriptor
// ============================================================================

/// Describes an artifact a sink wrote, returned from `Sink::write`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactDescriptor {
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

// ============================================================================
// SECTION: Plugin Traits
// ============================================================================

/// A node that produces rows into the pipeline.
pub trait Source: Send + Sync {
    /// Loads rows from this source, in iteration order.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the source cannot begin iterating at
    /// all (a configuration or I/O failure); per-row validation failures
    /// are represented as [`SourceRow::Quarantined`], not an `Err`.
    fn load(&self, ctx: &PluginContext) -> Result<Box<dyn Iterator<Item = SourceRow>>, EngineError>;
}

/// A node that transforms one row into zero or more rows.
pub trait Transform: Send + Sync {
    /// Processes a single row.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] only for failures outside the plugin's own
    /// control (context misuse); ordinary processing failures are reported
    /// through [`TransformResult::Error`].
    fn process(&self, row: PipelineRow, ctx: &mut PluginContext) -> Result<TransformResult, EngineError>;

    /// Whether this transform emits multiple child tokens per input row.
    fn creates_tokens(&self) -> bool {
        false
    }
}

/// A node that buffers tokens and processes them together on trigger fire.
pub trait BatchTransform: Send + Sync {
    /// Processes a batch of rows assembled by an aggregation node.
    ///
    /// # Errors
    ///
    /// See [`Transform::process`].
    fn process_batch(
        &self,
        rows: Vec<PipelineRow>,
        ctx: &mut PluginContext,
    ) -> Result<TransformResult, EngineError>;
}

/// A node that routes a row to one of several outgoing edges.
pub trait Gate: Send + Sync {
    /// Evaluates this gate's condition against a row, returning the
    /// outcome label whose value selects an outgoing edge.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the condition expression cannot be
    /// evaluated against the row (e.g. a referenced field is absent and no
    /// default applies).
    fn evaluate(&self, row: &PipelineRow, ctx: &PluginContext) -> Result<String, EngineError>;
}

/// A terminal node that writes rows to durable storage.
pub trait Sink: Send + Sync {
    /// Writes a batch of rows, returning a descriptor of what was written.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the write fails.
    fn write(&mut self, rows: Vec<Value>, ctx: &mut PluginContext) -> Result<ArtifactDescriptor, EngineError>;

    /// Ensures durability (explicit fsync semantics) of everything written
    /// so far. The orchestrator calls this before taking a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if durability cannot be guaranteed.
    fn flush(&mut self) -> Result<(), EngineError>;

    /// Closes the sink. Idempotent: calling this more than once is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if releasing underlying resources fails.
    fn close(&mut self) -> Result<(), EngineError>;

    /// Whether this sink can resume an interrupted write after a crash.
    fn supports_resume(&self) -> bool {
        false
    }

    /// Validates that this sink's output target still matches the
    /// configured schema. Called when resuming a sink that
    /// [`Sink::supports_resume`].
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the target's current schema no longer
    /// matches what was configured.
    fn validate_output_target(&self, contract: &SchemaContract) -> Result<(), EngineError>;
}

// ============================================================================
// SECTION: Host Seams
// ============================================================================

/// One external call a plugin reports through [`PluginContext::record_call`].
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
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

/// The audit-recording seam a plugin context calls into. Implemented by
/// `pw-store`'s Landscape recorder; never implemented by a plugin itself.
pub trait LandscapeRecorder: Send + Sync {
    /// Records one external call made on behalf of `state_id`.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the write fails or `state_id` does not
    /// refer to an open node state.
    fn record_call(&self, state_id: &StateId, call: CallRecord) -> Result<(), EngineError>;

    /// Records a source-row validation failure, returning the token id
    /// created to track it.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the write fails.
    fn record_validation_error(&self, run_id: &RunId, reason: Value) -> Result<TokenId, EngineError>;

    /// Records a transform processing failure, returning the token id
    /// created to track it.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the write fails.
    fn record_transform_error(&self, state_id: &StateId, reason: Value) -> Result<TokenId, EngineError>;
}

/// The content-addressed payload seam a plugin context calls into.
/// Implemented by `pw-payload`'s filesystem store.
pub trait PayloadStore: Send + Sync {
    /// Stores bytes, returning their content digest.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the write fails.
    fn store(&self, bytes: &[u8]) -> Result<String, EngineError>;

    /// Retrieves bytes by their content digest.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the digest is not found or the stored
    /// content fails its integrity check on read.
    fn retrieve(&self, digest: &str) -> Result<Vec<u8>, EngineError>;
}

/// A no-op span marker. Tracing itself (span export, sampling) is the
/// host process's concern; a plugin only ever sees this handle.
#[derive(Debug, Clone, Copy, Default)]
pub struct Span;

impl Span {
    /// Marks the span as entered. A no-op without a configured [`Tracer`].
    pub const fn enter(&self) {}
}

/// An optional tracing hook a plugin context may carry.
pub trait Tracer: Send + Sync {
    /// Starts a named span.
    fn start_span(&self, name: &str) -> Span;
}

/// Routes rows to a named sink outside the current node's own wiring, used
/// by gates and error-handling transforms that divert by name rather than
/// by edge.
pub trait SinkRouter: Send + Sync {
    /// Writes `rows` to the sink registered under `sink_name`.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if no sink is registered under that name,
    /// or the write itself fails.
    fn route(&self, sink_name: &str, rows: Vec<Value>) -> Result<ArtifactDescriptor, EngineError>;
}

// ============================================================================
// SECTION: Plugin Context
// ============================================================================

/// The context object passed to every plugin call (§4.6).
///
/// # Invariants
/// - `record_call` requires `state_id` to be set; calling it before
///   `begin_node_state` has recorded a state for this context is an
///   orchestration-invariant error.
/// - `get_checkpoint`/`update_checkpoint`/`clear_checkpoint` check the
///   per-node `batch_checkpoints` map before falling back to `checkpoint`,
///   mirroring the host's batch-vs-row-wise checkpoint storage split.
pub struct PluginContext {
    /// Run this context belongs to.
    pub run_id: RunId,
    /// Node this context is currently bound to.
    pub node_id: NodeId,
    /// Node state this context is currently bound to, if one is open.
    state_id: Option<StateId>,
    /// Run-level configuration.
    config: Value,
    /// Audit recorder, absent only in dry-run/validate contexts.
    recorder: Option<Arc<dyn LandscapeRecorder>>,
    /// Content-addressed payload store.
    payload_store: Arc<dyn PayloadStore>,
    /// Optional tracer hook.
    tracer: Option<Arc<dyn Tracer>>,
    /// Optional named-sink router.
    sink_router: Option<Arc<dyn SinkRouter>>,
    /// Per-node checkpoint state for batch transforms.
    batch_checkpoints: HashMap<NodeId, Value>,
    /// This context's own node's checkpoint state, used when no per-node
    /// entry exists in `batch_checkpoints`.
    checkpoint: Option<Value>,
}

impl PluginContext {
    /// Creates a new plugin context for the given run and node.
    #[must_use]
    pub fn new(run_id: RunId, node_id: NodeId, config: Value, payload_store: Arc<dyn PayloadStore>) -> Self {
        Self {
            run_id,
            node_id,
            state_id: None,
            config,
            recorder: None,
            payload_store,
            tracer: None,
            sink_router: None,
            batch_checkpoints: HashMap::new(),
            checkpoint: None,
        }
    }

    /// Attaches an audit recorder to this context.
    #[must_use]
    pub fn with_recorder(mut self, recorder: Arc<dyn LandscapeRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Attaches a tracer to this context.
    #[must_use]
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Attaches a named-sink router to this context.
    #[must_use]
    pub fn with_sink_router(mut self, sink_router: Arc<dyn SinkRouter>) -> Self {
        self.sink_router = Some(sink_router);
        self
    }

    /// Binds this context to an open node state, enabling `record_call`.
    pub fn bind_state(&mut self, state_id: StateId) {
        self.state_id = Some(state_id);
    }

    /// The node state this context is currently bound to, if one is open.
    #[must_use]
    pub fn state_id(&self) -> Option<&StateId> {
        self.state_id.as_ref()
    }

    /// Looks up a dotted-path key in the run-level configuration
    /// (e.g. `"retry.max_attempts"`), returning `default` if any segment is
    /// absent.
    #[must_use]
    pub fn get(&self, key: &str, default: Value) -> Value {
        let mut current = &self.config;
        for segment in key.split('.') {
            match current.get(segment) {
                Some(next) => current = next,
                None => return default,
            }
        }
        current.clone()
    }

    /// Starts a named span, a no-op when no tracer is configured.
    pub fn start_span(&self, name: &str) -> Span {
        self.tracer.as_ref().map_or_else(Span::default, |tracer| tracer.start_span(name))
    }

    /// Records one external call made by the plugin currently bound to this
    /// context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OrchestrationInvariant`] if no node state is
    /// bound, or whatever the recorder's own write returns.
    pub fn record_call(&self, call: CallRecord) -> Result<(), EngineError> {
        let state_id = self
            .state_id
            .as_ref()
            .ok_or_else(|| EngineError::OrchestrationInvariant("record_call with no bound state".to_owned()))?;
        match &self.recorder {
            Some(recorder) => recorder.record_call(state_id, call),
            None => Ok(()),
        }
    }

    /// Records a source-row validation failure.
    ///
    /// # Errors
    ///
    /// Returns whatever the recorder's own write returns, if a recorder is
    /// configured.
    pub fn record_validation_error(&self, reason: Value) -> Result<Option<TokenId>, EngineError> {
        match &self.recorder {
            Some(recorder) => recorder.record_validation_error(&self.run_id, reason).map(Some),
            None => Ok(None),
        }
    }

    /// Records a transform processing failure.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OrchestrationInvariant`] if no node state is
    /// bound, or whatever the recorder's own write returns.
    pub fn record_transform_error(&self, reason: Value) -> Result<Option<TokenId>, EngineError> {
        let state_id = self.state_id.as_ref().ok_or_else(|| {
            EngineError::OrchestrationInvariant("record_transform_error with no bound state".to_owned())
        })?;
        match &self.recorder {
            Some(recorder) => recorder.record_transform_error(state_id, reason).map(Some),
            None => Ok(None),
        }
    }

    /// Routes rows to a named sink.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OrchestrationInvariant`] if no sink router is
    /// configured, or whatever the router's own write returns.
    pub fn route_to_sink(&self, sink_name: &str, rows: Vec<Value>) -> Result<ArtifactDescriptor, EngineError> {
        self.sink_router.as_ref().map_or_else(
            || Err(EngineError::OrchestrationInvariant("no sink router configured".to_owned())),
            |router| router.route(sink_name, rows),
        )
    }

    /// Stores bytes in the payload store.
    ///
    /// # Errors
    ///
    /// Returns whatever the payload store's own write returns.
    pub fn store_payload(&self, bytes: &[u8]) -> Result<String, EngineError> {
        self.payload_store.store(bytes)
    }

    /// Retrieves bytes from the payload store.
    ///
    /// # Errors
    ///
    /// Returns whatever the payload store's own read returns.
    pub fn retrieve_payload(&self, digest: &str) -> Result<Vec<u8>, EngineError> {
        self.payload_store.retrieve(digest)
    }

    /// Returns the checkpoint state for `node_id`, checking the per-node
    /// batch-checkpoint map before falling back to this context's own
    /// checkpoint slot.
    #[must_use]
    pub fn get_checkpoint(&self, node_id: &NodeId) -> Option<&Value> {
        self.batch_checkpoints.get(node_id).or(self.checkpoint.as_ref())
    }

    /// Updates the checkpoint state for `node_id`.
    pub fn update_checkpoint(&mut self, node_id: NodeId, value: Value) {
        if node_id == self.node_id {
            self.checkpoint = Some(value);
        } else {
            self.batch_checkpoints.insert(node_id, value);
        }
    }

    /// Clears the checkpoint state for `node_id`.
    pub fn clear_checkpoint(&mut self, node_id: &NodeId) {
        if *node_id == self.node_id {
            self.checkpoint = None;
        } else {
            self.batch_checkpoints.remove(node_id);
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

    use serde_json::json;

    use super::*;

    struct NullPayloadStore;

    impl PayloadStore for NullPayloadStore {
        fn store(&self, _bytes: &[u8]) -> Result<String, EngineError> {
            Ok("digest".to_owned())
        }

        fn retrieve(&self, _digest: &str) -> Result<Vec<u8>, EngineError> {
            Ok(Vec::new())
        }
    }

    fn test_context() -> PluginContext {
        PluginContext::new(
            RunId::new("run-1"),
            NodeId::new("node-1"),
            json!({"retry": {"max_attempts": 3}}),
            Arc::new(NullPayloadStore),
        )
    }

    #[test]
    fn dotted_path_lookup_resolves_nested_keys() {
        let ctx = test_context();
        assert_eq!(ctx.get("retry.max_attempts", json!(null)), json!(3));
    }

    #[test]
    fn dotted_path_lookup_returns_default_when_absent() {
        let ctx = test_context();
        assert_eq!(ctx.get("retry.backoff_seconds", json!(1)), json!(1));
    }

    #[test]
    fn record_call_without_bound_state_is_an_invariant_error() {
        let ctx = test_context();
        let call = CallRecord {
            call_type: CallType::Http,
            status: CallStatus::Success,
            request_hash: "h".to_owned(),
            response_hash: None,
            error_json: None,
            latency_ms: 1.0,
            retryable: false,
        };
        let err = ctx.record_call(call).expect_err("no bound state");
        assert_eq!(err.category(), crate::core::error::ErrorCategory::OrchestrationInvariant);
    }

    #[test]
    fn checkpoint_prefers_batch_entry_over_local_slot() {
        let mut ctx = test_context();
        let own = ctx.node_id.clone();
        ctx.update_checkpoint(own.clone(), json!({"local": true}));
        let other = NodeId::new("node-2");
        ctx.update_checkpoint(other.clone(), json!({"batch": true}));
        assert_eq!(ctx.get_checkpoint(&other), Some(&json!({"batch": true})));
        assert_eq!(ctx.get_checkpoint(&own), Some(&json!({"local": true})));
    }

    #[test]
    fn clearing_checkpoint_removes_only_that_node() {
        let mut ctx = test_context();
        let own = ctx.node_id.clone();
        ctx.update_checkpoint(own.clone(), json!({"local": true}));
        ctx.clear_checkpoint(&own);
        assert_eq!(ctx.get_checkpoint(&own), None);
    }

    #[test]
    fn no_tracer_configured_yields_default_span() {
        let ctx = test_context();
        let span = ctx.start_span("unit");
        span.enter();
    }
}
