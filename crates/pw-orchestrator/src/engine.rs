// crates/pw-orchestrator/src/engine.rs
// ============================================================================
// Module: Orchestrator Engine
// Description: The cooperative, single-threaded work-queue loop that drives
// a validated DAG to completion (§4.12, §5): dispatches each work item by
// node kind, forks/expands/coalesces token lineage through `TokenManager`,
// writes checkpoints before a pooled stage's sinks are flushed, and grades
// the run's reproducibility at `finalize_run`.
// Purpose: Everything upstream of this module (construction, navigation,
// lineage, the pool) is a pure or narrowly-scoped primitive; this is the one
// place that actually drives a pipeline end to end, so every other module's
// contract gets exercised together here rather than re-derived per caller.
// Dependencies: pw-core, pw-dag, pw-condition, pw-store, serde_json,
// thiserror, tracing, crate::{checkpoint, pool, token}
// Grounding: examples/original_source's orchestrator loop (fork/expand/
// coalesce dispatch keyed by node kind) and `pw-dag::navigator`'s own
// doc comments, which describe exactly this dispatch contract from the
// navigator's side.
// ============================================================================

//! ## Overview
//! [`PluginRegistry`] is where a host process registers the concrete
//! plugins a pipeline configuration names by plugin type (sources,
//! transforms, batch transforms — stateless, shared across every node that
//! names them) and by sink node name (sinks hold open resources, so each
//! sink node gets its own instance). [`Orchestrator::run`] constructs the
//! DAG, opens a run, loads the source, and drains a work queue until every
//! token reaches a terminal outcome or the run is cooperatively cancelled.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Instant;

use pw_core::core::canonical::CanonicalError;
use pw_core::core::canonical::stable_hash;
use pw_core::core::error::EngineError;
use pw_core::core::identifiers::EdgeId;
use pw_core::core::identifiers::NodeId;
use pw_core::core::identifiers::RowId;
use pw_core::core::identifiers::RunId;
use pw_core::core::identifiers::TokenId;
use pw_core::core::model::BatchStatus;
use pw_core::core::model::Determinism;
use pw_core::core::model::EdgeMode;
use pw_core::core::model::NodeStateStatus;
use pw_core::core::model::NodeType;
use pw_core::core::model::Run;
use pw_core::core::model::RunStatus;
use pw_core::core::model::Token;
use pw_core::core::model::TokenOutcomeKind;
use pw_core::protocol::ArtifactDescriptor;
use pw_core::protocol::BatchTransform;
use pw_core::protocol::PayloadStore;
use pw_core::protocol::PipelineRow;
use pw_core::protocol::PluginContext;
use pw_core::protocol::Sink;
use pw_core::protocol::Source;
use pw_core::protocol::SourceRow;
use pw_core::protocol::Tracer;
use pw_core::protocol::Transform;
use pw_core::protocol::TransformResult;
use pw_dag::ConstructionError;
use pw_dag::Dag;
use pw_dag::DagNavigator;
use pw_dag::DagNode;
use pw_dag::DagNodeKind;
use pw_dag::PipelineConfig;
use pw_dag::ResolvedNode;
use pw_dag::WorkItem;
use pw_dag::config::CoalescePolicy;
use pw_dag::config::MergeStrategy;
use pw_store::NewNode;
use pw_store::NewNodeState;
use pw_store::NodeStateCompletion;
use pw_store::RoutingDecision;
use pw_store::SqliteLandscape;
use pw_store::StoreError;
use serde_json::Value;
use serde_json::json;

use crate::checkpoint::CheckpointManager;
use crate::checkpoint::mark_sinks_flushed;
use crate::pool::CapacityError;
use crate::pool::PoolConfig;
use crate::pool::PooledExecutor;
use crate::pool::RowContext;
use crate::token::TokenManager;
use crate::token::TokenManagerError;

/// Canonical-encoder version stamped on every run this engine begins.
const CANONICAL_VERSION: &str = "1";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Failures raised while running a pipeline end to end.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The pipeline configuration failed DAG construction.
    #[error("pipeline failed construction with {} error(s): {0:?}", .0.len())]
    Construction(Vec<ConstructionError>),
    /// A plugin, invariant, or audit-integrity failure occurred mid-run.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The underlying Landscape store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Canonicalizing the pipeline configuration or a node spec failed.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    /// The checkpoint manager failed to write or verify a checkpoint.
    #[error(transparent)]
    Checkpoint(#[from] crate::checkpoint::CheckpointManagerError),
    /// The token manager failed a lineage operation.
    #[error(transparent)]
    Token(#[from] TokenManagerError),
}

// ============================================================================
// SECTION: Plugin Registry
// ============================================================================

/// The concrete plugins a host process has available, keyed the way each
/// kind is actually shared: sources, transforms, and batch transforms are
/// stateless and registered once per plugin *type* (many nodes may name the
/// same plugin with different options); sinks hold open resources and are
/// registered once per sink *node name*, since two sink nodes naming the
/// same plugin still write to two different targets.
pub struct PluginRegistry {
    sources: BTreeMap<String, Arc<dyn Source>>,
    transforms: BTreeMap<String, Arc<dyn Transform>>,
    batch_transforms: BTreeMap<String, Arc<dyn BatchTransform>>,
    sinks: Mutex<BTreeMap<String, Box<dyn Sink>>>,
    determinism: BTreeMap<String, Determinism>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sources: BTreeMap::new(),
            transforms: BTreeMap::new(),
            batch_transforms: BTreeMap::new(),
            sinks: Mutex::new(BTreeMap::new()),
            determinism: BTreeMap::new(),
        }
    }

    /// Registers a source plugin under `plugin_name`.
    pub fn register_source(&mut self, plugin_name: impl Into<String>, plugin: Arc<dyn Source>) {
        self.sources.insert(plugin_name.into(), plugin);
    }

    /// Registers a transform plugin under `plugin_name`.
    pub fn register_transform(&mut self, plugin_name: impl Into<String>, plugin: Arc<dyn Transform>) {
        self.transforms.insert(plugin_name.into(), plugin);
    }

    /// Registers a batch-transform plugin under `plugin_name`.
    pub fn register_batch_transform(&mut self, plugin_name: impl Into<String>, plugin: Arc<dyn BatchTransform>) {
        self.batch_transforms.insert(plugin_name.into(), plugin);
    }

    /// Registers a sink instance under the sink node's own name.
    pub fn register_sink(&mut self, sink_node_name: impl Into<String>, plugin: Box<dyn Sink>) {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner).insert(sink_node_name.into(), plugin);
    }

    /// Declares `plugin_name`'s replay-determinism classification, used at
    /// topology registration to grade the run's reproducibility. Plugins
    /// not declared here are assumed [`Determinism::NonDeterministic`], the
    /// conservative default.
    pub fn register_determinism(&mut self, plugin_name: impl Into<String>, determinism: Determinism) {
        self.determinism.insert(plugin_name.into(), determinism);
    }

    fn determinism_of(&self, plugin_name: &str) -> Determinism {
        self.determinism.get(plugin_name).copied().unwrap_or(Determinism::NonDeterministic)
    }

    fn source(&self, plugin_name: &str) -> Result<&Arc<dyn Source>, EngineError> {
        self.sources
            .get(plugin_name)
            .ok_or_else(|| EngineError::Configuration(format!("no source plugin registered under '{plugin_name}'")))
    }

    fn transform(&self, plugin_name: &str) -> Result<&Arc<dyn Transform>, EngineError> {
        self.transforms
            .get(plugin_name)
            .ok_or_else(|| EngineError::Configuration(format!("no transform plugin registered under '{plugin_name}'")))
    }

    fn batch_transform(&self, plugin_name: &str) -> Result<&Arc<dyn BatchTransform>, EngineError> {
        self.batch_transforms
            .get(plugin_name)
            .ok_or_else(|| EngineError::Configuration(format!("no batch transform plugin registered under '{plugin_name}'")))
    }

    /// Writes `rows` through the sink registered under `sink_node_name`,
    /// using the caller-supplied context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OrchestrationInvariant`] if no sink is
    /// registered under that name, or whatever the sink's own write
    /// returns.
    pub(crate) fn write_sink(&self, sink_node_name: &str, rows: Vec<Value>, ctx: &mut PluginContext) -> Result<ArtifactDescriptor, EngineError> {
        let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        let sink = sinks.get_mut(sink_node_name).ok_or_else(|| {
            EngineError::OrchestrationInvariant(format!("no sink registered under '{sink_node_name}'"))
        })?;
        sink.write(rows, ctx)
    }

    fn flush_and_close_all(&self) -> Result<(), EngineError> {
        let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        for sink in sinks.values_mut() {
            sink.flush()?;
            sink.close()?;
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Sink Router
// ============================================================================

/// Routes a gate's or transform's named-sink diversion to the registered
/// sink, outside the current node's own edge wiring.
struct RunSinkRouter {
    registry: Arc<PluginRegistry>,
    run_id: RunId,
    payload_store: Arc<dyn PayloadStore>,
}

impl pw_core::protocol::SinkRouter for RunSinkRouter {
    fn route(&self, sink_name: &str, rows: Vec<Value>) -> Result<ArtifactDescriptor, EngineError> {
        let mut ctx = PluginContext::new(self.run_id.clone(), NodeId::new(sink_name), Value::Null, Arc::clone(&self.payload_store));
        self.registry.write_sink(sink_name, rows, &mut ctx)
    }
}

// ============================================================================
// SECTION: Hashing Helpers
// ============================================================================

/// Projects a [`DagNode`] into the serializable shape every topology and
/// checkpoint hash is computed over. `DagNode` itself is not `Serialize`
/// (a gate's parsed [`pw_condition::Condition`] carries no derive for one),
/// so every hash in this module goes through this projection instead of the
/// node directly.
pub(crate) fn node_spec_for_hash(node: &DagNode) -> Value {
    let kind = match &node.kind {
        DagNodeKind::Source { plugin, options } => json!({"kind": "source", "plugin": plugin, "options": options}),
        DagNodeKind::Transform { plugin, options } => json!({"kind": "transform", "plugin": plugin, "options": options}),
        DagNodeKind::Gate { condition, routes } => json!({"kind": "gate", "condition": condition.source(), "routes": routes}),
        DagNodeKind::Aggregation { plugin, options, trigger, output_mode } => {
            json!({"kind": "aggregation", "plugin": plugin, "options": options, "trigger": trigger, "output_mode": output_mode})
        }
        DagNodeKind::Coalesce { branches, policy, quorum_count, timeout_seconds, merge } => {
            json!({"kind": "coalesce", "branches": branches, "policy": policy, "quorum_count": quorum_count, "timeout_seconds": timeout_seconds, "merge": merge})
        }
        DagNodeKind::Sink { plugin, options } => json!({"kind": "sink", "plugin": plugin, "options": options}),
    };
    json!({"node_id": node.node_id.as_str(), "kind": kind})
}

const fn node_type_for_kind(kind: &DagNodeKind) -> NodeType {
    match kind {
        DagNodeKind::Source { .. } => NodeType::Source,
        DagNodeKind::Transform { .. } => NodeType::Transform,
        DagNodeKind::Gate { .. } => NodeType::Gate,
        DagNodeKind::Aggregation { .. } => NodeType::Aggregation,
        DagNodeKind::Coalesce { .. } => NodeType::Coalesce,
        DagNodeKind::Sink { .. } => NodeType::Sink,
    }
}

const fn edge_mode_to_routing_mode(mode: EdgeMode) -> pw_core::core::model::RoutingMode {
    match mode {
        EdgeMode::Move => pw_core::core::model::RoutingMode::Move,
        EdgeMode::Copy => pw_core::core::model::RoutingMode::Copy,
        EdgeMode::Divert => pw_core::core::model::RoutingMode::Divert,
    }
}

/// The work items an aggregation node has buffered so far, and when the
/// buffer was opened, used to evaluate a `timeout_seconds` trigger or a
/// `condition` trigger referencing `batch_age_seconds` (§4.12 step 7).
struct AggregationBuffer {
    /// Work items buffered for this aggregation node, in arrival order.
    items: Vec<WorkItem>,
    /// When the first item was buffered.
    opened_at: Instant,
}

/// Evaluates `trigger` (§6) against a buffer of `batch_count` members open
/// for `batch_age_seconds`. `condition` is parsed fresh on every call: DAG
/// construction already validated it parses, so this only ever fails if the
/// restricted grammar itself rejects a comparison at evaluation time (e.g.
/// an incomparable type), not on the expression's shape.
///
/// # Errors
///
/// Returns [`OrchestratorError::Engine`] if `trigger.condition` fails to
/// parse or evaluate.
fn aggregation_trigger_fires(trigger: &pw_dag::config::TriggerSpec, batch_count: usize, batch_age_seconds: u64) -> Result<bool, OrchestratorError> {
    if let Some(count) = trigger.count {
        if u64::try_from(batch_count).unwrap_or(u64::MAX) >= count {
            return Ok(true);
        }
    }
    if let Some(timeout_seconds) = trigger.timeout_seconds {
        if batch_age_seconds >= timeout_seconds {
            return Ok(true);
        }
    }
    if let Some(source) = &trigger.condition {
        let condition = pw_condition::parse(source).map_err(|err| EngineError::Configuration(err.to_string()))?;
        let batch_fields = json!({ "batch_count": batch_count, "batch_age_seconds": batch_age_seconds });
        let Value::Object(batch_fields) = batch_fields else {
            unreachable!("json! macro always builds an object for a brace literal")
        };
        let verdict = condition.evaluate(&batch_fields).map_err(|err| EngineError::Configuration(err.to_string()))?;
        if matches!(verdict, pw_condition::Tristate::True) {
            return Ok(true);
        }
    }
    Ok(trigger.count.is_none() && trigger.timeout_seconds.is_none() && trigger.condition.is_none())
}

/// Plugin name a node binds to, for registry lookups and the determinism
/// grading written at topology registration. Structural nodes (coalesce)
/// have none.
fn plugin_name_of(kind: &DagNodeKind) -> Option<&str> {
    match kind {
        DagNodeKind::Source { plugin, .. }
        | DagNodeKind::Transform { plugin, .. }
        | DagNodeKind::Aggregation { plugin, .. }
        | DagNodeKind::Sink { plugin, .. } => Some(plugin.as_str()),
        DagNodeKind::Gate { .. } | DagNodeKind::Coalesce { .. } => None,
    }
}

/// Plugin-defined options carried by a node, for threading into a
/// [`PluginContext`]. Structural and gate nodes carry none.
fn options_of(kind: &DagNodeKind) -> Value {
    match kind {
        DagNodeKind::Source { options, .. }
        | DagNodeKind::Transform { options, .. }
        | DagNodeKind::Aggregation { options, .. }
        | DagNodeKind::Sink { options, .. } => options.clone(),
        DagNodeKind::Gate { .. } | DagNodeKind::Coalesce { .. } => Value::Null,
    }
}

// ============================================================================
// SECTION: Run Summary
// ============================================================================

/// The finalized outcome of [`Orchestrator::run`].
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// The finalized run record, including its reproducibility grade.
    pub run: Run,
}

// ============================================================================
// SECTION: Orchestrator
// ============================================================================

/// Drives a validated DAG to completion, dispatching each work item by node
/// kind and recording every step through the Landscape store (§4.12, §5).
pub struct Orchestrator {
    store: Arc<SqliteLandscape>,
    payload_store: Arc<dyn PayloadStore>,
    registry: Arc<PluginRegistry>,
    tracer: Option<Arc<dyn Tracer>>,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Builds an orchestrator over `store`, routing every plugin's content
    /// through `payload_store` and every plugin call's node dispatch
    /// through `registry`.
    #[must_use]
    pub fn new(store: Arc<SqliteLandscape>, payload_store: Arc<dyn PayloadStore>, registry: Arc<PluginRegistry>) -> Self {
        Self { store, payload_store, registry, tracer: None, cancel: Arc::new(AtomicBool::new(false)) }
    }

    /// Attaches a tracer every plugin context started by this orchestrator
    /// will use for spans.
    #[must_use]
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// A cooperative cancellation flag: setting it true causes the run loop
    /// to stop dispatching new work items and finalize the run as
    /// `cancelled` at the next opportunity.
    #[must_use]
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn plugin_context(&self, run_id: &RunId, node_id: &NodeId, options: Value, sink_router: Arc<dyn pw_core::protocol::SinkRouter>) -> PluginContext {
        let mut ctx = PluginContext::new(run_id.clone(), node_id.clone(), options, Arc::clone(&self.payload_store))
            .with_recorder(Arc::clone(&self.store) as Arc<dyn pw_core::protocol::LandscapeRecorder>)
            .with_sink_router(sink_router);
        if let Some(tracer) = &self.tracer {
            ctx = ctx.with_tracer(Arc::clone(tracer));
        }
        ctx
    }

    fn sink_router_for(&self, run_id: &RunId) -> Arc<dyn pw_core::protocol::SinkRouter> {
        Arc::new(RunSinkRouter { registry: Arc::clone(&self.registry), run_id: run_id.clone(), payload_store: Arc::clone(&self.payload_store) })
    }

    /// Registers every node and edge of `dag` into the Landscape store,
    /// returning the map from `(from, to, label)` to the edge id the store
    /// assigned, used by gate dispatch to record routing decisions.
    fn register_topology(&self, run_id: &RunId, dag: &Dag) -> Result<BTreeMap<(String, String, String), EdgeId>, OrchestratorError> {
        for node in dag.nodes() {
            let spec = node_spec_for_hash(node);
            let config_hash = stable_hash(&spec)?.to_string();
            let determinism = plugin_name_of(&node.kind).map_or(Determinism::Deterministic, |name| self.registry.determinism_of(name));
            self.store.register_node(
                run_id,
                NewNode {
                    node_id: node.node_id.clone(),
                    plugin_name: plugin_name_of(&node.kind).unwrap_or("<structural>").to_owned(),
                    node_type: node_type_for_kind(&node.kind),
                    plugin_version: "0".to_owned(),
                    determinism,
                    config_hash,
                    config_json: spec,
                    schema_mode: node.schema.mode,
                    schema_fields: Some(serde_json::to_value(&node.schema.fields).map_err(|err| EngineError::AuditIntegrity(err.to_string()))?),
                },
            )?;
        }

        let mut edge_ids = BTreeMap::new();
        for edge in dag.edges() {
            let registered = self.store.register_edge(run_id, edge.from_node_id.clone(), edge.to_node_id.clone(), edge.label.clone(), edge.mode)?;
            edge_ids.insert((edge.from_node_id.as_str().to_owned(), edge.to_node_id.as_str().to_owned(), edge.label.clone()), registered.edge_id);
        }
        Ok(edge_ids)
    }

    /// Runs `config` end to end: construction, topology registration,
    /// source load, and the work-queue loop, finalizing the run whether it
    /// completes, fails, or is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Construction`] if `config` fails DAG
    /// construction; otherwise whatever the first unrecoverable plugin,
    /// store, or invariant failure was.
    pub fn run(&self, config: &PipelineConfig) -> Result<RunSummary, OrchestratorError> {
        let construction = pw_dag::construct(config).map_err(OrchestratorError::Construction)?;
        let dag = Arc::new(construction.dag);
        let navigator = DagNavigator::new(Arc::clone(&dag));

        let config_hash = stable_hash(config)?.to_string();
        let run = self.store.begin_run(config_hash, CANONICAL_VERSION.to_owned())?;
        let edge_ids = self.register_topology(&run.run_id, &dag)?;

        let source_node_id = NodeId::new("source");
        let source_node = dag.node(&source_node_id).ok_or_else(|| {
            OrchestratorError::Engine(EngineError::OrchestrationInvariant("constructed dag has no 'source' node".to_owned()))
        })?;
        self.store.record_source_schema(
            &run.run_id,
            serde_json::to_value(&source_node.schema).map_err(|err| EngineError::AuditIntegrity(err.to_string()))?,
            json!({}),
        )?;

        let token_manager = TokenManager::new(&self.store);
        let checkpoint_manager = CheckpointManager::new(&self.store);
        let sink_router = self.sink_router_for(&run.run_id);

        let result = self.drive(&run, &dag, &navigator, &edge_ids, &token_manager, &checkpoint_manager, &sink_router);

        self.registry.flush_and_close_all()?;

        let final_status = match &result {
            Ok(()) if self.cancel.load(Ordering::SeqCst) => RunStatus::Cancelled,
            Ok(()) => RunStatus::Completed,
            Err(_) => RunStatus::Failed,
        };
        let finalized = self.store.finalize_run(&run.run_id, final_status)?;
        result?;
        Ok(RunSummary { run: finalized })
    }

    #[allow(clippy::too_many_arguments, reason = "each argument is a distinct piece of run-scoped state threaded through the loop")]
    fn drive(
        &self,
        run: &Run,
        dag: &Arc<Dag>,
        navigator: &DagNavigator,
        edge_ids: &BTreeMap<(String, String, String), EdgeId>,
        token_manager: &TokenManager<'_>,
        checkpoint_manager: &CheckpointManager<'_>,
        sink_router: &Arc<dyn pw_core::protocol::SinkRouter>,
    ) -> Result<(), OrchestratorError> {
        let mut queue: VecDeque<WorkItem> = VecDeque::new();
        self.load_source(run, dag, navigator, token_manager, &mut queue)?;

        let mut pending_coalesce: BTreeMap<(NodeId, RowId), Vec<Token>> = BTreeMap::new();
        let mut fired_coalesce: BTreeSet<(NodeId, RowId)> = BTreeSet::new();
        let mut pending_aggregation: BTreeMap<NodeId, AggregationBuffer> = BTreeMap::new();

        loop {
            while let Some(item) = queue.pop_front() {
                if self.cancel.load(Ordering::SeqCst) {
                    token_manager.drop_row_data(&item.token.token_id);
                    continue;
                }

                let Some(node_id) = item.current_node_id.clone() else {
                    continue;
                };

                match navigator.resolve_plugin_for_node(&node_id)? {
                    ResolvedNode::Structural => {
                        self.dispatch_coalesce(run, dag, navigator, &node_id, item, token_manager, &mut queue, &mut pending_coalesce, &mut fired_coalesce)?;
                    }
                    ResolvedNode::Plugin(_) => {
                        let node = dag.node(&node_id).ok_or_else(|| {
                            EngineError::OrchestrationInvariant(format!("resolved plugin node '{node_id}' vanished"))
                        })?;
                        match &node.kind {
                            DagNodeKind::Source { .. } => {
                                let continuation = navigator.create_continuation_work_item(item.token, &node_id, item.coalesce_name, item.on_success_sink)?;
                                queue.push_back(continuation);
                            }
                            DagNodeKind::Transform { plugin, options } => {
                                self.dispatch_transform(run, dag, navigator, &node_id, plugin, options, item, token_manager, sink_router, &mut queue)?;
                            }
                            DagNodeKind::Gate { condition, routes } => {
                                self.dispatch_gate(run, dag, navigator, &node_id, condition, routes, edge_ids, item, token_manager, &mut queue)?;
                            }
                            DagNodeKind::Aggregation { plugin, options, trigger, output_mode } => {
                                self.dispatch_aggregation(
                                    run,
                                    navigator,
                                    &node_id,
                                    plugin,
                                    options,
                                    trigger,
                                    *output_mode,
                                    item,
                                    token_manager,
                                    checkpoint_manager,
                                    dag.nodes().collect::<Vec<_>>().as_slice(),
                                    sink_router,
                                    &mut queue,
                                    &mut pending_aggregation,
                                )?;
                            }
                            DagNodeKind::Coalesce { .. } => {
                                unreachable!("navigator routes every coalesce node through ResolvedNode::Structural")
                            }
                            DagNodeKind::Sink { plugin, options } => {
                                self.dispatch_sink(run, &node_id, plugin, options, item, token_manager, sink_router)?;
                            }
                        }
                    }
                }
            }

            // The work queue is empty but an aggregation may still be
            // holding tokens whose trigger never fired (a `count` that was
            // never reached, or a `timeout_seconds`/`condition` trigger that
            // never evaluated true). §4.12 step 7 has no "pipeline ran dry"
            // exception to a batch's trigger, but §8's one-terminal-outcome
            // invariant still applies to every buffered token, so the last
            // open buffer per aggregation node is force-flushed here rather
            // than left holding only a non-terminal `Buffered` outcome.
            let stuck_nodes: Vec<NodeId> = pending_aggregation.iter().filter(|(_, buffer)| !buffer.items.is_empty()).map(|(node_id, _)| node_id.clone()).collect();
            if stuck_nodes.is_empty() {
                break;
            }
            for node_id in stuck_nodes {
                let Some(buffer) = pending_aggregation.remove(&node_id) else { continue };
                if buffer.items.is_empty() {
                    continue;
                }
                let node = dag.node(&node_id).ok_or_else(|| EngineError::OrchestrationInvariant(format!("aggregation node '{node_id}' vanished")))?;
                let DagNodeKind::Aggregation { plugin, options, output_mode, .. } = &node.kind else {
                    return Err(OrchestratorError::Engine(EngineError::OrchestrationInvariant(format!("'{node_id}' is not an aggregation node"))));
                };
                self.flush_aggregation(
                    run,
                    navigator,
                    &node_id,
                    plugin,
                    options,
                    *output_mode,
                    buffer.items,
                    token_manager,
                    checkpoint_manager,
                    dag.nodes().collect::<Vec<_>>().as_slice(),
                    sink_router,
                    &mut queue,
                )?;
            }
        }

        Ok(())
    }

    fn load_source(
        &self,
        run: &Run,
        dag: &Arc<Dag>,
        navigator: &DagNavigator,
        token_manager: &TokenManager<'_>,
        queue: &mut VecDeque<WorkItem>,
    ) -> Result<(), OrchestratorError> {
        let source_node_id = NodeId::new("source");
        let source_node = dag.node(&source_node_id).ok_or_else(|| {
            EngineError::OrchestrationInvariant("constructed dag has no 'source' node".to_owned())
        })?;
        let DagNodeKind::Source { plugin, options } = &source_node.kind else {
            return Err(OrchestratorError::Engine(EngineError::OrchestrationInvariant("'source' node is not a source".to_owned())));
        };
        let source_plugin = self.registry.source(plugin)?;
        let sink_router = self.sink_router_for(&run.run_id);
        let ctx = self.plugin_context(&run.run_id, &source_node_id, options.clone(), sink_router);
        let rows = source_plugin.load(&ctx).map_err(OrchestratorError::Engine)?;

        for (index, source_row) in rows.enumerate() {
            #[allow(clippy::cast_possible_truncation, reason = "row counts stay far below u64::MAX in any realistic run")]
            let row_index = index as u64;
            match source_row {
                SourceRow::Valid { data, .. } => {
                    let row_hash = stable_hash(&data)?.to_string();
                    let row = self.store.create_row(&run.run_id, &source_node_id, row_index, row_hash, None)?;
                    let token = token_manager.create_initial_token(&run.run_id, row.row_id, data)?;
                    let work = navigator.create_continuation_work_item(token, &source_node_id, None, None)?;
                    queue.push_back(work);
                }
                SourceRow::Quarantined { data, reason } => {
                    self.store.record_validation_error(&run.run_id, json!({"reason": reason, "row_index": row_index, "data": data}))?;
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments, reason = "each argument is a distinct piece of dispatch-scoped state")]
    fn dispatch_transform(
        &self,
        run: &Run,
        dag: &Arc<Dag>,
        navigator: &DagNavigator,
        node_id: &NodeId,
        plugin_name: &str,
        options: &Value,
        item: WorkItem,
        token_manager: &TokenManager<'_>,
        sink_router: &Arc<dyn pw_core::protocol::SinkRouter>,
        queue: &mut VecDeque<WorkItem>,
    ) -> Result<(), OrchestratorError> {
        let plugin = self.registry.transform(plugin_name)?;
        let pool_size = options.get("pool_size").and_then(Value::as_u64).unwrap_or(1);

        // A lone ready row is never worth the thread-pool setup cost; only a
        // configured `pool_size` greater than one, with more than one row
        // already queued for this exact node, routes through the pool.
        let mut batch = vec![item];
        if pool_size > 1 {
            while let Some(next) = queue.front() {
                if next.current_node_id.as_ref() == Some(node_id) {
                    batch.push(queue.pop_front().ok_or_else(|| EngineError::OrchestrationInvariant("front item vanished".to_owned()))?);
                } else {
                    break;
                }
            }
        }

        if pool_size > 1 && batch.len() > 1 {
            self.dispatch_transform_pooled(run, navigator, node_id, plugin_name, plugin, options, pool_size, batch, token_manager, sink_router, queue)
        } else {
            for work_item in batch {
                let result = self.run_transform_once(run, node_id, plugin, options, &work_item, token_manager, sink_router)?;
                self.apply_transform_result(run, navigator, node_id, work_item, result, token_manager, queue)?;
            }
            Ok(())
        }
    }

    #[allow(clippy::too_many_arguments, reason = "each argument is a distinct piece of dispatch-scoped state")]
    fn dispatch_transform_pooled(
        &self,
        run: &Run,
        navigator: &DagNavigator,
        node_id: &NodeId,
        plugin_name: &str,
        plugin: &Arc<dyn Transform>,
        options: &Value,
        pool_size: u64,
        batch: Vec<WorkItem>,
        token_manager: &TokenManager<'_>,
        sink_router: &Arc<dyn pw_core::protocol::SinkRouter>,
        queue: &mut VecDeque<WorkItem>,
    ) -> Result<(), OrchestratorError> {
        #[allow(clippy::cast_possible_truncation, reason = "pool_size is validated to fit usize by any reasonable pipeline config")]
        let executor = PooledExecutor::new(PoolConfig { pool_size: pool_size as usize, ..PoolConfig::default() });
        let rows: Vec<RowContext<WorkItem>> = batch
            .into_iter()
            .enumerate()
            .map(|(row_index, item)| RowContext { state_id: item.token.token_id.as_str().to_owned(), row: item, row_index })
            .collect();

        let results = executor.execute_batch(rows.clone(), &|row_ctx: &RowContext<WorkItem>| {
            match self.run_transform_once(run, node_id, plugin, options, &row_ctx.row, token_manager, sink_router) {
                Ok(transform_result) => Ok(transform_result),
                Err(EngineError::PluginRetryable(message)) => Err(CapacityError { message, status_code: None }),
                Err(other) => Ok(TransformResult::Error { reason: json!({"error": other.to_string()}), retryable: false }),
            }
        });

        let stats = executor.stats();
        tracing::debug!(
            node_id = %node_id,
            plugin = plugin_name,
            rows = results.len(),
            capacity_retries = stats.pool_stats.capacity_retries,
            peak_delay_ms = stats.pool_stats.peak_delay_ms,
            total_throttle_time_ms = stats.pool_stats.total_throttle_time_ms,
            "processed pooled transform batch"
        );

        for (row_ctx, result) in rows.into_iter().zip(results) {
            self.apply_transform_result(run, navigator, node_id, row_ctx.row, result, token_manager, queue)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments, reason = "each argument is a distinct piece of dispatch-scoped state")]
    fn run_transform_once(
        &self,
        run: &Run,
        node_id: &NodeId,
        plugin: &Arc<dyn Transform>,
        options: &Value,
        item: &WorkItem,
        token_manager: &TokenManager<'_>,
        sink_router: &Arc<dyn pw_core::protocol::SinkRouter>,
    ) -> Result<TransformResult, EngineError> {
        let start = Instant::now();
        let data = token_manager.row_data(&item.token.token_id).unwrap_or(Value::Null);
        let input_hash = stable_hash(&data)?.to_string();
        let state = self.store.begin_node_state(
            &run.run_id,
            NewNodeState { token_id: item.token.token_id.clone(), node_id: node_id.clone(), step_index: 0, attempt: 0, input_hash, context_before: None },
        )?;

        let mut ctx = self.plugin_context(&run.run_id, node_id, options.clone(), Arc::clone(sink_router));
        ctx.bind_state(state.state_id.clone());
        let contract = Arc::new(dag_schema_placeholder());
        let row = PipelineRow { data, contract };

        let outcome = plugin.process(row, &mut ctx);
        #[allow(clippy::cast_precision_loss, reason = "durations stay far below f64's exact-integer range")]
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        match &outcome {
            Ok(TransformResult::Success { row, success_reason }) => {
                let output_hash = stable_hash(&row.data)?.to_string();
                self.store.complete_node_state(
                    &state.state_id,
                    NodeStateCompletion {
                        status: NodeStateStatus::Completed,
                        output_hash: Some(output_hash),
                        context_after: None,
                        duration_ms,
                        error_json: None,
                        success_reason_json: success_reason.clone(),
                    },
                )?;
            }
            Ok(TransformResult::SuccessMulti { success_reason, .. }) => {
                self.store.complete_node_state(
                    &state.state_id,
                    NodeStateCompletion {
                        status: NodeStateStatus::Completed,
                        output_hash: None,
                        context_after: None,
                        duration_ms,
                        error_json: None,
                        success_reason_json: success_reason.clone(),
                    },
                )?;
            }
            Ok(TransformResult::Error { reason, .. }) => {
                self.store.complete_node_state(
                    &state.state_id,
                    NodeStateCompletion {
                        status: NodeStateStatus::Failed,
                        output_hash: None,
                        context_after: None,
                        duration_ms,
                        error_json: Some(reason.clone()),
                        success_reason_json: None,
                    },
                )?;
            }
            Ok(TransformResult::Pending { checkpoint }) => {
                self.store.complete_node_state(
                    &state.state_id,
                    NodeStateCompletion {
                        status: NodeStateStatus::Completed,
                        output_hash: None,
                        context_after: Some(checkpoint.clone()),
                        duration_ms,
                        error_json: None,
                        success_reason_json: None,
                    },
                )?;
            }
            Err(_) => {}
        }

        outcome
    }

    fn apply_transform_result(
        &self,
        run: &Run,
        navigator: &DagNavigator,
        node_id: &NodeId,
        item: WorkItem,
        result: TransformResult,
        token_manager: &TokenManager<'_>,
        queue: &mut VecDeque<WorkItem>,
    ) -> Result<(), OrchestratorError> {
        match result {
            TransformResult::Success { row, .. } => {
                token_manager.update_row_data(item.token.token_id.clone(), row.data);
                let continuation = navigator.create_continuation_work_item(item.token, node_id, item.coalesce_name, item.on_success_sink)?;
                queue.push_back(continuation);
            }
            TransformResult::SuccessMulti { rows, .. } => {
                let expand_group = token_manager.new_expand_group();
                for row in rows {
                    let child = token_manager.expand_token(&run.run_id, &item.token, expand_group.clone(), row.data)?;
                    let continuation = navigator.create_continuation_work_item(child, node_id, item.coalesce_name.clone(), item.on_success_sink.clone())?;
                    queue.push_back(continuation);
                }
                token_manager.drop_row_data(&item.token.token_id);
            }
            TransformResult::Error { reason, .. } => {
                self.store.record_token_outcome(&run.run_id, &item.token.token_id, TokenOutcomeKind::Failed, None, None, reason)?;
                token_manager.drop_row_data(&item.token.token_id);
            }
            TransformResult::Pending { .. } => {
                // The checkpoint was already written to this token's node
                // state by `run_transform_once`; the token is suspended
                // until a resumed run re-derives and re-enqueues it.
                token_manager.drop_row_data(&item.token.token_id);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments, reason = "each argument is a distinct piece of dispatch-scoped state")]
    fn dispatch_gate(
        &self,
        run: &Run,
        dag: &Arc<Dag>,
        navigator: &DagNavigator,
        node_id: &NodeId,
        condition: &pw_condition::Condition,
        routes: &BTreeMap<String, String>,
        edge_ids: &BTreeMap<(String, String, String), EdgeId>,
        item: WorkItem,
        token_manager: &TokenManager<'_>,
        queue: &mut VecDeque<WorkItem>,
    ) -> Result<(), OrchestratorError> {
        let data = token_manager.row_data(&item.token.token_id).unwrap_or(Value::Null);
        let fields = data.as_object().cloned().unwrap_or_default();

        let label = match condition.evaluate(&fields) {
            Ok(pw_condition::Tristate::True) => "true",
            Ok(pw_condition::Tristate::False) => "false",
            Ok(pw_condition::Tristate::Unknown) => "unknown",
            Err(err) => {
                self.store.record_token_outcome(&run.run_id, &item.token.token_id, TokenOutcomeKind::Failed, None, None, json!({"error": err.to_string()}))?;
                token_manager.drop_row_data(&item.token.token_id);
                return Ok(());
            }
        };

        let Some(target) = routes.get(label).or_else(|| routes.get("default")) else {
            return Err(OrchestratorError::Engine(EngineError::OrchestrationInvariant(format!(
                "gate '{node_id}' has no route for outcome '{label}' and no default"
            ))));
        };

        let target_node = dag.successor_node(node_id, target).unwrap_or_else(|| NodeId::new(target.clone()));

        if let Some(edge_id) = edge_ids.get(&(node_id.as_str().to_owned(), target_node.as_str().to_owned(), target.clone())) {
            let state = self.store.begin_node_state(
                &run.run_id,
                NewNodeState { token_id: item.token.token_id.clone(), node_id: node_id.clone(), step_index: 0, attempt: 0, input_hash: stable_hash(&data)?.to_string(), context_before: None },
            )?;
            self.store.complete_node_state(
                &state.state_id,
                NodeStateCompletion { status: NodeStateStatus::Completed, output_hash: None, context_after: None, duration_ms: 0.0, error_json: None, success_reason_json: None },
            )?;
            self.store.record_routing_events(&state.state_id, vec![RoutingDecision { edge_id: edge_id.clone(), mode: edge_mode_to_routing_mode(EdgeMode::Move) }], None, None)?;
        }

        let continuation = navigator.create_work_item(item.token, Some(target_node), item.coalesce_name, item.coalesce_node_id, item.on_success_sink)?;
        queue.push_back(continuation);
        Ok(())
    }

    #[allow(clippy::too_many_arguments, reason = "each argument is a distinct piece of dispatch-scoped state")]
    fn dispatch_aggregation(
        &self,
        run: &Run,
        navigator: &DagNavigator,
        node_id: &NodeId,
        plugin_name: &str,
        options: &Value,
        trigger: &pw_dag::config::TriggerSpec,
        output_mode: pw_dag::config::OutputMode,
        item: WorkItem,
        token_manager: &TokenManager<'_>,
        checkpoint_manager: &CheckpointManager<'_>,
        all_nodes: &[&DagNode],
        sink_router: &Arc<dyn pw_core::protocol::SinkRouter>,
        queue: &mut VecDeque<WorkItem>,
        pending_aggregation: &mut BTreeMap<NodeId, AggregationBuffer>,
    ) -> Result<(), OrchestratorError> {
        self.store.record_token_outcome(&run.run_id, &item.token.token_id, TokenOutcomeKind::Buffered, None, None, Value::Null)?;
        let buffer = pending_aggregation.entry(node_id.clone()).or_insert_with(|| AggregationBuffer { items: Vec::new(), opened_at: Instant::now() });
        buffer.items.push(item);

        let batch_count = buffer.items.len();
        let batch_age_seconds = buffer.opened_at.elapsed().as_secs();
        if !aggregation_trigger_fires(trigger, batch_count, batch_age_seconds)? {
            return Ok(());
        }

        let Some(buffer) = pending_aggregation.remove(node_id) else {
            return Ok(());
        };
        self.flush_aggregation(run, navigator, node_id, plugin_name, options, output_mode, buffer.items, token_manager, checkpoint_manager, all_nodes, sink_router, queue)
    }

    // Runs a buffered batch through the batch-transform plugin and retires
    // every member token. Shared by the trigger-fired path and the
    // end-of-queue forced drain, neither of which re-checks the trigger.
    #[allow(clippy::too_many_arguments, reason = "each argument is a distinct piece of dispatch-scoped state")]
    fn flush_aggregation(
        &self,
        run: &Run,
        navigator: &DagNavigator,
        node_id: &NodeId,
        plugin_name: &str,
        options: &Value,
        output_mode: pw_dag::config::OutputMode,
        items: Vec<WorkItem>,
        token_manager: &TokenManager<'_>,
        checkpoint_manager: &CheckpointManager<'_>,
        all_nodes: &[&DagNode],
        sink_router: &Arc<dyn pw_core::protocol::SinkRouter>,
        queue: &mut VecDeque<WorkItem>,
    ) -> Result<(), OrchestratorError> {
        let Some(driving_item) = items.last().cloned() else {
            return Ok(());
        };
        let members: Vec<Token> = items.iter().map(|item| item.token.clone()).collect();

        let batch = self.store.create_batch(&run.run_id, node_id, "count".to_owned())?;
        self.store.update_batch_status(&batch.batch_id, BatchStatus::Executing)?;
        for (ordinal, member) in members.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation, reason = "batch membership stays far below u32::MAX")]
            self.store.add_batch_member(&batch.batch_id, &member.token_id, ordinal as u32)?;
        }

        let rows: Vec<PipelineRow> = members
            .iter()
            .map(|token| PipelineRow { data: token_manager.row_data(&token.token_id).unwrap_or(Value::Null), contract: Arc::new(dag_schema_placeholder()) })
            .collect();

        let input_hash = stable_hash(&Value::Array(rows.iter().map(|row| row.data.clone()).collect()))?.to_string();
        let state = self.store.begin_node_state(
            &run.run_id,
            NewNodeState { token_id: members[0].token_id.clone(), node_id: node_id.clone(), step_index: 0, attempt: 0, input_hash, context_before: None },
        )?;

        let plugin = self.registry.batch_transform(plugin_name)?;
        let executor = PooledExecutor::new(PoolConfig::default());
        let row_ctx = vec![RowContext { state_id: state.state_id.as_str().to_owned(), row: rows, row_index: 0 }];

        let start = Instant::now();
        let mut results = executor.execute_batch(row_ctx, &|ctx: &RowContext<Vec<PipelineRow>>| {
            let mut plugin_ctx = self.plugin_context(&run.run_id, node_id, options.clone(), Arc::clone(sink_router));
            plugin_ctx.bind_state(state.state_id.clone());
            match plugin.process_batch(ctx.row.clone(), &mut plugin_ctx) {
                Ok(result) => Ok(result),
                Err(EngineError::PluginRetryable(message)) => Err(CapacityError { message, status_code: None }),
                Err(other) => Ok(TransformResult::Error { reason: json!({"error": other.to_string()}), retryable: false }),
            }
        });
        #[allow(clippy::cast_precision_loss, reason = "durations stay far below f64's exact-integer range")]
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        let stats = executor.stats();
        let stats_json = json!({
            "pool_size": stats.pool_config.pool_size,
            "max_capacity_retry_seconds": stats.pool_config.max_capacity_retry_seconds,
            "capacity_retries": stats.pool_stats.capacity_retries,
            "successes": stats.pool_stats.successes,
            "peak_delay_ms": stats.pool_stats.peak_delay_ms,
            "current_delay_ms": stats.pool_stats.current_delay_ms,
            "total_throttle_time_ms": stats.pool_stats.total_throttle_time_ms,
        });

        let outcome = results.pop().ok_or_else(|| EngineError::OrchestrationInvariant("pooled executor dropped the only aggregation batch row".to_owned()))?;

        let success_reason = match &outcome {
            TransformResult::Success { success_reason, .. } | TransformResult::SuccessMulti { success_reason, .. } => success_reason.clone(),
            TransformResult::Error { .. } | TransformResult::Pending { .. } => None,
        };
        self.store.complete_node_state(
            &state.state_id,
            NodeStateCompletion {
                status: if matches!(outcome, TransformResult::Error { .. }) { NodeStateStatus::Failed } else { NodeStateStatus::Completed },
                output_hash: None,
                context_after: Some(stats_json),
                duration_ms,
                error_json: if let TransformResult::Error { reason, .. } = &outcome { Some(reason.clone()) } else { None },
                success_reason_json: success_reason,
            },
        )?;

        self.store.update_batch_status(&batch.batch_id, BatchStatus::Completed)?;

        let upstream_specs: Vec<Value> = all_nodes.iter().map(|node| node_spec_for_hash(node)).collect();
        let upstream_hash = checkpoint_manager.upstream_topology_hash(&upstream_specs)?;
        let node_spec = all_nodes.iter().find(|node| &node.node_id == node_id).map(|node| node_spec_for_hash(node)).unwrap_or(Value::Null);
        let node_hash = checkpoint_manager.node_config_hash(&node_spec)?;
        checkpoint_manager.write(&run.run_id, members[0].token_id.clone(), node_id.clone(), upstream_hash, node_hash, None, mark_sinks_flushed())?;

        let expand_group = token_manager.new_expand_group();
        let parents: Vec<TokenId> = members.iter().map(|token| token.token_id.clone()).collect();
        let produced = match (output_mode, outcome) {
            (pw_dag::config::OutputMode::Transform, TransformResult::Success { row, .. }) => vec![row.data],
            (pw_dag::config::OutputMode::Transform, TransformResult::SuccessMulti { rows, .. }) => rows.into_iter().map(|row| row.data).collect(),
            (pw_dag::config::OutputMode::Passthrough, _) => members.iter().map(|token| token_manager.row_data(&token.token_id).unwrap_or(Value::Null)).collect(),
            (_, TransformResult::Error { reason, .. }) => {
                for parent in &members {
                    self.store.record_token_outcome(&run.run_id, &parent.token_id, TokenOutcomeKind::Failed, None, Some(batch.batch_id.clone()), reason.clone())?;
                    token_manager.drop_row_data(&parent.token_id);
                }
                return Ok(());
            }
            (_, TransformResult::Pending { .. }) => return Ok(()),
        };

        for data in produced {
            let child = token_manager.expand_token(&run.run_id, &members[0], expand_group.clone(), data)?;
            self.store.add_batch_output(&batch.batch_id, &child.token_id, parents.clone())?;
            let continuation = navigator.create_continuation_work_item(child, node_id, driving_item.coalesce_name.clone(), driving_item.on_success_sink.clone())?;
            queue.push_back(continuation);
        }
        for parent in &members[1 ..] {
            self.store.record_token_outcome(&run.run_id, &parent.token_id, TokenOutcomeKind::ConsumedInBatch, None, Some(batch.batch_id.clone()), Value::Null)?;
            token_manager.drop_row_data(&parent.token_id);
        }
        self.store.record_token_outcome(&run.run_id, &members[0].token_id, TokenOutcomeKind::ConsumedInBatch, None, Some(batch.batch_id.clone()), Value::Null)?;

        Ok(())
    }

    #[allow(clippy::too_many_arguments, reason = "each argument is a distinct piece of dispatch-scoped state")]
    fn dispatch_coalesce(
        &self,
        run: &Run,
        dag: &Arc<Dag>,
        navigator: &DagNavigator,
        node_id: &NodeId,
        item: WorkItem,
        token_manager: &TokenManager<'_>,
        queue: &mut VecDeque<WorkItem>,
        pending_coalesce: &mut BTreeMap<(NodeId, RowId), Vec<Token>>,
        fired_coalesce: &mut BTreeSet<(NodeId, RowId)>,
    ) -> Result<(), OrchestratorError> {
        let node = dag.node(node_id).ok_or_else(|| EngineError::OrchestrationInvariant(format!("coalesce node '{node_id}' vanished")))?;
        let DagNodeKind::Coalesce { branches, policy, quorum_count, merge, .. } = &node.kind else {
            return Err(OrchestratorError::Engine(EngineError::OrchestrationInvariant(format!("'{node_id}' is not a coalesce node"))));
        };

        let key = (node_id.clone(), item.token.row_id.clone());
        if fired_coalesce.contains(&key) {
            // A late arrival on a branch that has already been merged
            // (§11): recorded as routed, not as a failure, and does not
            // reopen the coalesce.
            self.store.record_token_outcome(&run.run_id, &item.token.token_id, TokenOutcomeKind::Routed, None, None, Value::Null)?;
            token_manager.drop_row_data(&item.token.token_id);
            return Ok(());
        }

        let entry = pending_coalesce.entry(key.clone()).or_default();
        entry.push(item.token.clone());

        let required = match policy {
            CoalescePolicy::RequireAll | CoalescePolicy::BestEffort => branches.len(),
            #[allow(clippy::cast_possible_truncation, reason = "quorum counts stay far below usize::MAX")]
            CoalescePolicy::Quorum => quorum_count.map_or(branches.len(), |count| count as usize),
        };
        if entry.len() < required {
            self.store.record_token_outcome(&run.run_id, &item.token.token_id, TokenOutcomeKind::Buffered, None, None, Value::Null)?;
            return Ok(());
        }

        let parents = pending_coalesce.remove(&key).unwrap_or_default();
        fired_coalesce.insert(key);

        let merged_data = match merge {
            MergeStrategy::Union => {
                let mut merged = serde_json::Map::new();
                for parent in &parents {
                    if let Some(data) = token_manager.row_data(&parent.token_id).and_then(|value| value.as_object().cloned()) {
                        merged.extend(data);
                    }
                }
                Value::Object(merged)
            }
            MergeStrategy::FirstComplete => token_manager.row_data(&parents[0].token_id).unwrap_or(Value::Null),
        };

        let join_group = token_manager.new_join_group();
        let merged_token = token_manager.coalesce_tokens(&run.run_id, &parents, join_group, merged_data)?;
        let sink_name = navigator.resolve_coalesce_sink(node_id.as_str(), "engine coalesce dispatch")?;
        let sink_node = dag.node(&NodeId::new(sink_name.clone())).map(|node| node.node_id.clone()).unwrap_or_else(|| NodeId::new(sink_name));
        let continuation = navigator.create_work_item(merged_token, Some(sink_node), None, None, item.on_success_sink)?;
        queue.push_back(continuation);
        Ok(())
    }

    #[allow(clippy::too_many_arguments, reason = "each argument is a distinct piece of dispatch-scoped state")]
    fn dispatch_sink(
        &self,
        run: &Run,
        node_id: &NodeId,
        plugin_name: &str,
        options: &Value,
        item: WorkItem,
        token_manager: &TokenManager<'_>,
        sink_router: &Arc<dyn pw_core::protocol::SinkRouter>,
    ) -> Result<(), OrchestratorError> {
        let data = token_manager.row_data(&item.token.token_id).unwrap_or(Value::Null);
        let start = Instant::now();
        let input_hash = stable_hash(&data)?.to_string();
        let state = self.store.begin_node_state(
            &run.run_id,
            NewNodeState { token_id: item.token.token_id.clone(), node_id: node_id.clone(), step_index: 0, attempt: 0, input_hash, context_before: None },
        )?;
        let mut ctx = self.plugin_context(&run.run_id, node_id, options.clone(), Arc::clone(sink_router));
        ctx.bind_state(state.state_id.clone());

        let outcome = self.registry.write_sink(node_id.as_str(), vec![data], &mut ctx);
        #[allow(clippy::cast_precision_loss, reason = "durations stay far below f64's exact-integer range")]
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(descriptor) => {
                self.store.complete_node_state(
                    &state.state_id,
                    NodeStateCompletion {
                        status: NodeStateStatus::Completed,
                        output_hash: Some(descriptor.content_hash.clone()),
                        context_after: None,
                        duration_ms,
                        error_json: None,
                        success_reason_json: None,
                    },
                )?;
                self.store.register_artifact(
                    &run.run_id,
                    pw_store::NewArtifact {
                        state_id: state.state_id.clone(),
                        sink_node_id: node_id.clone(),
                        artifact_type: descriptor.artifact_type,
                        path_or_uri: descriptor.path_or_uri,
                        content_hash: descriptor.content_hash,
                        size_bytes: descriptor.size_bytes,
                        idempotency_key: descriptor.idempotency_key,
                    },
                )?;
                self.store.record_token_outcome(&run.run_id, &item.token.token_id, TokenOutcomeKind::Completed, Some(node_id.as_str().to_owned()), None, Value::Null)?;
            }
            Err(err) => {
                self.store.complete_node_state(
                    &state.state_id,
                    NodeStateCompletion {
                        status: NodeStateStatus::Failed,
                        output_hash: None,
                        context_after: None,
                        duration_ms,
                        error_json: Some(json!({"error": err.to_string()})),
                        success_reason_json: None,
                    },
                )?;
                self.store.record_token_outcome(&run.run_id, &item.token.token_id, TokenOutcomeKind::Failed, Some(node_id.as_str().to_owned()), None, json!({"error": err.to_string()}))?;
            }
        }
        token_manager.drop_row_data(&item.token.token_id);
        Ok(())
    }
}

/// A permissive placeholder contract attached to rows whose true contract
/// is carried by the `Dag` the orchestrator already validated schema
/// compatibility against at construction time; the plugin protocol's
/// [`PipelineRow::contract`] field exists for plugins that inspect it
/// directly, not to re-check compatibility the engine already guarantees.
fn dag_schema_placeholder() -> pw_core::core::schema::SchemaContract {
    pw_core::core::schema::SchemaContract {
        mode: pw_core::core::model::SchemaMode::Dynamic,
        fields: Vec::new(),
        allow_extra_fields: true,
        strict: false,
        required_input_fields: None,
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

    use std::sync::Arc;

    use pw_core::core::model::ReproducibilityGrade;
    use pw_core::core::model::RunStatus;
    use pw_core::protocol::ArtifactDescriptor;
    use pw_core::protocol::PluginContext;
    use pw_core::protocol::SourceRow;
    use pw_dag::PipelineConfig;
    use pw_dag::config::SinkSpec;
    use pw_dag::config::SourceSpec;
    use pw_payload::FilesystemPayloadStore;
    use serde_json::json;

    use super::Orchestrator;
    use super::PluginRegistry;

    struct TestSource;
    impl pw_core::protocol::Source for TestSource {
        fn load(&self, _ctx: &PluginContext) -> Result<Box<dyn Iterator<Item = SourceRow>>, pw_core::core::error::EngineError> {
            let rows = vec![
                SourceRow::Valid { data: json!({"value": 1}), contract: Arc::new(super::dag_schema_placeholder()) },
                SourceRow::Valid { data: json!({"value": 2}), contract: Arc::new(super::dag_schema_placeholder()) },
            ];
            Ok(Box::new(rows.into_iter()))
        }
    }

    struct TestSink;
    impl pw_core::protocol::Sink for TestSink {
        fn write(&mut self, rows: Vec<serde_json::Value>, _ctx: &mut PluginContext) -> Result<ArtifactDescriptor, pw_core::core::error::EngineError> {
            Ok(ArtifactDescriptor {
                artifact_type: "memory".to_owned(),
                path_or_uri: "memory://sink".to_owned(),
                content_hash: pw_core::core::canonical::stable_hash(&rows)?.to_string(),
                size_bytes: rows.len() as u64,
                idempotency_key: None,
            })
        }
        fn flush(&mut self) -> Result<(), pw_core::core::error::EngineError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), pw_core::core::error::EngineError> {
            Ok(())
        }
        fn validate_output_target(&self, _contract: &pw_core::core::schema::SchemaContract) -> Result<(), pw_core::core::error::EngineError> {
            Ok(())
        }
    }

    fn minimal_config() -> PipelineConfig {
        PipelineConfig {
            source: SourceSpec { plugin: "test".to_owned(), options: serde_json::Value::Null, on_success: "sink".to_owned(), schema: None },
            transforms: Vec::new(),
            gates: Vec::new(),
            aggregations: Vec::new(),
            coalesce: Vec::new(),
            sinks: std::collections::BTreeMap::from([("sink".to_owned(), SinkSpec { plugin: "test".to_owned(), options: serde_json::Value::Null })]),
            default_sink: None,
        }
    }

    #[test]
    fn runs_a_linear_source_to_sink_pipeline_to_full_reproducible() {
        let store = Arc::new(pw_store::SqliteLandscape::open_in_memory().expect("opens store"));
        let temp = tempfile::tempdir().expect("tempdir");
        let payload_store: Arc<dyn pw_core::protocol::PayloadStore> = Arc::new(FilesystemPayloadStore::open(temp.path()).expect("opens payload store"));

        let mut registry = PluginRegistry::new();
        registry.register_source("test", Arc::new(TestSource));
        registry.register_sink("sink", Box::new(TestSink));
        registry.register_determinism("test", pw_core::core::model::Determinism::Deterministic);

        let orchestrator = Orchestrator::new(store, payload_store, Arc::new(registry));
        let summary = orchestrator.run(&minimal_config()).expect("pipeline runs to completion");

        assert_eq!(summary.run.status, RunStatus::Completed);
        assert_eq!(summary.run.reproducibility_grade, Some(ReproducibilityGrade::FullReproducible));
    }

    #[test]
    fn quarantined_rows_are_recorded_without_aborting_the_run() {
        struct QuarantineSource;
        impl pw_core::protocol::Source for QuarantineSource {
            fn load(&self, _ctx: &PluginContext) -> Result<Box<dyn Iterator<Item = SourceRow>>, pw_core::core::error::EngineError> {
                Ok(Box::new(
                    vec![SourceRow::Quarantined { data: json!({"bad": true}), reason: "missing required field".to_owned() }].into_iter(),
                ))
            }
        }

        let store = Arc::new(pw_store::SqliteLandscape::open_in_memory().expect("opens store"));
        let temp = tempfile::tempdir().expect("tempdir");
        let payload_store: Arc<dyn pw_core::protocol::PayloadStore> = Arc::new(FilesystemPayloadStore::open(temp.path()).expect("opens payload store"));

        let mut registry = PluginRegistry::new();
        registry.register_source("test", Arc::new(QuarantineSource));
        registry.register_sink("sink", Box::new(TestSink));

        let orchestrator = Orchestrator::new(store, payload_store, Arc::new(registry));
        let summary = orchestrator.run(&minimal_config()).expect("pipeline runs to completion");
        assert_eq!(summary.run.status, RunStatus::Completed);
    }

    struct SummingBatchTransform {
        state_ids: std::sync::Mutex<Vec<pw_core::core::identifiers::StateId>>,
    }
    impl pw_core::protocol::BatchTransform for SummingBatchTransform {
        fn process_batch(&self, rows: Vec<pw_core::protocol::PipelineRow>, ctx: &mut PluginContext) -> Result<pw_core::protocol::TransformResult, pw_core::core::error::EngineError> {
            if let Some(state_id) = ctx.state_id() {
                self.state_ids.lock().expect("lock state_ids").push(state_id.clone());
            }
            let sum: i64 = rows.iter().filter_map(|row| row.data.get("value").and_then(serde_json::Value::as_i64)).sum();
            Ok(pw_core::protocol::TransformResult::Success {
                row: pw_core::protocol::PipelineRow { data: json!({"sum": sum}), contract: Arc::new(super::dag_schema_placeholder()) },
                success_reason: None,
            })
        }
    }

    struct RecordingSink {
        rows: Arc<std::sync::Mutex<Vec<serde_json::Value>>>,
    }
    impl pw_core::protocol::Sink for RecordingSink {
        fn write(&mut self, rows: Vec<serde_json::Value>, _ctx: &mut PluginContext) -> Result<ArtifactDescriptor, pw_core::core::error::EngineError> {
            self.rows.lock().expect("lock recorded rows").extend(rows.clone());
            Ok(ArtifactDescriptor {
                artifact_type: "memory".to_owned(),
                path_or_uri: "memory://sink".to_owned(),
                content_hash: pw_core::core::canonical::stable_hash(&rows)?.to_string(),
                size_bytes: rows.len() as u64,
                idempotency_key: None,
            })
        }
        fn flush(&mut self) -> Result<(), pw_core::core::error::EngineError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), pw_core::core::error::EngineError> {
            Ok(())
        }
        fn validate_output_target(&self, _contract: &pw_core::core::schema::SchemaContract) -> Result<(), pw_core::core::error::EngineError> {
            Ok(())
        }
    }

    fn aggregation_config(trigger: pw_dag::config::TriggerSpec, output_mode: pw_dag::config::OutputMode) -> PipelineConfig {
        PipelineConfig {
            source: SourceSpec { plugin: "test".to_owned(), options: serde_json::Value::Null, on_success: "agg_in".to_owned(), schema: None },
            transforms: Vec::new(),
            gates: Vec::new(),
            aggregations: vec![pw_dag::config::AggregationSpec {
                name: "agg".to_owned(),
                plugin: "sum".to_owned(),
                input: "agg_in".to_owned(),
                on_success: "sink".to_owned(),
                trigger,
                output_mode,
                options: serde_json::Value::Null,
                schema: None,
            }],
            coalesce: Vec::new(),
            sinks: std::collections::BTreeMap::from([("sink".to_owned(), SinkSpec { plugin: "test".to_owned(), options: serde_json::Value::Null })]),
            default_sink: None,
        }
    }

    #[test]
    fn a_condition_only_trigger_flushes_the_buffer_without_a_count() {
        let store = Arc::new(pw_store::SqliteLandscape::open_in_memory().expect("opens store"));
        let temp = tempfile::tempdir().expect("tempdir");
        let payload_store: Arc<dyn pw_core::protocol::PayloadStore> = Arc::new(FilesystemPayloadStore::open(temp.path()).expect("opens payload store"));

        let recorded = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        registry.register_source("test", Arc::new(TestSource));
        registry.register_batch_transform("sum", Arc::new(SummingBatchTransform { state_ids: std::sync::Mutex::new(Vec::new()) }));
        registry.register_sink("sink", Box::new(RecordingSink { rows: Arc::clone(&recorded) }));

        let orchestrator = Orchestrator::new(store, payload_store, Arc::new(registry));
        let trigger = pw_dag::config::TriggerSpec { count: None, timeout_seconds: None, condition: Some("row['batch_count'] >= 2".to_owned()) };
        let config = aggregation_config(trigger, pw_dag::config::OutputMode::Transform);
        let summary = orchestrator.run(&config).expect("pipeline runs to completion");

        assert_eq!(summary.run.status, RunStatus::Completed);
        let rows = recorded.lock().expect("lock recorded rows");
        assert_eq!(*rows, vec![json!({"sum": 3})], "a condition-only trigger must flush the batch exactly once");
    }

    #[test]
    fn a_trigger_that_never_reaches_threshold_is_force_flushed_at_end_of_queue() {
        let store = Arc::new(pw_store::SqliteLandscape::open_in_memory().expect("opens store"));
        let temp = tempfile::tempdir().expect("tempdir");
        let payload_store: Arc<dyn pw_core::protocol::PayloadStore> = Arc::new(FilesystemPayloadStore::open(temp.path()).expect("opens payload store"));

        let recorded = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        registry.register_source("test", Arc::new(TestSource));
        registry.register_batch_transform("sum", Arc::new(SummingBatchTransform { state_ids: std::sync::Mutex::new(Vec::new()) }));
        registry.register_sink("sink", Box::new(RecordingSink { rows: Arc::clone(&recorded) }));

        let orchestrator = Orchestrator::new(store, payload_store, Arc::new(registry));
        let trigger = pw_dag::config::TriggerSpec { count: Some(100), timeout_seconds: None, condition: None };
        let config = aggregation_config(trigger, pw_dag::config::OutputMode::Passthrough);
        let summary = orchestrator.run(&config).expect("pipeline runs to completion");

        assert_eq!(summary.run.status, RunStatus::Completed);
        let rows = recorded.lock().expect("lock recorded rows");
        assert_eq!(*rows, vec![json!({"value": 1}), json!({"value": 2})], "an unreached trigger must still drain at end of queue");
    }

    #[test]
    fn aggregation_node_state_carries_pool_throttle_stats() {
        let store = Arc::new(pw_store::SqliteLandscape::open_in_memory().expect("opens store"));
        let temp = tempfile::tempdir().expect("tempdir");
        let payload_store: Arc<dyn pw_core::protocol::PayloadStore> = Arc::new(FilesystemPayloadStore::open(temp.path()).expect("opens payload store"));

        let plugin = Arc::new(SummingBatchTransform { state_ids: std::sync::Mutex::new(Vec::new()) });
        let mut registry = PluginRegistry::new();
        registry.register_source("test", Arc::new(TestSource));
        registry.register_batch_transform("sum", Arc::clone(&plugin) as Arc<dyn pw_core::protocol::BatchTransform>);
        registry.register_sink("sink", Box::new(TestSink));

        let orchestrator = Orchestrator::new(Arc::clone(&store), payload_store, Arc::new(registry));
        let trigger = pw_dag::config::TriggerSpec { count: Some(2), timeout_seconds: None, condition: None };
        let config = aggregation_config(trigger, pw_dag::config::OutputMode::Transform);
        let summary = orchestrator.run(&config).expect("pipeline runs to completion");
        assert_eq!(summary.run.status, RunStatus::Completed);

        let state_id = plugin.state_ids.lock().expect("lock state ids").first().cloned().expect("batch transform was invoked with a bound state");
        let state = store.get_node_state(&state_id).expect("aggregation node state was recorded");
        let context_after = state.context_after.expect("pool stats were written to context_after");
        assert!(context_after.get("capacity_retries").is_some(), "pool stats must include capacity_retries");
        assert!(context_after.get("successes").is_some(), "pool stats must include successes");
        assert!(context_after.get("total_throttle_time_ms").is_some(), "pool stats must include total_throttle_time_ms");
    }
}
