// crates/pw-dag/src/construct.rs
// ============================================================================
// Module: DAG Construction
// Description: Compiles a `PipelineConfig` into a validated `Dag` (§4.5):
// builds the producer/consumer connection registry, checks schema
// compatibility per edge, enforces acyclicity, and flags divert-into-
// require_all-coalesce interactions.
// Purpose: Catch every wiring mistake before a run starts, with actionable,
// suggestion-bearing diagnostics, rather than failing mid-run on a
// misrouted token.
// Dependencies: pw-condition (gate/trigger conditions), pw-core (schema
// compatibility), crate::{config, error, model}
// ============================================================================

//! ## Overview
//! Construction proceeds in four passes over the configuration:
//! 1. Build every node, assigning each a [`pw_core::core::identifiers::NodeId`]
//!    equal to its declared name (sources are named `source`, sinks keep
//!    their map key).
//! 2. Build the producer and consumer registries (§4.5): every connection
//!    name gets at most one producer and one consumer; connection names and
//!    sink names occupy disjoint namespaces.
//! 3. Resolve every producer's target to a consumer node or a sink,
//!    materializing [`crate::model::DagEdge`]s, and check schema
//!    compatibility per edge.
//! 4. Check the resulting graph for cycles outside declared coalesce/
//!    aggregation join points, and flag divert-into-`require_all`-coalesce
//!    interactions as non-fatal warnings.
//!
//! Every pass collects into the same `Vec<ConstructionError>` rather than
//! returning on the first failure, so `pw-cli validate` can report every
//! mistake in one run.

use std::collections::BTreeMap;

use pw_core::core::identifiers::NodeId;
use pw_core::core::model::EdgeMode;
use pw_core::core::model::SchemaMode;
use pw_core::core::schema::SchemaContract;
use pw_core::core::schema::check_compatibility;

use crate::config::CoalescePolicy;
use crate::config::PipelineConfig;
use crate::error::ConstructionError;
use crate::model::Dag;
use crate::model::DagEdge;
use crate::model::DagNode;
use crate::model::DagNodeKind;

/// The outcome of a successful construction pass: the validated graph, plus
/// any non-fatal warnings worth surfacing to the operator.
#[derive(Debug, Clone)]
pub struct ConstructionResult {
    /// The validated graph.
    pub dag: Dag,
}

/// A target a producing node routes to: either a connection consumed by
/// another node, or a terminal sink.
#[derive(Debug, Clone)]
enum Target {
    /// Routes into another node via the named connection.
    Connection(String),
    /// Routes directly to the named sink.
    Sink(String),
}

/// Compiles `config` into a validated [`Dag`].
///
/// # Errors
///
/// Returns every [`ConstructionError`] found, collected rather than
/// short-circuited on the first.
pub fn construct(config: &PipelineConfig) -> Result<ConstructionResult, Vec<ConstructionError>> {
    let mut errors = Vec::new();

    let mut nodes: BTreeMap<NodeId, DagNode> = BTreeMap::new();
    let mut node_names: Vec<String> = Vec::new();
    let mut seen_names: BTreeMap<String, ()> = BTreeMap::new();

    let declare_name = |name: &str, errors: &mut Vec<ConstructionError>, seen: &mut BTreeMap<String, ()>| {
        if seen.insert(name.to_owned(), ()).is_some() {
            errors.push(ConstructionError::DuplicateNodeName { name: name.to_owned() });
        }
    };

    declare_name("source", &mut errors, &mut seen_names);
    node_names.push("source".to_owned());
    nodes.insert(
        NodeId::new("source"),
        DagNode {
            node_id: NodeId::new("source"),
            kind: DagNodeKind::Source { plugin: config.source.plugin.clone(), options: config.source.options.clone() },
            schema: schema_or_observed(config.source.schema.clone()),
        },
    );

    for transform in &config.transforms {
        declare_name(&transform.name, &mut errors, &mut seen_names);
        node_names.push(transform.name.clone());
        nodes.insert(
            NodeId::new(transform.name.clone()),
            DagNode {
                node_id: NodeId::new(transform.name.clone()),
                kind: DagNodeKind::Transform { plugin: transform.plugin.clone(), options: transform.options.clone() },
                schema: schema_or_observed(transform.schema.clone()),
            },
        );
    }

    for gate in &config.gates {
        declare_name(&gate.name, &mut errors, &mut seen_names);
        node_names.push(gate.name.clone());
        match pw_condition::parse(&gate.condition) {
            Ok(condition) => {
                nodes.insert(
                    NodeId::new(gate.name.clone()),
                    DagNode {
                        node_id: NodeId::new(gate.name.clone()),
                        kind: DagNodeKind::Gate { condition, routes: gate.routes.clone() },
                        schema: passthrough_schema(),
                    },
                );
            }
            Err(source) => errors.push(ConstructionError::InvalidCondition { node: gate.name.clone(), source }),
        }
    }

    for aggregation in &config.aggregations {
        declare_name(&aggregation.name, &mut errors, &mut seen_names);
        node_names.push(aggregation.name.clone());
        if let Some(condition) = &aggregation.trigger.condition {
            if let Err(source) = pw_condition::parse(condition) {
                errors.push(ConstructionError::InvalidCondition { node: aggregation.name.clone(), source });
            }
        }
        nodes.insert(
            NodeId::new(aggregation.name.clone()),
            DagNode {
                node_id: NodeId::new(aggregation.name.clone()),
                kind: DagNodeKind::Aggregation {
                    plugin: aggregation.plugin.clone(),
                    options: aggregation.options.clone(),
                    trigger: aggregation.trigger.clone(),
                    output_mode: aggregation.output_mode,
                },
                schema: schema_or_observed(aggregation.schema.clone()),
            },
        );
    }

    for coalesce in &config.coalesce {
        declare_name(&coalesce.name, &mut errors, &mut seen_names);
        node_names.push(coalesce.name.clone());
        if let Some(quorum_count) = coalesce.quorum_count {
            if coalesce.policy == CoalescePolicy::Quorum
                && (quorum_count == 0 || usize::try_from(quorum_count).is_ok_and(|count| count > coalesce.branches.len()))
            {
                errors.push(ConstructionError::InvalidQuorumCount {
                    coalesce: coalesce.name.clone(),
                    quorum_count,
                    branch_count: coalesce.branches.len(),
                });
            }
        }
        nodes.insert(
            NodeId::new(coalesce.name.clone()),
            DagNode {
                node_id: NodeId::new(coalesce.name.clone()),
                kind: DagNodeKind::Coalesce {
                    branches: coalesce.branches.clone(),
                    policy: coalesce.policy,
                    quorum_count: coalesce.quorum_count,
                    timeout_seconds: coalesce.timeout_seconds,
                    merge: coalesce.merge,
                },
                schema: passthrough_schema(),
            },
        );
    }

    for (sink_name, sink) in &config.sinks {
        if seen_names.contains_key(sink_name) {
            errors.push(ConstructionError::NamespaceCollision { name: sink_name.clone() });
        }
        nodes.insert(
            NodeId::new(sink_name.clone()),
            DagNode {
                node_id: NodeId::new(sink_name.clone()),
                kind: DagNodeKind::Sink { plugin: sink.plugin.clone(), options: sink.options.clone() },
                schema: passthrough_schema(),
            },
        );
    }

    // Consumer registry: connection name -> the single node consuming it.
    let mut consumers: BTreeMap<String, String> = BTreeMap::new();
    let mut claim_consumer = |connection: &str, consumer: &str, errors: &mut Vec<ConstructionError>| {
        if let Some(first_consumer) = consumers.insert(connection.to_owned(), consumer.to_owned()) {
            errors.push(ConstructionError::DuplicateConsumer {
                connection: connection.to_owned(),
                first_consumer,
                second_consumer: consumer.to_owned(),
            });
        }
    };

    for transform in &config.transforms {
        claim_consumer(&transform.input, &transform.name, &mut errors);
    }
    for gate in &config.gates {
        claim_consumer(&gate.input, &gate.name, &mut errors);
    }
    for aggregation in &config.aggregations {
        claim_consumer(&aggregation.input, &aggregation.name, &mut errors);
    }
    for coalesce in &config.coalesce {
        for branch in &coalesce.branches {
            claim_consumer(branch, &coalesce.name, &mut errors);
        }
    }

    // Producer registry: each producing node's targets, as (from_node, label, target).
    let mut producer_edges: Vec<(String, String, Target)> = Vec::new();
    let mut producers: BTreeMap<String, String> = BTreeMap::new();
    let mut claim_producer = |connection: &str, producer: &str, errors: &mut Vec<ConstructionError>| {
        if let Some(first_producer) = producers.insert(connection.to_owned(), producer.to_owned()) {
            errors.push(ConstructionError::DuplicateProducer {
                connection: connection.to_owned(),
                first_producer,
                second_producer: producer.to_owned(),
            });
        }
    };

    let mut route = |from_node: &str, label: &str, target: &str, errors: &mut Vec<ConstructionError>, edges: &mut Vec<(String, String, Target)>| {
        if consumers.contains_key(target) {
            claim_producer(target, from_node, errors);
            edges.push((from_node.to_owned(), label.to_owned(), Target::Connection(target.to_owned())));
        } else if config.sinks.contains_key(target) {
            edges.push((from_node.to_owned(), label.to_owned(), Target::Sink(target.to_owned())));
        } else {
            errors.push(ConstructionError::UnresolvedConnection {
                from_node: from_node.to_owned(),
                target: target.to_owned(),
                suggestion: suggestion_for(target, &node_names, &config.sinks),
            });
        }
    };

    route("source", "continue", &config.source.on_success, &mut errors, &mut producer_edges);
    for transform in &config.transforms {
        route(&transform.name, "continue", &transform.on_success, &mut errors, &mut producer_edges);
    }
    for aggregation in &config.aggregations {
        route(&aggregation.name, "continue", &aggregation.on_success, &mut errors, &mut producer_edges);
    }
    for coalesce in &config.coalesce {
        route(&coalesce.name, "continue", &coalesce.on_success, &mut errors, &mut producer_edges);
    }
    for gate in &config.gates {
        for (outcome, target) in &gate.routes {
            route(&gate.name, outcome, target, &mut errors, &mut producer_edges);
        }
    }

    if errors.is_empty() {
        let mut edges = Vec::with_capacity(producer_edges.len());
        for (from_node, label, target) in &producer_edges {
            let (to_node, mode) = match target {
                Target::Connection(connection) => {
                    (consumers.get(connection).cloned().unwrap_or_default(), EdgeMode::Move)
                }
                Target::Sink(sink) => (sink.clone(), EdgeMode::Move),
            };
            let from_id = NodeId::new(from_node.clone());
            let to_id = NodeId::new(to_node.clone());

            if let (Some(producer_node), Some(consumer_node)) = (nodes.get(&from_id), nodes.get(&to_id)) {
                let report = check_compatibility(&producer_node.schema, &consumer_node.schema);
                if !report.compatible {
                    errors.push(ConstructionError::SchemaIncompatible {
                        from_node: from_node.clone(),
                        to_node: to_node.clone(),
                        report,
                    });
                }
            }

            edges.push(DagEdge { from_node_id: from_id, to_node_id: to_id, label: label.clone(), mode });
        }

        if errors.is_empty() {
            let warnings = warn_divert_coalesce_interactions(&config.coalesce, &producers, &nodes);
            let connection_consumers: BTreeMap<String, NodeId> =
                consumers.iter().map(|(connection, consumer)| (connection.clone(), NodeId::new(consumer.clone()))).collect();
            let dag = Dag::from_parts(nodes, edges, warnings, connection_consumers);
            if let Some(cycle) = dag.find_cycle() {
                errors.push(ConstructionError::CycleDetected { path: cycle.into_iter().map(|id| id.into_inner()).collect() });
            } else {
                return Ok(ConstructionResult { dag });
            }
        }
    }

    Err(errors)
}

/// A `Dynamic`, unconstrained schema contract for a node whose output
/// schema was not declared (observed from the first row at runtime).
fn schema_or_observed(declared: Option<SchemaContract>) -> SchemaContract {
    declared.unwrap_or_else(|| SchemaContract {
        mode: SchemaMode::Dynamic,
        fields: Vec::new(),
        allow_extra_fields: true,
        strict: false,
        required_input_fields: None,
    })
}

/// The schema contract for a purely structural node (gate, coalesce, sink):
/// such a node never changes the row shape, so it is always compatible.
fn passthrough_schema() -> SchemaContract {
    SchemaContract { mode: SchemaMode::Free, fields: Vec::new(), allow_extra_fields: true, strict: false, required_input_fields: None }
}

/// Flags transforms whose `on_success` diverts into a coalesce declared
/// with `policy: require_all` (§4.5): a divert edge by definition may not
/// fire, so a `require_all` coalesce downstream of one can deadlock waiting
/// for a branch that never arrives. This is a warning, not a construction
/// failure, since the plugin author may have a compensating design.
fn warn_divert_coalesce_interactions(
    coalesce_specs: &[crate::config::CoalesceSpec],
    producers: &BTreeMap<String, String>,
    nodes: &BTreeMap<NodeId, DagNode>,
) -> Vec<String> {
    let mut warnings = Vec::new();
    for coalesce in coalesce_specs {
        if coalesce.policy != CoalescePolicy::RequireAll {
            continue;
        }
        for branch in &coalesce.branches {
            let Some(producer_name) = producers.get(branch) else { continue };
            let Some(producer_node) = nodes.get(&NodeId::new(producer_name.clone())) else { continue };
            if matches!(producer_node.kind, DagNodeKind::Transform { .. }) {
                warnings.push(format!(
                    "coalesce '{}' uses policy require_all but branch '{branch}' is produced by transform '{producer_name}', whose divert outcomes may never arrive",
                    coalesce.name
                ));
            }
        }
    }
    warnings
}

/// Suggests the closest known connection or sink name to `target` by edit
/// distance, for an `UnresolvedConnection` diagnostic. Returns an empty
/// string if nothing is close enough to be a plausible typo.
fn suggestion_for(target: &str, node_names: &[String], sinks: &BTreeMap<String, crate::config::SinkSpec>) -> String {
    const MAX_SUGGESTION_DISTANCE: usize = 3;

    let candidates = node_names.iter().cloned().chain(sinks.keys().cloned());
    let best = candidates
        .map(|candidate| {
            let distance = levenshtein(target, &candidate);
            (distance, candidate)
        })
        .min_by_key(|(distance, _)| *distance);

    match best {
        Some((distance, candidate)) if distance <= MAX_SUGGESTION_DISTANCE && distance > 0 => {
            format!("; did you mean '{candidate}'?")
        }
        _ => String::new(),
    }
}

/// Classic Wagner-Fischer edit distance between two strings, used only to
/// rank suggestion candidates; not exposed outside this module.
fn levenshtein(left: &str, right: &str) -> usize {
    let left: Vec<char> = left.chars().collect();
    let right: Vec<char> = right.chars().collect();
    let mut previous_row: Vec<usize> = (0..=right.len()).collect();

    for (i, left_char) in left.iter().enumerate() {
        let mut current_row = vec![i + 1];
        for (j, right_char) in right.iter().enumerate() {
            let cost = usize::from(left_char != right_char);
            let value = (previous_row[j] + cost).min(previous_row[j + 1] + 1).min(current_row[j] + 1);
            current_row.push(value);
        }
        previous_row = current_row;
    }
    previous_row[right.len()]
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

    use serde_json::Value;

    use super::*;
    use crate::config::AggregationSpec;
    use crate::config::GateSpec;
    use crate::config::MergeStrategy;
    use crate::config::OutputMode;
    use crate::config::SinkSpec;
    use crate::config::SourceSpec;
    use crate::config::TransformSpec;
    use crate::config::TriggerSpec;

    fn minimal_config() -> PipelineConfig {
        PipelineConfig {
            source: SourceSpec { plugin: "csv".to_owned(), options: Value::Null, on_success: "raw".to_owned(), schema: None },
            transforms: vec![TransformSpec {
                name: "normalize".to_owned(),
                plugin: "noop".to_owned(),
                input: "raw".to_owned(),
                on_success: "sink".to_owned(),
                options: Value::Null,
                schema: None,
            }],
            gates: Vec::new(),
            aggregations: Vec::new(),
            coalesce: Vec::new(),
            sinks: BTreeMap::from([("sink".to_owned(), SinkSpec { plugin: "file".to_owned(), options: Value::Null })]),
            default_sink: None,
        }
    }

    #[test]
    fn constructs_a_minimal_linear_pipeline() {
        let config = minimal_config();
        let result = construct(&config).expect("valid pipeline");
        assert!(result.dag.node(&NodeId::new("source")).is_some());
        assert!(result.dag.node(&NodeId::new("normalize")).is_some());
        assert_eq!(result.dag.successor_node(&NodeId::new("source"), "continue"), Some(NodeId::new("normalize")));
    }

    #[test]
    fn detects_unresolved_connection_with_suggestion() {
        let mut config = minimal_config();
        config.transforms[0].on_success = "snik".to_owned();
        let errors = construct(&config).expect_err("unresolved");
        assert!(errors.iter().any(|error| matches!(
            error,
            ConstructionError::UnresolvedConnection { target, suggestion, .. }
                if target == "snik" && suggestion.contains("sink")
        )));
    }

    #[test]
    fn detects_duplicate_consumer() {
        let mut config = minimal_config();
        config.gates.push(GateSpec {
            name: "gate".to_owned(),
            input: "raw".to_owned(),
            condition: "row['x']".to_owned(),
            routes: BTreeMap::from([("true".to_owned(), "sink".to_owned())]),
        });
        let errors = construct(&config).expect_err("duplicate consumer");
        assert!(errors.iter().any(|error| matches!(error, ConstructionError::DuplicateConsumer { .. })));
    }

    #[test]
    fn detects_cycle() {
        let mut config = minimal_config();
        config.transforms[0].on_success = "back".to_owned();
        config.transforms.push(TransformSpec {
            name: "loopback".to_owned(),
            plugin: "noop".to_owned(),
            input: "back".to_owned(),
            on_success: "raw".to_owned(),
            options: Value::Null,
            schema: None,
        });
        let errors = construct(&config).expect_err("cycle");
        assert!(errors.iter().any(|error| matches!(error, ConstructionError::CycleDetected { .. })));
    }

    #[test]
    fn rejects_invalid_gate_condition() {
        let mut config = minimal_config();
        config.transforms[0].on_success = "gated".to_owned();
        config.gates.push(GateSpec {
            name: "gate".to_owned(),
            input: "gated".to_owned(),
            condition: "row['x'] @ 1".to_owned(),
            routes: BTreeMap::from([("true".to_owned(), "sink".to_owned())]),
        });
        let errors = construct(&config).expect_err("invalid condition");
        assert!(errors.iter().any(|error| matches!(error, ConstructionError::InvalidCondition { .. })));
    }

    #[test]
    fn require_all_coalesce_fed_by_a_transform_divert_is_flagged() {
        let config = PipelineConfig {
            source: SourceSpec { plugin: "csv".to_owned(), options: Value::Null, on_success: "raw".to_owned(), schema: None },
            transforms: vec![TransformSpec {
                name: "split".to_owned(),
                plugin: "noop".to_owned(),
                input: "raw".to_owned(),
                on_success: "branch_a".to_owned(),
                options: Value::Null,
                schema: None,
            }],
            gates: Vec::new(),
            aggregations: vec![AggregationSpec {
                name: "agg".to_owned(),
                plugin: "noop".to_owned(),
                input: "branch_b".to_owned(),
                on_success: "sink".to_owned(),
                trigger: TriggerSpec { count: Some(1), timeout_seconds: None, condition: None },
                output_mode: OutputMode::Transform,
                options: Value::Null,
                schema: None,
            }],
            coalesce: vec![crate::config::CoalesceSpec {
                name: "join".to_owned(),
                branches: vec!["branch_a".to_owned(), "branch_b".to_owned()],
                policy: CoalescePolicy::RequireAll,
                quorum_count: None,
                timeout_seconds: None,
                merge: MergeStrategy::Union,
                on_success: "sink".to_owned(),
            }],
            sinks: BTreeMap::from([("sink".to_owned(), SinkSpec { plugin: "file".to_owned(), options: Value::Null })]),
            default_sink: None,
        };
        let result = construct(&config).expect("valid, only a warning");
        assert!(result.dag.warnings().iter().any(|warning| warning.contains("join")));
    }

    #[test]
    fn levenshtein_distance_matches_known_values() {
        assert_eq!(levenshtein("sink", "snik"), 2);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }
}
