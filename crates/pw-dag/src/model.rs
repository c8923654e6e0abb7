// crates/pw-dag/src/model.rs
// ============================================================================
// Module: DAG Model
// Description: The directed multigraph a pipeline configuration compiles
// into (§4.4): nodes keyed by node id, edges keyed by (from, to, label).
// Purpose: Give the construction pass and the navigator a shared, queryable
// topology — node lookup, successors by label, acyclicity, topological
// sort, and the branch-first-node map — independent of how the graph was
// built.
// Dependencies: pw-core (identifiers, schema, edge mode), pw-condition
// ============================================================================

//! ## Overview
//! A [`Dag`] is immutable once constructed: `pw-dag::construct` is the only
//! code that builds one. Everything downstream — the navigator, the
//! orchestrator — only ever reads it. Edge labels route tokens (`continue`,
//! a gate outcome like `true`/`false`, or a branch/coalesce name); the three
//! [`pw_core::core::model::EdgeMode`] variants describe whether a token
//! moves, is copied, or is diverted along that edge.

use std::collections::BTreeMap;

use pw_condition::Condition;
use pw_core::core::identifiers::NodeId;
use pw_core::core::model::EdgeMode;
use pw_core::core::schema::SchemaContract;
use serde_json::Value;

use crate::config::CoalescePolicy;
use crate::config::MergeStrategy;
use crate::config::OutputMode;
use crate::config::TriggerSpec;

// ============================================================================
// SECTION: Node
// ============================================================================

/// The structural role and bound configuration of one node in the graph.
#[derive(Debug, Clone)]
pub enum DagNodeKind {
    /// Produces rows into the pipeline.
    Source {
        /// Plugin name.
        plugin: String,
        /// Plugin-defined options.
        options: Value,
    },
    /// Transforms one row (or a batch) into zero or more rows.
    Transform {
        /// Plugin name.
        plugin: String,
        /// Plugin-defined options.
        options: Value,
    },
    /// Routes a row to one of several outgoing edges.
    Gate {
        /// The parsed condition a gate evaluates per row.
        condition: Condition,
        /// Outcome label to destination connection/sink name, as declared.
        routes: BTreeMap<String, String>,
    },
    /// Buffers tokens until a trigger fires, then processes them together.
    Aggregation {
        /// Plugin name.
        plugin: String,
        /// Plugin-defined options.
        options: Value,
        /// The flush trigger.
        trigger: TriggerSpec,
        /// Whether output replaces or augments the buffer.
        output_mode: OutputMode,
    },
    /// Merges multiple parent tokens into one child token.
    Coalesce {
        /// Connection names consumed, one per branch.
        branches: Vec<String>,
        /// Arrival policy.
        policy: CoalescePolicy,
        /// Required arrival count under `policy: quorum`.
        quorum_count: Option<u32>,
        /// Maximum wait under `policy: best_effort`.
        timeout_seconds: Option<u64>,
        /// Merge strategy.
        merge: MergeStrategy,
    },
    /// Terminal node that writes rows to durable storage.
    Sink {
        /// Plugin name.
        plugin: String,
        /// Plugin-defined options.
        options: Value,
    },
}

impl DagNodeKind {
    /// A short, stable label for this node kind, used in error messages and
    /// as the `node_type` recorded with the audit trail.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Source { .. } => "source",
            Self::Transform { .. } => "transform",
            Self::Gate { .. } => "gate",
            Self::Aggregation { .. } => "aggregation",
            Self::Coalesce { .. } => "coalesce",
            Self::Sink { .. } => "sink",
        }
    }

    /// Whether this node kind has no bound plugin (a coalesce landing
    /// node is purely structural; §4.8's `resolve_plugin_for_node`
    /// returns nothing for it).
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(self, Self::Coalesce { .. })
    }
}

/// One node in a constructed [`Dag`].
#[derive(Debug, Clone)]
pub struct DagNode {
    /// Node identifier, unique within the graph.
    pub node_id: NodeId,
    /// Structural role and bound configuration.
    pub kind: DagNodeKind,
    /// The schema contract pinned to this node's output, established at
    /// construction (declared, or `Observed`/`Dynamic` pending the first
    /// row if undeclared).
    pub schema: SchemaContract,
}

// ============================================================================
// SECTION: Edge
// ============================================================================

/// One edge in a constructed [`Dag`].
#[derive(Debug, Clone, PartialEq)]
pub struct DagEdge {
    /// Upstream node.
    pub from_node_id: NodeId,
    /// Downstream node.
    pub to_node_id: NodeId,
    /// The label that routes tokens along this edge (`continue`, a gate
    /// outcome, or a branch/coalesce name).
    pub label: String,
    /// Default routing mode for this edge.
    pub mode: EdgeMode,
}

// ============================================================================
// SECTION: Dag
// ============================================================================

/// A directed multigraph compiled from a pipeline configuration (§4.4).
///
/// # Invariants
/// - `node_id` is unique within the graph.
/// - `(from_node_id, to_node_id, label)` is unique among `edges`.
#[derive(Debug, Clone)]
pub struct Dag {
    nodes: BTreeMap<NodeId, DagNode>,
    edges: Vec<DagEdge>,
    /// Construction-time warnings that do not block a run (e.g. a divert
    /// edge feeding a `require_all` coalesce).
    warnings: Vec<String>,
    /// Connection name to the single node consuming it (a node's `input`,
    /// or a coalesce's branch entry). Distinct from edge labels, which
    /// carry routing outcomes (`continue`, a gate outcome) rather than
    /// connection names.
    connection_consumers: BTreeMap<String, NodeId>,
}

impl Dag {
    /// Builds a `Dag` from its already-validated nodes, edges, and
    /// connection registry. Only `pw_dag::construct` calls this; everything
    /// else treats a `Dag` as read-only.
    #[must_use]
    pub fn from_parts(
        nodes: BTreeMap<NodeId, DagNode>,
        edges: Vec<DagEdge>,
        warnings: Vec<String>,
        connection_consumers: BTreeMap<String, NodeId>,
    ) -> Self {
        Self { nodes, edges, warnings, connection_consumers }
    }

    /// Returns the node consuming the named connection, if any.
    #[must_use]
    pub fn connection_consumer(&self, connection: &str) -> Option<&NodeId> {
        self.connection_consumers.get(connection)
    }

    /// Iterates every connection name and its consumer node.
    pub fn connection_consumers(&self) -> impl Iterator<Item = (&str, &NodeId)> {
        self.connection_consumers.iter().map(|(name, node_id)| (name.as_str(), node_id))
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<&DagNode> {
        self.nodes.get(node_id)
    }

    /// Iterates every node, in node-id order.
    pub fn nodes(&self) -> impl Iterator<Item = &DagNode> {
        self.nodes.values()
    }

    /// Iterates every edge.
    pub fn edges(&self) -> impl Iterator<Item = &DagEdge> {
        self.edges.iter()
    }

    /// Construction-time warnings recorded for this graph.
    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Returns the edges leaving `node_id`, optionally filtered to a single
    /// label.
    pub fn successors(&self, node_id: &NodeId, label: Option<&str>) -> impl Iterator<Item = &DagEdge> {
        self.edges.iter().filter(move |edge| {
            &edge.from_node_id == node_id && label.is_none_or(|label| edge.label == label)
        })
    }

    /// Returns the single successor node reachable from `node_id` via
    /// `label`, if exactly one such edge exists.
    #[must_use]
    pub fn successor_node(&self, node_id: &NodeId, label: &str) -> Option<NodeId> {
        self.successors(node_id, Some(label)).next().map(|edge| edge.to_node_id.clone())
    }

    /// Detects a cycle using DFS with an explicit recursion-stack marker,
    /// so that a node with multiple incoming edges (a coalesce landing
    /// node merging several branches) is never mistaken for a cycle:
    /// only a back-edge onto the *current* DFS path counts.
    ///
    /// Returns the node ids forming the cycle, in traversal order, if one
    /// is found.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<NodeId>> {
        let mut marks: BTreeMap<NodeId, CycleMark> = BTreeMap::new();
        let mut stack: Vec<NodeId> = Vec::new();

        for start in self.nodes.keys() {
            if marks.contains_key(start) {
                continue;
            }
            if let Some(cycle) = self.visit_for_cycle(start, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    /// Recursive DFS helper for [`Dag::find_cycle`].
    fn visit_for_cycle(
        &self,
        node_id: &NodeId,
        marks: &mut BTreeMap<NodeId, CycleMark>,
        stack: &mut Vec<NodeId>,
    ) -> Option<Vec<NodeId>> {
        marks.insert(node_id.clone(), CycleMark::InProgress);
        stack.push(node_id.clone());

        for edge in self.successors(node_id, None) {
            match marks.get(&edge.to_node_id) {
                Some(CycleMark::InProgress) => {
                    let start = stack.iter().position(|id| *id == edge.to_node_id).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(edge.to_node_id.clone());
                    return Some(cycle);
                }
                Some(CycleMark::Done) => {}
                None => {
                    if let Some(cycle) = self.visit_for_cycle(&edge.to_node_id, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
        }

        stack.pop();
        marks.insert(node_id.clone(), CycleMark::Done);
        None
    }

    /// Topologically sorts the graph's nodes via Kahn's algorithm.
    ///
    /// Returns `None` if the graph contains a cycle (callers should run
    /// [`Dag::find_cycle`] first to construct an actionable error).
    #[must_use]
    pub fn topological_sort(&self) -> Option<Vec<NodeId>> {
        let mut in_degree: BTreeMap<NodeId, usize> = self.nodes.keys().map(|id| (id.clone(), 0)).collect();
        for edge in &self.edges {
            *in_degree.entry(edge.to_node_id.clone()).or_insert(0) += 1;
        }

        let mut ready: Vec<NodeId> =
            in_degree.iter().filter(|(_, degree)| **degree == 0).map(|(id, _)| id.clone()).collect();
        ready.sort();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node_id) = ready.pop() {
            order.push(node_id.clone());
            let mut newly_ready = Vec::new();
            for edge in self.successors(&node_id, None) {
                if let Some(degree) = in_degree.get_mut(&edge.to_node_id) {
                    *degree -= 1;
                    if *degree == 0 {
                        newly_ready.push(edge.to_node_id.clone());
                    }
                }
            }
            newly_ready.sort();
            ready.extend(newly_ready);
            ready.sort();
        }

        if order.len() == self.nodes.len() { Some(order) } else { None }
    }
}

/// DFS visitation state for [`Dag::find_cycle`]: whether a node is currently
/// on the DFS stack, or has been fully explored.
#[derive(Clone, Copy, PartialEq, Eq)]
enum CycleMark {
    /// On the current DFS path; a re-visit is a genuine back-edge.
    InProgress,
    /// Fully explored; a re-visit is a safe cross/forward edge (e.g. a
    /// coalesce landing node reached from a second branch).
    Done,
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

    use pw_core::core::model::SchemaMode;

    use super::*;

    fn dynamic_schema() -> SchemaContract {
        SchemaContract {
            mode: SchemaMode::Dynamic,
            fields: Vec::new(),
            allow_extra_fields: true,
            strict: false,
            required_input_fields: None,
        }
    }

    fn node(id: &str, kind: DagNodeKind) -> DagNode {
        DagNode { node_id: NodeId::new(id), kind, schema: dynamic_schema() }
    }

    fn edge(from: &str, to: &str, label: &str) -> DagEdge {
        DagEdge {
            from_node_id: NodeId::new(from),
            to_node_id: NodeId::new(to),
            label: label.to_owned(),
            mode: EdgeMode::Move,
        }
    }

    fn transform_node(id: &str) -> DagNode {
        node(id, DagNodeKind::Transform { plugin: "noop".to_owned(), options: Value::Null })
    }

    #[test]
    fn diamond_reconvergence_at_a_coalesce_is_not_a_cycle() {
        let nodes = BTreeMap::from([
            ("source".to_owned(), node("source", DagNodeKind::Source { plugin: "csv".to_owned(), options: Value::Null })),
            ("a".to_owned(), transform_node("a")),
            ("b".to_owned(), transform_node("b")),
            (
                "join".to_owned(),
                node(
                    "join",
                    DagNodeKind::Coalesce {
                        branches: vec!["a_out".to_owned(), "b_out".to_owned()],
                        policy: CoalescePolicy::RequireAll,
                        quorum_count: None,
                        timeout_seconds: None,
                        merge: MergeStrategy::Union,
                    },
                ),
            ),
        ]);
        let edges = vec![
            edge("source", "a", "branch_a"),
            edge("source", "b", "branch_b"),
            edge("a", "join", "a_out"),
            edge("b", "join", "b_out"),
        ];
        let dag = Dag::from_parts(nodes, edges, Vec::new(), BTreeMap::new());
        assert!(dag.find_cycle().is_none());
        assert!(dag.topological_sort().is_some());
    }

    #[test]
    fn genuine_back_edge_is_detected_as_a_cycle() {
        let nodes = BTreeMap::from([("a".to_owned(), transform_node("a")), ("b".to_owned(), transform_node("b"))]);
        let edges = vec![edge("a", "b", "continue"), edge("b", "a", "continue")];
        let dag = Dag::from_parts(nodes, edges, Vec::new(), BTreeMap::new());
        assert!(dag.find_cycle().is_some());
        assert!(dag.topological_sort().is_none());
    }

    #[test]
    fn successor_node_resolves_by_label() {
        let nodes = BTreeMap::from([("a".to_owned(), transform_node("a")), ("b".to_owned(), transform_node("b"))]);
        let edges = vec![edge("a", "b", "continue")];
        let dag = Dag::from_parts(nodes, edges, Vec::new(), BTreeMap::new());
        assert_eq!(dag.successor_node(&NodeId::new("a"), "continue"), Some(NodeId::new("b")));
        assert_eq!(dag.successor_node(&NodeId::new("a"), "other"), None);
    }
}
