// crates/pw-dag/src/navigator.rs
// ============================================================================
// Module: DAG Navigator
// Description: Pure topology queries over a constructed `Dag` — resolving
// the plugin bound to a node, the next node on the `continue` edge, the
// sink a coalesce point lands on, the eventual sink reachable from a gate's
// jump target, and the work item a token should carry into that next step
// (§4.8).
// Purpose: Give the orchestrator a single, side-effect-free query surface
// over graph topology, so traversal logic never duplicates graph-walking
// code inline.
// Dependencies: pw-core (identifiers, model, error), crate::model
// ============================================================================

//! ## Overview
//! Every method here is a pure query: none of them mutate the underlying
//! [`crate::model::Dag`], and none of them touch a running pipeline's state.
//! This mirrors the navigator's role as "pure topology queries for DAG
//! traversal" — resolution concerns live here so the orchestrator's main
//! loop only ever asks "what's next" without re-deriving it.

use std::collections::BTreeMap;
use std::sync::Arc;

use pw_core::core::error::EngineError;
use pw_core::core::identifiers::NodeId;
use pw_core::core::model::Token;

use crate::model::Dag;
use crate::model::DagNodeKind;

/// A unit of work the orchestrator's queue carries: a token, the node it is
/// about to visit, and (for a fork child walking back to a coalesce point)
/// the coalesce node and name it is converging on.
///
/// # Invariants
/// - `coalesce_node_id` and `coalesce_name` are both set or both `None`.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// The token carried by this work item.
    pub token: Token,
    /// The node this token is about to visit, or `None` if it has reached a
    /// terminal sink.
    pub current_node_id: Option<NodeId>,
    /// The coalesce node this token's branch converges on, if it was
    /// produced by a fork.
    pub coalesce_node_id: Option<NodeId>,
    /// The coalesce point's name, if `coalesce_node_id` is set.
    pub coalesce_name: Option<String>,
    /// A terminal sink inherited from the parent, for tokens produced by an
    /// expansion that skip gate re-evaluation.
    pub on_success_sink: Option<String>,
}

impl WorkItem {
    /// Builds a work item, validating the coalesce-fields invariant.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OrchestrationInvariant`] if exactly one of
    /// `coalesce_node_id`/`coalesce_name` is set.
    pub fn new(
        token: Token,
        current_node_id: Option<NodeId>,
        coalesce_node_id: Option<NodeId>,
        coalesce_name: Option<String>,
        on_success_sink: Option<String>,
    ) -> Result<Self, EngineError> {
        if coalesce_node_id.is_some() != coalesce_name.is_some() {
            return Err(EngineError::OrchestrationInvariant(format!(
                "work item coalesce fields must be both set or both None: coalesce_node_id={coalesce_node_id:?}, coalesce_name={coalesce_name:?}"
            )));
        }
        Ok(Self { token, current_node_id, coalesce_node_id, coalesce_name, on_success_sink })
    }
}

/// What a processing node resolves to: a bound plugin node, a structural
/// node with nothing to execute, or the end of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedNode<'a> {
    /// A node with a bound plugin (source, transform, gate, aggregation,
    /// sink).
    Plugin(&'a NodeId),
    /// A structural node with no plugin to execute (a coalesce landing
    /// point); the caller skips it and continues.
    Structural,
}

/// Pure topology queries over a constructed [`Dag`] (§4.8).
///
/// Wraps the graph in an `Arc` so every worker thread in the pooled
/// executor shares one read-only copy rather than cloning the topology per
/// token.
#[derive(Debug, Clone)]
pub struct DagNavigator {
    /// The constructed graph this navigator queries.
    dag: Arc<Dag>,
    /// Connection/branch name to the first processing node on that branch,
    /// used to route fork children back into their branch's start.
    branch_first_node: Arc<BTreeMap<String, NodeId>>,
}

impl DagNavigator {
    /// Builds a navigator over `dag`, deriving the branch-first-node map
    /// from the graph's connection registry: a branch name is a connection
    /// name, and its first node is whatever node consumes that connection.
    #[must_use]
    pub fn new(dag: Arc<Dag>) -> Self {
        let branch_first_node =
            dag.connection_consumers().map(|(name, node_id)| (name.to_owned(), node_id.clone())).collect();
        Self { dag, branch_first_node: Arc::new(branch_first_node) }
    }

    /// Resolves the plugin, or structural role, bound to `node_id`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OrchestrationInvariant`] if `node_id` is not
    /// present in the graph at all — a graph-construction bug, not a
    /// reachable runtime condition.
    pub fn resolve_plugin_for_node(&self, node_id: &NodeId) -> Result<ResolvedNode<'_>, EngineError> {
        let Some(node) = self.dag.node(node_id) else {
            return Err(EngineError::OrchestrationInvariant(format!(
                "node '{node_id}' is neither a plugin node nor a known structural node"
            )));
        };
        if node.kind.is_structural() {
            Ok(ResolvedNode::Structural)
        } else {
            Ok(ResolvedNode::Plugin(&node.node_id))
        }
    }

    /// Resolves the single node reached from `node_id` along its
    /// `continue` edge, or `None` if `node_id` is terminal (a sink).
    #[must_use]
    pub fn resolve_next_node(&self, node_id: &NodeId) -> Option<NodeId> {
        self.dag.successor_node(node_id, "continue")
    }

    /// Resolves the sink a coalesce point's merged token lands on.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OrchestrationInvariant`] if `coalesce_name`
    /// names no known coalesce node, or that node has no `continue`
    /// successor.
    pub fn resolve_coalesce_sink(&self, coalesce_name: &str, context: &str) -> Result<String, EngineError> {
        let node_id = NodeId::new(coalesce_name);
        let Some(node) = self.dag.node(&node_id) else {
            return Err(EngineError::OrchestrationInvariant(format!(
                "coalesce '{coalesce_name}' is not a known coalesce node ({context})"
            )));
        };
        if !matches!(node.kind, DagNodeKind::Coalesce { .. }) {
            return Err(EngineError::OrchestrationInvariant(format!(
                "'{coalesce_name}' is not a coalesce node ({context})"
            )));
        }
        self.dag.successor_node(&node_id, "continue").map(|sink_id| sink_id.into_inner()).ok_or_else(|| {
            EngineError::OrchestrationInvariant(format!(
                "coalesce '{coalesce_name}' has no resolved sink ({context})"
            ))
        })
    }

    /// Walks forward from `start_node_id` until it finds the terminal sink
    /// a gate route's jump target eventually lands on, or `None` if the
    /// walk passes through another gate (which self-routes at run time, so
    /// no static sink can be resolved ahead of time).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OrchestrationInvariant`] if the walk exceeds
    /// `node count + 1` iterations (a cycle slipped past construction), or
    /// terminates without a resolvable sink and without passing a gate.
    pub fn resolve_jump_target_sink(&self, start_node_id: &NodeId) -> Result<Option<String>, EngineError> {
        let max_iterations = self.dag.nodes().count() + 1;
        let mut current = Some(start_node_id.clone());
        let mut resolved_sink: Option<String> = None;
        let mut encountered_gate = false;
        let mut iterations = 0usize;

        while let Some(node_id) = current {
            iterations += 1;
            if iterations > max_iterations {
                return Err(EngineError::OrchestrationInvariant(format!(
                    "jump-target sink resolution exceeded {max_iterations} iterations from node '{start_node_id}'; possible cycle"
                )));
            }

            let node = self.dag.node(&node_id).ok_or_else(|| {
                EngineError::OrchestrationInvariant(format!("node '{node_id}' vanished mid-walk"))
            })?;

            if matches!(node.kind, DagNodeKind::Gate { .. }) {
                encountered_gate = true;
            }

            let next = self.resolve_next_node(&node_id);
            if next.is_none() {
                if let DagNodeKind::Coalesce { .. } = &node.kind {
                    resolved_sink = Some(self.resolve_coalesce_sink(
                        node_id.as_str(),
                        &format!("walk started at node '{start_node_id}'"),
                    )?);
                } else if let DagNodeKind::Sink { .. } = &node.kind {
                    resolved_sink = Some(node_id.as_str().to_owned());
                }
            }

            current = next;
        }

        if resolved_sink.is_none() && !encountered_gate {
            return Err(EngineError::OrchestrationInvariant(format!(
                "jump-target sink resolution reached a terminal path with no sink from node '{start_node_id}'"
            )));
        }

        Ok(resolved_sink)
    }

    /// Builds a work item, resolving a missing coalesce node id from a
    /// coalesce name or vice versa, so callers only ever need to supply
    /// one.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OrchestrationInvariant`] if a supplied
    /// coalesce node id has no matching coalesce name, or the resulting
    /// work item violates the coalesce-fields invariant.
    pub fn create_work_item(
        &self,
        token: Token,
        current_node_id: Option<NodeId>,
        coalesce_name: Option<String>,
        coalesce_node_id: Option<NodeId>,
        on_success_sink: Option<String>,
    ) -> Result<WorkItem, EngineError> {
        let resolved_coalesce_node_id = match (&coalesce_node_id, &coalesce_name) {
            (None, Some(name)) => Some(NodeId::new(name.clone())),
            (node_id, _) => node_id.clone(),
        };
        let resolved_coalesce_name = match (&coalesce_node_id, &coalesce_name) {
            (Some(node_id), None) => {
                let node = self.dag.node(node_id).ok_or_else(|| {
                    EngineError::OrchestrationInvariant(format!("unknown coalesce node id '{node_id}'"))
                })?;
                if !matches!(node.kind, DagNodeKind::Coalesce { .. }) {
                    return Err(EngineError::OrchestrationInvariant(format!(
                        "node '{node_id}' referenced as a coalesce node is not one"
                    )));
                }
                Some(node_id.as_str().to_owned())
            }
            (_, name) => name.clone(),
        };

        WorkItem::new(token, current_node_id, resolved_coalesce_node_id, resolved_coalesce_name, on_success_sink)
    }

    /// Creates the work item continuing a token after `current_node_id`, or
    /// (for a fork child whose `coalesce_name` is set) routes it to the
    /// first processing node on its branch.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OrchestrationInvariant`] if `coalesce_name`
    /// is set but the token carries no `branch_name`, or its branch has no
    /// known first node.
    pub fn create_continuation_work_item(
        &self,
        token: Token,
        current_node_id: &NodeId,
        coalesce_name: Option<String>,
        on_success_sink: Option<String>,
    ) -> Result<WorkItem, EngineError> {
        if let Some(coalesce_name) = coalesce_name {
            let branch_name = token.branch_name.clone().ok_or_else(|| {
                EngineError::OrchestrationInvariant(format!(
                    "token '{}' has coalesce_name='{coalesce_name}' but no branch_name",
                    token.token_id
                ))
            })?;
            let first_node = self.branch_first_node.get(&branch_name).cloned().ok_or_else(|| {
                EngineError::OrchestrationInvariant(format!("branch '{branch_name}' has no known first node"))
            })?;
            return self.create_work_item(token, Some(first_node), Some(coalesce_name), None, on_success_sink);
        }

        let next = self.resolve_next_node(current_node_id);
        self.create_work_item(token, next, None, None, on_success_sink)
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

    use pw_core::core::identifiers::RowId;
    use pw_core::core::identifiers::TokenId;
    use pw_core::core::model::EdgeMode;
    use pw_core::core::model::SchemaMode;
    use pw_core::core::schema::SchemaContract;
    use serde_json::Value;
    use time::OffsetDateTime;

    use super::*;
    use crate::model::DagEdge;
    use crate::model::DagNode;

    fn schema() -> SchemaContract {
        SchemaContract { mode: SchemaMode::Dynamic, fields: Vec::new(), allow_extra_fields: true, strict: false, required_input_fields: None }
    }

    fn token(branch_name: Option<&str>) -> Token {
        Token {
            token_id: TokenId::new("t1"),
            row_id: RowId::new("r1"),
            parent_token_id: None,
            fork_group_id: None,
            expand_group_id: None,
            join_group_id: None,
            branch_name: branch_name.map(str::to_owned),
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn linear_dag() -> Dag {
        let nodes = BTreeMap::from([
            (
                NodeId::new("source"),
                DagNode {
                    node_id: NodeId::new("source"),
                    kind: DagNodeKind::Source { plugin: "csv".to_owned(), options: Value::Null },
                    schema: schema(),
                },
            ),
            (
                NodeId::new("sink"),
                DagNode {
                    node_id: NodeId::new("sink"),
                    kind: DagNodeKind::Sink { plugin: "file".to_owned(), options: Value::Null },
                    schema: schema(),
                },
            ),
        ]);
        let edges = vec![DagEdge {
            from_node_id: NodeId::new("source"),
            to_node_id: NodeId::new("sink"),
            label: "continue".to_owned(),
            mode: EdgeMode::Move,
        }];
        Dag::from_parts(nodes, edges, Vec::new(), BTreeMap::new())
    }

    #[test]
    fn resolves_next_node_along_continue_edge() {
        let navigator = DagNavigator::new(Arc::new(linear_dag()));
        assert_eq!(navigator.resolve_next_node(&NodeId::new("source")), Some(NodeId::new("sink")));
        assert_eq!(navigator.resolve_next_node(&NodeId::new("sink")), None);
    }

    #[test]
    fn create_continuation_work_item_advances_to_next_node() {
        let navigator = DagNavigator::new(Arc::new(linear_dag()));
        let item = navigator
            .create_continuation_work_item(token(None), &NodeId::new("source"), None, None)
            .expect("builds");
        assert_eq!(item.current_node_id, Some(NodeId::new("sink")));
        assert!(item.coalesce_node_id.is_none());
    }

    #[test]
    fn work_item_rejects_half_set_coalesce_fields() {
        let err = WorkItem::new(token(None), None, Some(NodeId::new("join")), None, None).expect_err("invariant");
        assert!(matches!(err, EngineError::OrchestrationInvariant(_)));
    }

    #[test]
    fn fork_child_without_branch_name_is_rejected() {
        let dag = linear_dag();
        let navigator = DagNavigator::new(Arc::new(dag));
        let err = navigator
            .create_continuation_work_item(token(None), &NodeId::new("source"), Some("join".to_owned()), None)
            .expect_err("missing branch_name");
        assert!(matches!(err, EngineError::OrchestrationInvariant(_)));
    }
}
