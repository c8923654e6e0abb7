// crates/pw-dag/src/error.rs
// ============================================================================
// Module: DAG Construction Errors
// Description: Everything that can go wrong compiling a pipeline
// configuration into a validated `Dag` (§4.5).
// Purpose: Give `construct` and its callers (`pw-cli validate`) precise,
// actionable diagnostics rather than the first-failure-wins style of a
// fallible iterator chain — every configuration mistake is collected and
// reported together.
// Dependencies: thiserror, pw-core (schema compatibility report)
// ============================================================================

use pw_core::core::schema::CompatibilityReport;

/// A single construction-time defect in a pipeline configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConstructionError {
    /// Two node specs declared the same node name.
    #[error("node name '{name}' is declared more than once")]
    DuplicateNodeName {
        /// The repeated name.
        name: String,
    },
    /// Two producing edges (a node's `on_success`, or a gate route) targeted
    /// the same connection name.
    #[error("connection '{connection}' has more than one producer: '{first_producer}' and '{second_producer}'")]
    DuplicateProducer {
        /// The connection name with two producers.
        connection: String,
        /// The node name that first claimed it.
        first_producer: String,
        /// The node name that claimed it again.
        second_producer: String,
    },
    /// Two node specs declared the same `input` connection name (or the same
    /// coalesce branch name was claimed twice).
    #[error("connection '{connection}' has more than one consumer: '{first_consumer}' and '{second_consumer}'")]
    DuplicateConsumer {
        /// The connection name with two consumers.
        connection: String,
        /// The node name that first claimed it.
        first_consumer: String,
        /// The node name that claimed it again.
        second_consumer: String,
    },
    /// A node's outgoing target named neither a known connection consumer
    /// nor a known sink.
    #[error(
        "'{from_node}' routes to '{target}', which is neither a declared sink nor consumed by any node{suggestion}"
    )]
    UnresolvedConnection {
        /// The node whose route could not be resolved.
        from_node: String,
        /// The unresolved target name.
        target: String,
        /// A formatted "; did you mean '...'?" hint, or empty.
        suggestion: String,
    },
    /// A connection name and a sink name collided; the two namespaces must
    /// stay disjoint.
    #[error("'{name}' is declared as both a connection and a sink name")]
    NamespaceCollision {
        /// The colliding name.
        name: String,
    },
    /// An edge's declared schema is incompatible between producer and
    /// consumer.
    #[error("'{from_node}' -> '{to_node}' has an incompatible schema: {report:?}")]
    SchemaIncompatible {
        /// The upstream node.
        from_node: String,
        /// The downstream node.
        to_node: String,
        /// The compatibility report explaining the mismatch.
        report: CompatibilityReport,
    },
    /// The graph contains a cycle outside of a declared coalesce/aggregation
    /// join point.
    #[error("cycle detected: {}", path.join(" -> "))]
    CycleDetected {
        /// The node names forming the cycle, in traversal order.
        path: Vec<String>,
    },
    /// A gate's condition, or an aggregation's trigger condition, failed to
    /// parse.
    #[error("'{node}' has an invalid condition: {source}")]
    InvalidCondition {
        /// The node whose condition failed to parse.
        node: String,
        /// The underlying parse error.
        #[source]
        source: pw_condition::ConditionError,
    },
    /// A coalesce's `branches` list named a connection no producer ever
    /// claims.
    #[error("coalesce '{coalesce}' expects branch connection '{branch}', which no node produces")]
    UnproducedBranch {
        /// The coalesce node.
        coalesce: String,
        /// The unproduced branch connection name.
        branch: String,
    },
    /// A `quorum_count` exceeded the number of declared branches, or was
    /// zero.
    #[error("coalesce '{coalesce}' has quorum_count {quorum_count}, but only {branch_count} branch(es) are declared")]
    InvalidQuorumCount {
        /// The coalesce node.
        coalesce: String,
        /// The declared quorum count.
        quorum_count: u32,
        /// The number of declared branches.
        branch_count: usize,
    },
    /// No sink was named `default_sink`, but at least one `on_success`/route
    /// relied on the default.
    #[error("'{node}' has no on_success target, and no default_sink is configured")]
    MissingDefaultSink {
        /// The node relying on the unset default.
        node: String,
    },
}

/// Every [`ConstructionError`] found while compiling a pipeline
/// configuration, collected rather than stopping at the first, so a
/// `validate` run reports the whole list of mistakes at once.
pub type ConstructionErrors = Vec<ConstructionError>;
