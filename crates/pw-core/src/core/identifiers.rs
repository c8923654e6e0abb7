// crates/pw-core/src/core/identifiers.rs
// ============================================================================
// Module: Opaque Identifiers
// Description: Newtype wrappers over opaque string identifiers for every
// entity in the audit data model.
// Purpose: Prevent accidental mixing of unrelated ID spaces at compile time.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Every identifier in the audit data model (§3) is treated as an opaque
//! string by the engine; nothing here parses or attaches meaning to the
//! contents of an ID beyond equality and ordering. Each ID gets its own
//! newtype so that, for example, a `RowId` can never be passed where a
//! `TokenId` is expected.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Macro
// ============================================================================

/// Declares an opaque string-backed identifier newtype.
macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier from any string-like value.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the identifier, returning the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// ============================================================================
// SECTION: Identifiers
// ============================================================================

opaque_id!(
    /// Identifies a single pipeline run. Unique across the engine's lifetime.
    RunId
);
opaque_id!(
    /// Identifies a node within a run's DAG. Unique within a run.
    NodeId
);
opaque_id!(
    /// Identifies an edge within a run's DAG.
    EdgeId
);
opaque_id!(
    /// Identifies a row read from a source node.
    RowId
);
opaque_id!(
    /// Identifies a token tracing one lineage of row data through the DAG.
    TokenId
);
opaque_id!(
    /// Identifies a single node-state record (one token visiting one node).
    StateId
);
opaque_id!(
    /// Identifies a routing event.
    EventId
);
opaque_id!(
    /// Identifies an aggregation batch.
    BatchId
);
opaque_id!(
    /// Identifies a terminal or non-terminal token outcome record.
    OutcomeId
);
opaque_id!(
    /// Identifies an artifact emitted by a sink.
    ArtifactId
);
opaque_id!(
    /// Identifies a checkpoint row.
    CheckpointId
);
opaque_id!(
    /// Identifies a fork group: the set of sibling tokens produced by one fork.
    ForkGroupId
);
opaque_id!(
    /// Identifies an expand group: the set of sibling tokens produced by one expansion.
    ExpandGroupId
);
opaque_id!(
    /// Identifies a join group: the set of parent tokens merged by one coalesce.
    JoinGroupId
);
opaque_id!(
    /// Identifies a routing group: the set of routing events from one decision point.
    RoutingGroupId
);

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
    fn round_trips_through_display_and_as_str() {
        let id = RunId::new("run-1");
        assert_eq!(id.as_str(), "run-1");
        assert_eq!(id.to_string(), "run-1");
    }

    #[test]
    fn distinct_id_types_do_not_unify() {
        let run_id = RunId::from("run-1");
        let node_id = NodeId::from("run-1");
        assert_eq!(run_id.as_str(), node_id.as_str());
    }

    #[test]
    fn serializes_as_transparent_string() {
        let id = TokenId::new("tok-1");
        let json = serde_json::to_string(&id).unwrap_or_default();
        assert_eq!(json, "\"tok-1\"");
    }
}
