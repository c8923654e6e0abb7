// crates/pw-dag/src/lib.rs
// ============================================================================
// Crate: pw-dag
// Description: Compiles a declared pipeline configuration into a validated
// directed multigraph (§4.4-4.5), and gives the orchestrator pure topology
// queries over the result (§4.8).
// Purpose: Catch every wiring mistake — duplicate producers/consumers,
// unresolved connections, schema incompatibility, cycles, invalid condition
// expressions — before a run starts, rather than failing mid-run on a
// misrouted token.
// Dependencies: pw-core, pw-condition, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! [`config`] defines the on-disk pipeline configuration shape a run is
//! declared with. [`construct::construct`] compiles a [`config::PipelineConfig`]
//! into a validated [`model::Dag`], collecting every [`error::ConstructionError`]
//! it finds rather than stopping at the first. [`navigator::DagNavigator`]
//! wraps the resulting graph in pure, side-effect-free topology queries —
//! resolving a node's bound plugin, its `continue` successor, the sink a
//! coalesce point lands on — so the orchestrator's main loop never re-derives
//! graph-walking logic inline.

pub mod config;
pub mod construct;
pub mod error;
pub mod model;
pub mod navigator;

pub use config::PipelineConfig;
pub use construct::ConstructionResult;
pub use construct::construct;
pub use error::ConstructionError;
pub use error::ConstructionErrors;
pub use model::Dag;
pub use model::DagEdge;
pub use model::DagNode;
pub use model::DagNodeKind;
pub use navigator::DagNavigator;
pub use navigator::ResolvedNode;
pub use navigator::WorkItem;
