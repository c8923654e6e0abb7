// crates/pw-store/tests/landscape_invariants.rs
// ============================================================================
// Module: Landscape Invariant Tests
// Description: End-to-end tests of the §8 invariants a complete Landscape
// audit trail must uphold: one terminal outcome per token, node-state
// ordering and completion requirements, routing-group ordinals, and
// idempotent artifact registration.
// ============================================================================

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
    reason = "Test-only assertions and helpers are permitted."
)]

use pw_core::core::identifiers::NodeId;
use pw_core::core::model::CallStatus;
use pw_core::core::model::CallType;
use pw_core::core::model::Determinism;
use pw_core::core::model::EdgeMode;
use pw_core::core::model::NodeStateStatus;
use pw_core::core::model::NodeType;
use pw_core::core::model::RunStatus;
use pw_core::core::model::SchemaMode;
use pw_core::core::model::TokenOutcomeKind;
use pw_store::NewArtifact;
use pw_store::NewCall;
use pw_store::NewCheckpoint;
use pw_store::NewNode;
use pw_store::NewNodeState;
use pw_store::NewToken;
use pw_store::NodeStateCompletion;
use pw_store::RoutingDecision;
use pw_store::SqliteLandscape;
use serde_json::json;

fn opened() -> SqliteLandscape {
    SqliteLandscape::open_in_memory().expect("open in-memory landscape")
}

fn register_source(store: &SqliteLandscape, run_id: &pw_core::core::identifiers::RunId) -> NodeId {
    let node = store
        .register_node(
            run_id,
            NewNode {
                node_id: NodeId::new("src-1"),
                plugin_name: "csv_source".to_owned(),
                node_type: NodeType::Source,
                plugin_version: "1.0.0".to_owned(),
                determinism: Determinism::Deterministic,
                config_hash: "hash-src".to_owned(),
                config_json: json!({"path": "in.csv"}),
                schema_mode: SchemaMode::Observed,
                schema_fields: None,
            },
        )
        .expect("register source node");
    node.node_id
}

#[test]
fn one_terminal_outcome_per_token_is_enforced() {
    let store = opened();
    let run = store.begin_run("cfg-hash".to_owned(), "v1".to_owned()).expect("begin run");
    let source = register_source(&store, &run.run_id);
    let row = store.create_row(&run.run_id, &source, 0, "row-hash".to_owned(), None).expect("create row");
    let token = store
        .create_token(&run.run_id, NewToken { row_id: row.row_id, parents: Vec::new(), fork_group_id: None, expand_group_id: None, join_group_id: None, branch_name: None })
        .expect("create token");

    store
        .record_token_outcome(&run.run_id, &token.token_id, TokenOutcomeKind::Completed, Some("sink-1".to_owned()), None, json!({"ok": true}))
        .expect("first terminal outcome");

    let second = store.record_token_outcome(&run.run_id, &token.token_id, TokenOutcomeKind::Failed, None, None, json!({"oops": true}));
    assert!(second.is_err(), "a second terminal outcome for the same token must be rejected");
}

#[test]
fn non_terminal_outcomes_do_not_conflict_with_each_other() {
    let store = opened();
    let run = store.begin_run("cfg-hash".to_owned(), "v1".to_owned()).expect("begin run");
    let source = register_source(&store, &run.run_id);
    let row = store.create_row(&run.run_id, &source, 0, "row-hash".to_owned(), None).expect("create row");
    let token = store
        .create_token(&run.run_id, NewToken { row_id: row.row_id, parents: Vec::new(), fork_group_id: None, expand_group_id: None, join_group_id: None, branch_name: None })
        .expect("create token");

    store.record_token_outcome(&run.run_id, &token.token_id, TokenOutcomeKind::Buffered, None, None, json!({})).expect("first buffered outcome");
    store.record_token_outcome(&run.run_id, &token.token_id, TokenOutcomeKind::Buffered, None, None, json!({})).expect("second buffered outcome must not conflict");
}

#[test]
fn node_state_completion_requires_open_status_and_monotonic_timestamps() {
    let store = opened();
    let run = store.begin_run("cfg-hash".to_owned(), "v1".to_owned()).expect("begin run");
    let source = register_source(&store, &run.run_id);
    let row = store.create_row(&run.run_id, &source, 0, "row-hash".to_owned(), None).expect("create row");
    let token = store
        .create_token(&run.run_id, NewToken { row_id: row.row_id, parents: Vec::new(), fork_group_id: None, expand_group_id: None, join_group_id: None, branch_name: None })
        .expect("create token");

    let state = store
        .begin_node_state(&run.run_id, NewNodeState { token_id: token.token_id.clone(), node_id: source.clone(), step_index: 0, attempt: 0, input_hash: "in-hash".to_owned(), context_before: None })
        .expect("begin node state");
    assert_eq!(state.status, NodeStateStatus::Open);

    let completed = store
        .complete_node_state(
            &state.state_id,
            NodeStateCompletion {
                status: NodeStateStatus::Completed,
                output_hash: Some("out-hash".to_owned()),
                context_after: None,
                duration_ms: 12.5,
                error_json: None,
                success_reason_json: None,
            },
        )
        .expect("complete node state");
    assert_eq!(completed.status, NodeStateStatus::Completed);
    assert!(completed.started_at <= completed.completed_at.expect("completed_at set"));
    assert_eq!(completed.duration_ms, Some(12.5));

    let retry = store.complete_node_state(
        &state.state_id,
        NodeStateCompletion { status: NodeStateStatus::Completed, output_hash: None, context_after: None, duration_ms: 1.0, error_json: None, success_reason_json: None },
    );
    assert!(retry.is_err(), "completing an already-completed node state must fail");
}

#[test]
fn routing_group_ordinals_start_at_zero_and_share_one_reason() {
    let store = opened();
    let run = store.begin_run("cfg-hash".to_owned(), "v1".to_owned()).expect("begin run");
    let source = register_source(&store, &run.run_id);
    let sink = store
        .register_node(
            &run.run_id,
            NewNode {
                node_id: NodeId::new("sink-1"),
                plugin_name: "csv_sink".to_owned(),
                node_type: NodeType::Sink,
                plugin_version: "1.0.0".to_owned(),
                determinism: Determinism::IoWrite,
                config_hash: "hash-sink".to_owned(),
                config_json: json!({"path": "out.csv"}),
                schema_mode: SchemaMode::Free,
                schema_fields: None,
            },
        )
        .expect("register sink node");
    let edge_a = store.register_edge(&run.run_id, source.clone(), sink.clone(), "a".to_owned(), EdgeMode::Move).expect("register edge a");
    let edge_b = store.register_edge(&run.run_id, source.clone(), sink.clone(), "b".to_owned(), EdgeMode::Copy).expect("register edge b");

    let row = store.create_row(&run.run_id, &source, 0, "row-hash".to_owned(), None).expect("create row");
    let token = store
        .create_token(&run.run_id, NewToken { row_id: row.row_id, parents: Vec::new(), fork_group_id: None, expand_group_id: None, join_group_id: None, branch_name: None })
        .expect("create token");
    let state = store
        .begin_node_state(&run.run_id, NewNodeState { token_id: token.token_id, node_id: source, step_index: 0, attempt: 0, input_hash: "in-hash".to_owned(), context_before: None })
        .expect("begin node state");

    let events = store
        .record_routing_events(
            &state.state_id,
            vec![
                RoutingDecision { edge_id: edge_a.edge_id, mode: pw_core::core::model::RoutingMode::Move },
                RoutingDecision { edge_id: edge_b.edge_id, mode: pw_core::core::model::RoutingMode::Copy },
            ],
            Some("reason-hash".to_owned()),
            Some("reason-ref".to_owned()),
        )
        .expect("record routing events");

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].ordinal, 0);
    assert_eq!(events[1].ordinal, 1);
    assert_eq!(events[0].routing_group_id, events[1].routing_group_id);
    assert_eq!(events[0].reason_ref, events[1].reason_ref);
}

#[test]
fn call_index_is_monotonic_per_state() {
    let store = opened();
    let run = store.begin_run("cfg-hash".to_owned(), "v1".to_owned()).expect("begin run");
    let source = register_source(&store, &run.run_id);
    let row = store.create_row(&run.run_id, &source, 0, "row-hash".to_owned(), None).expect("create row");
    let token = store
        .create_token(&run.run_id, NewToken { row_id: row.row_id, parents: Vec::new(), fork_group_id: None, expand_group_id: None, join_group_id: None, branch_name: None })
        .expect("create token");
    let state = store
        .begin_node_state(&run.run_id, NewNodeState { token_id: token.token_id, node_id: source, step_index: 0, attempt: 0, input_hash: "in-hash".to_owned(), context_before: None })
        .expect("begin node state");

    let first = store
        .record_call(&state.state_id, NewCall { call_type: CallType::Http, status: CallStatus::Success, request_hash: "req-1".to_owned(), response_hash: Some("res-1".to_owned()), error_json: None, latency_ms: 5.0, retryable: false })
        .expect("record first call");
    let second = store
        .record_call(&state.state_id, NewCall { call_type: CallType::Http, status: CallStatus::Success, request_hash: "req-2".to_owned(), response_hash: Some("res-2".to_owned()), error_json: None, latency_ms: 6.0, retryable: false })
        .expect("record second call");

    assert_eq!(first.call_index, 0);
    assert_eq!(second.call_index, 1);
}

#[test]
fn artifact_registration_is_idempotent() {
    let store = opened();
    let run = store.begin_run("cfg-hash".to_owned(), "v1".to_owned()).expect("begin run");
    let source = register_source(&store, &run.run_id);
    let row = store.create_row(&run.run_id, &source, 0, "row-hash".to_owned(), None).expect("create row");
    let token = store
        .create_token(&run.run_id, NewToken { row_id: row.row_id, parents: Vec::new(), fork_group_id: None, expand_group_id: None, join_group_id: None, branch_name: None })
        .expect("create token");
    let state = store
        .begin_node_state(&run.run_id, NewNodeState { token_id: token.token_id, node_id: source.clone(), step_index: 0, attempt: 0, input_hash: "in-hash".to_owned(), context_before: None })
        .expect("begin node state");

    let new_artifact = NewArtifact {
        state_id: state.state_id.clone(),
        sink_node_id: source.clone(),
        artifact_type: "csv_file".to_owned(),
        path_or_uri: "/out/part-0.csv".to_owned(),
        content_hash: "content-hash".to_owned(),
        size_bytes: 1024,
        idempotency_key: Some("part-0".to_owned()),
    };
    let first = store.register_artifact(&run.run_id, new_artifact.clone()).expect("first registration");
    let second = store.register_artifact(&run.run_id, new_artifact).expect("retry registration");

    assert_eq!(first.artifact_id, second.artifact_id, "retrying with the same idempotency key must return the same artifact");
}

#[test]
fn checkpoint_sequence_numbers_are_monotonic_per_node() {
    let store = opened();
    let run = store.begin_run("cfg-hash".to_owned(), "v1".to_owned()).expect("begin run");
    let source = register_source(&store, &run.run_id);
    let row = store.create_row(&run.run_id, &source, 0, "row-hash".to_owned(), None).expect("create row");
    let token = store
        .create_token(&run.run_id, NewToken { row_id: row.row_id, parents: Vec::new(), fork_group_id: None, expand_group_id: None, join_group_id: None, branch_name: None })
        .expect("create token");

    let first = store
        .write_checkpoint(
            &run.run_id,
            NewCheckpoint {
                token_id: token.token_id.clone(),
                node_id: source.clone(),
                upstream_topology_hash: "topo-1".to_owned(),
                checkpoint_node_config_hash: "cfg-1".to_owned(),
                aggregation_state_json: None,
            },
        )
        .expect("first checkpoint");
    let second = store
        .write_checkpoint(
            &run.run_id,
            NewCheckpoint {
                token_id: token.token_id,
                node_id: source.clone(),
                upstream_topology_hash: "topo-1".to_owned(),
                checkpoint_node_config_hash: "cfg-1".to_owned(),
                aggregation_state_json: None,
            },
        )
        .expect("second checkpoint");

    assert_eq!(first.sequence_number, 0);
    assert_eq!(second.sequence_number, 1);

    let latest = store.latest_checkpoint(&run.run_id, &source).expect("read latest checkpoint").expect("a checkpoint exists");
    assert_eq!(latest.checkpoint_id, second.checkpoint_id);
}

#[test]
fn reproducibility_grade_reflects_node_determinism() {
    let store = opened();
    let run = store.begin_run("cfg-hash".to_owned(), "v1".to_owned()).expect("begin run");
    let source = register_source(&store, &run.run_id);
    let row = store.create_row(&run.run_id, &source, 0, "row-hash".to_owned(), None).expect("create row");
    let token = store
        .create_token(&run.run_id, NewToken { row_id: row.row_id, parents: Vec::new(), fork_group_id: None, expand_group_id: None, join_group_id: None, branch_name: None })
        .expect("create token");
    let state = store
        .begin_node_state(&run.run_id, NewNodeState { token_id: token.token_id, node_id: source, step_index: 0, attempt: 0, input_hash: "in-hash".to_owned(), context_before: None })
        .expect("begin node state");
    store
        .complete_node_state(
            &state.state_id,
            NodeStateCompletion { status: NodeStateStatus::Completed, output_hash: Some("out".to_owned()), context_after: None, duration_ms: 1.0, error_json: None, success_reason_json: None },
        )
        .expect("complete node state");

    let finished = store.finalize_run(&run.run_id, RunStatus::Completed).expect("finalize run");
    assert_eq!(finished.reproducibility_grade, Some(pw_core::core::model::ReproducibilityGrade::FullReproducible));
}
