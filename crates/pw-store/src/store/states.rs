// crates/pw-store/src/store/states.rs
// ============================================================================
// Module: Node State, Routing, and Calls
// Description: `begin_node_state`, `complete_node_state`,
// `record_routing_events`, `record_call` (§4.3, §4.9's `_node_state_
// recording.py`-derived group-reuse rule for routing reasons).
// Dependencies: rusqlite, serde_json, pw-core
// ============================================================================

use pw_core::core::identifiers::EdgeId;
use pw_core::core::identifiers::EventId;
use pw_core::core::identifiers::NodeId;
use pw_core::core::identifiers::RoutingGroupId;
use pw_core::core::identifiers::RunId;
use pw_core::core::identifiers::StateId;
use pw_core::core::identifiers::TokenId;
use pw_core::core::model::Call;
use pw_core::core::model::CallStatus;
use pw_core::core::model::CallType;
use pw_core::core::model::NodeState;
use pw_core::core::model::NodeStateStatus;
use pw_core::core::model::RoutingEvent;
use pw_core::core::model::RoutingMode;
use rusqlite::OptionalExtension as _;
use rusqlite::Row;
use serde_json::Value;

use crate::SqliteLandscape;
use crate::StoreError;
use crate::codec;
use crate::ids;
use crate::timefmt;
use crate::writer;

/// Every field needed to begin a node state, grouped to keep
/// [`SqliteLandscape::begin_node_state`] under clippy's argument-count limit.
#[derive(Debug, Clone)]
pub struct NewNodeState {
    /// Token visiting the node.
    pub token_id: TokenId,
    /// Node being visited.
    pub node_id: NodeId,
    /// Position of this visit in the token's execution path.
    pub step_index: u64,
    /// Attempt number; `0` for the first attempt.
    pub attempt: u32,
    /// SHA-256 hash of the canonical encoding of the input.
    pub input_hash: String,
    /// Canonical JSON snapshot of context before processing.
    pub context_before: Option<Value>,
}

/// Every field needed to complete a node state, grouped to keep
/// [`SqliteLandscape::complete_node_state`] under clippy's argument-count
/// limit.
#[derive(Debug, Clone)]
pub struct NodeStateCompletion {
    /// Final status; must be `completed` or `failed`.
    pub status: NodeStateStatus,
    /// SHA-256 hash of the canonical encoding of the output, if produced.
    pub output_hash: Option<String>,
    /// Canonical JSON snapshot of context after processing.
    pub context_after: Option<Value>,
    /// Processing duration in milliseconds. Required at completion.
    pub duration_ms: f64,
    /// Canonical JSON of the error, if the outcome was a failure.
    pub error_json: Option<Value>,
    /// Canonical JSON of the success reason, if one was supplied.
    pub success_reason_json: Option<Value>,
}

/// One routing decision to record, before `routing_group_id` and `ordinal`
/// are assigned by [`SqliteLandscape::record_routing_events`].
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// Edge this route takes.
    pub edge_id: EdgeId,
    /// Mode this route is taken in.
    pub mode: RoutingMode,
}

/// Every field needed to record a call, grouped to keep
/// [`SqliteLandscape::record_call`] under clippy's argument-count limit.
#[derive(Debug, Clone)]
pub struct NewCall {
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

#[allow(clippy::type_complexity, reason = "A row-shaped tuple mirroring the node_states table's columns.")]
type StateFields = (
    String,
    String,
    String,
    String,
    i64,
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<f64>,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
);

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<StateFields> {
    Ok((
        row.get("state_id")?,
        row.get("token_id")?,
        row.get("node_id")?,
        row.get("run_id")?,
        row.get("step_index")?,
        row.get("attempt")?,
        row.get("status")?,
        row.get("input_hash")?,
        row.get("output_hash")?,
        row.get("context_before")?,
        row.get("context_after")?,
        row.get("duration_ms")?,
        row.get("error_json")?,
        row.get("success_reason_json")?,
        row.get("started_at")?,
        row.get("completed_at")?,
    ))
}

fn decode_state(fields: StateFields) -> Result<NodeState, StoreError> {
    let (state_id, token_id, node_id, run_id, step_index, attempt, status, input_hash, output_hash, context_before, context_after, duration_ms, error_json, success_reason_json, started_at, completed_at) =
        fields;
    Ok(NodeState {
        state_id: StateId::new(state_id),
        token_id: TokenId::new(token_id),
        node_id: NodeId::new(node_id),
        run_id: RunId::new(run_id),
        #[allow(clippy::cast_sign_loss, reason = "step_index is always written as a non-negative value")]
        step_index: step_index as u64,
        #[allow(clippy::cast_sign_loss, reason = "attempt is always written as a non-negative value")]
        attempt: attempt as u32,
        status: codec::parse_node_state_status(&status)?,
        input_hash,
        output_hash,
        context_before: decode_json_opt(context_before)?,
        context_after: decode_json_opt(context_after)?,
        duration_ms,
        error_json: decode_json_opt(error_json)?,
        success_reason_json: decode_json_opt(success_reason_json)?,
        started_at: timefmt::decode(&started_at)?,
        completed_at: timefmt::decode_opt(completed_at)?,
    })
}

fn decode_json_opt(text: Option<String>) -> Result<Option<Value>, StoreError> {
    text.map(|text| serde_json::from_str(&text)).transpose().map_err(|err| StoreError::Decode(err.to_string()))
}

impl SqliteLandscape {
    /// Opens a new node-state record in `open` status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn begin_node_state(&self, run_id: &RunId, new: NewNodeState) -> Result<NodeState, StoreError> {
        let state_id = StateId::new(ids::fresh("state"));
        let started_at = self.clock_now();
        writer::call(&self.writer, {
            let state_id = state_id.as_str().to_owned();
            let run_id = run_id.as_str().to_owned();
            let token_id = new.token_id.as_str().to_owned();
            let node_id = new.node_id.as_str().to_owned();
            let input_hash = new.input_hash.clone();
            let context_before = new.context_before.as_ref().map(ToString::to_string);
            #[allow(clippy::cast_possible_wrap, reason = "step_index fits comfortably within i64 for any token's execution path")]
            let step_index = new.step_index as i64;
            let attempt = i64::from(new.attempt);
            move |tx| {
                tx.execute(
                    "INSERT INTO node_states (state_id, token_id, node_id, run_id, step_index, attempt, status, \
                     input_hash, context_before, started_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'open', ?7, ?8, ?9)",
                    rusqlite::params![state_id, token_id, node_id, run_id, step_index, attempt, input_hash, context_before, timefmt::encode(started_at)],
                )
                .map_err(StoreError::from)?;
                Ok(())
            }
        })?;
        Ok(NodeState {
            state_id,
            token_id: new.token_id,
            node_id: new.node_id,
            run_id: run_id.clone(),
            step_index: new.step_index,
            attempt: new.attempt,
            status: NodeStateStatus::Open,
            input_hash: new.input_hash,
            output_hash: None,
            context_before: new.context_before,
            context_after: None,
            duration_ms: None,
            error_json: None,
            success_reason_json: None,
            started_at,
            completed_at: None,
        })
    }

    /// Completes an open node state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invariant`] if the state is not `open`, if
    /// `completion.status` is not `completed`/`failed`, or if the write
    /// would place `completed_at` before `started_at`.
    pub fn complete_node_state(&self, state_id: &StateId, completion: NodeStateCompletion) -> Result<NodeState, StoreError> {
        if !matches!(completion.status, NodeStateStatus::Completed | NodeStateStatus::Failed) {
            return Err(StoreError::Invariant(format!("cannot complete node state with status '{:?}'", completion.status)));
        }
        let completed_at = self.clock_now();
        let state_id_str = state_id.as_str().to_owned();
        writer::call(&self.writer, {
            let state_id_str = state_id_str.clone();
            let status_str = codec::node_state_status_str(completion.status);
            let output_hash = completion.output_hash.clone();
            let context_after = completion.context_after.as_ref().map(ToString::to_string);
            let error_json = completion.error_json.as_ref().map(ToString::to_string);
            let success_reason_json = completion.success_reason_json.as_ref().map(ToString::to_string);
            let duration_ms = completion.duration_ms;
            move |tx| {
                let (current_status, started_at): (String, String) = tx
                    .query_row("SELECT status, started_at FROM node_states WHERE state_id = ?1", [&state_id_str], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })
                    .optional()
                    .map_err(StoreError::from)?
                    .ok_or_else(|| StoreError::NotFound(format!("node state '{state_id_str}'")))?;
                if current_status != "open" {
                    return Err(StoreError::Invariant(format!("node state '{state_id_str}' is not open")));
                }
                let started_at_parsed = timefmt::decode(&started_at)?;
                if completed_at < started_at_parsed {
                    return Err(StoreError::Invariant(format!("node state '{state_id_str}' completed before it started")));
                }
                tx.execute(
                    "UPDATE node_states SET status = ?2, output_hash = ?3, context_after = ?4, duration_ms = ?5, \
                     error_json = ?6, success_reason_json = ?7, completed_at = ?8 WHERE state_id = ?1",
                    rusqlite::params![state_id_str, status_str, output_hash, context_after, duration_ms, error_json, success_reason_json, timefmt::encode(completed_at)],
                )
                .map_err(StoreError::from)?;
                Ok(())
            }
        })?;
        self.get_node_state(state_id)
    }

    /// Reads a node state by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if it does not exist.
    pub fn get_node_state(&self, state_id: &StateId) -> Result<NodeState, StoreError> {
        let state_id_str = state_id.as_str().to_owned();
        self.read_pool.with_connection(move |conn| {
            let fields = conn
                .query_row("SELECT * FROM node_states WHERE state_id = ?1", [&state_id_str], state_from_row)
                .optional()
                .map_err(StoreError::from)?
                .ok_or_else(|| StoreError::NotFound(format!("node state '{state_id_str}'")))?;
            decode_state(fields)
        })
    }

    /// Records a group of routing decisions made by one node state. Every
    /// event shares one `routing_group_id` with ordinals `0..k-1`, and (per
    /// §9) the canonically-hashed `reason` is persisted once and shared
    /// across the whole group via `reason_hash`/`reason_ref` rather than
    /// re-stored per event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn record_routing_events(
        &self,
        state_id: &StateId,
        decisions: Vec<RoutingDecision>,
        reason_hash: Option<String>,
        reason_ref: Option<String>,
    ) -> Result<Vec<RoutingEvent>, StoreError> {
        let routing_group_id = RoutingGroupId::new(ids::fresh("rgrp"));
        let created_at = self.clock_now();
        let mut events = Vec::with_capacity(decisions.len());
        let mut rows = Vec::with_capacity(decisions.len());
        #[allow(clippy::cast_possible_truncation, reason = "a single node state never produces anywhere near u32::MAX routes")]
        for (ordinal, decision) in decisions.into_iter().enumerate() {
            let event_id = EventId::new(ids::fresh("revt"));
            let ordinal = ordinal as u32;
            rows.push((
                event_id.as_str().to_owned(),
                decision.edge_id.as_str().to_owned(),
                ordinal,
                codec::routing_mode_str(decision.mode),
            ));
            events.push(RoutingEvent {
                event_id,
                state_id: state_id.clone(),
                edge_id: decision.edge_id,
                routing_group_id: routing_group_id.clone(),
                ordinal,
                mode: decision.mode,
                reason_hash: reason_hash.clone(),
                reason_ref: reason_ref.clone(),
                created_at,
            });
        }
        writer::call(&self.writer, {
            let state_id = state_id.as_str().to_owned();
            let routing_group_id = routing_group_id.as_str().to_owned();
            let reason_hash = reason_hash.clone();
            let reason_ref = reason_ref.clone();
            move |tx| {
                for (event_id, edge_id, ordinal, mode_str) in rows {
                    tx.execute(
                        "INSERT INTO routing_events (event_id, state_id, edge_id, routing_group_id, ordinal, mode, \
                         reason_hash, reason_ref, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        rusqlite::params![event_id, state_id, edge_id, routing_group_id, ordinal, mode_str, reason_hash, reason_ref, timefmt::encode(created_at)],
                    )
                    .map_err(StoreError::from)?;
                }
                Ok(())
            }
        })?;
        Ok(events)
    }

    /// Records one external call made on behalf of a node state.
    /// `call_index` is assigned as the next monotonic index for `state_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn record_call(&self, state_id: &StateId, new: NewCall) -> Result<Call, StoreError> {
        let state_id_str = state_id.as_str().to_owned();
        let call_index = writer::call(&self.writer, {
            let state_id_str = state_id_str.clone();
            let call_type_str = codec::call_type_str(new.call_type);
            let status_str = codec::call_status_str(new.status);
            let request_hash = new.request_hash.clone();
            let response_hash = new.response_hash.clone();
            let error_json_text = new.error_json.as_ref().map(ToString::to_string);
            let latency_ms = new.latency_ms;
            let retryable = new.retryable;
            move |tx| {
                let next_index: i64 = tx
                    .query_row("SELECT COALESCE(MAX(call_index) + 1, 0) FROM calls WHERE state_id = ?1", [&state_id_str], |row| row.get(0))
                    .map_err(StoreError::from)?;
                tx.execute(
                    "INSERT INTO calls (state_id, call_index, call_type, status, request_hash, response_hash, \
                     error_json, latency_ms, retryable) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![state_id_str, next_index, call_type_str, status_str, request_hash, response_hash, error_json_text, latency_ms, retryable],
                )
                .map_err(StoreError::from)?;
                Ok(next_index)
            }
        })?;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation, reason = "call_index is always assigned as a small non-negative counter")]
        let call_index = call_index as u32;
        Ok(Call {
            state_id: state_id.clone(),
            call_index,
            call_type: new.call_type,
            status: new.status,
            request_hash: new.request_hash,
            response_hash: new.response_hash,
            error_json: new.error_json,
            latency_ms: new.latency_ms,
            retryable: new.retryable,
        })
    }
}
