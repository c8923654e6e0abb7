// crates/pw-store/src/store/recorder.rs
// ============================================================================
// Module: Recorder Seam
// Description: Implements `pw_core::protocol::LandscapeRecorder` on top of
// the `states`/`lineage`/`outcomes` primitives — the narrow trait seam a
// running `PluginContext` calls into (§4.3, §4.5).
// Dependencies: pw-core
// ============================================================================

use pw_core::core::canonical;
use pw_core::core::error::EngineError;
use pw_core::core::identifiers::NodeId;
use pw_core::core::identifiers::RunId;
use pw_core::core::identifiers::StateId;
use pw_core::core::identifiers::TokenId;
use pw_core::core::model::TokenOutcomeKind;
use pw_core::protocol::CallRecord;
use pw_core::protocol::LandscapeRecorder;
use serde_json::Value;

use crate::SqliteLandscape;
use crate::store::lineage::NewToken;
use crate::store::states::NewCall;

/// Sentinel source-node id stamped onto rows synthesized to track a
/// validation failure, which happens before any real node has been visited.
const VALIDATION_SOURCE_NODE: &str = "validation";

impl LandscapeRecorder for SqliteLandscape {
    fn record_call(&self, state_id: &StateId, call: CallRecord) -> Result<(), EngineError> {
        let new_call = NewCall {
            call_type: call.call_type,
            status: call.status,
            request_hash: call.request_hash,
            response_hash: call.response_hash,
            error_json: call.error_json,
            latency_ms: call.latency_ms,
            retryable: call.retryable,
        };
        self.record_call(state_id, new_call).map(|_| ()).map_err(EngineError::from)
    }

    fn record_validation_error(&self, run_id: &RunId, reason: Value) -> Result<TokenId, EngineError> {
        let reason_hash = canonical::stable_hash(&reason).map_err(|err| EngineError::AuditIntegrity(err.to_string()))?;
        let row = self
            .create_row(run_id, &NodeId::new(VALIDATION_SOURCE_NODE), 0, reason_hash.value, None)
            .map_err(EngineError::from)?;
        let token = self
            .create_token(run_id, NewToken { row_id: row.row_id, parents: Vec::new(), fork_group_id: None, expand_group_id: None, join_group_id: None, branch_name: None })
            .map_err(EngineError::from)?;
        self.record_token_outcome(run_id, &token.token_id, TokenOutcomeKind::Discarded, None, None, reason)
            .map_err(EngineError::from)?;
        Ok(token.token_id)
    }

    fn record_transform_error(&self, state_id: &StateId, reason: Value) -> Result<TokenId, EngineError> {
        let state = self.get_node_state(state_id).map_err(EngineError::from)?;
        self.record_token_outcome(&state.run_id, &state.token_id, TokenOutcomeKind::Failed, None, None, reason)
            .map_err(EngineError::from)?;
        Ok(state.token_id)
    }
}
