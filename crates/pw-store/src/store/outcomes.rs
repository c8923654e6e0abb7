// crates/pw-store/src/store/outcomes.rs
// ============================================================================
// Module: Token Outcomes
// Description: `record_token_outcome` (§4.3, §8): the terminal/non-terminal
// disposition of a token, enforced one-terminal-outcome-per-token by the
// partial unique index in `schema.rs`.
// Dependencies: rusqlite, serde_json, pw-core
// ============================================================================

use pw_core::core::identifiers::BatchId;
use pw_core::core::identifiers::OutcomeId;
use pw_core::core::identifiers::RunId;
use pw_core::core::identifiers::TokenId;
use pw_core::core::model::TokenOutcome;
use pw_core::core::model::TokenOutcomeKind;
use rusqlite::OptionalExtension as _;
use serde_json::Value;

use crate::SqliteLandscape;
use crate::StoreError;
use crate::codec;
use crate::ids;
use crate::writer;

impl SqliteLandscape {
    /// Records a token's disposition. Recording a second terminal outcome
    /// for the same token is rejected by the store's partial unique index
    /// (surfaced here as [`StoreError::Constraint`]); recording a
    /// non-terminal outcome (e.g. `buffered`) has no such restriction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Constraint`] if a terminal outcome already
    /// exists for this token.
    pub fn record_token_outcome(
        &self,
        run_id: &RunId,
        token_id: &TokenId,
        outcome: TokenOutcomeKind,
        sink_name: Option<String>,
        batch_id: Option<BatchId>,
        context_json: Value,
    ) -> Result<TokenOutcome, StoreError> {
        let outcome_id = OutcomeId::new(ids::fresh("outc"));
        let is_terminal = outcome.is_terminal();
        writer::call(&self.writer, {
            let outcome_id = outcome_id.as_str().to_owned();
            let run_id = run_id.as_str().to_owned();
            let token_id = token_id.as_str().to_owned();
            let outcome_str = codec::token_outcome_kind_str(outcome);
            let sink_name = sink_name.clone();
            let batch_id = batch_id.as_ref().map(|id| id.as_str().to_owned());
            let context_json_text = context_json.to_string();
            move |tx| {
                tx.execute(
                    "INSERT INTO token_outcomes (outcome_id, run_id, token_id, outcome, is_terminal, sink_name, \
                     batch_id, context_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![outcome_id, run_id, token_id, outcome_str, is_terminal, sink_name, batch_id, context_json_text],
                )
                .map_err(StoreError::from)?;
                Ok(())
            }
        })?;
        Ok(TokenOutcome { outcome_id, run_id: run_id.clone(), token_id: token_id.clone(), outcome, is_terminal, sink_name, batch_id, context_json })
    }

    /// Returns the terminal outcome recorded for a token, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn terminal_outcome(&self, token_id: &TokenId) -> Result<Option<TokenOutcome>, StoreError> {
        let token_id_str = token_id.as_str().to_owned();
        self.read_pool.with_connection(move |conn| {
            conn.query_row(
                "SELECT outcome_id, run_id, token_id, outcome, is_terminal, sink_name, batch_id, context_json \
                 FROM token_outcomes WHERE token_id = ?1 AND is_terminal = 1",
                [&token_id_str],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()
            .map_err(StoreError::from)?
            .map(|(outcome_id, run_id, token_id, outcome, is_terminal, sink_name, batch_id, context_json)| {
                Ok(TokenOutcome {
                    outcome_id: OutcomeId::new(outcome_id),
                    run_id: RunId::new(run_id),
                    token_id: TokenId::new(token_id),
                    outcome: codec::parse_token_outcome_kind(&outcome)?,
                    is_terminal,
                    sink_name,
                    batch_id: batch_id.map(BatchId::new),
                    context_json: serde_json::from_str(&context_json).map_err(|err| StoreError::Decode(err.to_string()))?,
                })
            })
            .transpose()
        })
    }
}
