// crates/pw-store/src/store/checkpoints.rs
// ============================================================================
// Module: Checkpoints
// Description: `write_checkpoint` and the latest-checkpoint lookup resume
// (§4.11) uses to recompute and compare `upstream_topology_hash` and
// `checkpoint_node_config_hash` before trusting a checkpoint.
// Dependencies: rusqlite, serde_json, pw-core
// ============================================================================

use pw_core::core::identifiers::CheckpointId;
use pw_core::core::identifiers::NodeId;
use pw_core::core::identifiers::RunId;
use pw_core::core::identifiers::TokenId;
use pw_core::core::model::Checkpoint;
use rusqlite::OptionalExtension as _;
use serde_json::Value;

use crate::SqliteLandscape;
use crate::StoreError;
use crate::ids;
use crate::timefmt;
use crate::writer;

/// Every field needed to write a checkpoint, grouped to keep
/// [`SqliteLandscape::write_checkpoint`] under clippy's argument-count
/// limit.
#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    /// Token this checkpoint is written for.
    pub token_id: TokenId,
    /// Node this checkpoint is written for.
    pub node_id: NodeId,
    /// SHA-256 hash over the canonical encoding of every upstream node spec.
    pub upstream_topology_hash: String,
    /// SHA-256 hash of this checkpoint node's canonical configuration.
    pub checkpoint_node_config_hash: String,
    /// Canonical JSON of aggregation state, if this checkpoint belongs to
    /// an aggregation node.
    pub aggregation_state_json: Option<Value>,
}

impl SqliteLandscape {
    /// Writes a new checkpoint, assigning the next `sequence_number` for
    /// `(run_id, node_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn write_checkpoint(&self, run_id: &RunId, new: NewCheckpoint) -> Result<Checkpoint, StoreError> {
        let checkpoint_id = CheckpointId::new(ids::fresh("ckpt"));
        let created_at = self.clock_now();
        let sequence_number = writer::call(&self.writer, {
            let checkpoint_id = checkpoint_id.as_str().to_owned();
            let run_id = run_id.as_str().to_owned();
            let token_id = new.token_id.as_str().to_owned();
            let node_id = new.node_id.as_str().to_owned();
            let upstream_topology_hash = new.upstream_topology_hash.clone();
            let checkpoint_node_config_hash = new.checkpoint_node_config_hash.clone();
            let aggregation_state_json = new.aggregation_state_json.as_ref().map(ToString::to_string);
            move |tx| {
                let next_sequence: i64 = tx
                    .query_row(
                        "SELECT COALESCE(MAX(sequence_number) + 1, 0) FROM checkpoints WHERE run_id = ?1 AND node_id = ?2",
                        rusqlite::params![run_id, node_id],
                        |row| row.get(0),
                    )
                    .map_err(StoreError::from)?;
                tx.execute(
                    "INSERT INTO checkpoints (checkpoint_id, run_id, token_id, node_id, sequence_number, \
                     upstream_topology_hash, checkpoint_node_config_hash, aggregation_state_json, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        checkpoint_id,
                        run_id,
                        token_id,
                        node_id,
                        next_sequence,
                        upstream_topology_hash,
                        checkpoint_node_config_hash,
                        aggregation_state_json,
                        timefmt::encode(created_at),
                    ],
                )
                .map_err(StoreError::from)?;
                Ok(next_sequence)
            }
        })?;
        #[allow(clippy::cast_sign_loss, reason = "sequence_number is always assigned as a non-negative counter")]
        let sequence_number = sequence_number as u64;
        Ok(Checkpoint {
            checkpoint_id,
            run_id: run_id.clone(),
            token_id: new.token_id,
            node_id: new.node_id,
            sequence_number,
            upstream_topology_hash: new.upstream_topology_hash,
            checkpoint_node_config_hash: new.checkpoint_node_config_hash,
            aggregation_state_json: new.aggregation_state_json,
            created_at,
        })
    }

    /// Returns the most recent checkpoint written for `(run_id, node_id)`,
    /// used by the recovery manager to resume a node's in-flight state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn latest_checkpoint(&self, run_id: &RunId, node_id: &NodeId) -> Result<Option<Checkpoint>, StoreError> {
        let run_id_str = run_id.as_str().to_owned();
        let node_id_str = node_id.as_str().to_owned();
        self.read_pool.with_connection(move |conn| {
            conn.query_row(
                "SELECT * FROM checkpoints WHERE run_id = ?1 AND node_id = ?2 ORDER BY sequence_number DESC LIMIT 1",
                rusqlite::params![run_id_str, node_id_str],
                |row| {
                    Ok((
                        row.get::<_, String>("checkpoint_id")?,
                        row.get::<_, String>("run_id")?,
                        row.get::<_, String>("token_id")?,
                        row.get::<_, String>("node_id")?,
                        row.get::<_, i64>("sequence_number")?,
                        row.get::<_, String>("upstream_topology_hash")?,
                        row.get::<_, String>("checkpoint_node_config_hash")?,
                        row.get::<_, Option<String>>("aggregation_state_json")?,
                        row.get::<_, String>("created_at")?,
                    ))
                },
            )
            .optional()
            .map_err(StoreError::from)?
            .map(
                |(checkpoint_id, run_id, token_id, node_id, sequence_number, upstream_topology_hash, checkpoint_node_config_hash, aggregation_state_json, created_at)| {
                    Ok(Checkpoint {
                        checkpoint_id: CheckpointId::new(checkpoint_id),
                        run_id: RunId::new(run_id),
                        token_id: TokenId::new(token_id),
                        node_id: NodeId::new(node_id),
                        #[allow(clippy::cast_sign_loss, reason = "sequence_number is always written as a non-negative value")]
                        sequence_number: sequence_number as u64,
                        upstream_topology_hash,
                        checkpoint_node_config_hash,
                        aggregation_state_json: aggregation_state_json
                            .map(|text| serde_json::from_str(&text))
                            .transpose()
                            .map_err(|err| StoreError::Decode(err.to_string()))?,
                        created_at: timefmt::decode(&created_at)?,
                    })
                },
            )
            .transpose()
        })
    }
}
