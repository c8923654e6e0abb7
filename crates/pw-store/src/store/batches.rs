// crates/pw-store/src/store/batches.rs
// ============================================================================
// Module: Batches
// Description: `create_batch`, `add_batch_member`, `add_batch_output`,
// `update_batch_status`, and the member/output readers the coalesce logic
// needs to reassemble a batch (§4.3, §4.7).
// Dependencies: rusqlite, pw-core
// ============================================================================

use pw_core::core::identifiers::BatchId;
use pw_core::core::identifiers::NodeId;
use pw_core::core::identifiers::RunId;
use pw_core::core::identifiers::TokenId;
use pw_core::core::model::Batch;
use pw_core::core::model::BatchMember;
use pw_core::core::model::BatchOutput;
use pw_core::core::model::BatchStatus;
use rusqlite::OptionalExtension as _;

use crate::SqliteLandscape;
use crate::StoreError;
use crate::codec;
use crate::ids;
use crate::timefmt;
use crate::writer;

impl SqliteLandscape {
    /// Creates a new batch in `draft` status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn create_batch(&self, run_id: &RunId, aggregation_node_id: &NodeId, trigger_type: String) -> Result<Batch, StoreError> {
        let batch_id = BatchId::new(ids::fresh("batch"));
        let created_at = self.clock_now();
        writer::call(&self.writer, {
            let batch_id = batch_id.as_str().to_owned();
            let run_id = run_id.as_str().to_owned();
            let aggregation_node_id = aggregation_node_id.as_str().to_owned();
            let trigger_type = trigger_type.clone();
            move |tx| {
                tx.execute(
                    "INSERT INTO batches (batch_id, run_id, aggregation_node_id, attempt, status, trigger_type, created_at) \
                     VALUES (?1, ?2, ?3, 0, 'draft', ?4, ?5)",
                    rusqlite::params![batch_id, run_id, aggregation_node_id, trigger_type, timefmt::encode(created_at)],
                )
                .map_err(StoreError::from)?;
                Ok(())
            }
        })?;
        Ok(Batch {
            batch_id,
            run_id: run_id.clone(),
            aggregation_node_id: aggregation_node_id.clone(),
            attempt: 0,
            status: BatchStatus::Draft,
            trigger_type,
            created_at,
        })
    }

    /// Updates a batch's lifecycle status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the batch does not exist.
    pub fn update_batch_status(&self, batch_id: &BatchId, status: BatchStatus) -> Result<(), StoreError> {
        let batch_id_str = batch_id.as_str().to_owned();
        writer::call(&self.writer, move |tx| {
            let status_str = codec::batch_status_str(status);
            let changed = tx
                .execute("UPDATE batches SET status = ?2 WHERE batch_id = ?1", rusqlite::params![batch_id_str, status_str])
                .map_err(StoreError::from)?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("batch '{batch_id_str}'")));
            }
            Ok(())
        })
    }

    /// Re-registers a batch under a new attempt number after crash recovery
    /// reconstructs it as `failed` (§4.12).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the batch does not exist.
    pub fn increment_batch_attempt(&self, batch_id: &BatchId) -> Result<(), StoreError> {
        let batch_id_str = batch_id.as_str().to_owned();
        writer::call(&self.writer, move |tx| {
            let changed = tx
                .execute("UPDATE batches SET attempt = attempt + 1, status = 'assembling' WHERE batch_id = ?1", [&batch_id_str])
                .map_err(StoreError::from)?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("batch '{batch_id_str}'")));
            }
            Ok(())
        })
    }

    /// Adds a token as a member of a batch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn add_batch_member(&self, batch_id: &BatchId, token_id: &TokenId, ordinal: u32) -> Result<BatchMember, StoreError> {
        writer::call(&self.writer, {
            let batch_id = batch_id.as_str().to_owned();
            let token_id = token_id.as_str().to_owned();
            move |tx| {
                tx.execute(
                    "INSERT INTO batch_members (batch_id, token_id, ordinal) VALUES (?1, ?2, ?3)",
                    rusqlite::params![batch_id, token_id, ordinal],
                )
                .map_err(StoreError::from)?;
                Ok(())
            }
        })?;
        Ok(BatchMember { batch_id: batch_id.clone(), token_id: token_id.clone(), ordinal })
    }

    /// Records a token produced by processing a batch, along with every
    /// member token consumed to produce it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn add_batch_output(&self, batch_id: &BatchId, token_id: &TokenId, parent_token_ids: Vec<TokenId>) -> Result<BatchOutput, StoreError> {
        writer::call(&self.writer, {
            let batch_id = batch_id.as_str().to_owned();
            let token_id = token_id.as_str().to_owned();
            let parents: Vec<String> = parent_token_ids.iter().map(|id| id.as_str().to_owned()).collect();
            move |tx| {
                for parent in parents {
                    tx.execute(
                        "INSERT INTO batch_outputs (batch_id, token_id, parent_token_id) VALUES (?1, ?2, ?3)",
                        rusqlite::params![batch_id, token_id, parent],
                    )
                    .map_err(StoreError::from)?;
                }
                Ok(())
            }
        })?;
        Ok(BatchOutput { batch_id: batch_id.clone(), token_id: token_id.clone(), parent_token_ids })
    }

    /// Reads a batch by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if it does not exist.
    pub fn get_batch(&self, batch_id: &BatchId) -> Result<Batch, StoreError> {
        let batch_id_str = batch_id.as_str().to_owned();
        self.read_pool.with_connection(move |conn| {
            conn.query_row("SELECT * FROM batches WHERE batch_id = ?1", [&batch_id_str], |row| {
                Ok((
                    row.get::<_, String>("batch_id")?,
                    row.get::<_, String>("run_id")?,
                    row.get::<_, String>("aggregation_node_id")?,
                    row.get::<_, i64>("attempt")?,
                    row.get::<_, String>("status")?,
                    row.get::<_, String>("trigger_type")?,
                    row.get::<_, String>("created_at")?,
                ))
            })
            .optional()
            .map_err(StoreError::from)?
            .ok_or_else(|| StoreError::NotFound(format!("batch '{batch_id_str}'")))
            .and_then(|(batch_id, run_id, aggregation_node_id, attempt, status, trigger_type, created_at)| {
                Ok(Batch {
                    batch_id: BatchId::new(batch_id),
                    run_id: RunId::new(run_id),
                    aggregation_node_id: NodeId::new(aggregation_node_id),
                    #[allow(clippy::cast_sign_loss, reason = "attempt is always written as a non-negative value")]
                    attempt: attempt as u32,
                    status: codec::parse_batch_status(&status)?,
                    trigger_type,
                    created_at: timefmt::decode(&created_at)?,
                })
            })
        })
    }

    /// Lists the member tokens of a batch, in ordinal order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn list_batch_members(&self, batch_id: &BatchId) -> Result<Vec<BatchMember>, StoreError> {
        let batch_id_str = batch_id.as_str().to_owned();
        self.read_pool.with_connection(move |conn| {
            let mut stmt = conn
                .prepare("SELECT batch_id, token_id, ordinal FROM batch_members WHERE batch_id = ?1 ORDER BY ordinal ASC")
                .map_err(StoreError::from)?;
            let rows = stmt
                .query_map([&batch_id_str], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, u32>(2)?)))
                .map_err(StoreError::from)?;
            let mut members = Vec::new();
            for row in rows {
                let (batch_id, token_id, ordinal) = row.map_err(StoreError::from)?;
                members.push(BatchMember { batch_id: BatchId::new(batch_id), token_id: TokenId::new(token_id), ordinal });
            }
            Ok(members)
        })
    }

    /// Lists every batch for `run_id` currently in `executing` status, used
    /// by the recovery manager to reconstruct in-flight aggregation work on
    /// resume (§4.12).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn list_executing_batches(&self, run_id: &RunId) -> Result<Vec<Batch>, StoreError> {
        let run_id_str = run_id.as_str().to_owned();
        self.read_pool.with_connection(move |conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM batches WHERE run_id = ?1 AND status = 'executing'")
                .map_err(StoreError::from)?;
            let rows = stmt
                .query_map([&run_id_str], |row| {
                    Ok((
                        row.get::<_, String>("batch_id")?,
                        row.get::<_, String>("run_id")?,
                        row.get::<_, String>("aggregation_node_id")?,
                        row.get::<_, i64>("attempt")?,
                        row.get::<_, String>("status")?,
                        row.get::<_, String>("trigger_type")?,
                        row.get::<_, String>("created_at")?,
                    ))
                })
                .map_err(StoreError::from)?;
            let mut batches = Vec::new();
            for row in rows {
                let (batch_id, run_id, aggregation_node_id, attempt, status, trigger_type, created_at) = row.map_err(StoreError::from)?;
                batches.push(Batch {
                    batch_id: BatchId::new(batch_id),
                    run_id: RunId::new(run_id),
                    aggregation_node_id: NodeId::new(aggregation_node_id),
                    #[allow(clippy::cast_sign_loss, reason = "attempt is always written as a non-negative value")]
                    attempt: attempt as u32,
                    status: codec::parse_batch_status(&status)?,
                    trigger_type,
                    created_at: timefmt::decode(&created_at)?,
                });
            }
            Ok(batches)
        })
    }
}
