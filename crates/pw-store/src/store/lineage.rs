// crates/pw-store/src/store/lineage.rs
// ============================================================================
// Module: Row & Token Lineage
// Description: `create_row` and the token-lineage primitive `create_token`
// (§4.3, §4.7, §9's `token_parents` side table).
// Purpose: `pw-store` persists lineage; the branch/expand/coalesce *business
// logic* (which rows go to which branches, how merged data is assembled)
// belongs to `pw_orchestrator::token::TokenManager`, which composes these
// primitives. This keeps the audit store a pure recorder.
// Dependencies: rusqlite, pw-core
// ============================================================================

use pw_core::core::identifiers::ExpandGroupId;
use pw_core::core::identifiers::ForkGroupId;
use pw_core::core::identifiers::JoinGroupId;
use pw_core::core::identifiers::NodeId;
use pw_core::core::identifiers::RowId;
use pw_core::core::identifiers::RunId;
use pw_core::core::identifiers::TokenId;
use pw_core::core::model::Row as AuditRow;
use pw_core::core::model::Token;
use rusqlite::Row;

use crate::SqliteLandscape;
use crate::StoreError;
use crate::ids;
use crate::timefmt;
use crate::writer;

/// Every field needed to create a token, grouped to keep
/// [`SqliteLandscape::create_token`] under clippy's argument-count limit.
#[derive(Debug, Clone)]
pub struct NewToken {
    /// Row this token's lineage originates from.
    pub row_id: RowId,
    /// Parent tokens consumed to produce this token (zero for an initial
    /// token, one for fork/expand, more than one for coalesce).
    pub parents: Vec<TokenId>,
    /// Group shared by every sibling produced by the same fork.
    pub fork_group_id: Option<ForkGroupId>,
    /// Group shared by every sibling produced by the same expansion.
    pub expand_group_id: Option<ExpandGroupId>,
    /// Group shared by every parent merged into this token by a coalesce.
    pub join_group_id: Option<JoinGroupId>,
    /// Name of the fork branch this token is traversing, if any.
    pub branch_name: Option<String>,
}

fn row_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, i64, String, Option<String>, String)> {
    Ok((
        row.get("row_id")?,
        row.get("run_id")?,
        row.get("source_node_id")?,
        row.get("row_index")?,
        row.get("source_data_hash")?,
        row.get("source_data_ref")?,
        row.get("created_at")?,
    ))
}

impl SqliteLandscape {
    /// Records a row read from a source node.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn create_row(
        &self,
        run_id: &RunId,
        source_node_id: &NodeId,
        row_index: u64,
        source_data_hash: String,
        source_data_ref: Option<String>,
    ) -> Result<AuditRow, StoreError> {
        let row_id = RowId::new(ids::fresh("row"));
        let created_at = self.clock_now();
        writer::call(&self.writer, {
            let row_id = row_id.as_str().to_owned();
            let run_id = run_id.as_str().to_owned();
            let source_node_id = source_node_id.as_str().to_owned();
            let source_data_hash = source_data_hash.clone();
            let source_data_ref = source_data_ref.clone();
            #[allow(clippy::cast_possible_wrap, reason = "row_index fits comfortably within i64 for any run this store can hold")]
            let row_index_i64 = row_index as i64;
            move |tx| {
                tx.execute(
                    "INSERT INTO rows (row_id, run_id, source_node_id, row_index, source_data_hash, source_data_ref, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![row_id, run_id, source_node_id, row_index_i64, source_data_hash, source_data_ref, timefmt::encode(created_at)],
                )
                .map_err(StoreError::from)?;
                Ok(())
            }
        })?;
        Ok(AuditRow {
            row_id,
            run_id: run_id.clone(),
            source_node_id: source_node_id.clone(),
            row_index,
            source_data_hash,
            source_data_ref,
            created_at,
        })
    }

    /// Reads a row by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if it does not exist.
    pub fn get_row(&self, row_id: &RowId) -> Result<AuditRow, StoreError> {
        let row_id_str = row_id.as_str().to_owned();
        self.read_pool.with_connection(move |conn| {
            let fields = conn
                .query_row("SELECT * FROM rows WHERE row_id = ?1", [&row_id_str], row_from_row)
                .map_err(StoreError::from)?;
            let (row_id, run_id, source_node_id, row_index, source_data_hash, source_data_ref, created_at) = fields;
            Ok(AuditRow {
                row_id: RowId::new(row_id),
                run_id: RunId::new(run_id),
                source_node_id: NodeId::new(source_node_id),
                #[allow(clippy::cast_sign_loss, reason = "row_index is always written as a non-negative value")]
                row_index: row_index as u64,
                source_data_hash,
                source_data_ref,
                created_at: timefmt::decode(&created_at)?,
            })
        })
    }

    /// Creates a token and records its parent lineage. `new.parents` is
    /// empty for an initial token, holds one id for a fork/expand child, and
    /// holds every merged parent for a coalesce child — the `token_parents`
    /// side table always holds the full set, independent of what
    /// `Token.parent_token_id` (populated only when there is exactly one
    /// parent) can represent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn create_token(&self, run_id: &RunId, new: NewToken) -> Result<Token, StoreError> {
        let token_id = TokenId::new(ids::fresh("tok"));
        let created_at = self.clock_now();
        let parent_token_id = match new.parents.as_slice() {
            [single] => Some(single.clone()),
            _ => None,
        };
        writer::call(&self.writer, {
            let token_id = token_id.as_str().to_owned();
            let run_id = run_id.as_str().to_owned();
            let row_id = new.row_id.as_str().to_owned();
            let parent_token_id = parent_token_id.as_ref().map(|id| id.as_str().to_owned());
            let fork_group_id = new.fork_group_id.as_ref().map(|id| id.as_str().to_owned());
            let expand_group_id = new.expand_group_id.as_ref().map(|id| id.as_str().to_owned());
            let join_group_id = new.join_group_id.as_ref().map(|id| id.as_str().to_owned());
            let branch_name = new.branch_name.clone();
            let parents: Vec<String> = new.parents.iter().map(|id| id.as_str().to_owned()).collect();
            move |tx| {
                tx.execute(
                    "INSERT INTO tokens (token_id, run_id, row_id, parent_token_id, fork_group_id, expand_group_id, \
                     join_group_id, branch_name, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        token_id,
                        run_id,
                        row_id,
                        parent_token_id,
                        fork_group_id,
                        expand_group_id,
                        join_group_id,
                        branch_name,
                        timefmt::encode(created_at),
                    ],
                )
                .map_err(StoreError::from)?;
                for parent in &parents {
                    tx.execute(
                        "INSERT INTO token_parents (run_id, child_token_id, parent_token_id) VALUES (?1, ?2, ?3)",
                        rusqlite::params![run_id, token_id, parent],
                    )
                    .map_err(StoreError::from)?;
                }
                Ok(())
            }
        })?;
        Ok(Token {
            token_id,
            row_id: new.row_id,
            parent_token_id,
            fork_group_id: new.fork_group_id,
            expand_group_id: new.expand_group_id,
            join_group_id: new.join_group_id,
            branch_name: new.branch_name,
            created_at,
        })
    }

    /// Returns every parent recorded for `token_id` via `token_parents`
    /// (the authoritative source for coalesce's multi-parent lineage).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn token_parents(&self, token_id: &TokenId) -> Result<Vec<TokenId>, StoreError> {
        let token_id_str = token_id.as_str().to_owned();
        self.read_pool.with_connection(move |conn| {
            let mut stmt = conn
                .prepare("SELECT parent_token_id FROM token_parents WHERE child_token_id = ?1")
                .map_err(StoreError::from)?;
            let rows = stmt.query_map([&token_id_str], |row| row.get::<_, String>(0)).map_err(StoreError::from)?;
            let mut parents = Vec::new();
            for row in rows {
                parents.push(TokenId::new(row.map_err(StoreError::from)?));
            }
            Ok(parents)
        })
    }
}
