// crates/pw-orchestrator/src/token.rs
// ============================================================================
// Module: Token Manager
// Description: The fork/expand/coalesce business logic that turns a Landscape
// row into a lineage of tokens, and keeps each live token's current row data
// in memory between node visits (§4.7).
// Purpose: `pw-store::SqliteLandscape::create_token` only persists lineage;
// deciding when a row forks into branches, expands into several children, or
// several parents coalesce into one is orchestration logic that belongs next
// to the engine, not inside the audit store.
// Dependencies: pw-core, pw-store
// Grounding: examples/original_source distills token lineage into three
// operations (branch, expand, merge) that `pw-store::store::lineage`'s
// `NewToken`/`create_token`/`token_parents` were already shaped to support;
// this module is the first caller of that primitive and has no direct
// Python counterpart (the original represents lineage implicitly via nested
// row dictionaries rather than an explicit token graph).
// ============================================================================

//! ## Overview
//! [`TokenManager::create_initial_token`] mints the first token for a row
//! read from a source. [`TokenManager::fork_token`] and
//! [`TokenManager::expand_token`] each produce one child from one parent,
//! tagged with a caller-supplied group id shared by every sibling from the
//! same fork or expansion. [`TokenManager::coalesce_tokens`] merges several
//! parents into one child. Every live token's current row payload is cached
//! in [`TokenManager`]'s `current_data` map, read with
//! [`TokenManager::row_data`] and dropped with
//! [`TokenManager::drop_row_data`] once a token reaches a terminal outcome.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::PoisonError;

use pw_core::core::error::EngineError;
use pw_core::core::identifiers::ExpandGroupId;
use pw_core::core::identifiers::ForkGroupId;
use pw_core::core::identifiers::JoinGroupId;
use pw_core::core::identifiers::RowId;
use pw_core::core::identifiers::RunId;
use pw_core::core::identifiers::TokenId;
use pw_core::core::model::Token;
use pw_store::NewToken;
use pw_store::SqliteLandscape;
use pw_store::StoreError;
use serde_json::Value;

use crate::ids;

/// Failures raised while managing token lineage.
#[derive(Debug, thiserror::Error)]
pub enum TokenManagerError {
    /// The underlying Landscape write or read failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A coalesce was attempted with no parent tokens.
    #[error("coalesce requires at least one parent token")]
    EmptyCoalesce,
}

impl From<TokenManagerError> for EngineError {
    fn from(err: TokenManagerError) -> Self {
        match err {
            TokenManagerError::Store(store_err) => store_err.into(),
            TokenManagerError::EmptyCoalesce => {
                Self::OrchestrationInvariant("coalesce requires at least one parent token".to_owned())
            }
        }
    }
}

/// Manages token lineage (fork/expand/coalesce) and the in-memory row data
/// each live token carries between node visits.
pub struct TokenManager<'a> {
    /// The Landscape store lineage is persisted to.
    store: &'a SqliteLandscape,
    /// Current row payload for every live token, keyed by token id.
    current_data: Mutex<HashMap<TokenId, Value>>,
}

impl<'a> TokenManager<'a> {
    /// Builds a token manager over `store`, with no cached row data.
    #[must_use]
    pub fn new(store: &'a SqliteLandscape) -> Self {
        Self { store, current_data: Mutex::new(HashMap::new()) }
    }

    /// Generates a fresh fork-group id, shared across every branch produced
    /// by one fork.
    #[must_use]
    pub fn new_fork_group(&self) -> ForkGroupId {
        ForkGroupId::new(ids::fresh("fgrp"))
    }

    /// Generates a fresh expand-group id, shared across every child
    /// produced by one expansion.
    #[must_use]
    pub fn new_expand_group(&self) -> ExpandGroupId {
        ExpandGroupId::new(ids::fresh("xgrp"))
    }

    /// Generates a fresh join-group id, shared by every parent merged into
    /// one coalesce.
    #[must_use]
    pub fn new_join_group(&self) -> JoinGroupId {
        JoinGroupId::new(ids::fresh("jgrp"))
    }

    /// Creates the initial token for a row read from a source, caching its
    /// row data.
    ///
    /// # Errors
    ///
    /// Returns [`TokenManagerError`] if the write fails.
    pub fn create_initial_token(&self, run_id: &RunId, row_id: RowId, data: Value) -> Result<Token, TokenManagerError> {
        let token = self.store.create_token(
            run_id,
            NewToken { row_id, parents: Vec::new(), fork_group_id: None, expand_group_id: None, join_group_id: None, branch_name: None },
        )?;
        self.cache(&token.token_id, data);
        Ok(token)
    }

    /// Produces one child token on branch `branch_name`, forked from
    /// `parent`, tagged with `fork_group_id` (shared with its siblings on
    /// other branches).
    ///
    /// # Errors
    ///
    /// Returns [`TokenManagerError`] if the write fails.
    pub fn fork_token(
        &self,
        run_id: &RunId,
        parent: &Token,
        fork_group_id: ForkGroupId,
        branch_name: String,
        data: Value,
    ) -> Result<Token, TokenManagerError> {
        let token = self.store.create_token(
            run_id,
            NewToken {
                row_id: parent.row_id.clone(),
                parents: vec![parent.token_id.clone()],
                fork_group_id: Some(fork_group_id),
                expand_group_id: None,
                join_group_id: None,
                branch_name: Some(branch_name),
            },
        )?;
        self.cache(&token.token_id, data);
        Ok(token)
    }

    /// Produces one child token from a deaggregating transform's output,
    /// tagged with `expand_group_id` (shared with its siblings from the
    /// same expansion).
    ///
    /// # Errors
    ///
    /// Returns [`TokenManagerError`] if the write fails.
    pub fn expand_token(
        &self,
        run_id: &RunId,
        parent: &Token,
        expand_group_id: ExpandGroupId,
        data: Value,
    ) -> Result<Token, TokenManagerError> {
        let token = self.store.create_token(
            run_id,
            NewToken {
                row_id: parent.row_id.clone(),
                parents: vec![parent.token_id.clone()],
                fork_group_id: None,
                expand_group_id: Some(expand_group_id),
                join_group_id: None,
                branch_name: parent.branch_name.clone(),
            },
        )?;
        self.cache(&token.token_id, data);
        Ok(token)
    }

    /// Merges `parents` into one child token, tagged with `join_group_id`.
    /// The child's row lineage follows the first parent listed.
    ///
    /// # Errors
    ///
    /// Returns [`TokenManagerError::EmptyCoalesce`] if `parents` is empty,
    /// or a store error if the write fails.
    pub fn coalesce_tokens(
        &self,
        run_id: &RunId,
        parents: &[Token],
        join_group_id: JoinGroupId,
        data: Value,
    ) -> Result<Token, TokenManagerError> {
        let Some(first) = parents.first() else {
            return Err(TokenManagerError::EmptyCoalesce);
        };
        let token = self.store.create_token(
            run_id,
            NewToken {
                row_id: first.row_id.clone(),
                parents: parents.iter().map(|token| token.token_id.clone()).collect(),
                fork_group_id: None,
                expand_group_id: None,
                join_group_id: Some(join_group_id),
                branch_name: None,
            },
        )?;
        for parent in parents {
            self.drop_row_data(&parent.token_id);
        }
        self.cache(&token.token_id, data);
        Ok(token)
    }

    /// Returns every parent recorded for `token_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenManagerError`] if the read fails.
    pub fn parents_of(&self, token_id: &TokenId) -> Result<Vec<TokenId>, TokenManagerError> {
        Ok(self.store.token_parents(token_id)?)
    }

    /// Returns a token's currently cached row data, if still live.
    #[must_use]
    pub fn row_data(&self, token_id: &TokenId) -> Option<Value> {
        self.current_data.lock().unwrap_or_else(PoisonError::into_inner).get(token_id).cloned()
    }

    /// Replaces a token's cached row data (a transform's output becomes the
    /// next node visit's input).
    pub fn update_row_data(&self, token_id: TokenId, data: Value) {
        self.cache(&token_id, data);
    }

    /// Drops a token's cached row data once it reaches a terminal outcome.
    pub fn drop_row_data(&self, token_id: &TokenId) {
        self.current_data.lock().unwrap_or_else(PoisonError::into_inner).remove(token_id);
    }

    /// Inserts or replaces a token's cached row data.
    fn cache(&self, token_id: &TokenId, data: Value) {
        self.current_data.lock().unwrap_or_else(PoisonError::into_inner).insert(token_id.clone(), data);
    }
}

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

    use pw_core::core::identifiers::NodeId;
    use serde_json::json;

    use super::TokenManager;
    use super::TokenManagerError;

    fn store() -> pw_store::SqliteLandscape {
        pw_store::SqliteLandscape::open_in_memory().expect("opens")
    }

    #[test]
    fn initial_token_caches_its_row_data() {
        let store = store();
        let run = store.begin_run("cfg-hash".to_owned(), "v1".to_owned()).expect("begins run");
        let row = store.create_row(&run.run_id, &NodeId::new("source"), 0, "row-hash".to_owned(), None).expect("creates row");
        let manager = TokenManager::new(&store);

        let token = manager.create_initial_token(&run.run_id, row.row_id, json!({"a": 1})).expect("creates token");
        assert!(token.parent_token_id.is_none());
        assert_eq!(manager.row_data(&token.token_id), Some(json!({"a": 1})));
    }

    #[test]
    fn fork_produces_children_sharing_one_group_id() {
        let store = store();
        let run = store.begin_run("cfg-hash".to_owned(), "v1".to_owned()).expect("begins run");
        let row = store.create_row(&run.run_id, &NodeId::new("source"), 0, "row-hash".to_owned(), None).expect("creates row");
        let manager = TokenManager::new(&store);
        let parent = manager.create_initial_token(&run.run_id, row.row_id, json!({})).expect("creates token");

        let group = manager.new_fork_group();
        let left = manager.fork_token(&run.run_id, &parent, group.clone(), "left".to_owned(), json!({"branch": "left"})).expect("forks");
        let right = manager.fork_token(&run.run_id, &parent, group.clone(), "right".to_owned(), json!({"branch": "right"})).expect("forks");

        assert_eq!(left.fork_group_id, Some(group.clone()));
        assert_eq!(right.fork_group_id, Some(group));
        assert_eq!(left.parent_token_id, Some(parent.token_id.clone()));
        assert_eq!(right.parent_token_id, Some(parent.token_id));
    }

    #[test]
    fn coalesce_records_every_parent_in_token_parents() {
        let store = store();
        let run = store.begin_run("cfg-hash".to_owned(), "v1".to_owned()).expect("begins run");
        let row = store.create_row(&run.run_id, &NodeId::new("source"), 0, "row-hash".to_owned(), None).expect("creates row");
        let manager = TokenManager::new(&store);
        let parent = manager.create_initial_token(&run.run_id, row.row_id, json!({})).expect("creates token");

        let fork_group = manager.new_fork_group();
        let left = manager.fork_token(&run.run_id, &parent, fork_group.clone(), "left".to_owned(), json!({})).expect("forks");
        let right = manager.fork_token(&run.run_id, &parent, fork_group, "right".to_owned(), json!({})).expect("forks");

        let join_group = manager.new_join_group();
        let merged = manager
            .coalesce_tokens(&run.run_id, &[left.clone(), right.clone()], join_group.clone(), json!({"merged": true}))
            .expect("coalesces");

        assert_eq!(merged.join_group_id, Some(join_group));
        assert!(merged.parent_token_id.is_none(), "multi-parent tokens have no single parent_token_id");
        let mut parents = manager.parents_of(&merged.token_id).expect("reads parents");
        parents.sort_by(|left, right| left.as_str().cmp(right.as_str()));
        let mut expected = vec![left.token_id, right.token_id];
        expected.sort_by(|left, right| left.as_str().cmp(right.as_str()));
        assert_eq!(parents, expected);
    }

    #[test]
    fn coalesce_with_no_parents_is_rejected() {
        let store = store();
        let run = store.begin_run("cfg-hash".to_owned(), "v1".to_owned()).expect("begins run");
        let manager = TokenManager::new(&store);
        let err = manager.coalesce_tokens(&run.run_id, &[], manager.new_join_group(), json!({})).expect_err("empty coalesce");
        assert!(matches!(err, TokenManagerError::EmptyCoalesce));
    }

    #[test]
    fn dropping_row_data_clears_the_cache() {
        let store = store();
        let run = store.begin_run("cfg-hash".to_owned(), "v1".to_owned()).expect("begins run");
        let row = store.create_row(&run.run_id, &NodeId::new("source"), 0, "row-hash".to_owned(), None).expect("creates row");
        let manager = TokenManager::new(&store);
        let token = manager.create_initial_token(&run.run_id, row.row_id, json!({})).expect("creates token");

        manager.drop_row_data(&token.token_id);
        assert_eq!(manager.row_data(&token.token_id), None);
    }
}
