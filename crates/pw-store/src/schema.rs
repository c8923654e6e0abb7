// crates/pw-store/src/schema.rs
// ============================================================================
// Module: Landscape Schema
// Description: `CREATE TABLE` DDL for the 13+1 Landscape tables (§3, §6):
// runs, nodes, edges, rows, tokens, token_parents, node_states,
// routing_events, calls, batches, batch_members, batch_outputs, artifacts,
// checkpoints.
// Purpose: One place that defines every column and constraint the recorder
// writes against, so a schema change is reviewable as a single diff.
// Dependencies: rusqlite
// ============================================================================

//! ## Overview
//! Every table stores its own `run_id` even where a join could derive it
//! (e.g. `tokens.run_id` could be reached through `rows`), so every query
//! that scopes to one run does so with a plain equality predicate rather
//! than a join. JSON-bearing columns hold canonical JSON text; the recorder
//! layer is the only code that ever writes to them, and it never accepts a
//! value that hasn't already passed through `pw_core::core::canonical`.
//!
//! `token_parents` is the many-to-many side table §9 calls for: fork,
//! expand, and coalesce all populate it (one row per parent-child edge),
//! so lineage traversal never needs a `Token.parent_token_id` back-pointer
//! walk to reconstruct a coalesce's multiple parents.

/// The current schema version. Bumped whenever `CREATE_TABLES` changes in a
/// way that is not purely additive.
pub const SCHEMA_VERSION: i64 = 1;

/// The full DDL, executed once via `execute_batch` against a fresh or
/// existing database (every statement is `IF NOT EXISTS`, so re-running it
/// against an already-initialized database is a no-op).
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS store_meta (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    config_hash TEXT NOT NULL,
    canonical_version TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    reproducibility_grade TEXT,
    source_schema_json TEXT,
    source_field_resolution TEXT
);

CREATE TABLE IF NOT EXISTS nodes (
    node_id TEXT NOT NULL,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    plugin_name TEXT NOT NULL,
    node_type TEXT NOT NULL,
    plugin_version TEXT NOT NULL,
    determinism TEXT NOT NULL,
    config_hash TEXT NOT NULL,
    config_json TEXT NOT NULL,
    schema_mode TEXT NOT NULL,
    schema_fields TEXT,
    registered_at TEXT NOT NULL,
    PRIMARY KEY (node_id, run_id)
);

CREATE TABLE IF NOT EXISTS edges (
    edge_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    from_node_id TEXT NOT NULL,
    to_node_id TEXT NOT NULL,
    label TEXT NOT NULL,
    default_mode TEXT NOT NULL,
    UNIQUE (run_id, from_node_id, to_node_id, label)
);

CREATE TABLE IF NOT EXISTS rows (
    row_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    source_node_id TEXT NOT NULL,
    row_index INTEGER NOT NULL,
    source_data_hash TEXT NOT NULL,
    source_data_ref TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tokens (
    token_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    row_id TEXT NOT NULL REFERENCES rows(row_id),
    parent_token_id TEXT,
    fork_group_id TEXT,
    expand_group_id TEXT,
    join_group_id TEXT,
    branch_name TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS token_parents (
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    child_token_id TEXT NOT NULL REFERENCES tokens(token_id),
    parent_token_id TEXT NOT NULL REFERENCES tokens(token_id),
    PRIMARY KEY (child_token_id, parent_token_id)
);

CREATE TABLE IF NOT EXISTS node_states (
    state_id TEXT PRIMARY KEY,
    token_id TEXT NOT NULL REFERENCES tokens(token_id),
    node_id TEXT NOT NULL,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    step_index INTEGER NOT NULL,
    attempt INTEGER NOT NULL,
    status TEXT NOT NULL,
    input_hash TEXT NOT NULL,
    output_hash TEXT,
    context_before TEXT,
    context_after TEXT,
    duration_ms REAL,
    error_json TEXT,
    success_reason_json TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    FOREIGN KEY (node_id, run_id) REFERENCES nodes(node_id, run_id)
);

CREATE TABLE IF NOT EXISTS routing_events (
    event_id TEXT PRIMARY KEY,
    state_id TEXT NOT NULL REFERENCES node_states(state_id),
    edge_id TEXT NOT NULL REFERENCES edges(edge_id),
    routing_group_id TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    mode TEXT NOT NULL,
    reason_hash TEXT,
    reason_ref TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS calls (
    state_id TEXT NOT NULL REFERENCES node_states(state_id),
    call_index INTEGER NOT NULL,
    call_type TEXT NOT NULL,
    status TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    response_hash TEXT,
    error_json TEXT,
    latency_ms REAL NOT NULL,
    retryable INTEGER NOT NULL,
    PRIMARY KEY (state_id, call_index)
);

CREATE TABLE IF NOT EXISTS batches (
    batch_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    aggregation_node_id TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    status TEXT NOT NULL,
    trigger_type TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS batch_members (
    batch_id TEXT NOT NULL REFERENCES batches(batch_id),
    token_id TEXT NOT NULL REFERENCES tokens(token_id),
    ordinal INTEGER NOT NULL,
    PRIMARY KEY (batch_id, token_id)
);

CREATE TABLE IF NOT EXISTS batch_outputs (
    batch_id TEXT NOT NULL REFERENCES batches(batch_id),
    token_id TEXT NOT NULL REFERENCES tokens(token_id),
    parent_token_id TEXT NOT NULL REFERENCES tokens(token_id),
    PRIMARY KEY (batch_id, token_id, parent_token_id)
);

CREATE TABLE IF NOT EXISTS token_outcomes (
    outcome_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    token_id TEXT NOT NULL REFERENCES tokens(token_id),
    outcome TEXT NOT NULL,
    is_terminal INTEGER NOT NULL,
    sink_name TEXT,
    batch_id TEXT,
    context_json TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS token_outcomes_terminal_unique
    ON token_outcomes(token_id)
    WHERE is_terminal = 1;

CREATE TABLE IF NOT EXISTS artifacts (
    artifact_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    state_id TEXT NOT NULL REFERENCES node_states(state_id),
    sink_node_id TEXT NOT NULL,
    artifact_type TEXT NOT NULL,
    path_or_uri TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    idempotency_key TEXT,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS artifacts_idempotency_unique
    ON artifacts(run_id, sink_node_id, idempotency_key)
    WHERE idempotency_key IS NOT NULL;

CREATE TABLE IF NOT EXISTS checkpoints (
    checkpoint_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    token_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    sequence_number INTEGER NOT NULL,
    upstream_topology_hash TEXT NOT NULL,
    checkpoint_node_config_hash TEXT NOT NULL,
    aggregation_state_json TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS checkpoints_by_node
    ON checkpoints(run_id, node_id, sequence_number);
"#;

/// Opens a connection with the pragmas the Landscape store requires (WAL
/// journaling for concurrent readers, foreign keys enforced), then applies
/// [`CREATE_TABLES`] and records [`SCHEMA_VERSION`] if this is a fresh
/// database.
///
/// # Errors
///
/// Returns [`rusqlite::Error`] if any pragma or statement fails.
pub fn initialize(conn: &mut rusqlite::Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5_000)?;
    let tx = conn.transaction()?;
    tx.execute_batch(CREATE_TABLES)?;
    let has_version: bool =
        tx.query_row("SELECT EXISTS (SELECT 1 FROM store_meta)", [], |row| row.get(0))?;
    if !has_version {
        tx.execute("INSERT INTO store_meta (version) VALUES (?1)", [SCHEMA_VERSION])?;
    }
    tx.commit()
}
