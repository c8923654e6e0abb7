// crates/pw-store/src/store/runs.rs
// ============================================================================
// Module: Runs
// Description: `begin_run`, `finalize_run`, `get_run` (§4.3, §4.12).
// Dependencies: rusqlite, time, serde_json, pw-core
// ============================================================================

use pw_core::core::identifiers::RunId;
use pw_core::core::model::ReproducibilityGrade;
use pw_core::core::model::Run;
use pw_core::core::model::RunStatus;
use rusqlite::OptionalExtension as _;
use rusqlite::Row;
use rusqlite::Transaction;
use serde_json::Value;
use time::OffsetDateTime;

use crate::SqliteLandscape;
use crate::StoreError;
use crate::codec;
use crate::ids;
use crate::timefmt;
use crate::writer;

#[allow(clippy::type_complexity, reason = "A row-shaped tuple mirroring the runs table's columns.")]
type RunFields = (String, String, String, String, String, Option<String>, Option<String>, Option<String>, Option<String>);

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunFields> {
    Ok((
        row.get("run_id")?,
        row.get("config_hash")?,
        row.get("canonical_version")?,
        row.get("status")?,
        row.get("started_at")?,
        row.get("completed_at")?,
        row.get("reproducibility_grade")?,
        row.get("source_schema_json")?,
        row.get("source_field_resolution")?,
    ))
}

fn decode_run(fields: RunFields) -> Result<Run, StoreError> {
    let (run_id, config_hash, canonical_version, status, started_at, completed_at, grade, schema_json, field_resolution) = fields;
    Ok(Run {
        run_id: RunId::new(run_id),
        config_hash,
        canonical_version,
        status: codec::parse_run_status(&status)?,
        started_at: timefmt::decode(&started_at)?,
        completed_at: timefmt::decode_opt(completed_at)?,
        reproducibility_grade: grade.as_deref().map(codec::parse_reproducibility_grade).transpose()?,
        source_schema_json: schema_json
            .map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(|err| StoreError::Decode(err.to_string()))?,
        source_field_resolution: field_resolution
            .map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(|err| StoreError::Decode(err.to_string()))?,
    })
}

impl SqliteLandscape {
    /// Inserts a new run in `running` status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn begin_run(&self, config_hash: String, canonical_version: String) -> Result<Run, StoreError> {
        let run_id = ids::fresh("run");
        let started_at = self.clock_now();
        writer::call(&self.writer, {
            let run_id = run_id.clone();
            let config_hash = config_hash.clone();
            let canonical_version = canonical_version.clone();
            move |tx| {
                tx.execute(
                    "INSERT INTO runs (run_id, config_hash, canonical_version, status, started_at) \
                     VALUES (?1, ?2, ?3, 'running', ?4)",
                    rusqlite::params![run_id, config_hash, canonical_version, timefmt::encode(started_at)],
                )
                .map_err(StoreError::from)?;
                Ok(())
            }
        })?;
        Ok(Run {
            run_id: RunId::new(run_id),
            config_hash,
            canonical_version,
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            reproducibility_grade: None,
            source_schema_json: None,
            source_field_resolution: None,
        })
    }

    /// Records the source node's resolved schema and field-resolution
    /// mapping for a run, used by the recovery manager to remap raw source
    /// headers on resume.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn record_source_schema(&self, run_id: &RunId, schema_json: Value, field_resolution: Value) -> Result<(), StoreError> {
        let run_id = run_id.as_str().to_owned();
        writer::call(&self.writer, move |tx| {
            tx.execute(
                "UPDATE runs SET source_schema_json = ?2, source_field_resolution = ?3 WHERE run_id = ?1",
                rusqlite::params![run_id, schema_json.to_string(), field_resolution.to_string()],
            )
            .map_err(StoreError::from)?;
            Ok(())
        })
    }

    /// Finalizes a run: computes its reproducibility grade from the
    /// determinism of every node touched, writes the completion timestamp,
    /// and marks the run immutable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the run does not exist, or
    /// [`StoreError::Invariant`] if it is already finalized.
    pub fn finalize_run(&self, run_id: &RunId, status: RunStatus) -> Result<Run, StoreError> {
        let run_id_str = run_id.as_str().to_owned();
        let completed_at = self.clock_now();
        let status_str = codec::run_status_str(status);
        writer::call(&self.writer, {
            let run_id_str = run_id_str.clone();
            move |tx| {
                let current_status: String = tx
                    .query_row("SELECT status FROM runs WHERE run_id = ?1", [&run_id_str], |row| row.get(0))
                    .optional()
                    .map_err(StoreError::from)?
                    .ok_or_else(|| StoreError::NotFound(format!("run '{run_id_str}'")))?;
                if current_status != "running" {
                    return Err(StoreError::Invariant(format!("run '{run_id_str}' already finalized")));
                }
                let grade = if status == RunStatus::Completed {
                    Some(compute_reproducibility_grade(tx, &run_id_str)?)
                } else {
                    None
                };
                tx.execute(
                    "UPDATE runs SET status = ?2, completed_at = ?3, reproducibility_grade = ?4 WHERE run_id = ?1",
                    rusqlite::params![run_id_str, status_str, timefmt::encode(completed_at), grade.map(codec::reproducibility_grade_str)],
                )
                .map_err(StoreError::from)?;
                Ok(())
            }
        })?;
        self.get_run(run_id)
    }

    /// Downgrades a finalized run's reproducibility grade, used by purge
    /// (§6): a `replay_reproducible` run whose replay payloads are deleted
    /// becomes `attributable_only`; `full_reproducible` runs are untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn downgrade_to_attributable_only(&self, run_id: &RunId) -> Result<(), StoreError> {
        let run_id_str = run_id.as_str().to_owned();
        writer::call(&self.writer, move |tx| {
            tx.execute(
                "UPDATE runs SET reproducibility_grade = 'attributable_only' \
                 WHERE run_id = ?1 AND reproducibility_grade = 'replay_reproducible'",
                [&run_id_str],
            )
            .map_err(StoreError::from)?;
            Ok(())
        })
    }

    /// Reads a run by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if it does not exist.
    pub fn get_run(&self, run_id: &RunId) -> Result<Run, StoreError> {
        let run_id_str = run_id.as_str().to_owned();
        self.read_pool.with_connection(move |conn| {
            let fields = conn
                .query_row("SELECT * FROM runs WHERE run_id = ?1", [&run_id_str], run_from_row)
                .optional()
                .map_err(StoreError::from)?
                .ok_or_else(|| StoreError::NotFound(format!("run '{run_id_str}'")))?;
            decode_run(fields)
        })
    }

    /// Lists every run finalized at or before `cutoff`, used by purge (§6)
    /// to find candidate runs for reproducibility downgrade.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn list_runs_completed_before(&self, cutoff: OffsetDateTime) -> Result<Vec<Run>, StoreError> {
        let cutoff_str = timefmt::encode(cutoff);
        self.read_pool.with_connection(move |conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM runs WHERE completed_at IS NOT NULL AND completed_at <= ?1")
                .map_err(StoreError::from)?;
            let rows = stmt.query_map([&cutoff_str], run_from_row).map_err(StoreError::from)?;
            let mut runs = Vec::new();
            for row in rows {
                runs.push(decode_run(row.map_err(StoreError::from)?)?);
            }
            Ok(runs)
        })
    }

    /// Returns the current wall-clock time. A dedicated method so every
    /// other operation file shares one seam for "now".
    pub(crate) fn clock_now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Computes the reproducibility grade for a run by scanning the
/// `determinism` of every node visited (i.e. every node with at least one
/// `node_states` row) in this run.
///
/// Grading rule (§4.12, §9): `full_reproducible` if every visited node is
/// `deterministic` or `seeded`; `replay_reproducible` if every
/// non-deterministic node's output was captured (every such node state has
/// an `output_hash`); otherwise `attributable_only`.
fn compute_reproducibility_grade(tx: &Transaction<'_>, run_id: &str) -> Result<ReproducibilityGrade, StoreError> {
    let mut stmt = tx
        .prepare(
            "SELECT DISTINCT n.determinism FROM nodes n \
             JOIN node_states s ON s.node_id = n.node_id AND s.run_id = n.run_id \
             WHERE n.run_id = ?1",
        )
        .map_err(StoreError::from)?;
    let determinisms: Vec<String> = stmt
        .query_map([run_id], |row| row.get(0))
        .map_err(StoreError::from)?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(StoreError::from)?;

    let mut has_non_deterministic = false;
    for text in &determinisms {
        let determinism = codec::parse_determinism(text)?;
        if !matches!(
            determinism,
            pw_core::core::model::Determinism::Deterministic | pw_core::core::model::Determinism::Seeded
        ) {
            has_non_deterministic = true;
        }
    }
    if !has_non_deterministic {
        return Ok(ReproducibilityGrade::FullReproducible);
    }

    let uncaptured: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM node_states s \
             JOIN nodes n ON n.node_id = s.node_id AND n.run_id = s.run_id \
             WHERE s.run_id = ?1 AND n.determinism IN ('io_read', 'io_write', 'external_call', 'non_deterministic') \
             AND s.output_hash IS NULL",
            [run_id],
            |row| row.get(0),
        )
        .map_err(StoreError::from)?;

    if uncaptured == 0 {
        Ok(ReproducibilityGrade::ReplayReproducible)
    } else {
        Ok(ReproducibilityGrade::AttributableOnly)
    }
}
