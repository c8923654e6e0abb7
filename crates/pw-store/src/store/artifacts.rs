// crates/pw-store/src/store/artifacts.rs
// ============================================================================
// Module: Artifacts
// Description: `register_artifact` (§4.3, spec.md "idempotent artifact
// registration"): retrying registration with the same `idempotency_key`
// returns the existing artifact rather than erroring or duplicating.
// Dependencies: rusqlite, pw-core
// ============================================================================

use pw_core::core::identifiers::ArtifactId;
use pw_core::core::identifiers::NodeId;
use pw_core::core::identifiers::RunId;
use pw_core::core::identifiers::StateId;
use pw_core::core::model::Artifact;
use rusqlite::OptionalExtension as _;

use crate::SqliteLandscape;
use crate::StoreError;
use crate::ids;
use crate::timefmt;
use crate::writer;

/// Every field needed to register an artifact, grouped to keep
/// [`SqliteLandscape::register_artifact`] under clippy's argument-count
/// limit.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    /// Node state that produced this artifact.
    pub state_id: StateId,
    /// Sink node that wrote this artifact.
    pub sink_node_id: NodeId,
    /// Sink-defined artifact type (e.g. `"csv_file"`).
    pub artifact_type: String,
    /// Path or URI where the artifact was written.
    pub path_or_uri: String,
    /// SHA-256 hash of the artifact's bytes on disk.
    pub content_hash: String,
    /// Size of the artifact in bytes.
    pub size_bytes: u64,
    /// Idempotency key allowing safe retry without duplicate artifacts.
    pub idempotency_key: Option<String>,
}

impl SqliteLandscape {
    /// Registers an artifact. When `new.idempotency_key` is `Some` and an
    /// artifact with the same `(run_id, sink_node_id, idempotency_key)`
    /// already exists, returns that existing artifact unchanged rather than
    /// inserting a duplicate or erroring — the retry-safety spec.md calls
    /// for.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn register_artifact(&self, run_id: &RunId, new: NewArtifact) -> Result<Artifact, StoreError> {
        if let Some(key) = &new.idempotency_key {
            if let Some(existing) = self.find_artifact_by_idempotency_key(run_id, &new.sink_node_id, key)? {
                return Ok(existing);
            }
        }
        let artifact_id = ArtifactId::new(ids::fresh("artf"));
        let created_at = self.clock_now();
        writer::call(&self.writer, {
            let artifact_id = artifact_id.as_str().to_owned();
            let run_id = run_id.as_str().to_owned();
            let state_id = new.state_id.as_str().to_owned();
            let sink_node_id = new.sink_node_id.as_str().to_owned();
            let artifact_type = new.artifact_type.clone();
            let path_or_uri = new.path_or_uri.clone();
            let content_hash = new.content_hash.clone();
            #[allow(clippy::cast_possible_wrap, reason = "size_bytes fits comfortably within i64 for any artifact this store can track")]
            let size_bytes = new.size_bytes as i64;
            let idempotency_key = new.idempotency_key.clone();
            move |tx| {
                tx.execute(
                    "INSERT INTO artifacts (artifact_id, run_id, state_id, sink_node_id, artifact_type, path_or_uri, \
                     content_hash, size_bytes, idempotency_key, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    rusqlite::params![
                        artifact_id,
                        run_id,
                        state_id,
                        sink_node_id,
                        artifact_type,
                        path_or_uri,
                        content_hash,
                        size_bytes,
                        idempotency_key,
                        timefmt::encode(created_at),
                    ],
                )
                .map_err(StoreError::from)?;
                Ok(())
            }
        })?;
        Ok(Artifact {
            artifact_id,
            run_id: run_id.clone(),
            state_id: new.state_id,
            sink_node_id: new.sink_node_id,
            artifact_type: new.artifact_type,
            path_or_uri: new.path_or_uri,
            content_hash: new.content_hash,
            size_bytes: new.size_bytes,
            idempotency_key: new.idempotency_key,
            created_at,
        })
    }

    fn find_artifact_by_idempotency_key(&self, run_id: &RunId, sink_node_id: &NodeId, key: &str) -> Result<Option<Artifact>, StoreError> {
        let run_id_str = run_id.as_str().to_owned();
        let sink_node_id_str = sink_node_id.as_str().to_owned();
        let key = key.to_owned();
        self.read_pool.with_connection(move |conn| {
            conn.query_row(
                "SELECT * FROM artifacts WHERE run_id = ?1 AND sink_node_id = ?2 AND idempotency_key = ?3",
                rusqlite::params![run_id_str, sink_node_id_str, key],
                |row| {
                    Ok((
                        row.get::<_, String>("artifact_id")?,
                        row.get::<_, String>("run_id")?,
                        row.get::<_, String>("state_id")?,
                        row.get::<_, String>("sink_node_id")?,
                        row.get::<_, String>("artifact_type")?,
                        row.get::<_, String>("path_or_uri")?,
                        row.get::<_, String>("content_hash")?,
                        row.get::<_, i64>("size_bytes")?,
                        row.get::<_, Option<String>>("idempotency_key")?,
                        row.get::<_, String>("created_at")?,
                    ))
                },
            )
            .optional()
            .map_err(StoreError::from)?
            .map(|(artifact_id, run_id, state_id, sink_node_id, artifact_type, path_or_uri, content_hash, size_bytes, idempotency_key, created_at)| {
                Ok(Artifact {
                    artifact_id: ArtifactId::new(artifact_id),
                    run_id: RunId::new(run_id),
                    state_id: StateId::new(state_id),
                    sink_node_id: NodeId::new(sink_node_id),
                    artifact_type,
                    path_or_uri,
                    content_hash,
                    #[allow(clippy::cast_sign_loss, reason = "size_bytes is always written as a non-negative value")]
                    size_bytes: size_bytes as u64,
                    idempotency_key,
                    created_at: timefmt::decode(&created_at)?,
                })
            })
            .transpose()
        })
    }
}
