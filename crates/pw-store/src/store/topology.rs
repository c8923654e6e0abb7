// crates/pw-store/src/store/topology.rs
// ============================================================================
// Module: Topology
// Description: `register_node`, `register_edge`, and the read accessors the
// recovery manager uses to recompute `upstream_topology_hash` (§4.3, §4.11).
// Dependencies: rusqlite, serde_json, pw-core
// ============================================================================

use pw_core::core::identifiers::EdgeId;
use pw_core::core::identifiers::NodeId;
use pw_core::core::identifiers::RunId;
use pw_core::core::model::Determinism;
use pw_core::core::model::Edge;
use pw_core::core::model::EdgeMode;
use pw_core::core::model::Node;
use pw_core::core::model::NodeType;
use pw_core::core::model::SchemaMode;
use rusqlite::Row;
use serde_json::Value;

use crate::SqliteLandscape;
use crate::StoreError;
use crate::codec;
use crate::ids;
use crate::timefmt;
use crate::writer;

/// Every field needed to register a node, grouped to keep
/// [`SqliteLandscape::register_node`] under clippy's argument-count limit.
#[derive(Debug, Clone)]
pub struct NewNode {
    /// Caller-assigned node identifier, unique within the run.
    pub node_id: NodeId,
    /// Name of the plugin implementing this node.
    pub plugin_name: String,
    /// Structural role of this node.
    pub node_type: NodeType,
    /// Version string of the plugin implementation.
    pub plugin_version: String,
    /// Replay-determinism classification.
    pub determinism: Determinism,
    /// SHA-256 hash of this node's canonical configuration.
    pub config_hash: String,
    /// Canonical JSON of this node's configuration.
    pub config_json: Value,
    /// How this node's schema is established.
    pub schema_mode: SchemaMode,
    /// Declared or observed schema fields, if any.
    pub schema_fields: Option<Value>,
}

#[allow(clippy::type_complexity, reason = "A row-shaped tuple mirroring the nodes table's columns.")]
type NodeFields = (String, String, String, String, String, String, String, String, String, Option<String>, String);

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<NodeFields> {
    Ok((
        row.get("node_id")?,
        row.get("run_id")?,
        row.get("plugin_name")?,
        row.get("node_type")?,
        row.get("plugin_version")?,
        row.get("determinism")?,
        row.get("config_hash")?,
        row.get("config_json")?,
        row.get("schema_mode")?,
        row.get("schema_fields")?,
        row.get("registered_at")?,
    ))
}

fn decode_node(fields: NodeFields) -> Result<Node, StoreError> {
    let (node_id, run_id, plugin_name, node_type, plugin_version, determinism, config_hash, config_json, schema_mode, schema_fields, registered_at) =
        fields;
    Ok(Node {
        node_id: NodeId::new(node_id),
        run_id: RunId::new(run_id),
        plugin_name,
        node_type: codec::parse_node_type(&node_type)?,
        plugin_version,
        determinism: codec::parse_determinism(&determinism)?,
        config_hash,
        config_json: serde_json::from_str(&config_json).map_err(|err| StoreError::Decode(err.to_string()))?,
        schema_mode: codec::parse_schema_mode(&schema_mode)?,
        schema_fields: schema_fields.map(|text| serde_json::from_str(&text)).transpose().map_err(|err| StoreError::Decode(err.to_string()))?,
        registered_at: timefmt::decode(&registered_at)?,
    })
}

impl SqliteLandscape {
    /// Registers a node's topology and resolved configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Constraint`] if `node_id` is already registered
    /// in this run.
    pub fn register_node(&self, run_id: &RunId, node: NewNode) -> Result<Node, StoreError> {
        let run_id_owned = run_id.as_str().to_owned();
        let registered_at = self.clock_now();
        let node_id_str = node.node_id.as_str().to_owned();
        let config_json_text = node.config_json.to_string();
        let schema_fields_text = node.schema_fields.as_ref().map(ToString::to_string);
        writer::call(&self.writer, {
            let run_id_owned = run_id_owned.clone();
            let node_id_str = node_id_str.clone();
            let plugin_name = node.plugin_name.clone();
            let node_type_str = codec::node_type_str(node.node_type);
            let plugin_version = node.plugin_version.clone();
            let determinism_str = codec::determinism_str(node.determinism);
            let config_hash = node.config_hash.clone();
            let schema_mode_str = codec::schema_mode_str(node.schema_mode);
            move |tx| {
                tx.execute(
                    "INSERT INTO nodes (node_id, run_id, plugin_name, node_type, plugin_version, determinism, \
                     config_hash, config_json, schema_mode, schema_fields, registered_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        node_id_str,
                        run_id_owned,
                        plugin_name,
                        node_type_str,
                        plugin_version,
                        determinism_str,
                        config_hash,
                        config_json_text,
                        schema_mode_str,
                        schema_fields_text,
                        timefmt::encode(registered_at),
                    ],
                )
                .map_err(StoreError::from)?;
                Ok(())
            }
        })?;
        Ok(Node {
            node_id: node.node_id,
            run_id: run_id.clone(),
            plugin_name: node.plugin_name,
            node_type: node.node_type,
            plugin_version: node.plugin_version,
            determinism: node.determinism,
            config_hash: node.config_hash,
            config_json: node.config_json,
            schema_mode: node.schema_mode,
            schema_fields: node.schema_fields,
            registered_at,
        })
    }

    /// Registers an edge's topology.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Constraint`] if `(from, to, label)` already
    /// exists in this run.
    pub fn register_edge(&self, run_id: &RunId, from_node_id: NodeId, to_node_id: NodeId, label: String, default_mode: EdgeMode) -> Result<Edge, StoreError> {
        let edge_id = EdgeId::new(ids::fresh("edge"));
        writer::call(&self.writer, {
            let edge_id = edge_id.as_str().to_owned();
            let run_id = run_id.as_str().to_owned();
            let from_node_id = from_node_id.as_str().to_owned();
            let to_node_id = to_node_id.as_str().to_owned();
            let label = label.clone();
            let mode_str = codec::edge_mode_str(default_mode);
            move |tx| {
                tx.execute(
                    "INSERT INTO edges (edge_id, run_id, from_node_id, to_node_id, label, default_mode) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![edge_id, run_id, from_node_id, to_node_id, label, mode_str],
                )
                .map_err(StoreError::from)?;
                Ok(())
            }
        })?;
        Ok(Edge { edge_id, run_id: run_id.clone(), from_node_id, to_node_id, label, default_mode })
    }

    /// Lists every node registered in a run, in registration order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn list_nodes(&self, run_id: &RunId) -> Result<Vec<Node>, StoreError> {
        let run_id_str = run_id.as_str().to_owned();
        self.read_pool.with_connection(move |conn| {
            let mut stmt = conn.prepare("SELECT * FROM nodes WHERE run_id = ?1 ORDER BY registered_at ASC").map_err(StoreError::from)?;
            let rows = stmt.query_map([&run_id_str], node_from_row).map_err(StoreError::from)?;
            let mut nodes = Vec::new();
            for row in rows {
                nodes.push(decode_node(row.map_err(StoreError::from)?)?);
            }
            Ok(nodes)
        })
    }

    /// Lists every edge registered in a run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn list_edges(&self, run_id: &RunId) -> Result<Vec<Edge>, StoreError> {
        let run_id_str = run_id.as_str().to_owned();
        self.read_pool.with_connection(move |conn| {
            let mut stmt = conn
                .prepare("SELECT edge_id, run_id, from_node_id, to_node_id, label, default_mode FROM edges WHERE run_id = ?1")
                .map_err(StoreError::from)?;
            let rows = stmt
                .query_map([&run_id_str], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .map_err(StoreError::from)?;
            let mut edges = Vec::new();
            for row in rows {
                let (edge_id, run_id, from_node_id, to_node_id, label, mode) = row.map_err(StoreError::from)?;
                edges.push(Edge {
                    edge_id: EdgeId::new(edge_id),
                    run_id: RunId::new(run_id),
                    from_node_id: NodeId::new(from_node_id),
                    to_node_id: NodeId::new(to_node_id),
                    label,
                    default_mode: codec::parse_edge_mode(&mode)?,
                });
            }
            Ok(edges)
        })
    }
}
