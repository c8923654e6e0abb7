// crates/pw-cli/src/main.rs
// ============================================================================
// Module: Pipewright CLI Entry Point
// Description: Command dispatcher for the engine-visible CLI surface (§6):
// `run`, `validate`, `resume`, `purge`.
// Purpose: Give an operator a thin, scriptable front end over the DAG
// constructor, the orchestrator, and the Landscape store, without pulling
// any plugin implementation into this binary — those are the host
// process's concern (§1 explicitly places plugins, the config loader, and
// the secret manager out of this engine's scope).
// Dependencies: clap, pw-core, pw-dag, pw-orchestrator, pw-payload,
// pw-store, serde_json, serde_yaml, toml, thiserror, time, tracing.
// ============================================================================

//! ## Overview
//! This binary links no concrete source/transform/gate/sink plugin. Its
//! `validate` subcommand fully exercises DAG construction (§4.5) — every
//! wiring and schema-compatibility mistake is caught without ever touching
//! a store. `run` and `resume` wire a real [`pw_store::SqliteLandscape`]
//! and [`pw_payload::FilesystemPayloadStore`] to a [`pw_orchestrator`]
//! driver, but the [`pw_orchestrator::PluginRegistry`] they build is empty;
//! a pipeline naming an actual source/transform/sink plugin fails with a
//! clear `EngineError::Configuration` ("no source plugin registered under
//! '...'") rather than panicking or silently no-op-ing. An embedding host
//! that links concrete plugin crates would construct its own
//! `PluginRegistry`, populate it, and drive `pw_orchestrator::Orchestrator`
//! directly instead of going through this binary. `purge` needs no
//! registry at all — it only touches the store.

#[cfg(test)]
mod main_tests;

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use clap::Subcommand;
use pw_core::core::model::ReproducibilityGrade;
use pw_core::core::model::RunStatus;
use pw_core::protocol::PayloadStore as PayloadStoreTrait;
use pw_dag::PipelineConfig;
use pw_orchestrator::Orchestrator;
use pw_orchestrator::PluginRegistry;
use pw_orchestrator::RecoveryManager;
use pw_payload::FilesystemPayloadStore;
use pw_store::SqliteLandscape;
use serde::Serialize;
use serde_json::json;
use time::Duration;
use time::OffsetDateTime;
use tracing::Level;

/// Number of pooled read connections a CLI-driven store opens.
const CLI_READ_POOL_SIZE: usize = pw_store::DEFAULT_READ_POOL_SIZE;

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Top-level CLI definition.
#[derive(Parser, Debug)]
#[command(name = "pw", about = "Pipewright pipeline execution engine", disable_help_subcommand = true)]
struct Cli {
    /// Emit machine-readable JSON on stdout instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,
    /// Selected subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands (§6).
#[derive(Subcommand, Debug)]
enum Commands {
    /// Constructs and validates a pipeline configuration's DAG, exiting
    /// non-zero on any violation.
    Validate {
        /// Path to a TOML or YAML pipeline configuration document.
        #[arg(long, value_name = "PATH")]
        config: PathBuf,
    },
    /// Executes a pipeline end to end.
    Run {
        /// Path to a TOML or YAML pipeline configuration document.
        #[arg(long, value_name = "PATH")]
        config: PathBuf,
        /// Path to the Landscape `SQLite` store (created if absent).
        #[arg(long, value_name = "PATH")]
        store: PathBuf,
        /// Root directory of the content-addressed payload store.
        /// Defaults to a `payloads` directory next to `--store`.
        #[arg(long, value_name = "DIR")]
        payload_dir: Option<PathBuf>,
    },
    /// Recovers a failed or cancelled run, reconstructing in-flight
    /// checkpoint and batch state ahead of resumption.
    Resume {
        /// Path to the same TOML or YAML pipeline configuration the failed
        /// run was originally started under.
        #[arg(long, value_name = "PATH")]
        config: PathBuf,
        /// Path to the Landscape `SQLite` store.
        #[arg(long, value_name = "PATH")]
        store: PathBuf,
        /// Identifier of the run to resume.
        #[arg(long, value_name = "RUN_ID")]
        run_id: String,
    },
    /// Downgrades runs older than `--older-than-days` from
    /// `replay_reproducible` to `attributable_only`, reflecting the
    /// deletion of their replay payloads.
    Purge {
        /// Path to the Landscape `SQLite` store.
        #[arg(long, value_name = "PATH")]
        store: PathBuf,
        /// Only runs completed at least this many days ago are eligible.
        /// Must be greater than zero.
        #[arg(long, value_name = "N")]
        older_than_days: i64,
    },
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Top-level CLI failure, wrapping every subsystem error this binary can
/// surface.
#[derive(Debug, thiserror::Error)]
enum CliError {
    /// The config file could not be read from disk.
    #[error("failed to read config file '{path}': {source}")]
    ReadConfig {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The config file's extension is not recognized.
    #[error("config file '{path}' has no recognized extension (expected .toml, .yaml, or .yml)")]
    UnknownConfigFormat {
        /// The offending path.
        path: PathBuf,
    },
    /// The config file failed to parse as TOML.
    #[error("failed to parse '{path}' as TOML: {source}")]
    ParseToml {
        /// Path that failed to parse.
        path: PathBuf,
        /// Underlying parse failure.
        #[source]
        source: toml::de::Error,
    },
    /// The config file failed to parse as YAML.
    #[error("failed to parse '{path}' as YAML: {source}")]
    ParseYaml {
        /// Path that failed to parse.
        path: PathBuf,
        /// Underlying parse failure.
        #[source]
        source: serde_yaml::Error,
    },
    /// The underlying Landscape store failed.
    #[error(transparent)]
    Store(#[from] pw_store::StoreError),
    /// The payload store failed.
    #[error(transparent)]
    Payload(#[from] pw_payload::PayloadStoreError),
    /// The orchestrator failed mid-run.
    #[error(transparent)]
    Orchestrator(#[from] pw_orchestrator::OrchestratorError),
    /// Recovery failed to reconstruct the crashed run's state.
    #[error(transparent)]
    Recovery(#[from] pw_orchestrator::RecoveryError),
    /// `--older-than-days` was not a positive integer.
    #[error("--older-than-days must be greater than zero, got {0}")]
    NonPositivePurgeWindow(i64),
    /// Writing output to stdout or stderr failed.
    #[error("failed to write output: {0}")]
    Output(#[source] std::io::Error),
}

/// CLI result alias for fallible operations.
type CliResult<T> = Result<T, CliError>;

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point, returning an exit code reflecting the subcommand's
/// outcome rather than panicking on any engine-reported failure.
fn main() -> ExitCode {
    pw_core::log::init(Level::INFO);
    let cli = Cli::parse();
    match dispatch(&cli) {
        Ok(code) => code,
        Err(err) => {
            let _ = write_stderr_line(&format!("error: {err}"));
            ExitCode::FAILURE
        }
    }
}

/// Executes the selected subcommand.
fn dispatch(cli: &Cli) -> CliResult<ExitCode> {
    match &cli.command {
        Commands::Validate { config } => run_validate(config, cli.json),
        Commands::Run { config, store, payload_dir } => run_run(config, store, payload_dir.as_deref(), cli.json),
        Commands::Resume { config, store, run_id } => run_resume(config, store, run_id, cli.json),
        Commands::Purge { store, older_than_days } => run_purge(store, *older_than_days, cli.json),
    }
}

// ============================================================================
// SECTION: `validate`
// ============================================================================

/// Constructs `config`'s DAG, reporting every construction error collected
/// (§4.5) rather than stopping at the first, and exiting non-zero if any
/// were found.
fn run_validate(config_path: &Path, json: bool) -> CliResult<ExitCode> {
    let config = load_config(config_path)?;
    match pw_dag::construct(&config) {
        Ok(result) => {
            let node_count = result.dag.nodes().count();
            let edge_count = result.dag.edges().count();
            let warnings = result.dag.warnings();
            if json {
                emit_json(&json!({
                    "valid": true,
                    "node_count": node_count,
                    "edge_count": edge_count,
                    "warnings": warnings,
                }))?;
            } else {
                write_stdout_line(&format!("OK: {node_count} node(s), {edge_count} edge(s)"))?;
                for warning in warnings {
                    write_stdout_line(&format!("warning: {warning}"))?;
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(errors) => {
            if json {
                let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
                emit_json(&json!({"valid": false, "errors": messages}))?;
            } else {
                for error in &errors {
                    write_stderr_line(&format!("error: {error}"))?;
                }
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

// ============================================================================
// SECTION: `run`
// ============================================================================

/// Opens the Landscape store and payload store at the given paths and
/// drives `config` to completion through an empty [`PluginRegistry`].
fn run_run(config_path: &Path, store_path: &Path, payload_dir: Option<&Path>, json: bool) -> CliResult<ExitCode> {
    let config = load_config(config_path)?;
    let store = Arc::new(SqliteLandscape::open(store_path, CLI_READ_POOL_SIZE)?);
    let payload_root = resolve_payload_dir(store_path, payload_dir);
    let payload_store: Arc<dyn PayloadStoreTrait> = Arc::new(FilesystemPayloadStore::open(payload_root)?);
    let registry = Arc::new(PluginRegistry::new());

    let orchestrator = Orchestrator::new(store, payload_store, registry);
    let summary = orchestrator.run(&config)?;

    let exit = match summary.run.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Failed | RunStatus::Cancelled | RunStatus::Running => ExitCode::FAILURE,
    };
    emit_run_summary(&summary.run, json)?;
    Ok(exit)
}

/// A minimal projection of [`pw_core::core::model::Run`] for CLI output;
/// avoids re-serializing internal-only fields like `source_schema_json`.
#[derive(Serialize)]
struct RunReport<'a> {
    /// The finalized run's identifier.
    run_id: &'a str,
    /// The finalized run's lifecycle status.
    status: RunStatus,
    /// The finalized run's reproducibility grade, if one was assigned.
    reproducibility_grade: Option<ReproducibilityGrade>,
}

fn emit_run_summary(run: &pw_core::core::model::Run, json: bool) -> CliResult<()> {
    let report = RunReport { run_id: run.run_id.as_str(), status: run.status, reproducibility_grade: run.reproducibility_grade };
    if json {
        emit_json(&report)
    } else {
        let grade = report.reproducibility_grade.map_or_else(|| "none".to_owned(), |grade| format!("{grade:?}"));
        write_stdout_line(&format!("run '{}' finished as {:?} (grade: {grade})", report.run_id, report.status))
    }
}

/// Resolves the payload store's root directory: the caller-supplied
/// `payload_dir`, or a `payloads` directory alongside `store_path`.
fn resolve_payload_dir(store_path: &Path, payload_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = payload_dir {
        return dir.to_path_buf();
    }
    let mut default_dir = store_path.parent().map_or_else(PathBuf::new, Path::to_path_buf);
    default_dir.push("payloads");
    default_dir
}

// ============================================================================
// SECTION: `resume`
// ============================================================================

/// Reconstructs the in-flight state of a crashed run and reports the
/// resulting recovery plan. Does not re-invoke the orchestrator itself:
/// resuming a row stream requires re-reading the source, which is the
/// embedding host's plugin's responsibility (§4.12).
fn run_resume(config_path: &Path, store_path: &Path, run_id: &str, json: bool) -> CliResult<ExitCode> {
    let config = load_config(config_path)?;
    let store = SqliteLandscape::open(store_path, CLI_READ_POOL_SIZE)?;
    let recovery = RecoveryManager::new(&store);
    let plan = recovery.resume(&pw_core::core::identifiers::RunId::new(run_id), &config)?;

    if json {
        emit_json(&json!({
            "run_id": plan.run.run_id.as_str(),
            "status": plan.run.status,
            "checkpoints_recovered": plan.checkpoints.len(),
            "batches_restored": plan.restored_batches.len(),
        }))?;
    } else {
        write_stdout_line(&format!(
            "run '{}' recovered: {} checkpoint(s), {} batch(es) reset for retry",
            plan.run.run_id,
            plan.checkpoints.len(),
            plan.restored_batches.len()
        ))?;
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: `purge`
// ============================================================================

/// Downgrades every run completed at least `older_than_days` days ago from
/// `replay_reproducible` to `attributable_only` (§6, §9). Does not delete
/// payload bytes itself — the Landscape store keeps no per-run index of
/// which payload digests a run referenced, so physical payload cleanup is
/// left to an out-of-band sweep of the content-addressed store; this
/// command is the audit-trail-visible half of that operation.
fn run_purge(store_path: &Path, older_than_days: i64, json: bool) -> CliResult<ExitCode> {
    if older_than_days <= 0 {
        return Err(CliError::NonPositivePurgeWindow(older_than_days));
    }
    let store = SqliteLandscape::open(store_path, CLI_READ_POOL_SIZE)?;
    let cutoff = OffsetDateTime::now_utc() - Duration::days(older_than_days);
    let candidates = store.list_runs_completed_before(cutoff)?;

    let mut downgraded = 0_usize;
    for run in &candidates {
        if run.reproducibility_grade == Some(ReproducibilityGrade::ReplayReproducible) {
            store.downgrade_to_attributable_only(&run.run_id)?;
            downgraded += 1;
        }
    }

    if json {
        emit_json(&json!({"runs_considered": candidates.len(), "runs_downgraded": downgraded}))?;
    } else {
        write_stdout_line(&format!("considered {} run(s), downgraded {downgraded}", candidates.len()))?;
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Config Loading
// ============================================================================

/// Loads a [`PipelineConfig`] from `path`, dispatching on its extension
/// (`.toml`, `.yaml`, `.yml`).
fn load_config(path: &Path) -> CliResult<PipelineConfig> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::ReadConfig { path: path.to_path_buf(), source })?;
    match path.extension().and_then(std::ffi::OsStr::to_str) {
        Some("toml") => toml::from_str(&text).map_err(|source| CliError::ParseToml { path: path.to_path_buf(), source }),
        Some("yaml" | "yml") => {
            serde_yaml::from_str(&text).map_err(|source| CliError::ParseYaml { path: path.to_path_buf(), source })
        }
        _ => Err(CliError::UnknownConfigFormat { path: path.to_path_buf() }),
    }
}

// ============================================================================
// SECTION: Output Helpers
// ============================================================================

/// Writes a single line to stdout.
fn write_stdout_line(message: &str) -> CliResult<()> {
    let mut stdout = std::io::stdout();
    writeln!(&mut stdout, "{message}").map_err(CliError::Output)
}

/// Writes a single line to stderr.
fn write_stderr_line(message: &str) -> CliResult<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}").map_err(CliError::Output)
}

/// Serializes `value` as pretty JSON and writes it to stdout.
fn emit_json<T: Serialize>(value: &T) -> CliResult<()> {
    let rendered = serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_owned());
    write_stdout_line(&rendered)
}
