// crates/pw-cli/src/main_tests.rs
// ============================================================================
// Module: CLI Entry Point Tests
// Description: Unit tests for config loading, payload-dir resolution, and
// the `validate`/`purge` subcommand bodies.
// Purpose: Exercise the CLI's own glue code without spawning the compiled
// binary, mirroring how `pw-dag`/`pw-orchestrator` test their own internals.
// Dependencies: tempfile
// ============================================================================

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

use std::path::PathBuf;

use tempfile::tempdir;

use super::load_config;
use super::resolve_payload_dir;
use super::run_purge;
use super::run_validate;

const MINIMAL_TOML: &str = r#"
[source]
plugin = "csv"
on_success = "sink"

[sinks.sink]
plugin = "csv"
"#;

const MINIMAL_YAML: &str = r"
source:
  plugin: csv
  on_success: sink
sinks:
  sink:
    plugin: csv
";

const BROKEN_CONFIG: &str = r#"
[source]
plugin = "csv"
on_success = "nowhere"

[sinks.sink]
plugin = "csv"
"#;

#[test]
fn load_config_parses_toml() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("pipeline.toml");
    std::fs::write(&path, MINIMAL_TOML).expect("write config");
    let config = load_config(&path).expect("toml config parses");
    assert_eq!(config.source.plugin, "csv");
    assert_eq!(config.source.on_success, "sink");
}

#[test]
fn load_config_parses_yaml() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("pipeline.yaml");
    std::fs::write(&path, MINIMAL_YAML).expect("write config");
    let config = load_config(&path).expect("yaml config parses");
    assert_eq!(config.source.plugin, "csv");
    assert!(config.sinks.contains_key("sink"));
}

#[test]
fn load_config_rejects_unknown_extension() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("pipeline.ini");
    std::fs::write(&path, MINIMAL_TOML).expect("write config");
    let err = load_config(&path).expect_err("unrecognized extension must fail");
    assert!(err.to_string().contains("no recognized extension"));
}

#[test]
fn load_config_reports_missing_file() {
    let missing = PathBuf::from("/nonexistent/pw-cli-test-config.toml");
    let err = load_config(&missing).expect_err("missing file must fail");
    assert!(err.to_string().contains("failed to read config file"));
}

#[test]
fn validate_reports_success_for_a_wired_pipeline() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("pipeline.toml");
    std::fs::write(&path, MINIMAL_TOML).expect("write config");
    let code = run_validate(&path, false).expect("validate should not error");
    assert_eq!(format!("{code:?}"), format!("{:?}", std::process::ExitCode::SUCCESS));
}

#[test]
fn validate_fails_on_unresolved_connection() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("pipeline.toml");
    std::fs::write(&path, BROKEN_CONFIG).expect("write config");
    let code = run_validate(&path, false).expect("validate should not error out, only report failure");
    assert_eq!(format!("{code:?}"), format!("{:?}", std::process::ExitCode::FAILURE));
}

#[test]
fn resolve_payload_dir_defaults_alongside_store() {
    let store = PathBuf::from("/var/data/landscape.sqlite");
    let resolved = resolve_payload_dir(&store, None);
    assert_eq!(resolved, PathBuf::from("/var/data/payloads"));
}

#[test]
fn resolve_payload_dir_honors_explicit_override() {
    let store = PathBuf::from("/var/data/landscape.sqlite");
    let override_dir = PathBuf::from("/elsewhere/blobs");
    let resolved = resolve_payload_dir(&store, Some(override_dir.as_path()));
    assert_eq!(resolved, override_dir);
}

#[test]
fn purge_rejects_non_positive_windows() {
    let dir = tempdir().expect("tempdir");
    let store_path = dir.path().join("landscape.sqlite");
    let err = run_purge(&store_path, 0, false).expect_err("zero-day window must be rejected");
    assert!(err.to_string().contains("must be greater than zero"));
    let err = run_purge(&store_path, -3, false).expect_err("negative window must be rejected");
    assert!(err.to_string().contains("must be greater than zero"));
}
