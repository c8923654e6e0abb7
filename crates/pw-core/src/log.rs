// crates/pw-core/src/log.rs
// ============================================================================
// Module: Logging Facade
// Description: Structured-logging initialization shared by the CLI and
// orchestrator binaries.
// Purpose: Give every Pipewright entry point one place to install a
// `tracing` subscriber, so log shape (target, level, format) stays
// consistent between `run`, `validate`, `resume`, and `purge`.
// Dependencies: tracing, tracing-subscriber
// ============================================================================

//! ## Overview
//! Every module in this workspace emits structured events through `tracing`
//! rather than printing directly; `cargo-deny`-style lints in the workspace
//! manifest forbid `println!`/`eprintln!` outside tests for exactly this
//! reason. [`init`] and [`init_json`] are the two subscriber shapes the CLI
//! chooses between (human-readable for a terminal, JSON for piping into a
//! log aggregator); both honor `RUST_LOG` through `EnvFilter` and fall back
//! to `default_level` when it is unset.

// ============================================================================
// SECTION: Imports
// ============================================================================

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::util::SubscriberInitExt;

// ============================================================================
// SECTION: Initialization
// ============================================================================

/// Installs a human-readable subscriber for interactive terminal use.
///
/// Honors `RUST_LOG` if set; otherwise filters to `default_level` and
/// above. Returns without error if a subscriber is already installed
/// (harmless when called more than once, e.g. from tests).
pub fn init(default_level: Level) {
    let filter = env_filter(default_level);
    let _ = fmt().with_target(true).with_env_filter(filter).try_init();
}

/// Installs a JSON-formatted subscriber, for piping into a log aggregator.
///
/// Honors `RUST_LOG` if set; otherwise filters to `default_level` and
/// above.
pub fn init_json(default_level: Level) {
    let filter = env_filter(default_level);
    let _ = fmt().json().with_target(true).with_env_filter(filter).try_init();
}

/// Builds an `EnvFilter` from `RUST_LOG`, falling back to `default_level`.
fn env_filter(default_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.to_string()))
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

    use super::*;

    #[test]
    fn env_filter_falls_back_to_default_level_without_rust_log() {
        // Confirm building a filter never panics at either level; does not
        // assert on RUST_LOG's actual presence, which varies under CI.
        let _ = env_filter(Level::INFO);
        let _ = env_filter(Level::DEBUG);
    }

    #[test]
    fn init_is_idempotent() {
        init(Level::INFO);
        init(Level::DEBUG);
    }
}
