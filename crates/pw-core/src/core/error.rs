// crates/pw-core/src/core/error.rs
// ============================================================================
// Module: Shared Error Taxonomy
// Description: The engine-wide error categories described in §7, plus the
// conversions every other crate's local error enum chains into.
// Purpose: Give every crate one vocabulary for fatal-vs-retryable-vs-data
// errors, so the orchestrator can dispatch on category without downcasting.
// Dependencies: thiserror, crate::core::canonical
// ============================================================================

//! ## Overview
//! §7 splits failure into six categories: configuration errors (fatal, raised
//! at DAG construction), orchestration-invariant errors (fatal, an internal
//! contract was broken), audit-integrity errors (fatal, a write could not be
//! read back or a non-canonical payload was submitted), plugin errors split
//! into retryable and non-retryable, data errors (never fatal — quarantined
//! or discarded), and the non-error "pending" signal. [`EngineError`] is the
//! single enum every crate's local error converts into at the orchestrator
//! boundary; [`ErrorCategory`] lets the orchestrator decide propagation
//! policy without matching on every variant.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

use crate::core::canonical::CanonicalError;

// ============================================================================
// SECTION: Error Category
// ============================================================================

/// The propagation policy bucket an error falls into (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Raised at DAG construction: duplicate producer/consumer, unresolved
    /// connection, schema incompatibility, invalid condition expression,
    /// reserved-field collision. Always fatal; never retried.
    Configuration,
    /// An internal contract was broken (e.g. completing an `open` node
    /// state, or a coalesce invariant violated). Always fatal.
    OrchestrationInvariant,
    /// A written state could not be read back, or a non-canonical payload
    /// was submitted to the audit or payload store. Always fatal.
    AuditIntegrity,
    /// Capacity/rate-limit/network/server errors surfaced by audited
    /// clients. Handled by the pooled executor's AIMD retry, or surfaced as
    /// `TransformResult::Error { retryable: true }`.
    PluginRetryable,
    /// Content-policy/auth/context-length/client-error failures, or plugin
    /// validation failures. Orchestrator emits a terminal `failed` outcome
    /// and optionally diverts to an error sink.
    PluginNonRetryable,
    /// Source validation failure; recorded with a dedicated error id and
    /// routed to a quarantine sink or discarded per configuration. Never
    /// stops the run.
    Data,
}

impl ErrorCategory {
    /// Whether this category always aborts the run.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::Configuration | Self::OrchestrationInvariant | Self::AuditIntegrity
        )
    }

    /// Whether the pooled executor's AIMD retry policy applies to this
    /// category.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::PluginRetryable)
    }
}

// ============================================================================
// SECTION: Engine Error
// ============================================================================

/// The engine-wide error type every crate's local error converts into at a
/// crate boundary (the orchestrator, primarily).
///
/// # Invariants
/// - Every condition raised here also writes a `NodeState` or `TokenOutcome`
///   row through the Landscape recorder before propagating; this type alone
///   does not guarantee that write happened, the orchestrator does.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A configuration error raised at DAG construction.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// An internal orchestration invariant was violated.
    #[error("orchestration invariant violated: {0}")]
    OrchestrationInvariant(String),
    /// An audit-integrity error: a write could not be read back, or a
    /// non-canonical payload was submitted.
    #[error("audit integrity error: {0}")]
    AuditIntegrity(String),
    /// A retryable plugin error (capacity, rate-limit, network, transient
    /// server failure).
    #[error("retryable plugin error: {0}")]
    PluginRetryable(String),
    /// A non-retryable plugin error (content policy, auth, context length,
    /// client error, or plugin-side validation failure).
    #[error("non-retryable plugin error: {0}")]
    PluginNonRetryable(String),
    /// A source-row validation failure, routed to quarantine or discarded.
    #[error("data error: {0}")]
    Data(String),
    /// Canonicalization or hashing of an audited payload failed.
    #[error("canonical encoding error: {0}")]
    Canonical(#[from] CanonicalError),
}

impl EngineError {
    /// Returns the propagation-policy category this error belongs to.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::OrchestrationInvariant(_) => ErrorCategory::OrchestrationInvariant,
            Self::AuditIntegrity(_) | Self::Canonical(_) => ErrorCategory::AuditIntegrity,
            Self::PluginRetryable(_) => ErrorCategory::PluginRetryable,
            Self::PluginNonRetryable(_) => ErrorCategory::PluginNonRetryable,
            Self::Data(_) => ErrorCategory::Data,
        }
    }

    /// Whether this error always aborts the run.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.category().is_fatal()
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

    use super::*;

    #[test]
    fn configuration_errors_are_fatal_and_never_retryable() {
        let err = EngineError::Configuration("duplicate producer".to_owned());
        assert!(err.is_fatal());
        assert!(!err.category().is_retryable());
    }

    #[test]
    fn plugin_retryable_errors_are_not_fatal() {
        let err = EngineError::PluginRetryable("rate limited".to_owned());
        assert!(!err.is_fatal());
        assert!(err.category().is_retryable());
    }

    #[test]
    fn data_errors_are_not_fatal() {
        let err = EngineError::Data("missing required field".to_owned());
        assert!(!err.is_fatal());
    }

    #[test]
    fn canonical_errors_chain_into_audit_integrity() {
        let err = EngineError::from(CanonicalError::NonFiniteFloat);
        assert_eq!(err.category(), ErrorCategory::AuditIntegrity);
    }
}
