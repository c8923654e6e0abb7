// crates/pw-condition/src/tristate.rs
// ============================================================================
// Module: Tri-State Boolean Logic
// Description: Kleene's strong three-valued logic (`True`/`False`/`Unknown`),
// used for condition evaluation when a referenced batch-level key is absent.
// Purpose: A condition like `row['batch_age_seconds'] > 30` has no verdict
// when `batch_age_seconds` was never recorded; Kleene logic lets composition
// (`and`/`or`/`not`) propagate that absence instead of guessing a default.
// Dependencies: none
// ============================================================================

//! ## Overview
//! [`Tristate`] composes the same way SQL's three-valued logic does:
//! `Unknown AND False` is `False` (a conjunction can never be satisfied once
//! one side fails, no matter the other), `Unknown OR True` is `True`, and
//! anything else touching `Unknown` stays `Unknown`. Callers who need a
//! final boolean outcome (a gate choosing an edge) call
//! [`Tristate::resolve`] with an explicit default for `Unknown`.

use std::fmt;

/// A three-valued logic result: `True`, `False`, or `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tristate {
    /// The condition holds.
    True,
    /// The condition does not hold.
    False,
    /// The condition's truth cannot be determined (a referenced key was
    /// absent).
    Unknown,
}

impl Tristate {
    /// Constructs a tri-state value from a plain boolean.
    #[must_use]
    pub const fn from_bool(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }

    /// Kleene conjunction.
    #[must_use]
    pub const fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::False, _) | (_, Self::False) => Self::False,
            (Self::Unknown, _) | (_, Self::Unknown) => Self::Unknown,
            (Self::True, Self::True) => Self::True,
        }
    }

    /// Kleene disjunction.
    #[must_use]
    pub const fn or(self, other: Self) -> Self {
        match (self, other) {
            (Self::True, _) | (_, Self::True) => Self::True,
            (Self::Unknown, _) | (_, Self::Unknown) => Self::Unknown,
            (Self::False, Self::False) => Self::False,
        }
    }

    /// Kleene negation; `Unknown` negates to `Unknown`.
    #[must_use]
    pub const fn not(self) -> Self {
        match self {
            Self::True => Self::False,
            Self::False => Self::True,
            Self::Unknown => Self::Unknown,
        }
    }

    /// Resolves this value to a plain boolean, substituting `default` for
    /// `Unknown`.
    #[must_use]
    pub const fn resolve(self, default: bool) -> bool {
        match self {
            Self::True => true,
            Self::False => false,
            Self::Unknown => default,
        }
    }
}

impl fmt::Display for Tristate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::True => "true",
            Self::False => "false",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
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
    fn and_is_false_when_either_side_is_false_even_if_other_is_unknown() {
        assert_eq!(Tristate::Unknown.and(Tristate::False), Tristate::False);
        assert_eq!(Tristate::False.and(Tristate::Unknown), Tristate::False);
    }

    #[test]
    fn or_is_true_when_either_side_is_true_even_if_other_is_unknown() {
        assert_eq!(Tristate::Unknown.or(Tristate::True), Tristate::True);
        assert_eq!(Tristate::True.or(Tristate::Unknown), Tristate::True);
    }

    #[test]
    fn unknown_propagates_when_no_short_circuit_applies() {
        assert_eq!(Tristate::Unknown.and(Tristate::True), Tristate::Unknown);
        assert_eq!(Tristate::Unknown.or(Tristate::False), Tristate::Unknown);
        assert_eq!(Tristate::Unknown.not(), Tristate::Unknown);
    }

    #[test]
    fn resolve_substitutes_default_only_for_unknown() {
        assert!(Tristate::True.resolve(false));
        assert!(!Tristate::False.resolve(true));
        assert!(Tristate::Unknown.resolve(true));
        assert!(!Tristate::Unknown.resolve(false));
    }
}
