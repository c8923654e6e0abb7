// crates/pw-condition/src/lib.rs
// ============================================================================
// Crate: pw-condition
// Description: The restricted condition-expression language used for gate
// conditions, aggregation triggers, and coalesce best-effort conditions.
// Purpose: Give the orchestrator one small, auditable place to parse and
// evaluate condition strings, kept deliberately narrower than a general
// expression language so every condition a pipeline author can write is one
// a reviewer can read in full (§6).
// ============================================================================

//! # pw-condition
//!
//! Condition expressions restrict to batch-level subscript access
//! (`row['batch_count']`, `row['batch_age_seconds']`) compared against
//! literals, composed with `and`/`or`/`not`. Attribute calls, imports, and
//! bare name lookups have no production in the grammar and are rejected at
//! parse time, not filtered out afterward.
//!
//! [`parse`] turns a condition string into a [`Condition`] once, typically
//! at DAG construction; [`Condition::evaluate`] runs it against a batch's
//! field map as many times as needed, returning a [`Tristate`] rather than
//! a plain `bool` so an absent key can propagate as "unknown" through
//! boolean composition instead of silently defaulting to one side.

mod ast;
mod error;
mod eval;
mod lexer;
mod parser;
mod tristate;

pub use ast::CompareOp;
pub use ast::Expr;
pub use ast::Literal;
pub use ast::Operand;
pub use error::ConditionError;
pub use tristate::Tristate;

use serde_json::Value;

/// A parsed, reusable condition expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// The parsed expression tree.
    expr: Expr,
    /// The original expression text, retained for diagnostics.
    source: String,
}

impl Condition {
    /// Parses `source` into a reusable [`Condition`].
    ///
    /// # Errors
    ///
    /// Returns [`ConditionError`] if `source` does not conform to the
    /// restricted condition grammar.
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let expr = parser::parse(source)?;
        Ok(Self { expr, source: source.to_owned() })
    }

    /// The original expression text this condition was parsed from.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates this condition against `fields`.
    ///
    /// # Errors
    ///
    /// Returns [`ConditionError::IncomparableTypes`] if a comparison's
    /// operands cannot be ordered under the attempted operator.
    pub fn evaluate(&self, fields: &serde_json::Map<String, Value>) -> Result<Tristate, ConditionError> {
        eval::evaluate(&self.expr, fields)
    }
}

/// Parses `source` into a [`Condition`]; a convenience wrapper around
/// [`Condition::parse`] for call sites that do not need to retain the
/// parsed form.
///
/// # Errors
///
/// Returns [`ConditionError`] if `source` does not conform to the
/// restricted condition grammar.
pub fn parse(source: &str) -> Result<Condition, ConditionError> {
    Condition::parse(source)
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

    use serde_json::json;

    use super::*;

    #[test]
    fn parses_and_evaluates_end_to_end() {
        let condition = parse("row['batch_count'] >= 3 and row['batch_age_seconds'] < 60").expect("parses");
        let fields = match json!({"batch_count": 4, "batch_age_seconds": 10}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        assert_eq!(condition.evaluate(&fields).expect("evaluates"), Tristate::True);
        assert_eq!(condition.source(), "row['batch_count'] >= 3 and row['batch_age_seconds'] < 60");
    }

    #[test]
    fn rejects_forbidden_constructs_at_parse_time() {
        assert!(Condition::parse("__import__('os')").is_err());
        assert!(Condition::parse("row['a'].strip()").is_err());
        assert!(Condition::parse("batch_count").is_err());
    }
}
