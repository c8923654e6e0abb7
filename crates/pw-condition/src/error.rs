// crates/pw-condition/src/error.rs
// ============================================================================
// Module: Condition Parse/Evaluation Errors
// Description: The error type raised by the lexer, parser, and evaluator.
// Purpose: Give callers a single enum to match on, with enough positional
// detail to point a pipeline author at the offending byte of a condition
// expression string.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! Every error here carries the byte offset into the original expression
//! string where the problem was detected, mirroring the span-bearing errors
//! the retrieved DSL parser this crate's structure is grounded on produces.
//! Construction errors (raised while building a DAG) convert these into
//! `EngineError::Configuration`; nothing here depends on `pw-core` so that
//! this crate can be unit-tested in isolation.

use thiserror::Error;

/// A condition expression could not be parsed or evaluated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConditionError {
    /// The expression exceeded the maximum permitted input length.
    #[error("condition expression exceeds the maximum length of {max} bytes")]
    TooLong {
        /// The configured maximum.
        max: usize,
    },
    /// The lexer encountered a byte it does not recognize.
    #[error("unexpected character {found:?} at byte {position}")]
    UnexpectedCharacter {
        /// The offending character.
        found: char,
        /// Byte offset into the input.
        position: usize,
    },
    /// A string literal was never closed with a matching quote.
    #[error("unterminated string literal starting at byte {position}")]
    UnterminatedString {
        /// Byte offset of the opening quote.
        position: usize,
    },
    /// The parser expected one token but found another.
    #[error("expected {expected} but found {found} at byte {position}")]
    UnexpectedToken {
        /// What the parser expected to see, in human-readable form.
        expected: String,
        /// A human-readable description of what was actually found.
        found: String,
        /// Byte offset into the input.
        position: usize,
    },
    /// The expression ended before a complete expression was parsed.
    #[error("unexpected end of condition expression, expected {expected}")]
    UnexpectedEof {
        /// What the parser expected to see.
        expected: String,
    },
    /// Trailing input remained after a complete expression was parsed.
    #[error("unexpected trailing input at byte {position}")]
    TrailingInput {
        /// Byte offset where the trailing input begins.
        position: usize,
    },
    /// A subscript used something other than a literal string, e.g.
    /// `row[x]` or `row[0]`; only `row['literal']` is permitted.
    #[error("subscript at byte {position} must be a literal string, e.g. row['batch_count']")]
    NonLiteralSubscript {
        /// Byte offset of the offending subscript.
        position: usize,
    },
    /// A bare name was referenced outside of a `row[...]` subscript, e.g.
    /// `batch_count == 3` instead of `row['batch_count'] == 3`. Attribute
    /// access, function calls, and imports all surface through this
    /// variant or `UnexpectedToken`, since the grammar has no production
    /// for any of them.
    #[error("bare name {name:?} at byte {position} is forbidden; use row['{name}'] instead")]
    ForbiddenNameLookup {
        /// The offending name.
        name: String,
        /// Byte offset of the name.
        position: usize,
    },
    /// Expression nesting exceeded the configured depth guard.
    #[error("condition expression nesting exceeds the maximum depth of {max}")]
    NestingTooDeep {
        /// The configured maximum.
        max: usize,
    },
    /// A comparison or boolean operator was applied to operands whose types
    /// cannot be compared (e.g. a string compared with `<` to a boolean).
    #[error("cannot compare {left} with {right} using {op}")]
    IncomparableTypes {
        /// Debug rendering of the left operand's type.
        left: String,
        /// Debug rendering of the right operand's type.
        right: String,
        /// The operator that was applied.
        op: String,
    },
}
