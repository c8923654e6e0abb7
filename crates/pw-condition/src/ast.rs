// crates/pw-condition/src/ast.rs
// ============================================================================
// Module: Condition Expression AST
// Description: The parsed representation of a condition expression.
// Purpose: Separate the grammar's shape from both parsing and evaluation, so
// each can be tested against a hand-built tree without going through text.
// Dependencies: none
// ============================================================================

//! ## Overview
//! The grammar this crate parses is deliberately narrow (§6's restricted
//! condition language): boolean composition (`and`/`or`/`not`) over
//! comparisons between a `row['literal_key']` subscript and a literal, or a
//! bare subscript treated as a truthiness check. There is no production for
//! bare names, attribute access, function calls, or imports, so those
//! constructs are rejected by the parser rather than filtered out after the
//! fact.

use std::fmt;

// ============================================================================
// SECTION: Literals
// ============================================================================

/// A literal value appearing in a condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// A numeric literal.
    Number(f64),
    /// A string literal.
    String(String),
    /// A boolean literal.
    Bool(bool),
    /// The `null` literal.
    Null,
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value:?}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Null => f.write_str("null"),
        }
    }
}

// ============================================================================
// SECTION: Operands
// ============================================================================

/// The left- or right-hand side of a comparison, or a standalone truthiness
/// check.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// `row['key']`: a subscript access into the batch-level field map with
    /// a literal string key.
    Subscript(String),
    /// A literal value.
    Literal(Literal),
}

// ============================================================================
// SECTION: Comparison Operators
// ============================================================================

/// A comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        };
        f.write_str(symbol)
    }
}

// ============================================================================
// SECTION: Expression
// ============================================================================

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A comparison between two operands.
    Compare {
        /// Left-hand operand.
        left: Operand,
        /// Comparison operator.
        op: CompareOp,
        /// Right-hand operand.
        right: Operand,
    },
    /// A bare operand evaluated for truthiness (non-`null`, non-zero,
    /// non-empty-string, non-`false`).
    Truthy(Operand),
    /// Logical conjunction.
    And(Box<Expr>, Box<Expr>),
    /// Logical disjunction.
    Or(Box<Expr>, Box<Expr>),
    /// Logical negation.
    Not(Box<Expr>),
}
