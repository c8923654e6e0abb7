// crates/pw-condition/src/parser.rs
// ============================================================================
// Module: Condition Expression Parser
// Description: A recursive-descent parser turning a condition expression's
// token stream into an `ast::Expr` tree.
// Purpose: Enforce the restricted condition grammar (§6) structurally: the
// parser has no production for bare names, attribute access, function
// calls, or imports, so those constructs fail here rather than needing a
// later validation pass.
// Dependencies: crate::{ast, error, lexer}
// ============================================================================

//! ## Overview
//! Operator precedence, low to high: `or`, `and`, `not`, comparison. Only
//! `row['literal_key']` and literal values are valid operands; anything
//! else (`row[x]`, `row.batch_count`, a bare `batch_count`, `import(...)`)
//! is rejected with a parse error naming the offending byte.

use crate::ast::CompareOp;
use crate::ast::Expr;
use crate::ast::Literal;
use crate::ast::Operand;
use crate::error::ConditionError;
use crate::lexer::MAX_NESTING_DEPTH;
use crate::lexer::SpannedToken;
use crate::lexer::Token;
use crate::lexer::tokenize;

/// Parses a condition expression string into an [`Expr`].
///
/// # Errors
///
/// Returns [`ConditionError`] if the expression cannot be tokenized, or
/// does not conform to the restricted condition grammar.
pub fn parse(input: &str) -> Result<Expr, ConditionError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens: &tokens, position: 0, depth: 0 };
    let expr = parser.parse_or()?;
    parser.expect_eof()?;
    Ok(expr)
}

/// Recursive-descent parser state over a borrowed token slice.
struct Parser<'a, 'b> {
    /// The full token stream, including the trailing `Eof` sentinel.
    tokens: &'b [SpannedToken<'a>],
    /// Index of the current token within `tokens`.
    position: usize,
    /// Current parenthesis nesting depth, checked against
    /// [`MAX_NESTING_DEPTH`].
    depth: usize,
}

impl<'a> Parser<'a, '_> {
    /// Returns the token at the current position without consuming it.
    fn current(&self) -> &SpannedToken<'a> {
        &self.tokens[self.position]
    }

    /// Consumes and returns the current token, advancing the position
    /// unless already at the trailing `Eof` sentinel.
    fn advance(&mut self) -> &SpannedToken<'a> {
        let token = &self.tokens[self.position];
        if self.position + 1 < self.tokens.len() {
            self.position += 1;
        }
        token
    }

    /// Parses an `or`-level expression: one or more `and`-level expressions
    /// joined by `or`.
    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_and()?;
        while matches!(self.current().token, Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    /// Parses an `and`-level expression: one or more unary expressions
    /// joined by `and`.
    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_unary()?;
        while matches!(self.current().token, Token::And) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    /// Parses a `not`-prefixed expression, or falls through to a primary
    /// expression.
    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if matches!(self.current().token, Token::Not) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    /// Parses a parenthesized sub-expression, or falls through to a
    /// comparison.
    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        if matches!(self.current().token, Token::LParen) {
            self.advance();
            self.depth += 1;
            if self.depth > MAX_NESTING_DEPTH {
                return Err(ConditionError::NestingTooDeep { max: MAX_NESTING_DEPTH });
            }
            let inner = self.parse_or()?;
            self.depth -= 1;
            self.expect(&Token::RParen, "')'")?;
            return Ok(inner);
        }
        self.parse_comparison()
    }

    /// Parses an operand, then an optional comparison operator and a
    /// second operand; an operand with no following operator parses as a
    /// truthiness check.
    fn parse_comparison(&mut self) -> Result<Expr, ConditionError> {
        let left = self.parse_operand()?;
        let op = match self.current().token {
            Token::EqEq => Some(CompareOp::Eq),
            Token::NotEq => Some(CompareOp::Ne),
            Token::Lt => Some(CompareOp::Lt),
            Token::Le => Some(CompareOp::Le),
            Token::Gt => Some(CompareOp::Gt),
            Token::Ge => Some(CompareOp::Ge),
            _ => None,
        };
        let Some(op) = op else {
            return Ok(Expr::Truthy(left));
        };
        self.advance();
        let right = self.parse_operand()?;
        Ok(Expr::Compare { left, op, right })
    }

    /// Parses a single operand: a `row['key']` subscript, or a literal.
    /// A bare identifier other than `row` is rejected, since the grammar
    /// has no production for a free name lookup.
    fn parse_operand(&mut self) -> Result<Operand, ConditionError> {
        let spanned = self.current().clone();
        match spanned.token {
            Token::Ident("row") => {
                self.advance();
                self.expect(&Token::LBracket, "'['")?;
                let key = self.parse_subscript_key()?;
                self.expect(&Token::RBracket, "']'")?;
                Ok(Operand::Subscript(key))
            }
            Token::Ident(name) => Err(ConditionError::ForbiddenNameLookup {
                name: name.to_owned(),
                position: spanned.position,
            }),
            Token::Number(value) => {
                self.advance();
                Ok(Operand::Literal(Literal::Number(value)))
            }
            Token::Str(ref value) => {
                let value = value.clone();
                self.advance();
                Ok(Operand::Literal(Literal::String(value)))
            }
            Token::True => {
                self.advance();
                Ok(Operand::Literal(Literal::Bool(true)))
            }
            Token::False => {
                self.advance();
                Ok(Operand::Literal(Literal::Bool(false)))
            }
            Token::Null => {
                self.advance();
                Ok(Operand::Literal(Literal::Null))
            }
            ref other => Err(ConditionError::UnexpectedToken {
                expected: "an operand (row['key'] or a literal)".to_owned(),
                found: describe(other),
                position: spanned.position,
            }),
        }
    }

    /// Parses the literal string key inside a `row[...]` subscript.
    fn parse_subscript_key(&mut self) -> Result<String, ConditionError> {
        let spanned = self.current().clone();
        match spanned.token {
            Token::Str(ref value) => {
                let value = value.clone();
                self.advance();
                Ok(value)
            }
            _ => Err(ConditionError::NonLiteralSubscript { position: spanned.position }),
        }
    }

    /// Consumes the current token if it matches `expected`, otherwise
    /// returns a parse error naming `description`.
    fn expect(&mut self, expected: &Token<'a>, description: &str) -> Result<(), ConditionError> {
        if &self.current().token == expected {
            self.advance();
            Ok(())
        } else {
            let spanned = self.current().clone();
            if matches!(spanned.token, Token::Eof) {
                Err(ConditionError::UnexpectedEof { expected: description.to_owned() })
            } else {
                Err(ConditionError::UnexpectedToken {
                    expected: description.to_owned(),
                    found: describe(&spanned.token),
                    position: spanned.position,
                })
            }
        }
    }

    /// Returns an error if any non-`Eof` token remains.
    fn expect_eof(&self) -> Result<(), ConditionError> {
        match self.current().token {
            Token::Eof => Ok(()),
            _ => Err(ConditionError::TrailingInput { position: self.current().position }),
        }
    }
}

/// Renders a human-readable description of a token kind for error messages.
fn describe(token: &Token<'_>) -> String {
    match token {
        Token::Ident(name) => format!("identifier {name:?}"),
        Token::Number(value) => format!("number {value}"),
        Token::Str(value) => format!("string {value:?}"),
        Token::And => "'and'".to_owned(),
        Token::Or => "'or'".to_owned(),
        Token::Not => "'not'".to_owned(),
        Token::True => "'true'".to_owned(),
        Token::False => "'false'".to_owned(),
        Token::Null => "'null'".to_owned(),
        Token::LParen => "'('".to_owned(),
        Token::RParen => "')'".to_owned(),
        Token::LBracket => "'['".to_owned(),
        Token::RBracket => "']'".to_owned(),
        Token::EqEq => "'=='".to_owned(),
        Token::NotEq => "'!='".to_owned(),
        Token::Lt => "'<'".to_owned(),
        Token::Le => "'<='".to_owned(),
        Token::Gt => "'>'".to_owned(),
        Token::Ge => "'>='".to_owned(),
        Token::Eof => "end of input".to_owned(),
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
    fn parses_simple_comparison() {
        let expr = parse("row['batch_count'] >= 3").expect("parses");
        assert_eq!(
            expr,
            Expr::Compare {
                left: Operand::Subscript("batch_count".to_owned()),
                op: CompareOp::Ge,
                right: Operand::Literal(Literal::Number(3.0)),
            }
        );
    }

    #[test]
    fn parses_boolean_composition_with_precedence() {
        let expr = parse("row['a'] == 1 or row['b'] == 2 and row['c'] == 3").expect("parses");
        // `and` binds tighter than `or`.
        assert!(matches!(expr, Expr::Or(_, right) if matches!(*right, Expr::And(_, _))));
    }

    #[test]
    fn parses_negation_and_grouping() {
        let expr = parse("not (row['a'] == 1)").expect("parses");
        assert!(matches!(expr, Expr::Not(_)));
    }

    #[test]
    fn bare_subscript_parses_as_truthy_check() {
        let expr = parse("row['is_final']").expect("parses");
        assert_eq!(expr, Expr::Truthy(Operand::Subscript("is_final".to_owned())));
    }

    #[test]
    fn rejects_bare_name_lookup() {
        let err = parse("batch_count >= 3").expect_err("forbidden");
        assert!(matches!(err, ConditionError::ForbiddenNameLookup { name, .. } if name == "batch_count"));
    }

    #[test]
    fn rejects_non_literal_subscript() {
        let err = parse("row[1]").expect_err("non-literal subscript");
        assert!(matches!(err, ConditionError::NonLiteralSubscript { .. }));
    }

    #[test]
    fn rejects_attribute_style_access() {
        // `.` is not a recognized character anywhere in the grammar, so
        // attribute/method-call syntax fails at the lexer, before a parse
        // tree is ever attempted.
        let err = parse("row['a'].upper()").expect_err("attribute call forbidden");
        assert!(matches!(err, ConditionError::UnexpectedCharacter { found: '.', .. }));
    }

    #[test]
    fn rejects_trailing_input() {
        let err = parse("row['a'] == 1 row['b'] == 2").expect_err("trailing input");
        assert!(matches!(err, ConditionError::TrailingInput { .. }));
    }

    #[test]
    fn rejects_nesting_beyond_maximum_depth() {
        let mut expr = String::from("row['a'] == 1");
        for _ in 0..MAX_NESTING_DEPTH + 1 {
            expr = format!("({expr})");
        }
        let err = parse(&expr).expect_err("too deep");
        assert!(matches!(err, ConditionError::NestingTooDeep { .. }));
    }
}
