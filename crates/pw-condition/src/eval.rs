// crates/pw-condition/src/eval.rs
// ============================================================================
// Module: Condition Expression Evaluator
// Description: Evaluates a parsed `Expr` against a map of batch-level
// fields, producing a `Tristate`.
// Purpose: Separate evaluation from parsing so a condition can be parsed
// once at DAG construction and evaluated many times against different
// batches without re-tokenizing.
// Dependencies: crate::{ast, error, tristate}, serde_json
// ============================================================================

//! ## Overview
//! A `row['key']` subscript resolves against the caller-supplied field map;
//! an absent key evaluates to [`Tristate::Unknown`] rather than an error,
//! letting `and`/`or` composition decide whether the absence is decisive
//! (§6: a gate condition referencing `row['batch_age_seconds']` on a batch
//! that never recorded it should not abort the run). Comparisons between
//! values of different JSON types, or ordering comparisons (`<`, `<=`, `>`,
//! `>=`) on non-numeric/non-string values, are genuine errors: the
//! expression was well-formed but cannot be evaluated against this data.

use serde_json::Value;

use crate::ast::CompareOp;
use crate::ast::Expr;
use crate::ast::Literal;
use crate::ast::Operand;
use crate::error::ConditionError;
use crate::tristate::Tristate;

/// Evaluates `expr` against `fields`, the batch-level key/value map a gate
/// or aggregation trigger condition is restricted to (§6).
///
/// # Errors
///
/// Returns [`ConditionError::IncomparableTypes`] if a comparison's operands
/// cannot be ordered or compared under the attempted operator.
pub fn evaluate(expr: &Expr, fields: &serde_json::Map<String, Value>) -> Result<Tristate, ConditionError> {
    match expr {
        Expr::Truthy(operand) => Ok(resolve(operand, fields).map_or(Tristate::Unknown, |value| {
            Tristate::from_bool(is_truthy(&value))
        })),
        Expr::Compare { left, op, right } => {
            let left_value = resolve(left, fields);
            let right_value = resolve(right, fields);
            match (left_value, right_value) {
                (Some(left_value), Some(right_value)) => compare(&left_value, *op, &right_value).map(Tristate::from_bool),
                _ => Ok(Tristate::Unknown),
            }
        }
        Expr::And(left, right) => Ok(evaluate(left, fields)?.and(evaluate(right, fields)?)),
        Expr::Or(left, right) => Ok(evaluate(left, fields)?.or(evaluate(right, fields)?)),
        Expr::Not(inner) => Ok(evaluate(inner, fields)?.not()),
    }
}

/// Resolves an operand to a JSON value, returning `None` for an absent
/// subscript key.
fn resolve(operand: &Operand, fields: &serde_json::Map<String, Value>) -> Option<Value> {
    match operand {
        Operand::Subscript(key) => fields.get(key).cloned(),
        Operand::Literal(literal) => Some(literal_to_value(literal)),
    }
}

/// Converts a literal AST node to its JSON value.
fn literal_to_value(literal: &Literal) -> Value {
    match literal {
        Literal::Number(value) => serde_json::Number::from_f64(*value).map_or(Value::Null, Value::Number),
        Literal::String(value) => Value::String(value.clone()),
        Literal::Bool(value) => Value::Bool(*value),
        Literal::Null => Value::Null,
    }
}

/// Returns whether a resolved JSON value is truthy, matching the grammar's
/// truthiness rule: `null` and `false` are falsy, `0` and `0.0` are falsy,
/// an empty string is falsy, everything else is truthy.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(value) => *value,
        Value::Number(number) => number.as_f64().map_or(true, |value| value != 0.0),
        Value::String(value) => !value.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Compares two resolved values under `op`.
fn compare(left: &Value, op: CompareOp, right: &Value) -> Result<bool, ConditionError> {
    match op {
        CompareOp::Eq => Ok(values_equal(left, right)),
        CompareOp::Ne => Ok(!values_equal(left, right)),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => order(left, right, op),
    }
}

/// Numeric-coercing equality: a JSON number and an identical-valued JSON
/// number compare equal regardless of how each was produced; every other
/// comparison falls back to JSON structural equality.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(left), Value::Number(right)) => left.as_f64() == right.as_f64(),
        _ => left == right,
    }
}

/// Evaluates an ordering comparison, which is only defined between two
/// numbers or two strings.
fn order(left: &Value, right: &Value, op: CompareOp) -> Result<bool, ConditionError> {
    let ordering = match (left, right) {
        (Value::Number(left), Value::Number(right)) => match (left.as_f64(), right.as_f64()) {
            (Some(left), Some(right)) => left.partial_cmp(&right),
            _ => None,
        },
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        _ => None,
    };

    let Some(ordering) = ordering else {
        return Err(ConditionError::IncomparableTypes {
            left: describe_kind(left),
            right: describe_kind(right),
            op: op.to_string(),
        });
    };

    Ok(match op {
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::Le => ordering.is_le(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Ge => ordering.is_ge(),
        CompareOp::Eq | CompareOp::Ne => ordering.is_eq(),
    })
}

/// Renders a short type-kind label for an error message.
fn describe_kind(value: &Value) -> String {
    match value {
        Value::Null => "null".to_owned(),
        Value::Bool(_) => "bool".to_owned(),
        Value::Number(_) => "number".to_owned(),
        Value::String(_) => "string".to_owned(),
        Value::Array(_) => "array".to_owned(),
        Value::Object(_) => "object".to_owned(),
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

    use serde_json::json;

    use super::*;
    use crate::parser::parse;

    fn fields(value: Value) -> serde_json::Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn comparison_against_present_field_resolves() {
        let expr = parse("row['batch_count'] >= 3").expect("parses");
        let present = fields(json!({"batch_count": 5}));
        assert_eq!(evaluate(&expr, &present).expect("evaluates"), Tristate::True);

        let below = fields(json!({"batch_count": 1}));
        assert_eq!(evaluate(&expr, &below).expect("evaluates"), Tristate::False);
    }

    #[test]
    fn comparison_against_absent_field_is_unknown() {
        let expr = parse("row['batch_age_seconds'] > 30").expect("parses");
        let empty = fields(json!({}));
        assert_eq!(evaluate(&expr, &empty).expect("evaluates"), Tristate::Unknown);
    }

    #[test]
    fn and_short_circuits_to_false_even_with_an_unknown_side() {
        let expr = parse("row['missing'] > 30 and row['batch_count'] == 0").expect("parses");
        let data = fields(json!({"batch_count": 7}));
        assert_eq!(evaluate(&expr, &data).expect("evaluates"), Tristate::False);
    }

    #[test]
    fn or_short_circuits_to_true_even_with_an_unknown_side() {
        let expr = parse("row['missing'] > 30 or row['batch_count'] == 7").expect("parses");
        let data = fields(json!({"batch_count": 7}));
        assert_eq!(evaluate(&expr, &data).expect("evaluates"), Tristate::True);
    }

    #[test]
    fn truthy_check_on_bare_subscript() {
        let expr = parse("row['is_final']").expect("parses");
        assert_eq!(evaluate(&expr, &fields(json!({"is_final": true}))).expect("evaluates"), Tristate::True);
        assert_eq!(evaluate(&expr, &fields(json!({"is_final": false}))).expect("evaluates"), Tristate::False);
        assert_eq!(evaluate(&expr, &fields(json!({}))).expect("evaluates"), Tristate::Unknown);
    }

    #[test]
    fn ordering_rejects_incomparable_types() {
        let expr = parse("row['a'] > 'x'").expect("parses");
        let data = fields(json!({"a": true}));
        let err = evaluate(&expr, &data).expect_err("incomparable");
        assert!(matches!(err, ConditionError::IncomparableTypes { .. }));
    }

    #[test]
    fn string_ordering_is_lexicographic() {
        let expr = parse("row['status'] < 'pending'").expect("parses");
        let data = fields(json!({"status": "failed"}));
        assert_eq!(evaluate(&expr, &data).expect("evaluates"), Tristate::True);
    }
}
