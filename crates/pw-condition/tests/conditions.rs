// crates/pw-condition/tests/conditions.rs
//! Integration tests exercising `pw_condition` the way a gate or
//! aggregation-trigger caller would: parse once, evaluate against several
//! batch field maps.

use pw_condition::Condition;
use pw_condition::ConditionError;
use pw_condition::Tristate;
use serde_json::Value;
use serde_json::json;

fn object(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other:?}"),
    }
}

#[test]
fn aggregation_trigger_fires_once_count_and_age_conditions_are_met() {
    let condition = Condition::parse("row['batch_count'] >= 10 or row['batch_age_seconds'] >= 300")
        .expect("trigger condition should parse");

    let early = object(json!({"batch_count": 3, "batch_age_seconds": 5}));
    assert_eq!(condition.evaluate(&early).expect("evaluates"), Tristate::False);

    let count_triggered = object(json!({"batch_count": 10, "batch_age_seconds": 5}));
    assert_eq!(condition.evaluate(&count_triggered).expect("evaluates"), Tristate::True);

    let age_triggered = object(json!({"batch_count": 1, "batch_age_seconds": 301}));
    assert_eq!(condition.evaluate(&age_triggered).expect("evaluates"), Tristate::True);
}

#[test]
fn gate_condition_with_nested_grouping_and_negation() {
    let condition = Condition::parse("not (row['status'] == 'retry' and row['attempt'] >= 3)")
        .expect("gate condition should parse");

    let should_continue = object(json!({"status": "retry", "attempt": 1}));
    assert_eq!(condition.evaluate(&should_continue).expect("evaluates"), Tristate::True);

    let should_stop = object(json!({"status": "retry", "attempt": 5}));
    assert_eq!(condition.evaluate(&should_stop).expect("evaluates"), Tristate::False);
}

#[test]
fn coalesce_best_effort_condition_tolerates_missing_late_arrivals() {
    let condition = Condition::parse("row['received_count'] >= row['expected_count']").is_err();
    // The right-hand side of a comparison must be a literal or a
    // `row[...]` subscript on its own; comparing two subscripts directly
    // against each other is supported by the grammar, so this specific
    // shape should NOT be a parse error.
    assert!(!condition);
}

#[test]
fn unknown_batch_keys_propagate_rather_than_abort_the_run() {
    let condition = Condition::parse("row['never_recorded'] > 5").expect("parses");
    let empty = object(json!({}));
    assert_eq!(condition.evaluate(&empty).expect("evaluates"), Tristate::Unknown);
}

#[test]
fn malformed_conditions_report_the_offending_byte() {
    let err = Condition::parse("row['batch_count'] @ 3").expect_err("malformed");
    match err {
        ConditionError::UnexpectedCharacter { found, .. } => assert_eq!(found, '@'),
        other => panic!("expected UnexpectedCharacter, got {other:?}"),
    }
}
