// crates/pw-core/src/core/schema.rs
// ============================================================================
// Module: Schema Contract
// Description: Field-set/type contracts pinned to edges, and the
// producer/consumer compatibility check run at DAG construction (§4.2).
// Purpose: Catch wiring mistakes (missing fields, type mismatches, forbidden
// extras) before a run starts, rather than mid-pipeline.
// Dependencies: serde, crate::core::model::SchemaMode
// ============================================================================

//! ## Overview
//! A [`SchemaContract`] describes the field set flowing across an edge under
//! one of four [`SchemaMode`]s. [`check_compatibility`] runs once per edge at
//! DAG construction and never again at runtime: every row that later crosses
//! that edge is already known to satisfy it.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::core::model::SchemaMode;

// ============================================================================
// SECTION: Field Type
// ============================================================================

/// A field's declared type.
///
/// # Invariants
/// - [`FieldType::accepts`] is the sole source of coercion truth; no other
///   code compares field types directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// A UTF-8 string.
    String,
    /// A signed integer.
    Int,
    /// A floating-point number.
    Float,
    /// A boolean.
    Bool,
    /// Accepts a producer field of any type.
    Any,
    /// Accepts a producer field matching any of the listed variants.
    Union(Vec<FieldType>),
    /// Accepts a producer field matching the inner type, or its absence.
    Optional(Box<FieldType>),
}

impl FieldType {
    /// Returns whether a field declared as `self` (the consumer's expected
    /// type) accepts a producer field declared as `producer`.
    ///
    /// Numeric coercion (`int` → `float`) is permitted unless `strict` is
    /// set, matching §4.2's strict-mode rule that forbids it.
    #[must_use]
    pub fn accepts(&self, producer: &FieldType, strict: bool) -> bool {
        match self {
            Self::Any => true,
            Self::Union(variants) => variants.iter().any(|variant| variant.accepts(producer, strict)),
            Self::Optional(inner) => inner.accepts(producer, strict),
            Self::Float => matches!(producer, Self::Float) || (!strict && matches!(producer, Self::Int)),
            Self::Int => matches!(producer, Self::Int),
            Self::String => matches!(producer, Self::String),
            Self::Bool => matches!(producer, Self::Bool),
        }
    }
}

// ============================================================================
// SECTION: Field Spec
// ============================================================================

/// One field declared by a schema contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name.
    pub name: String,
    /// Declared type.
    pub field_type: FieldType,
    /// Whether a producer must supply this field.
    pub required: bool,
}

// ============================================================================
// SECTION: Schema Contract
// ============================================================================

/// Describes the field set that passes between plugins on an edge (§4.2).
///
/// # Invariants
/// - `required_input_fields` of `Some(vec![])` is an explicit opt-out, not
///   an unset value; callers must distinguish it from `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaContract {
    /// Which of the four schema modes this contract operates under.
    pub mode: SchemaMode,
    /// Declared fields.
    pub fields: Vec<FieldSpec>,
    /// Whether fields not declared here are tolerated on the producer side.
    pub allow_extra_fields: bool,
    /// Whether strict mode is in effect (forbids numeric coercion).
    pub strict: bool,
    /// Declared input-field dependencies for templates with row references.
    /// `Some(vec![])` is an explicit opt-out; `None` means undeclared.
    pub required_input_fields: Option<Vec<String>>,
}

impl SchemaContract {
    /// Returns the field spec with the given name, if declared.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }
}

// ============================================================================
// SECTION: Compatibility Report
// ============================================================================

/// The result of checking a producer contract against a consumer contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityReport {
    /// Whether the producer satisfies the consumer's contract.
    pub compatible: bool,
    /// Fields the consumer requires that the producer does not supply.
    pub missing_fields: Vec<String>,
    /// Fields present on both sides whose types are incompatible, as
    /// `(field_name, expected, actual)`.
    pub type_mismatches: Vec<(String, FieldType, FieldType)>,
    /// Producer fields not declared by the consumer, reported only when the
    /// consumer forbids extras.
    pub extra_fields: Vec<String>,
}

/// Checks a producer contract against a consumer contract (§4.2).
///
/// `Dynamic` consumers accept any producer. `Observed` consumers are pinned
/// from the producer at construction time and are always compatible with
/// it by definition. `Fixed` and `Free` consumers are checked field by
/// field, with numeric coercion permitted unless the consumer is strict.
#[must_use]
pub fn check_compatibility(producer: &SchemaContract, consumer: &SchemaContract) -> CompatibilityReport {
    match consumer.mode {
        SchemaMode::Dynamic | SchemaMode::Observed => CompatibilityReport {
            compatible: true,
            missing_fields: Vec::new(),
            type_mismatches: Vec::new(),
            extra_fields: Vec::new(),
        },
        SchemaMode::Fixed | SchemaMode::Free => check_fixed_or_free(producer, consumer),
    }
}

/// Field-by-field check shared by `Fixed` and `Free` consumer contracts.
fn check_fixed_or_free(producer: &SchemaContract, consumer: &SchemaContract) -> CompatibilityReport {
    let mut missing_fields = Vec::new();
    let mut type_mismatches = Vec::new();

    for field in &consumer.fields {
        match producer.field(&field.name) {
            Some(producer_field) => {
                if !field.field_type.accepts(&producer_field.field_type, consumer.strict) {
                    type_mismatches.push((
                        field.name.clone(),
                        field.field_type.clone(),
                        producer_field.field_type.clone(),
                    ));
                }
            }
            None if field.required => missing_fields.push(field.name.clone()),
            None => {}
        }
    }

    let extra_fields = if consumer.allow_extra_fields {
        Vec::new()
    } else {
        let declared: BTreeSet<&str> = consumer.fields.iter().map(|field| field.name.as_str()).collect();
        producer
            .fields
            .iter()
            .map(|field| field.name.as_str())
            .filter(|name| !declared.contains(name))
            .map(ToOwned::to_owned)
            .collect()
    };

    let compatible = missing_fields.is_empty() && type_mismatches.is_empty() && extra_fields.is_empty();

    CompatibilityReport { compatible, missing_fields, type_mismatches, extra_fields }
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

    fn field(name: &str, field_type: FieldType, required: bool) -> FieldSpec {
        FieldSpec { name: name.to_owned(), field_type, required }
    }

    #[test]
    fn dynamic_consumer_accepts_anything() {
        let producer = SchemaContract {
            mode: SchemaMode::Fixed,
            fields: vec![field("a", FieldType::String, true)],
            allow_extra_fields: false,
            strict: false,
            required_input_fields: None,
        };
        let consumer = SchemaContract {
            mode: SchemaMode::Dynamic,
            fields: vec![],
            allow_extra_fields: true,
            strict: false,
            required_input_fields: None,
        };
        assert!(check_compatibility(&producer, &consumer).compatible);
    }

    #[test]
    fn missing_required_field_is_reported() {
        let producer = SchemaContract {
            mode: SchemaMode::Fixed,
            fields: vec![],
            allow_extra_fields: true,
            strict: false,
            required_input_fields: None,
        };
        let consumer = SchemaContract {
            mode: SchemaMode::Fixed,
            fields: vec![field("needed", FieldType::String, true)],
            allow_extra_fields: true,
            strict: false,
            required_input_fields: None,
        };
        let report = check_compatibility(&producer, &consumer);
        assert!(!report.compatible);
        assert_eq!(report.missing_fields, vec!["needed".to_owned()]);
    }

    #[test]
    fn int_to_float_coercion_permitted_unless_strict() {
        let producer = SchemaContract {
            mode: SchemaMode::Fixed,
            fields: vec![field("n", FieldType::Int, true)],
            allow_extra_fields: true,
            strict: false,
            required_input_fields: None,
        };
        let lenient_consumer = SchemaContract {
            mode: SchemaMode::Fixed,
            fields: vec![field("n", FieldType::Float, true)],
            allow_extra_fields: true,
            strict: false,
            required_input_fields: None,
        };
        assert!(check_compatibility(&producer, &lenient_consumer).compatible);

        let strict_consumer =
            SchemaContract { strict: true, ..lenient_consumer };
        let report = check_compatibility(&producer, &strict_consumer);
        assert!(!report.compatible);
        assert_eq!(report.type_mismatches.len(), 1);
    }

    #[test]
    fn extra_fields_reported_only_when_forbidden() {
        let producer = SchemaContract {
            mode: SchemaMode::Fixed,
            fields: vec![field("a", FieldType::String, true), field("b", FieldType::String, true)],
            allow_extra_fields: true,
            strict: false,
            required_input_fields: None,
        };
        let strict_consumer = SchemaContract {
            mode: SchemaMode::Fixed,
            fields: vec![field("a", FieldType::String, true)],
            allow_extra_fields: false,
            strict: false,
            required_input_fields: None,
        };
        let report = check_compatibility(&producer, &strict_consumer);
        assert!(!report.compatible);
        assert_eq!(report.extra_fields, vec!["b".to_owned()]);

        let lenient_consumer = SchemaContract { allow_extra_fields: true, ..strict_consumer };
        assert!(check_compatibility(&producer, &lenient_consumer).compatible);
    }

    #[test]
    fn union_accepts_any_matching_variant() {
        let expected = FieldType::Union(vec![FieldType::String, FieldType::Int]);
        assert!(expected.accepts(&FieldType::Int, true));
        assert!(expected.accepts(&FieldType::String, true));
        assert!(!expected.accepts(&FieldType::Bool, true));
    }

    #[test]
    fn any_accepts_every_producer_type() {
        assert!(FieldType::Any.accepts(&FieldType::Bool, true));
        assert!(FieldType::Any.accepts(&FieldType::String, false));
    }
}
