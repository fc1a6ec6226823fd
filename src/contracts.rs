//! Contract validation for agent-to-agent data flow.
//!
//! A contract constrains the output a node produces: required fields,
//! declared types from the closed [`FieldType`] set, numeric bounds, length
//! bounds, and an optional recursive structural schema. Checking never
//! short-circuits; every violation found is reported so callers get a
//! complete diagnostic in one pass.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{ContractDef, FieldSpec, SchemaSpec};
use crate::types::FieldType;

/// Outcome of checking one contract against one output payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContractOutcome {
    pub contract_id: String,
    pub source: String,
    pub violations: Vec<Violation>,
}

impl ContractOutcome {
    /// True when no violations were recorded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }
}

/// A single recorded contract violation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Violation {
    /// Dot-notation path of the offending field (`*` for whole-payload issues).
    pub field: String,
    pub expected: String,
    pub actual: String,
    pub message: String,
}

impl Violation {
    fn new(
        field: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            expected: expected.into(),
            actual: actual.into(),
            message: message.into(),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Stateless checker for node output contracts.
#[derive(Clone, Copy, Debug, Default)]
pub struct ContractValidator;

impl ContractValidator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Check a node's output payload against one contract.
    ///
    /// Returns an outcome carrying *all* violations found; an empty list
    /// means the contract holds. A non-object payload trips required-field
    /// and per-field checks immediately since fields cannot be resolved.
    #[must_use]
    pub fn check(&self, contract: &ContractDef, output: &Value) -> ContractOutcome {
        let mut violations = Vec::new();

        let fields = match output.as_object() {
            Some(map) => Some(map),
            None => {
                if !contract.required_fields.is_empty() || !contract.fields.is_empty() {
                    violations.push(Violation::new(
                        "*",
                        "object",
                        json_type_name(output),
                        "output must be an object for field validation",
                    ));
                }
                None
            }
        };

        if let Some(map) = fields {
            for name in &contract.required_fields {
                if !map.contains_key(name) {
                    violations.push(Violation::new(
                        name.clone(),
                        "present",
                        "missing",
                        format!("required field '{name}' is missing"),
                    ));
                }
            }

            // Deterministic report order regardless of map iteration order.
            let mut specs: Vec<(&String, &FieldSpec)> = contract.fields.iter().collect();
            specs.sort_by(|a, b| a.0.cmp(b.0));
            for (name, spec) in specs {
                let Some(value) = map.get(name) else {
                    continue; // presence is the required_fields list's concern
                };
                check_field(name, spec, value, &mut violations);
            }
        }

        if let Some(schema) = &contract.schema {
            check_schema(schema, output, "$", &mut violations);
        }

        ContractOutcome {
            contract_id: contract.id.clone(),
            source: contract.source.clone(),
            violations,
        }
    }
}

fn check_field(name: &str, spec: &FieldSpec, value: &Value, violations: &mut Vec<Violation>) {
    if let Some(expected) = spec.field_type
        && !expected.matches(value)
    {
        violations.push(Violation::new(
            name,
            expected.to_string(),
            json_type_name(value),
            format!(
                "field '{name}' expected type {expected}, got {}",
                json_type_name(value)
            ),
        ));
        // Bounds below assume the declared type; skip them on a mismatch.
        return;
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = spec.min
            && n < min
        {
            violations.push(Violation::new(
                name,
                format!(">= {min}"),
                n.to_string(),
                format!("field '{name}' value {n} is below minimum {min}"),
            ));
        }
        if let Some(max) = spec.max
            && n > max
        {
            violations.push(Violation::new(
                name,
                format!("<= {max}"),
                n.to_string(),
                format!("field '{name}' value {n} exceeds maximum {max}"),
            ));
        }
    }

    let len = match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        _ => None,
    };
    if let Some(len) = len {
        if let Some(min_len) = spec.min_length
            && len < min_len
        {
            violations.push(Violation::new(
                name,
                format!("length >= {min_len}"),
                len.to_string(),
                format!("field '{name}' length {len} is below minimum {min_len}"),
            ));
        }
        if let Some(max_len) = spec.max_length
            && len > max_len
        {
            violations.push(Violation::new(
                name,
                format!("length <= {max_len}"),
                len.to_string(),
                format!("field '{name}' length {len} exceeds maximum {max_len}"),
            ));
        }
    }
}

/// Recursive structural schema check, shared with the assertion engine's
/// `schema_valid` kind.
pub(crate) fn check_schema(
    schema: &SchemaSpec,
    value: &Value,
    path: &str,
    violations: &mut Vec<Violation>,
) {
    if let Some(expected) = schema.value_type
        && !expected.matches(value)
    {
        violations.push(Violation::new(
            path,
            expected.to_string(),
            json_type_name(value),
            format!("'{path}' expected {expected}, got {}", json_type_name(value)),
        ));
        return;
    }

    let implied_object = !schema.required.is_empty() || !schema.properties.is_empty();
    let Some(map) = value.as_object() else {
        if implied_object && schema.value_type.is_none() {
            violations.push(Violation::new(
                path,
                "object",
                json_type_name(value),
                format!("'{path}' expected object, got {}", json_type_name(value)),
            ));
        }
        return;
    };

    for name in &schema.required {
        if !map.contains_key(name) {
            violations.push(Violation::new(
                format!("{path}.{name}"),
                "present",
                "missing",
                format!("'{path}.{name}' is required"),
            ));
        }
    }

    let mut props: Vec<(&String, &SchemaSpec)> = schema.properties.iter().collect();
    props.sort_by(|a, b| a.0.cmp(b.0));
    for (name, child) in props {
        if let Some(value) = map.get(name) {
            check_schema(child, value, &format!("{path}.{name}"), violations);
        }
    }
}

/// Check an arbitrary value against a standalone schema (used by the
/// `schema_valid` assertion kind).
#[must_use]
pub fn check_value_against_schema(schema: &SchemaSpec, value: &Value) -> Vec<Violation> {
    let mut violations = Vec::new();
    check_schema(schema, value, "$", &mut violations);
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldSpec;
    use rustc_hash::FxHashMap;
    use serde_json::json;

    fn contract_with(
        required: &[&str],
        fields: Vec<(&str, FieldSpec)>,
        schema: Option<SchemaSpec>,
    ) -> ContractDef {
        ContractDef {
            id: "c1".into(),
            source: "n1".into(),
            required_fields: required.iter().map(|s| s.to_string()).collect(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            schema,
        }
    }

    #[test]
    fn reports_all_violations_not_just_first() {
        let contract = contract_with(
            &["confidence", "response"],
            vec![(
                "score",
                FieldSpec {
                    field_type: Some(FieldType::Number),
                    min: Some(0.0),
                    max: Some(1.0),
                    ..Default::default()
                },
            )],
            None,
        );
        let outcome = ContractValidator::new().check(&contract, &json!({"score": 3.5}));
        assert!(!outcome.is_ok());
        // missing confidence, missing response, score above max
        assert_eq!(outcome.violations.len(), 3);
    }

    #[test]
    fn missing_required_field_is_violation() {
        let contract = contract_with(&["confidence"], vec![], None);
        let outcome =
            ContractValidator::new().check(&contract, &json!({"response": "classified"}));
        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(outcome.violations[0].field, "confidence");
        assert_eq!(outcome.violations[0].actual, "missing");
    }

    #[test]
    fn type_mismatch_skips_bounds() {
        let contract = contract_with(
            &[],
            vec![(
                "count",
                FieldSpec {
                    field_type: Some(FieldType::Number),
                    min: Some(10.0),
                    ..Default::default()
                },
            )],
            None,
        );
        let outcome = ContractValidator::new().check(&contract, &json!({"count": "five"}));
        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(outcome.violations[0].expected, "number");
    }

    #[test]
    fn length_bounds_apply_to_strings_and_arrays() {
        let contract = contract_with(
            &[],
            vec![
                (
                    "tag",
                    FieldSpec {
                        min_length: Some(3),
                        ..Default::default()
                    },
                ),
                (
                    "items",
                    FieldSpec {
                        max_length: Some(2),
                        ..Default::default()
                    },
                ),
            ],
            None,
        );
        let outcome =
            ContractValidator::new().check(&contract, &json!({"tag": "ab", "items": [1, 2, 3]}));
        assert_eq!(outcome.violations.len(), 2);
    }

    #[test]
    fn non_object_output_fails_field_checks() {
        let contract = contract_with(&["x"], vec![], None);
        let outcome = ContractValidator::new().check(&contract, &json!("just a string"));
        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(outcome.violations[0].field, "*");
    }

    #[test]
    fn nested_schema_violations_carry_paths() {
        let mut props = FxHashMap::default();
        props.insert(
            "meta".to_string(),
            SchemaSpec {
                required: vec!["source".to_string()],
                ..Default::default()
            },
        );
        let schema = SchemaSpec {
            value_type: Some(FieldType::Object),
            required: vec!["meta".to_string()],
            properties: props,
        };
        let violations =
            check_value_against_schema(&schema, &json!({"meta": {"other": true}}));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "$.meta.source");
    }

    #[test]
    fn clean_output_passes() {
        let contract = contract_with(
            &["response"],
            vec![(
                "confidence",
                FieldSpec {
                    field_type: Some(FieldType::Number),
                    min: Some(0.0),
                    max: Some(1.0),
                    ..Default::default()
                },
            )],
            None,
        );
        let outcome = ContractValidator::new()
            .check(&contract, &json!({"response": "hi", "confidence": 0.92}));
        assert!(outcome.is_ok());
    }
}
