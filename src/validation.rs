//! Schema validation helpers.
//!
//! Validates a JSON object against a [`Schema`] and reports every problem as a
//! [`Diagnostic`] pointing at the offending attribute.
//!
//! # Example
//!
//! ```
//! use hemmer_provider_freeipa::schema::{Attribute, Schema};
//! use hemmer_provider_freeipa::validation::validate;
//! use serde_json::json;
//!
//! let schema = Schema::v0()
//!     .with_attribute("fqdn", Attribute::required_string())
//!     .with_attribute("random", Attribute::optional_bool());
//!
//! assert!(validate(&schema, &json!({"fqdn": "a.test", "random": true})).is_empty());
//!
//! let diagnostics = validate(&schema, &json!({"fqdn": "a.test", "random": "yes"}));
//! assert_eq!(diagnostics.len(), 1);
//! assert_eq!(diagnostics[0].attribute, Some("random".to_string()));
//! ```

use crate::schema::{Attribute, AttributeType, Diagnostic, Schema};
use serde_json::Value;

/// Validate a JSON value against a schema.
///
/// - Required attributes must be present and non-null
/// - Optional attributes may be absent or null
/// - Computed-only attributes are skipped (the provider sets these)
/// - Attribute types must match the schema
pub fn validate(schema: &Schema, value: &Value) -> Vec<Diagnostic> {
    let obj = match value {
        Value::Object(map) => map,
        // A null config is treated as an empty object.
        Value::Null => return missing_required(schema),
        other => {
            return vec![Diagnostic::error("Expected object")
                .with_detail(format!("Got {}", value_type_name(other)))]
        },
    };

    let mut diagnostics = Vec::new();
    for (name, attr) in &schema.block.attributes {
        validate_attribute(name, attr, obj.get(name), &mut diagnostics);
    }
    diagnostics
}

/// Validate a JSON value against a schema, returning Ok if valid or Err with diagnostics.
pub fn validate_result(schema: &Schema, value: &Value) -> Result<(), Vec<Diagnostic>> {
    let diagnostics = validate(schema, value);
    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(diagnostics)
    }
}

fn missing_required(schema: &Schema) -> Vec<Diagnostic> {
    schema
        .block
        .attributes
        .iter()
        .filter(|(_, attr)| attr.flags.required)
        .map(|(name, _)| missing_attribute(name))
        .collect()
}

fn validate_attribute(
    name: &str,
    attr: &Attribute,
    value: Option<&Value>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if attr.flags.computed && !attr.flags.optional && !attr.flags.required {
        return;
    }

    match value {
        None | Some(Value::Null) => {
            if attr.flags.required {
                diagnostics.push(missing_attribute(name));
            }
        },
        Some(v) => {
            if !type_matches(attr.attr_type, v) {
                diagnostics.push(type_error(name, attr.attr_type, v));
            }
        },
    }
}

fn type_matches(attr_type: AttributeType, value: &Value) -> bool {
    match attr_type {
        AttributeType::String => value.is_string(),
        AttributeType::Bool => value.is_boolean(),
        AttributeType::Int64 => is_int64(value),
    }
}

fn is_int64(value: &Value) -> bool {
    match value {
        Value::Number(n) if n.is_i64() => true,
        Value::Number(n) => n
            .as_f64()
            .map(|f| f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64)
            .unwrap_or(false),
        _ => false,
    }
}

fn missing_attribute(name: &str) -> Diagnostic {
    Diagnostic::error(format!("Missing required attribute '{}'", name))
        .with_detail("This attribute is required and must be provided")
        .with_attribute(name)
}

fn type_error(name: &str, expected: AttributeType, got: &Value) -> Diagnostic {
    let expected = match expected {
        AttributeType::String => "string",
        AttributeType::Int64 => "int64",
        AttributeType::Bool => "bool",
    };
    Diagnostic::error(format!("Invalid type for attribute '{}'", name))
        .with_detail(format!("Expected {}, got {}", expected, value_type_name(got)))
        .with_attribute(name)
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
