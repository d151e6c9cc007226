//! Payload validation against a [`Shape`].
//!
//! Validation walks the whole value and collects every violation instead of
//! stopping at the first one. A payload is either accepted as a whole, in
//! which case the normalized value is returned, or rejected as a whole.
//!
//! Normalization drops optional fields that are `null` and strips unknown
//! fields of open objects; nothing else is coerced.

use crate::shape::{NumberRules, ObjectShape, Shape, StringRules};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

/// One field-level problem, addressed by a JSON path such as `$.todos[0].id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

/// All violations found in a rejected payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationFailure {
    pub violations: Vec<Violation>,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.violations.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", v.path, v.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationFailure {}

/// Normalized value on success, every violation on failure.
pub type ValidationResult = std::result::Result<Value, ValidationFailure>;

/// Check `value` against `shape`.
pub fn validate(shape: &Shape, value: &Value) -> ValidationResult {
    let mut violations = Vec::new();
    let normalized = check(shape, value, "$", &mut violations);

    if violations.is_empty() {
        Ok(normalized)
    } else {
        Err(ValidationFailure { violations })
    }
}

fn check(shape: &Shape, value: &Value, path: &str, out: &mut Vec<Violation>) -> Value {
    match shape {
        Shape::Any => value.clone(),
        Shape::Bool => {
            if !value.is_boolean() {
                mismatch("boolean", value, path, out);
            }
            value.clone()
        }
        Shape::Number(rules) => {
            check_number(rules, value, path, out);
            value.clone()
        }
        Shape::String(rules) => {
            check_string(rules, value, path, out);
            value.clone()
        }
        Shape::Array { items } => match value.as_array() {
            Some(elements) => Value::Array(
                elements
                    .iter()
                    .enumerate()
                    .map(|(i, element)| check(items, element, &format!("{}[{}]", path, i), out))
                    .collect(),
            ),
            None => {
                mismatch("array", value, path, out);
                value.clone()
            }
        },
        Shape::Record { values } => match value.as_object() {
            Some(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(key, entry)| {
                        let checked = check(values, entry, &format!("{}.{}", path, key), out);
                        (key.clone(), checked)
                    })
                    .collect(),
            ),
            None => {
                mismatch("object", value, path, out);
                value.clone()
            }
        },
        Shape::Object(object) => check_object(object, value, path, out),
    }
}

fn check_object(object: &ObjectShape, value: &Value, path: &str, out: &mut Vec<Violation>) -> Value {
    let Some(entries) = value.as_object() else {
        mismatch("object", value, path, out);
        return value.clone();
    };

    let mut normalized = Map::new();

    for field in &object.fields {
        let field_path = format!("{}.{}", path, field.name);
        match entries.get(&field.name) {
            Some(Value::Null) if !field.required => {}
            Some(entry) => {
                normalized.insert(field.name.clone(), check(&field.shape, entry, &field_path, out));
            }
            None if field.required => out.push(Violation {
                path: field_path,
                message: "is required".to_string(),
            }),
            None => {}
        }
    }

    if object.strict {
        for key in entries.keys() {
            if object.get(key).is_none() {
                out.push(Violation {
                    path: format!("{}.{}", path, key),
                    message: "unknown field".to_string(),
                });
            }
        }
    }

    Value::Object(normalized)
}

fn check_number(rules: &NumberRules, value: &Value, path: &str, out: &mut Vec<Violation>) {
    let Some(number) = value.as_f64() else {
        mismatch("number", value, path, out);
        return;
    };

    if rules.integer && !(value.is_i64() || value.is_u64() || number.fract() == 0.0) {
        out.push(Violation {
            path: path.to_string(),
            message: "must be an integer".to_string(),
        });
    }
    if let Some(min) = rules.min {
        if number < min {
            out.push(Violation {
                path: path.to_string(),
                message: format!("must be greater than or equal to {}", min),
            });
        }
    }
    if let Some(max) = rules.max {
        if number > max {
            out.push(Violation {
                path: path.to_string(),
                message: format!("must be less than or equal to {}", max),
            });
        }
    }
}

fn check_string(rules: &StringRules, value: &Value, path: &str, out: &mut Vec<Violation>) {
    let Some(text) = value.as_str() else {
        mismatch("string", value, path, out);
        return;
    };

    let len = text.chars().count();
    if let Some(min) = rules.min_len {
        if len < min {
            out.push(Violation {
                path: path.to_string(),
                message: format!("must be at least {} characters", min),
            });
        }
    }
    if let Some(max) = rules.max_len {
        if len > max {
            out.push(Violation {
                path: path.to_string(),
                message: format!("must be at most {} characters", max),
            });
        }
    }
    if let Some(allowed) = &rules.one_of {
        if !allowed.iter().any(|a| a == text) {
            out.push(Violation {
                path: path.to_string(),
                message: format!("must be one of: {}", allowed.join(", ")),
            });
        }
    }
}

fn mismatch(expected: &str, value: &Value, path: &str, out: &mut Vec<Violation>) {
    out.push(Violation {
        path: path.to_string(),
        message: format!("expected {}, got {}", expected, value_kind(value)),
    });
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn todo_shape() -> Shape {
        Shape::object()
            .field("id", Shape::string())
            .field("title", Shape::string())
            .field("completed", Shape::bool())
            .field("createdAt", Shape::string())
            .into()
    }

    fn paths(failure: &ValidationFailure) -> Vec<&str> {
        failure.violations.iter().map(|v| v.path.as_str()).collect()
    }

    #[test]
    fn test_valid_object_passes_unchanged() {
        let value = json!({"id": "1", "title": "Buy milk", "completed": false, "createdAt": "now"});
        assert_eq!(validate(&todo_shape(), &value).unwrap(), value);
    }

    #[test]
    fn test_strict_object_rejects_unknown_fields() {
        let shape: Shape = Shape::object().field("title", Shape::string()).into();
        let failure = validate(&shape, &json!({"title": "a", "extra": 1})).unwrap_err();

        assert_eq!(paths(&failure), vec!["$.extra"]);
        assert_eq!(failure.violations[0].message, "unknown field");
    }

    #[test]
    fn test_open_object_strips_unknown_fields() {
        let shape: Shape = Shape::object().field("title", Shape::string()).open().into();
        let normalized = validate(&shape, &json!({"title": "a", "extra": 1})).unwrap();

        assert_eq!(normalized, json!({"title": "a"}));
    }

    #[test]
    fn test_string_length_bounds() {
        let shape: Shape = Shape::object()
            .field("title", Shape::string().min_len(1).max_len(5))
            .into();

        let failure = validate(&shape, &json!({"title": ""})).unwrap_err();
        assert_eq!(failure.violations[0].message, "must be at least 1 characters");

        let failure = validate(&shape, &json!({"title": "toolong"})).unwrap_err();
        assert_eq!(failure.violations[0].message, "must be at most 5 characters");

        // Multi-byte characters count once
        assert!(validate(&shape, &json!({"title": "ñññññ"})).is_ok());
    }

    #[test]
    fn test_enumeration() {
        let shape = Shape::enumeration(["all", "completed", "pending"]);
        assert!(validate(&shape, &json!("pending")).is_ok());

        let failure = validate(&shape, &json!("archived")).unwrap_err();
        assert_eq!(
            failure.violations[0].message,
            "must be one of: all, completed, pending"
        );
    }

    #[test]
    fn test_optional_fields_and_null() {
        let shape: Shape = Shape::object()
            .optional("limit", Shape::integer().min(0.0))
            .optional("offset", Shape::integer().min(0.0))
            .into();

        assert_eq!(validate(&shape, &json!({})).unwrap(), json!({}));
        assert_eq!(
            validate(&shape, &json!({"limit": null, "offset": 5})).unwrap(),
            json!({"offset": 5})
        );

        let failure = validate(&shape, &json!({"limit": 1.5, "offset": -1})).unwrap_err();
        assert_eq!(paths(&failure), vec!["$.limit", "$.offset"]);
    }

    #[test]
    fn test_missing_required_field() {
        let failure = validate(&todo_shape(), &json!({"id": "1"})).unwrap_err();
        assert_eq!(
            paths(&failure),
            vec!["$.title", "$.completed", "$.createdAt"]
        );
        assert!(failure.violations.iter().all(|v| v.message == "is required"));
    }

    #[test]
    fn test_nested_paths_in_arrays_and_records() {
        let shape: Shape = Shape::object()
            .field("todos", Shape::array(todo_shape()))
            .field("greeting", Shape::record(Shape::string()))
            .into();
        let value = json!({
            "todos": [
                {"id": "1", "title": "a", "completed": false, "createdAt": "x"},
                {"id": 2, "title": "b", "completed": "no", "createdAt": "y"}
            ],
            "greeting": {"en": "Hello", "fr": 3}
        });

        let failure = validate(&shape, &value).unwrap_err();
        assert_eq!(
            paths(&failure),
            vec!["$.todos[1].id", "$.todos[1].completed", "$.greeting.fr"]
        );
        assert_eq!(failure.violations[0].message, "expected string, got number");
    }

    #[test]
    fn test_top_level_type_mismatch() {
        let failure = validate(&todo_shape(), &json!("nope")).unwrap_err();
        assert_eq!(failure.to_string(), "$: expected object, got string");
    }

    #[test]
    fn test_any_accepts_everything() {
        let shape: Shape = Shape::object().optional("data", Shape::any()).into();
        let value = json!({"data": {"title": [1, 2, {"x": null}]}});
        assert_eq!(validate(&shape, &value).unwrap(), value);
    }
}
