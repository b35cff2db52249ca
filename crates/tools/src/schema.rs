//! Declarative parameter validation.
//!
//! Checks tool-call arguments against the JSON-Schema-like `parameters`
//! declaration before dispatch: required fields, primitive types, enums,
//! numeric bounds, string lengths, array item types, and nested objects.
//! Unknown fields are ignored.

use serde_json::Value;

/// Validate `params` against `schema`. Returns a list of human-readable
/// problems; empty means valid.
pub fn validate_params(params: &Value, schema: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    validate_object(params, schema, "", &mut errors);
    errors
}

fn validate_object(value: &Value, schema: &Value, path: &str, errors: &mut Vec<String>) {
    let properties = schema.get("properties").and_then(Value::as_object);
    let object = match value.as_object() {
        Some(object) => object,
        None => {
            errors.push(format!("{} should be object", display_name(path, "params")));
            return;
        }
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            let present = object.get(name).map(|v| !v.is_null()).unwrap_or(false);
            if !present {
                errors.push(format!("missing required {}", join_path(path, name)));
            }
        }
    }

    let properties = match properties {
        Some(properties) => properties,
        None => return,
    };
    for (name, field_schema) in properties {
        if let Some(field_value) = object.get(name) {
            if field_value.is_null() {
                continue;
            }
            validate_field(field_value, field_schema, &join_path(path, name), errors);
        }
    }
}

fn validate_field(value: &Value, schema: &Value, path: &str, errors: &mut Vec<String>) {
    let declared = schema.get("type").and_then(Value::as_str);

    match declared {
        Some("string") => {
            let s = match value.as_str() {
                Some(s) => s,
                None => {
                    errors.push(format!("{path} should be string"));
                    return;
                }
            };
            if let Some(min_len) = schema.get("minLength").and_then(Value::as_u64) {
                if (s.chars().count() as u64) < min_len {
                    errors.push(format!("{path} must be at least {min_len} chars"));
                }
            }
            if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
                let hit = allowed.iter().any(|v| v.as_str() == Some(s));
                if !hit {
                    let names: Vec<String> = allowed
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect();
                    errors.push(format!("{path} must be one of [{}]", names.join(", ")));
                }
            }
        }
        Some("integer") => {
            if !value.is_i64() && !value.is_u64() {
                errors.push(format!("{path} should be integer"));
                return;
            }
            check_bounds(value.as_f64().unwrap_or(0.0), schema, path, errors);
        }
        Some("number") => {
            let n = match value.as_f64() {
                Some(n) => n,
                None => {
                    errors.push(format!("{path} should be number"));
                    return;
                }
            };
            check_bounds(n, schema, path, errors);
        }
        Some("boolean") => {
            if !value.is_boolean() {
                errors.push(format!("{path} should be boolean"));
            }
        }
        Some("array") => {
            let items = match value.as_array() {
                Some(items) => items,
                None => {
                    errors.push(format!("{path} should be array"));
                    return;
                }
            };
            if let Some(item_schema) = schema.get("items") {
                for (idx, item) in items.iter().enumerate() {
                    validate_field(item, item_schema, &format!("{path}[{idx}]"), errors);
                }
            }
        }
        Some("object") => {
            validate_object(value, schema, path, errors);
        }
        _ => {}
    }
}

fn check_bounds(n: f64, schema: &Value, path: &str, errors: &mut Vec<String>) {
    if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
        if n < min {
            errors.push(format!("{path} must be >= {min}"));
        }
    }
    if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
        if n > max {
            errors.push(format!("{path} must be <= {max}"));
        }
    }
}

fn join_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_owned()
    } else {
        format!("{path}.{name}")
    }
}

fn display_name(path: &str, fallback: &str) -> String {
    if path.is_empty() {
        fallback.to_owned()
    } else {
        path.to_owned()
    }
}
