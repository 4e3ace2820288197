//! Argument validation against a tool's declared input schema.
//!
//! This is a structural check of the top level of the arguments object:
//! required fields, JSON types, `enum` membership and
//! `additionalProperties: false`. Deeper validation is left to the server.

use serde_json::Value;

use super::errors::McpError;
use super::types::truncate_text;

/// Validate `arguments` against `schema` for tool `tool`.
///
/// `null` arguments are treated as an empty object.
pub fn validate_arguments(tool: &str, schema: &Value, arguments: &Value) -> Result<(), McpError> {
    let empty = serde_json::Map::new();
    let args = match arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        Value::String(raw) => {
            return Err(invalid(
                tool,
                format!("arguments are not valid JSON: {}", truncate_text(raw, 200)),
            ))
        }
        other => {
            return Err(invalid(
                tool,
                format!("arguments must be a JSON object, got {}", type_name(other)),
            ))
        }
    };

    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if !args.contains_key(field) {
                return Err(invalid(tool, format!("missing required field: '{field}'")));
            }
        }
    }

    let properties = schema.get("properties").and_then(|p| p.as_object());

    if let Some(properties) = properties {
        for (key, value) in args {
            let Some(prop) = properties.get(key) else {
                continue;
            };
            if let Some(expected) = prop.get("type") {
                if !matches_declared_type(value, expected) {
                    return Err(invalid(
                        tool,
                        format!(
                            "field '{key}' expected {}, got {}",
                            describe_type(expected),
                            type_name(value)
                        ),
                    ));
                }
            }
            if let Some(allowed) = prop.get("enum").and_then(|e| e.as_array()) {
                if !allowed.contains(value) {
                    return Err(invalid(tool, format!("field '{key}' must be one of {}", Value::Array(allowed.clone()))));
                }
            }
        }
    }

    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
        let known = |k: &str| properties.map(|p| p.contains_key(k)).unwrap_or(false);
        if let Some(extra) = args.keys().find(|k| !known(k)) {
            return Err(invalid(tool, format!("unexpected field: '{extra}'")));
        }
    }

    Ok(())
}

fn invalid(tool: &str, reason: String) -> McpError {
    McpError::InvalidArguments {
        tool: tool.to_string(),
        reason,
    }
}

/// `type` may be a single name or a list of names.
fn matches_declared_type(value: &Value, expected: &Value) -> bool {
    match expected {
        Value::String(name) => matches_type(value, name),
        Value::Array(names) => names
            .iter()
            .filter_map(|n| n.as_str())
            .any(|n| matches_type(value, n)),
        _ => true,
    }
}

fn matches_type(value: &Value, name: &str) -> bool {
    match name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)
        }
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unknown type keywords are not ours to enforce.
        _ => true,
    }
}

fn describe_type(expected: &Value) -> String {
    match expected {
        Value::String(name) => name.clone(),
        Value::Array(names) => names
            .iter()
            .filter_map(|n| n.as_str())
            .collect::<Vec<_>>()
            .join(" | "),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
