// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Structural validation of tool arguments against a tool's JSON schema.
//!
//! Arguments arrive from the model as untyped JSON.  Before a call is
//! dispatched, the argument object is checked against the declared parameter
//! schema; a mismatch surfaces as an `invalid_args` tool error rather than a
//! panic inside the tool.  Covers the subset of JSON Schema that tool
//! schemas actually use: `type`, `required`, `properties`, `enum`, and
//! `items` for arrays.

use serde_json::Value;

/// Validate `args` against `schema`.  Returns a human-readable description
/// of the first violation found.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    validate_value(schema, args, "$")
}

fn validate_value(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    if let Some(allowed) = schema.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(value) {
            return Err(format!("{path}: value not in enum"));
        }
        return Ok(());
    }

    let Some(expected) = schema.get("type").and_then(|t| t.as_str()) else {
        return Ok(()); // untyped schema accepts anything
    };

    match expected {
        "object" => {
            let Some(obj) = value.as_object() else {
                return Err(format!("{path}: expected object"));
            };
            if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
                for field in required.iter().filter_map(|f| f.as_str()) {
                    if !obj.contains_key(field) {
                        return Err(format!("{path}: missing required field '{field}'"));
                    }
                }
            }
            if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
                for (key, sub_schema) in props {
                    if let Some(sub_value) = obj.get(key) {
                        validate_value(sub_schema, sub_value, &format!("{path}.{key}"))?;
                    }
                }
            }
            Ok(())
        }
        "array" => {
            let Some(items) = value.as_array() else {
                return Err(format!("{path}: expected array"));
            };
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    validate_value(item_schema, item, &format!("{path}[{i}]"))?;
                }
            }
            Ok(())
        }
        "string" if value.is_string() => Ok(()),
        "number" if value.is_number() => Ok(()),
        "integer" if value.is_i64() || value.is_u64() => Ok(()),
        "boolean" if value.is_boolean() => Ok(()),
        "null" if value.is_null() => Ok(()),
        other => Err(format!("{path}: expected {other}")),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
