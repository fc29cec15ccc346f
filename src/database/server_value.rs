use serde_json::{json, Map, Number, Value};

use crate::database::core::snap::{LeafValue, Node};
use crate::database::error::{invalid_argument, DatabaseResult};

/// Placeholder replaced by the server's clock when the write is applied.
pub fn server_timestamp() -> Value {
    json!({ ".sv": "timestamp" })
}

/// Placeholder that atomically adds `delta` to the stored number (or to zero
/// when the stored value is not a number).
pub fn increment(delta: f64) -> Value {
    json!({
        ".sv": {
            "increment": delta,
        }
    })
}

fn contains_server_value(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.contains_key(".sv") || map.values().any(contains_server_value),
        Value::Array(items) => items.iter().any(contains_server_value),
        _ => false,
    }
}

/// Replaces every placeholder in `value` with the value it stands for.
///
/// `existing` is the currently visible value at the same location and feeds
/// `increment`; `server_time_ms` feeds `timestamp`.
pub fn resolve_deferred_value(value: &Value, existing: &Node, server_time_ms: i64) -> DatabaseResult<Value> {
    if !contains_server_value(value) {
        return Ok(value.clone());
    }
    resolve_value(value, existing, server_time_ms)
}

fn resolve_value(value: &Value, existing: &Node, server_time_ms: i64) -> DatabaseResult<Value> {
    match value {
        Value::Object(map) => {
            if let Some(placeholder) = map.get(".sv") {
                return resolve_placeholder(placeholder, existing, server_time_ms);
            }
            let mut resolved = Map::with_capacity(map.len());
            for (key, child) in map {
                let child_existing = if key.starts_with('.') {
                    Node::empty()
                } else {
                    existing.immediate_child(key)
                };
                resolved.insert(
                    key.clone(),
                    resolve_value(child, &child_existing, server_time_ms)?,
                );
            }
            Ok(Value::Object(resolved))
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(index, child)| {
                resolve_value(child, &existing.immediate_child(&index.to_string()), server_time_ms)
            })
            .collect::<DatabaseResult<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

fn resolve_placeholder(placeholder: &Value, existing: &Node, server_time_ms: i64) -> DatabaseResult<Value> {
    match placeholder {
        Value::String(token) if token == "timestamp" => Ok(Value::Number(Number::from(server_time_ms))),
        Value::Object(spec) => {
            let delta = spec
                .get("increment")
                .ok_or_else(|| invalid_argument("Unsupported server value placeholder"))?
                .as_f64()
                .ok_or_else(|| invalid_argument("ServerValue.increment delta must be numeric"))?;
            let base = match existing.leaf_value() {
                Some(LeafValue::Number(number)) => *number,
                _ => 0.0,
            };
            number_value(base + delta)
        }
        _ => Err(invalid_argument("Unsupported server value placeholder")),
    }
}

fn number_value(total: f64) -> DatabaseResult<Value> {
    if total.fract() == 0.0 && total.abs() < 9.007_199_254_740_992e15 {
        return Ok(Value::Number(Number::from(total as i64)));
    }
    Number::from_f64(total)
        .map(Value::Number)
        .ok_or_else(|| invalid_argument("ServerValue.increment produced an invalid number"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_uses_given_server_time() {
        let resolved = resolve_deferred_value(
            &json!({ "at": server_timestamp(), "name": "x" }),
            &Node::empty(),
            1_700_000_000_000,
        )
        .unwrap();
        assert_eq!(resolved, json!({ "at": 1_700_000_000_000i64, "name": "x" }));
    }

    #[test]
    fn increment_adds_to_existing_number() {
        let existing = Node::from_json(&json!({ "count": 4, "label": "n" })).unwrap();
        let resolved = resolve_deferred_value(
            &json!({ "count": increment(2.0), "label": increment(1.0) }),
            &existing,
            0,
        )
        .unwrap();
        assert_eq!(resolved, json!({ "count": 6, "label": 1 }));
    }

    #[test]
    fn detects_nested_placeholders() {
        assert!(contains_server_value(&json!({ "a": [1, { "b": server_timestamp() }] })));
        assert!(!contains_server_value(&json!({ "a": { "sv": 1 } })));
        assert!(resolve_deferred_value(&json!({ ".sv": "bogus" }), &Node::empty(), 0).is_err());
    }
}
