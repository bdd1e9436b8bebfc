//! Server value placeholders and their local resolution.
//!
//! Writes may contain `{".sv": ...}` placeholders that the server replaces
//! with its own data. Once a write is acknowledged, the sync tree resolves
//! them locally so the server cache matches what the server stored.

use chrono::Utc;
use serde_json::{Map, Number, Value};

use crate::database::core::compound_write::CompoundWrite;
use crate::database::path::Path;
use crate::database::variant::{get_child, get_immediate_child, get_value};
use crate::util::CONSTANTS;

/// Port of `serverTimestamp()` from
/// `packages/database/src/api/ServerValue.ts`.
pub fn server_timestamp() -> Value {
    serde_json::json!({ ".sv": "timestamp" })
}

/// Port of `increment()` from `packages/database/src/api/ServerValue.ts`.
///
/// # Arguments
/// * `delta` - Amount to atomically add to the current value.
pub fn increment(delta: f64) -> Value {
    serde_json::json!({
        ".sv": {
            "increment": delta,
        }
    })
}

/// Values the placeholders resolve to, given the estimated offset between
/// the server clock and the local one.
pub fn generate_server_values(server_time_offset_ms: i64) -> Value {
    let now = Utc::now().timestamp_millis().saturating_add(server_time_offset_ms);
    serde_json::json!({ "timestamp": now })
}

pub fn contains_server_value(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.contains_key(CONSTANTS.server_value_key) || map.values().any(contains_server_value)
        }
        _ => false,
    }
}

/// Replaces every placeholder in `data`. `existing` is the data currently
/// stored at the same location and feeds `increment`.
pub fn resolve_deferred_value_snapshot(data: &Value, existing: &Value, server_values: &Value) -> Value {
    match data {
        Value::Object(map) => {
            if let Some(spec) = map.get(CONSTANTS.server_value_key) {
                return resolve_placeholder(spec, existing, server_values)
                    .unwrap_or_else(|| data.clone());
            }
            let mut resolved = Map::with_capacity(map.len());
            for (key, child) in map {
                let child_existing = get_immediate_child(existing, key);
                resolved.insert(
                    key.clone(),
                    resolve_deferred_value_snapshot(child, child_existing, server_values),
                );
            }
            Value::Object(resolved)
        }
        other => other.clone(),
    }
}

/// Resolves each write of `merge` against the data at its own location.
pub fn resolve_deferred_value_merge(
    merge: &CompoundWrite,
    existing: &Value,
    server_values: &Value,
) -> CompoundWrite {
    let mut resolved = CompoundWrite::new();
    merge
        .write_tree()
        .call_on_each(&mut |path: &Path, value: &Value| {
            let existing_at_path = get_child(existing, path);
            resolved.add_write_inline(
                path,
                resolve_deferred_value_snapshot(value, existing_at_path, server_values),
            );
        });
    resolved
}

fn resolve_placeholder(spec: &Value, existing: &Value, server_values: &Value) -> Option<Value> {
    match spec {
        Value::String(name) => match server_values.get(name) {
            Some(value) => Some(value.clone()),
            None => {
                log::warn!("Unknown server value placeholder '{name}' left unresolved");
                None
            }
        },
        Value::Object(map) => match map.get("increment") {
            Some(Value::Number(delta)) => Some(apply_increment(get_value(existing), delta)),
            _ => {
                log::warn!("Unsupported server value placeholder {spec} left unresolved");
                None
            }
        },
        _ => {
            log::warn!("Unsupported server value placeholder {spec} left unresolved");
            None
        }
    }
}

fn apply_increment(existing: &Value, delta: &Number) -> Value {
    let Value::Number(base) = existing else {
        return Value::Number(delta.clone());
    };
    if let (Some(base), Some(delta)) = (base.as_i64(), delta.as_i64()) {
        if let Some(sum) = base.checked_add(delta) {
            return Value::from(sum);
        }
    }
    let total = base.as_f64().unwrap_or(0.0) + delta.as_f64().unwrap_or(0.0);
    Number::from_f64(total)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
