//! Helpers over the JSON tree the sync core stores.
//!
//! Data lives in plain [`serde_json::Value`]s. A node's priority is stored in
//! a `.priority` entry; a leaf that carries a priority is wrapped as
//! `{".value": v, ".priority": p}`. Empty objects and objects holding only a
//! priority are treated as null, and every helper that writes keeps the tree
//! in that normalized shape.

use std::cmp::Ordering;
use std::fmt::Write as _;

use serde_json::{Map, Value};

use crate::database::comparator::QueryParamsComparator;
use crate::database::path::Path;
use crate::database::query::QueryParams;
use crate::util::{sha1_base64, CONSTANTS};

static NULL_VALUE: Value = Value::Null;

pub fn is_priority_key(key: &str) -> bool {
    key == CONSTANTS.priority_key
}

/// The data of a node without its priority wrapper.
pub fn get_value(variant: &Value) -> &Value {
    variant
        .as_object()
        .and_then(|obj| obj.get(CONSTANTS.value_key))
        .unwrap_or(variant)
}

pub fn get_priority(variant: &Value) -> &Value {
    variant
        .as_object()
        .and_then(|obj| obj.get(CONSTANTS.priority_key))
        .unwrap_or(&NULL_VALUE)
}

pub fn is_leaf(variant: &Value) -> bool {
    !matches!(get_value(variant), Value::Object(_) | Value::Array(_))
}

/// Null, an empty container, or a container holding nothing but a priority.
pub fn is_empty(variant: &Value) -> bool {
    match get_value(variant) {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(obj) => {
            obj.is_empty()
                || (obj.len() == 1
                    && obj
                        .get(CONSTANTS.priority_key)
                        .is_some_and(|priority| !priority.is_null()))
        }
        _ => false,
    }
}

/// Strips priority information from a node, recursively when asked.
pub fn prune_priorities(variant: &mut Value, recursive: bool) {
    let unwrapped = match variant {
        Value::Object(obj) => obj.remove(CONSTANTS.value_key).or_else(|| {
            obj.remove(CONSTANTS.priority_key);
            None
        }),
        _ => None,
    };
    if let Some(inner) = unwrapped {
        *variant = inner;
    }
    if recursive {
        if let Value::Object(obj) = variant {
            for child in obj.values_mut() {
                prune_priorities(child, true);
            }
        }
    }
}

pub fn combine_value_and_priority(value: &Value, priority: &Value) -> Value {
    if is_empty(value) || is_empty(priority) {
        let mut result = value.clone();
        prune_priorities(&mut result, false);
        return result;
    }
    let mut result = match value {
        Value::Object(obj) => obj.clone(),
        other => {
            let mut wrapper = Map::new();
            wrapper.insert(CONSTANTS.value_key.to_string(), other.clone());
            wrapper
        }
    };
    result.insert(CONSTANTS.priority_key.to_string(), priority.clone());
    Value::Object(result)
}

fn combine_value_and_priority_in_place(value: &mut Value, priority: &Value) {
    if is_empty(value) {
        *value = Value::Null;
    } else {
        *value = combine_value_and_priority(value, priority);
    }
}

/// Children of a node, excluding the priority entry.
pub fn children(variant: &Value) -> impl Iterator<Item = (&String, &Value)> {
    get_value(variant)
        .as_object()
        .into_iter()
        .flat_map(|obj| obj.iter())
        .filter(|(key, _)| !is_priority_key(key))
}

pub fn child_count(variant: &Value) -> usize {
    children(variant).count()
}

pub fn get_immediate_child<'a>(variant: &'a Value, key: &str) -> &'a Value {
    if is_priority_key(key) {
        return get_priority(variant);
    }
    if is_leaf(variant) {
        return &NULL_VALUE;
    }
    get_value(variant)
        .as_object()
        .and_then(|obj| obj.get(key))
        .unwrap_or(&NULL_VALUE)
}

/// Data at `path` below `variant`, or null when nothing is there.
pub fn get_child<'a>(variant: &'a Value, path: &Path) -> &'a Value {
    path.directories()
        .iter()
        .fold(variant, |current, key| get_immediate_child(current, key))
}

/// Like [`get_child`] but distinguishes a missing node from an explicit one.
pub fn get_internal_variant<'a>(variant: &'a Value, path: &Path) -> Option<&'a Value> {
    let mut current = variant;
    for key in path.directories() {
        let container = if is_priority_key(key) {
            current
        } else {
            get_value(current)
        };
        current = container.as_object()?.get(key.as_str())?;
    }
    Some(current)
}

fn ensure_object(variant: &mut Value) -> &mut Map<String, Value> {
    if !variant.is_object() {
        *variant = Value::Object(Map::new());
    }
    match variant {
        Value::Object(obj) => obj,
        _ => unreachable!("variant was just replaced by an object"),
    }
}

/// Replaces the data at `path`, creating intermediate nodes and pruning the
/// ones that become empty.
pub fn update_child(variant: &mut Value, path: &Path, value: Value) {
    let Some(front) = path.front_directory() else {
        *variant = value;
        return;
    };
    if is_priority_key(front) {
        combine_value_and_priority_in_place(variant, &value);
        return;
    }
    if !variant.is_null() && is_leaf(variant) {
        if is_empty(&value) {
            return;
        }
        if let Value::Object(obj) = variant {
            obj.remove(CONSTANTS.value_key);
        } else {
            *variant = Value::Object(Map::new());
        }
    }
    let rest = path.pop_front_directory();
    let obj = ensure_object(variant);
    let child = obj.entry(front.to_string()).or_insert(Value::Null);
    update_child(child, &rest, value);
    if is_empty(child) {
        obj.remove(front);
    }
    if is_empty(variant) {
        *variant = Value::Null;
    }
}

pub fn update_immediate_child(variant: &mut Value, key: &str, value: Value) {
    update_child(variant, &Path::from_segments([key]), value);
}

fn make_variant_at_path<'a>(variant: &'a mut Value, path: &Path) -> &'a mut Value {
    let mut current = variant;
    for key in path.directories() {
        let obj = ensure_object(current);
        obj.remove(CONSTANTS.value_key);
        current = obj.entry(key.clone()).or_insert(Value::Null);
    }
    current
}

/// Writes `value` at `path`, merging object entries into an existing object
/// instead of replacing it.
pub fn set_variant_at_path(variant: &mut Value, path: &Path, value: Value) {
    let target = make_variant_at_path(variant, path);
    match (target.is_object(), value) {
        (true, Value::Object(entries)) => {
            let obj = ensure_object(target);
            obj.remove(CONSTANTS.value_key);
            for (key, child) in entries {
                obj.insert(key, child);
            }
        }
        (true, other) => {
            let wrapped = target
                .as_object()
                .is_some_and(|obj| obj.contains_key(CONSTANTS.value_key));
            if wrapped {
                target[CONSTANTS.value_key] = other;
            } else {
                *target = other;
            }
        }
        (false, other) => *target = other,
    }
}

/// Same data and priorities at every level, comparing numbers by value.
pub fn variants_are_equivalent(a: &Value, b: &Value) -> bool {
    if QueryParamsComparator::compare_values(a, b) != Ordering::Equal
        || QueryParamsComparator::compare_priorities(a, b) != Ordering::Equal
    {
        return false;
    }
    match (a, b) {
        (Value::Object(left), Value::Object(right)) => {
            left.len() == right.len()
                && left.iter().zip(right.iter()).all(
                    |((key_a, value_a), (key_b, value_b))| {
                        key_a == key_b && variants_are_equivalent(value_a, value_b)
                    },
                )
        }
        _ => true,
    }
}

/// Converts arrays into objects keyed by index, recursively. The sync core
/// only stores objects.
pub fn normalize_arrays(value: Value) -> Value {
    match value {
        Value::Array(items) => {
            let mut obj = Map::new();
            for (index, item) in items.into_iter().enumerate() {
                let item = normalize_arrays(item);
                if !item.is_null() {
                    obj.insert(index.to_string(), item);
                }
            }
            if obj.is_empty() {
                Value::Null
            } else {
                Value::Object(obj)
            }
        }
        Value::Object(obj) => Value::Object(
            obj.into_iter()
                .map(|(key, child)| (key, normalize_arrays(child)))
                .collect(),
        ),
        other => other,
    }
}

/// Base64 SHA-1 of the node's hash representation, or an empty string for
/// empty data. Matches the hashes the backend computes for compound listens.
pub fn variant_hash(variant: &Value) -> String {
    let representation = hash_representation(variant);
    if representation.is_empty() {
        String::new()
    } else {
        sha1_base64(representation)
    }
}

fn hash_representation(variant: &Value) -> String {
    let mut out = String::new();
    match variant {
        Value::Object(obj) => {
            if let Some(priority) = obj.get(CONSTANTS.priority_key) {
                out.push_str("priority:");
                append_leaf_representation(&mut out, priority);
                out.push(':');
                let mut pruned = variant.clone();
                prune_priorities(&mut pruned, false);
                if pruned.is_object() {
                    append_children_representation(&mut out, &pruned);
                } else {
                    append_leaf_representation(&mut out, &pruned);
                }
            } else {
                append_children_representation(&mut out, variant);
            }
        }
        Value::Array(_) => {
            append_children_representation(&mut out, &normalize_arrays(variant.clone()))
        }
        leaf => append_leaf_representation(&mut out, leaf),
    }
    out
}

fn append_leaf_representation(out: &mut String, leaf: &Value) {
    match leaf {
        Value::String(text) => {
            out.push_str("string:");
            out.push_str(text);
        }
        Value::Bool(flag) => {
            out.push_str("boolean:");
            out.push_str(if *flag { "true" } else { "false" });
        }
        Value::Number(number) => {
            out.push_str("number:");
            let bits = number.as_f64().unwrap_or(0.0).to_bits();
            let _ = write!(out, "{bits:016x}");
        }
        _ => {}
    }
}

fn append_children_representation(out: &mut String, container: &Value) {
    let mut nodes: Vec<(&String, &Value)> = children(container).collect();
    let saw_priority = nodes
        .iter()
        .any(|(_, child)| !get_priority(child).is_null());
    if saw_priority {
        let params = QueryParams::default();
        let comparator = QueryParamsComparator::new(&params);
        nodes.sort_by(|(key_a, value_a), (key_b, value_b)| {
            comparator.compare(key_a, value_a, key_b, value_b)
        });
    } else {
        nodes.sort_by(|(key_a, _), (key_b, _)| QueryParamsComparator::compare_keys(key_a, key_b));
    }
    for (key, child) in nodes {
        let hash = variant_hash(child);
        if !hash.is_empty() {
            out.push(':');
            out.push_str(key);
            out.push(':');
            out.push_str(&hash);
        }
    }
}
