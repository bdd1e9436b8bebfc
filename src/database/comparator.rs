//! Child ordering rules of the Realtime Database.
//!
//! Every filtered view sorts its children with a [`QueryParamsComparator`]
//! built from the view's [`QueryParams`]. The comparator orders by the indexed
//! datum (priority, a nested child, or the value itself) and falls back to the
//! child key; ordering by key uses the key alone.
//!
//! Datum comparison follows the backend's type precedence:
//! `null < false < true < numbers < strings < objects`. Integers compare
//! numerically, mixed integer/float pairs compare as `f64`, and objects are
//! considered equal to each other.
//!
//! Keys that look like 32-bit integers sort before all other keys, in numeric
//! order; the remaining keys sort lexicographically. `[MIN_KEY]` and
//! `[MAX_KEY]` bracket everything.

use std::cmp::Ordering;

use serde_json::Value;

use crate::database::path::Path;
use crate::database::query::{QueryIndex, QueryParams};
use crate::database::variant::{get_child, get_priority, get_value};

pub const MIN_KEY: &str = "[MIN_KEY]";
pub const MAX_KEY: &str = "[MAX_KEY]";

/// A named child, or one of the sentinels that sort before/after every child.
#[derive(Clone, Debug, PartialEq)]
pub enum Post {
    Min,
    Node { name: String, value: Value },
    Max,
}

impl Post {
    pub fn node(name: impl Into<String>, value: Value) -> Self {
        Post::Node {
            name: name.into(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Post::Min => MIN_KEY,
            Post::Max => MAX_KEY,
            Post::Node { name, .. } => name,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct QueryParamsComparator<'a> {
    params: &'a QueryParams,
}

impl<'a> QueryParamsComparator<'a> {
    pub fn new(params: &'a QueryParams) -> Self {
        Self { params }
    }

    pub fn compare(
        &self,
        key_a: &str,
        value_a: &Value,
        key_b: &str,
        value_b: &Value,
    ) -> Ordering {
        let by_key = || Self::compare_keys(key_a, key_b);
        match &self.params.index {
            QueryIndex::Priority => Self::compare_priorities(value_a, value_b).then_with(by_key),
            QueryIndex::Child(child) => {
                let path = Path::new(child);
                Self::compare_values(get_child(value_a, &path), get_child(value_b, &path))
                    .then_with(by_key)
            }
            QueryIndex::Key => by_key(),
            QueryIndex::Value => Self::compare_values(value_a, value_b).then_with(by_key),
        }
    }

    pub fn compare_posts(&self, a: &Post, b: &Post) -> Ordering {
        match (a, b) {
            (Post::Min, Post::Min) | (Post::Max, Post::Max) => Ordering::Equal,
            (Post::Min, _) | (_, Post::Max) => Ordering::Less,
            (_, Post::Min) | (Post::Max, _) => Ordering::Greater,
            (
                Post::Node {
                    name: key_a,
                    value: value_a,
                },
                Post::Node {
                    name: key_b,
                    value: value_b,
                },
            ) => self.compare(key_a, value_a, key_b, value_b),
        }
    }

    /// Strict "sorts before" helper for ordered containers.
    pub fn less(&self, key_a: &str, value_a: &Value, key_b: &str, value_b: &Value) -> bool {
        self.compare(key_a, value_a, key_b, value_b) == Ordering::Less
    }

    pub fn compare_priorities(value_a: &Value, value_b: &Value) -> Ordering {
        Self::compare_values(get_priority(value_a), get_priority(value_b))
    }

    pub fn compare_keys(key_a: &str, key_b: &str) -> Ordering {
        if key_a == key_b {
            return Ordering::Equal;
        }
        if key_a == MIN_KEY || key_b == MAX_KEY {
            return Ordering::Less;
        }
        if key_b == MIN_KEY || key_a == MAX_KEY {
            return Ordering::Greater;
        }
        match (parse_int_key(key_a), parse_int_key(key_b)) {
            (Some(int_a), Some(int_b)) => int_a
                .cmp(&int_b)
                .then_with(|| key_a.len().cmp(&key_b.len())),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => key_a.cmp(key_b),
        }
    }

    pub fn compare_values(variant_a: &Value, variant_b: &Value) -> Ordering {
        let value_a = get_value(variant_a);
        let value_b = get_value(variant_b);
        let precedence = precedence(value_a).cmp(&precedence(value_b));
        if precedence != Ordering::Equal {
            return precedence;
        }
        match (value_a, value_b) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => {
                    let a = a.as_f64().unwrap_or(0.0);
                    let b = b.as_f64().unwrap_or(0.0);
                    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
                }
            },
            (Value::String(a), Value::String(b)) => a.as_str().cmp(b.as_str()),
            _ => Ordering::Equal,
        }
    }
}

fn precedence(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) | Value::Object(_) => 4,
    }
}

/// Keys made of an optional minus sign and up to ten digits that fit in an
/// `i32` are treated as integers.
fn parse_int_key(key: &str) -> Option<i64> {
    let digits = key.strip_prefix('-').unwrap_or(key);
    if digits.is_empty() || digits.len() > 10 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let parsed: i64 = key.parse().ok()?;
    (i64::from(i32::MIN)..=i64::from(i32::MAX))
        .contains(&parsed)
        .then_some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type Cmp = QueryParamsComparator<'static>;

    #[test]
    fn values_follow_type_precedence() {
        let ordered = [
            json!(null),
            json!(false),
            json!(true),
            json!(-3),
            json!(2.5),
            json!(10),
            json!("a"),
            json!("b"),
            json!({ "x": 1 }),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(Cmp::compare_values(&pair[0], &pair[1]), Ordering::Less, "{pair:?}");
        }
        assert_eq!(Cmp::compare_values(&json!(1), &json!(1.0)), Ordering::Equal);
        assert_eq!(
            Cmp::compare_values(&json!({ "a": 1 }), &json!({ "b": 2 })),
            Ordering::Equal
        );
    }

    #[test]
    fn values_ignore_priority_wrappers() {
        assert_eq!(
            Cmp::compare_values(&json!({ ".value": 5, ".priority": 1 }), &json!(5)),
            Ordering::Equal
        );
        assert_eq!(
            Cmp::compare_priorities(&json!({ ".value": 5, ".priority": 1 }), &json!(5)),
            Ordering::Greater
        );
    }

    #[test]
    fn integer_keys_sort_first_and_numerically() {
        assert_eq!(Cmp::compare_keys("2", "10"), Ordering::Less);
        assert_eq!(Cmp::compare_keys("-1", "0"), Ordering::Less);
        assert_eq!(Cmp::compare_keys("99", "a"), Ordering::Less);
        assert_eq!(Cmp::compare_keys("1", "01"), Ordering::Less);
        assert_eq!(Cmp::compare_keys("b", "a"), Ordering::Greater);
        assert_eq!(Cmp::compare_keys("99999999999", "a"), Ordering::Less);
        assert_eq!(Cmp::compare_keys("3", "99999999999"), Ordering::Less);
    }

    #[test]
    fn sentinel_keys_bracket_everything() {
        assert_eq!(Cmp::compare_keys(MIN_KEY, "-5"), Ordering::Less);
        assert_eq!(Cmp::compare_keys(MAX_KEY, "zzz"), Ordering::Greater);
        assert_eq!(Cmp::compare_keys("zzz", MAX_KEY), Ordering::Less);
    }

    #[test]
    fn priority_index_falls_back_to_keys() {
        let params = QueryParams::default();
        let cmp = QueryParamsComparator::new(&params);
        let low = json!({ ".value": 1, ".priority": 1 });
        let high = json!({ ".value": 0, ".priority": 2 });
        assert_eq!(cmp.compare("z", &low, "a", &high), Ordering::Less);
        assert_eq!(cmp.compare("a", &json!(1), "b", &json!(1)), Ordering::Less);
    }

    #[test]
    fn child_index_reads_nested_values() {
        let params = QueryParams::new().order_by_child("age").unwrap();
        let cmp = QueryParamsComparator::new(&params);
        let old = json!({ "age": 80 });
        let young = json!({ "age": 7 });
        let missing = json!({ "name": "x" });
        assert_eq!(cmp.compare("a", &old, "b", &young), Ordering::Greater);
        assert_eq!(cmp.compare("z", &missing, "a", &young), Ordering::Less);
    }

    #[test]
    fn key_index_ignores_values() {
        let params = QueryParams::new().order_by_key().unwrap();
        let cmp = QueryParamsComparator::new(&params);
        assert_eq!(
            cmp.compare("a", &json!(100), "b", &json!(1)),
            Ordering::Less
        );
    }

    #[test]
    fn posts_respect_sentinels() {
        let params = QueryParams::new().order_by_value().unwrap();
        let cmp = QueryParamsComparator::new(&params);
        let node = Post::node("k", json!(1));
        assert_eq!(cmp.compare_posts(&Post::Min, &node), Ordering::Less);
        assert_eq!(cmp.compare_posts(&node, &Post::Max), Ordering::Less);
        assert_eq!(cmp.compare_posts(&Post::Max, &Post::Max), Ordering::Equal);
        assert_eq!(Post::Min.name(), MIN_KEY);
    }
}
