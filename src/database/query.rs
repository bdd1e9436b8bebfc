use std::cmp::Ordering;
use std::fmt;

use serde_json::{json, Map, Value};

use crate::database::comparator::{Post, MAX_KEY, MIN_KEY};
use crate::database::error::{invalid_argument, DatabaseResult};
use crate::database::path::Path;
use crate::database::variant::set_variant_at_path;

/// Which datum children are sorted by.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum QueryIndex {
    #[default]
    Priority,
    Key,
    Value,
    Child(String),
}

/// A `startAt`/`endAt`/`equalTo` bound: the indexed value plus an optional
/// child key that breaks ties among children sharing that value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryBound {
    pub value: Value,
    pub name: Option<String>,
}

impl QueryBound {
    pub fn new(value: Value) -> Self {
        Self { value, name: None }
    }

    pub fn with_name(value: Value, name: impl Into<String>) -> Self {
        Self {
            value,
            name: Some(name.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueryLimit {
    First(u32),
    Last(u32),
}

impl QueryLimit {
    pub fn count(&self) -> u32 {
        match self {
            QueryLimit::First(count) | QueryLimit::Last(count) => *count,
        }
    }
}

/// Filter, sort and limit settings of a query.
///
/// Two params compare equal when they select the same data; the record of
/// whether an `order_by_*` builder was already called is ignored.
#[derive(Clone, Debug, Default)]
pub struct QueryParams {
    pub(crate) index: QueryIndex,
    pub(crate) start_at: Option<QueryBound>,
    pub(crate) end_at: Option<QueryBound>,
    pub(crate) equal_to: Option<QueryBound>,
    pub(crate) limit: Option<QueryLimit>,
    order_by_called: bool,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&self) -> &QueryIndex {
        &self.index
    }

    pub fn start_at_bound(&self) -> Option<&QueryBound> {
        self.start_at.as_ref()
    }

    pub fn end_at_bound(&self) -> Option<&QueryBound> {
        self.end_at.as_ref()
    }

    pub fn equal_to_bound(&self) -> Option<&QueryBound> {
        self.equal_to.as_ref()
    }

    pub fn limit(&self) -> Option<QueryLimit> {
        self.limit
    }

    fn set_index(mut self, index: QueryIndex) -> DatabaseResult<Self> {
        if self.order_by_called {
            return Err(invalid_argument("orderBy has already been specified"));
        }
        self.index = index;
        self.order_by_called = true;
        self.validate_bounds_for_index()?;
        Ok(self)
    }

    pub fn order_by_priority(self) -> DatabaseResult<Self> {
        self.set_index(QueryIndex::Priority)
    }

    pub fn order_by_key(self) -> DatabaseResult<Self> {
        self.set_index(QueryIndex::Key)
    }

    pub fn order_by_value(self) -> DatabaseResult<Self> {
        self.set_index(QueryIndex::Value)
    }

    pub fn order_by_child(self, path: &str) -> DatabaseResult<Self> {
        match path {
            "$key" => Err(invalid_argument(
                "order_by_child(\"$key\") is invalid; call order_by_key() instead",
            )),
            "$priority" => Err(invalid_argument(
                "order_by_child(\"$priority\") is invalid; call order_by_priority() instead",
            )),
            "$value" => Err(invalid_argument(
                "order_by_child(\"$value\") is invalid; call order_by_value() instead",
            )),
            _ if Path::new(path).is_empty() => {
                Err(invalid_argument("order_by_child requires a non-empty path"))
            }
            _ => self.set_index(QueryIndex::Child(Path::new(path).to_string())),
        }
    }

    pub fn start_at(mut self, bound: QueryBound) -> DatabaseResult<Self> {
        if self.start_at.is_some() || self.equal_to.is_some() {
            return Err(invalid_argument(
                "startAt/equalTo has already been specified",
            ));
        }
        self.start_at = Some(bound);
        self.validate_bounds_for_index()?;
        Ok(self)
    }

    pub fn end_at(mut self, bound: QueryBound) -> DatabaseResult<Self> {
        if self.end_at.is_some() || self.equal_to.is_some() {
            return Err(invalid_argument("endAt/equalTo has already been specified"));
        }
        self.end_at = Some(bound);
        self.validate_bounds_for_index()?;
        Ok(self)
    }

    pub fn equal_to(mut self, bound: QueryBound) -> DatabaseResult<Self> {
        if self.start_at.is_some() || self.end_at.is_some() || self.equal_to.is_some() {
            return Err(invalid_argument(
                "equalTo cannot be combined with startAt, endAt or another equalTo",
            ));
        }
        self.equal_to = Some(bound);
        self.validate_bounds_for_index()?;
        Ok(self)
    }

    pub fn limit_to_first(mut self, limit: u32) -> DatabaseResult<Self> {
        self.set_limit(QueryLimit::First(limit))?;
        Ok(self)
    }

    pub fn limit_to_last(mut self, limit: u32) -> DatabaseResult<Self> {
        self.set_limit(QueryLimit::Last(limit))?;
        Ok(self)
    }

    fn set_limit(&mut self, limit: QueryLimit) -> DatabaseResult<()> {
        if limit.count() == 0 {
            return Err(invalid_argument("limit must be a positive integer"));
        }
        if self.limit.is_some() {
            return Err(invalid_argument("limit has already been specified"));
        }
        self.limit = Some(limit);
        Ok(())
    }

    fn validate_bounds_for_index(&self) -> DatabaseResult<()> {
        let bounds = [&self.start_at, &self.end_at, &self.equal_to];
        for bound in bounds.into_iter().flatten() {
            match self.index {
                QueryIndex::Key => {
                    if !bound.value.is_string() || bound.name.is_some() {
                        return Err(invalid_argument(
                            "When ordering by key, bounds must be a single string",
                        ));
                    }
                }
                QueryIndex::Priority => {
                    if !matches!(
                        bound.value,
                        Value::Null | Value::Number(_) | Value::String(_)
                    ) {
                        return Err(invalid_argument(
                            "When ordering by priority, bounds must be a string, number, or null",
                        ));
                    }
                }
                QueryIndex::Value | QueryIndex::Child(_) => {
                    if bound.value.is_object() || bound.value.is_array() {
                        return Err(invalid_argument(
                            "Query bounds must be a primitive value",
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// True when the query neither filters nor limits: every child at the
    /// location belongs to it.
    pub fn loads_all_data(&self) -> bool {
        self.start_at.is_none()
            && self.end_at.is_none()
            && self.equal_to.is_none()
            && self.limit.is_none()
    }

    /// A query that loads all data in the default (priority) order.
    pub fn is_default(&self) -> bool {
        self.loads_all_data() && self.index == QueryIndex::Priority
    }

    pub fn has_start(&self) -> bool {
        self.start_at.is_some() || self.equal_to.is_some()
    }

    pub fn has_end(&self) -> bool {
        self.end_at.is_some() || self.equal_to.is_some()
    }

    fn start_bound(&self) -> Option<&QueryBound> {
        self.equal_to.as_ref().or(self.start_at.as_ref())
    }

    fn end_bound(&self) -> Option<&QueryBound> {
        self.equal_to.as_ref().or(self.end_at.as_ref())
    }

    pub fn start_name(&self) -> &str {
        self.start_bound()
            .and_then(|bound| bound.name.as_deref())
            .unwrap_or(MIN_KEY)
    }

    pub fn end_name(&self) -> &str {
        self.end_bound()
            .and_then(|bound| bound.name.as_deref())
            .unwrap_or(MAX_KEY)
    }

    /// Builds the node a child named `name` would be if its indexed datum
    /// were `value`.
    pub fn make_post(&self, name: &str, value: &Value) -> Post {
        match &self.index {
            QueryIndex::Priority => Post::node(name, json!({ ".priority": value })),
            QueryIndex::Child(child) => {
                let mut variant = Value::Null;
                set_variant_at_path(&mut variant, &Path::new(child), value.clone());
                Post::node(name, variant)
            }
            QueryIndex::Key => {
                let key = value.as_str().unwrap_or(name);
                Post::node(key, Value::Null)
            }
            QueryIndex::Value => Post::node(name, value.clone()),
        }
    }

    pub fn start_post(&self) -> Post {
        match self.start_bound() {
            Some(bound) => self.make_post(self.start_name(), &bound.value),
            None => Post::Min,
        }
    }

    pub fn end_post(&self) -> Post {
        match self.end_bound() {
            Some(bound) => self.make_post(self.end_name(), &bound.value),
            None => Post::Max,
        }
    }

    /// Listen parameters in the shape the realtime wire protocol expects.
    pub fn wire_params(&self) -> Value {
        let mut params = Map::new();
        if let Some(bound) = self.start_bound() {
            params.insert("sp".to_string(), bound.value.clone());
            if let Some(name) = &bound.name {
                params.insert("sn".to_string(), Value::String(name.clone()));
            }
        }
        if let Some(bound) = self.end_bound() {
            params.insert("ep".to_string(), bound.value.clone());
            if let Some(name) = &bound.name {
                params.insert("en".to_string(), Value::String(name.clone()));
            }
        }
        if let Some(limit) = self.limit {
            params.insert("l".to_string(), Value::from(limit.count()));
            let view_from = match limit {
                QueryLimit::First(_) => "l",
                QueryLimit::Last(_) => "r",
            };
            params.insert("vf".to_string(), Value::String(view_from.to_string()));
        }
        match &self.index {
            QueryIndex::Priority => {}
            QueryIndex::Key => {
                params.insert("i".to_string(), Value::String(".key".to_string()));
            }
            QueryIndex::Value => {
                params.insert("i".to_string(), Value::String(".value".to_string()));
            }
            QueryIndex::Child(child) => {
                params.insert("i".to_string(), Value::String(child.clone()));
            }
        }
        Value::Object(params)
    }

    fn sort_key(&self) -> (&QueryIndex, [BoundKey<'_>; 3], Option<QueryLimit>) {
        (
            &self.index,
            [
                BoundKey(self.start_at.as_ref()),
                BoundKey(self.end_at.as_ref()),
                BoundKey(self.equal_to.as_ref()),
            ],
            self.limit,
        )
    }
}

/// Orders optional bounds: absent first, then by value, then by name.
struct BoundKey<'a>(Option<&'a QueryBound>);

impl PartialEq for BoundKey<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BoundKey<'_> {}

impl PartialOrd for BoundKey<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BoundKey<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0, other.0) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(left), Some(right)) => canonical_cmp(&left.value, &right.value)
                .then_with(|| left.name.cmp(&right.name)),
        }
    }
}

/// Total order over JSON values, consistent with `Value` equality. Only used
/// to key maps by query params, never to sort data.
fn canonical_cmp(left: &Value, right: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    rank(left)
        .cmp(&rank(right))
        .then_with(|| left.to_string().cmp(&right.to_string()))
}

impl PartialEq for QueryParams {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueryParams {}

impl PartialOrd for QueryParams {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueryParams {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// A location plus the params that filter it: the identity of one logical
/// subscription.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct QuerySpec {
    pub path: Path,
    pub params: QueryParams,
}

impl QuerySpec {
    /// The default query at `path`.
    pub fn new(path: Path) -> Self {
        Self {
            path,
            params: QueryParams::default(),
        }
    }

    pub fn with_params(path: Path, params: QueryParams) -> Self {
        Self { path, params }
    }

    pub fn loads_all_data(&self) -> bool {
        self.params.loads_all_data()
    }

    pub fn is_default(&self) -> bool {
        self.params.is_default()
    }

    /// The default query at the same location.
    pub fn default_form(&self) -> QuerySpec {
        QuerySpec::new(self.path.clone())
    }
}

impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            write!(f, "/{}", self.path)
        } else {
            write!(f, "/{}?{}", self.path, self.params.wire_params())
        }
    }
}
