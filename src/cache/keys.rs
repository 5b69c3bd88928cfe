//! Query key definitions.
//!
//! A `QueryKey` is a path `[entity, operation, params]`. Shorter paths name
//! key families (`[entity]`, `[entity, operation]`) so invalidation can target
//! every list of an entity without knowing which parameters were used.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;

/// Name of a data kind, e.g. `services` or `promotions`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity(Arc<str>);

impl Entity {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Entity {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of read a key belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Detail,
    User,
    Search,
    Stats,
    Realtime,
    Custom(String),
}

impl Operation {
    pub fn as_str(&self) -> &str {
        match self {
            Self::List => "list",
            Self::Detail => "detail",
            Self::User => "user",
            Self::Search => "search",
            Self::Stats => "stats",
            Self::Realtime => "realtime",
            Self::Custom(name) => name,
        }
    }
}

impl FromStr for Operation {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "list" => Self::List,
            "detail" => Self::Detail,
            "user" => Self::User,
            "search" => Self::Search,
            "stats" => Self::Stats,
            "realtime" => Self::Realtime,
            other => Self::Custom(other.to_string()),
        })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attribute map identifying one concrete query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams(BTreeMap<String, Value>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Deterministic serialization: object keys are sorted at every depth.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        write_object(&mut out, self.0.iter());
        out
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }
}

fn write_object<'a>(out: &mut String, fields: impl Iterator<Item = (&'a String, &'a Value)>) {
    let mut sorted: Vec<_> = fields.collect();
    sorted.sort_by(|(left, _), (right, _)| left.cmp(right));

    out.push('{');
    for (index, (name, value)) in sorted.into_iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        write_string(out, name);
        out.push(':');
        write_canonical(out, value);
    }
    out.push('}');
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => write_object(out, map.iter()),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::String(text) => write_string(out, text),
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_string(out: &mut String, text: &str) {
    out.push_str(&Value::String(text.to_string()).to_string());
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Name(String),
    Params(String),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Params(canonical) => f.write_str(canonical),
        }
    }
}

/// Canonical identifier of a cache entry or key family.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    segments: Vec<Segment>,
}

impl QueryKey {
    /// Every key of `entity`.
    pub fn all(entity: &Entity) -> Self {
        Self {
            segments: vec![Segment::Name(entity.as_str().to_string())],
        }
    }

    /// Family of every key of `entity` with the given operation.
    pub fn family(entity: &Entity, operation: &Operation) -> Self {
        let mut key = Self::all(entity);
        key.segments
            .push(Segment::Name(operation.as_str().to_string()));
        key
    }

    /// Concrete key for `entity`, `operation` and `params`.
    pub fn build(entity: &Entity, operation: &Operation, params: &QueryParams) -> Self {
        let mut key = Self::family(entity, operation);
        key.segments.push(Segment::Params(params.canonical()));
        key
    }

    pub fn lists(entity: &Entity) -> Self {
        Self::family(entity, &Operation::List)
    }

    pub fn list(entity: &Entity, params: &QueryParams) -> Self {
        Self::build(entity, &Operation::List, params)
    }

    pub fn details(entity: &Entity) -> Self {
        Self::family(entity, &Operation::Detail)
    }

    pub fn detail(entity: &Entity, id: &str) -> Self {
        Self::build(entity, &Operation::Detail, &QueryParams::new().with("id", id))
    }

    pub fn users(entity: &Entity) -> Self {
        Self::family(entity, &Operation::User)
    }

    pub fn user(entity: &Entity, user_id: &str) -> Self {
        Self::build(
            entity,
            &Operation::User,
            &QueryParams::new().with("user_id", user_id),
        )
    }

    pub fn entity(&self) -> &str {
        match self.segments.first() {
            Some(Segment::Name(name)) => name,
            _ => "",
        }
    }

    pub fn operation(&self) -> Option<Operation> {
        match self.segments.get(1) {
            Some(Segment::Name(name)) => name.parse().ok(),
            _ => None,
        }
    }

    /// True for keys naming a single query rather than a family.
    pub fn is_concrete(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::Params(_)))
    }

    /// True when `self` is `other` or one of its ancestors.
    pub fn is_prefix_of(&self, other: &QueryKey) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// Stable hash used for log correlation.
    pub fn fingerprint(&self) -> u64 {
        hash_value(self)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, segment) in self.segments.iter().enumerate() {
            if index > 0 {
                f.write_str("/")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({self})")
    }
}

/// Selects cache entries either by family prefix or by exact key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFilter {
    key: QueryKey,
    exact: bool,
}

impl QueryFilter {
    pub fn prefix(key: QueryKey) -> Self {
        Self { key, exact: false }
    }

    pub fn exact(key: QueryKey) -> Self {
        Self { key, exact: true }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn is_exact(&self) -> bool {
        self.exact
    }

    pub fn matches(&self, candidate: &QueryKey) -> bool {
        if self.exact {
            &self.key == candidate
        } else {
            self.key.is_prefix_of(candidate)
        }
    }
}

impl From<QueryKey> for QueryFilter {
    fn from(key: QueryKey) -> Self {
        Self::prefix(key)
    }
}

/// Compute a hash for any hashable value.
pub fn hash_value<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
