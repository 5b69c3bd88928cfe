//! Remote datastore contract consumed by the query cache.
//!
//! The cache never speaks a particular query language; it only needs
//! filter + sort + range reads and row-level writes.

use std::cmp::Ordering;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A single row as returned by the remote store.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatastoreError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("no row in `{table}` matched the filter")]
    NotFound { table: String },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("datastore timeout")]
    Timeout,
    #[error("datastore unavailable: {0}")]
    Unavailable(String),
}

impl DatastoreError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    In {
        column: String,
        values: Vec<Value>,
    },
    /// Case-insensitive substring match over any of `columns`.
    Search { columns: Vec<String>, term: String },
}

/// Conjunction of conditions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.compare(column, CompareOp::Eq, value)
    }

    pub fn compare(
        mut self,
        column: impl Into<String>,
        op: CompareOp,
        value: impl Into<Value>,
    ) -> Self {
        self.conditions.push(Condition::Compare {
            column: column.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn one_of(mut self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.conditions.push(Condition::In {
            column: column.into(),
            values,
        });
        self
    }

    pub fn search(mut self, columns: Vec<String>, term: impl Into<String>) -> Self {
        self.conditions.push(Condition::Search {
            columns,
            term: term.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Evaluate the filter against a row. Missing columns never match.
    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Compare { column, op, value } => row
                .get(column)
                .is_some_and(|actual| compare_matches(actual, *op, value)),
            Condition::In { column, values } => row
                .get(column)
                .is_some_and(|actual| values.iter().any(|candidate| candidate == actual)),
            Condition::Search { columns, term } => {
                let needle = term.to_lowercase();
                columns.iter().any(|column| {
                    row.get(column)
                        .and_then(Value::as_str)
                        .is_some_and(|haystack| haystack.to_lowercase().contains(&needle))
                })
            }
        })
    }
}

fn compare_matches(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    match op {
        CompareOp::Eq => actual == expected,
        CompareOp::Neq => actual != expected,
        CompareOp::Gt => compare_values(actual, expected) == Some(Ordering::Greater),
        CompareOp::Gte => matches!(
            compare_values(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CompareOp::Lt => compare_values(actual, expected) == Some(Ordering::Less),
        CompareOp::Lte => matches!(
            compare_values(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
    }
}

/// Order two JSON scalars of the same kind; mixed kinds are unordered.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sort {
    pub column: String,
    pub direction: SortDirection,
}

impl Sort {
    pub fn ascending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Descending,
        }
    }
}

/// Offset/limit window over the sorted result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub offset: u64,
    pub limit: u64,
}

impl Range {
    pub fn page(page: u64, page_size: u64) -> Self {
        Self {
            offset: page.saturating_mul(page_size),
            limit: page_size,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    pub filter: Filter,
    pub sort: Vec<Sort>,
    pub range: Option<Range>,
    /// Ask the store for the total number of matching rows.
    pub count: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    pub rows: Vec<Row>,
    pub total: Option<u64>,
}

/// Asynchronous row store backing the cache.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(&self, table: &str, query: &SelectQuery) -> Result<RowSet, DatastoreError>;

    async fn insert(&self, table: &str, row: Row) -> Result<Row, DatastoreError>;

    async fn update(&self, table: &str, filter: &Filter, patch: Row)
    -> Result<Row, DatastoreError>;

    async fn delete(&self, table: &str, filter: &Filter) -> Result<(), DatastoreError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row(value: Value) -> Row {
        value.as_object().cloned().expect("object row")
    }

    #[test]
    fn filter_compares_numbers_and_strings() {
        let service = row(json!({"id": "s1", "price": 40, "status": "active"}));

        assert!(Filter::new().eq("status", "active").matches(&service));
        assert!(
            Filter::new()
                .compare("price", CompareOp::Gte, 40)
                .matches(&service)
        );
        assert!(
            !Filter::new()
                .compare("price", CompareOp::Gt, 40)
                .matches(&service)
        );
        assert!(!Filter::new().eq("missing", "x").matches(&service));
    }

    #[test]
    fn search_is_case_insensitive_across_columns() {
        let service = row(json!({"title": "Garden Design", "summary": "Hedges"}));
        let filter = Filter::new().search(vec!["title".into(), "summary".into()], "hEdG");
        assert!(filter.matches(&service));

        let miss = Filter::new().search(vec!["title".into()], "hedg");
        assert!(!miss.matches(&service));
    }

    #[test]
    fn mixed_kinds_are_unordered() {
        assert_eq!(compare_values(&json!(1), &json!("1")), None);
        assert_eq!(
            compare_values(&json!(1.5), &json!(1)),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn range_page_computes_offset() {
        assert_eq!(
            Range::page(2, 20),
            Range {
                offset: 40,
                limit: 20
            }
        );
    }
}
