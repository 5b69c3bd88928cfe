//! In-process implementation of [`RemoteStore`].
//!
//! Used by the CLI and the test suites. Supports unique constraints,
//! injected failures and artificial latency so cache behaviour can be
//! exercised without a network backend.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::application::datastore::{
    DatastoreError, Filter, RemoteStore, Row, RowSet, SelectQuery, Sort, SortDirection,
    compare_values,
};
use crate::cache::lock::mutex_lock;

const ID_COLUMN: &str = "id";
const SOURCE: &str = "infra::memory_store";

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: DashMap<String, Vec<Row>>,
    unique: HashMap<String, Vec<Vec<String>>>,
    failures: Mutex<VecDeque<DatastoreError>>,
    latency: Option<Duration>,
    selects: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject inserts that repeat the values of `columns` in `table`.
    pub fn with_unique(mut self, table: &str, columns: &[&str]) -> Self {
        self.unique
            .entry(table.to_string())
            .or_default()
            .push(columns.iter().map(|column| column.to_string()).collect());
        self
    }

    /// Delay every operation by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next operation fail with `error`.
    pub fn fail_next(&self, error: DatastoreError) {
        mutex_lock(&self.failures, SOURCE, "fail_next").push_back(error);
    }

    /// Insert rows directly, bypassing constraints.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .get(table)
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    pub fn select_count(&self) -> usize {
        self.selects.load(AtomicOrdering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(AtomicOrdering::SeqCst)
    }

    async fn enter(&self) -> Result<(), DatastoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let injected = mutex_lock(&self.failures, SOURCE, "enter").pop_front();
        match injected {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn check_unique(&self, table: &str, existing: &[Row], row: &Row) -> Result<(), DatastoreError> {
        let primary = vec![ID_COLUMN.to_string()];
        let constraints = std::iter::once(&primary)
            .chain(self.unique.get(table).into_iter().flatten());

        for columns in constraints {
            let clash = existing.iter().any(|other| {
                columns
                    .iter()
                    .all(|column| row.get(column).is_some() && row.get(column) == other.get(column))
            });
            if clash {
                let constraint = if columns == &primary {
                    format!("{table}_pkey")
                } else {
                    format!("{table}_{}_key", columns.join("_"))
                };
                return Err(DatastoreError::Duplicate { constraint });
            }
        }
        Ok(())
    }
}

fn compare_rows(left: &Row, right: &Row, sort: &[Sort]) -> Ordering {
    for order in sort {
        let ordering = match (left.get(&order.column), right.get(&order.column)) {
            (Some(l), Some(r)) => compare_values(l, r).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        let ordering = match order.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn select(&self, table: &str, query: &SelectQuery) -> Result<RowSet, DatastoreError> {
        self.selects.fetch_add(1, AtomicOrdering::SeqCst);
        self.enter().await?;

        let mut rows: Vec<Row> = self
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filter.matches(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|left, right| compare_rows(left, right, &query.sort));

        let total = query.count.then_some(rows.len() as u64);
        if let Some(range) = query.range {
            let offset = usize::try_from(range.offset).unwrap_or(usize::MAX);
            let limit = usize::try_from(range.limit).unwrap_or(usize::MAX);
            rows = rows.into_iter().skip(offset).take(limit).collect();
        }

        debug!(table, rows = rows.len(), "memory select");
        Ok(RowSet { rows, total })
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row, DatastoreError> {
        self.writes.fetch_add(1, AtomicOrdering::SeqCst);
        self.enter().await?;

        if !row.contains_key(ID_COLUMN) {
            row.insert(
                ID_COLUMN.to_string(),
                Value::String(Uuid::new_v4().to_string()),
            );
        }

        let mut rows = self.tables.entry(table.to_string()).or_default();
        self.check_unique(table, &rows, &row)?;
        rows.push(row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        table: &str,
        filter: &Filter,
        patch: Row,
    ) -> Result<Row, DatastoreError> {
        self.writes.fetch_add(1, AtomicOrdering::SeqCst);
        self.enter().await?;

        let not_found = || DatastoreError::NotFound {
            table: table.to_string(),
        };
        let mut rows = self.tables.get_mut(table).ok_or_else(not_found)?;
        let mut updated = None;
        for row in rows.iter_mut().filter(|row| filter.matches(row)) {
            for (column, value) in &patch {
                row.insert(column.clone(), value.clone());
            }
            if updated.is_none() {
                updated = Some(row.clone());
            }
        }
        updated.ok_or_else(not_found)
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<(), DatastoreError> {
        self.writes.fetch_add(1, AtomicOrdering::SeqCst);
        self.enter().await?;

        if let Some(mut rows) = self.tables.get_mut(table) {
            rows.retain(|row| !filter.matches(row));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::application::datastore::Range;

    fn row(value: Value) -> Row {
        value.as_object().cloned().expect("object")
    }

    fn services() -> MemoryStore {
        let store = MemoryStore::new();
        store.seed(
            "services",
            [
                row(json!({"id": "a", "price": 30, "category": "garden"})),
                row(json!({"id": "b", "price": 10, "category": "garden"})),
                row(json!({"id": "c", "price": 20, "category": "plumbing"})),
            ],
        );
        store
    }

    #[tokio::test]
    async fn select_filters_sorts_and_pages() {
        let store = services();
        let query = SelectQuery {
            filter: Filter::new().eq("category", "garden"),
            sort: vec![Sort::ascending("price")],
            range: Some(Range { offset: 0, limit: 1 }),
            count: true,
        };

        let result = store.select("services", &query).await.expect("select");
        assert_eq!(result.total, Some(2));
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0]["id"], json!("b"));
        assert_eq!(store.select_count(), 1);
    }

    #[tokio::test]
    async fn unique_constraints_reject_duplicates() {
        let store = MemoryStore::new().with_unique("favorites", &["user_id", "service_id"]);
        let favorite = row(json!({"user_id": "u", "service_id": "s"}));

        store
            .insert("favorites", favorite.clone())
            .await
            .expect("first insert");
        let error = store
            .insert("favorites", favorite)
            .await
            .expect_err("duplicate");
        assert_eq!(
            error,
            DatastoreError::Duplicate {
                constraint: "favorites_user_id_service_id_key".into()
            }
        );
    }

    #[tokio::test]
    async fn update_without_match_is_not_found() {
        let store = services();
        let error = store
            .update("services", &Filter::new().eq("id", "zzz"), row(json!({"price": 1})))
            .await
            .expect_err("no row");
        assert!(matches!(error, DatastoreError::NotFound { .. }));

        let updated = store
            .update("services", &Filter::new().eq("id", "a"), row(json!({"price": 1})))
            .await
            .expect("row updated");
        assert_eq!(updated["price"], json!(1));
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let store = services();
        store.fail_next(DatastoreError::Timeout);

        let query = SelectQuery::default();
        assert_eq!(
            store.select("services", &query).await,
            Err(DatastoreError::Timeout)
        );
        assert!(store.select("services", &query).await.is_ok());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = services();
        let filter = Filter::new().eq("id", "a");
        store.delete("services", &filter).await.expect("delete");
        store.delete("services", &filter).await.expect("delete again");
        assert_eq!(store.rows("services").len(), 2);
    }

    #[tokio::test]
    async fn poisoned_failure_queue_still_injects() {
        let store = services();
        std::thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = store.failures.lock().expect("first lock");
                    panic!("poison");
                })
                .join();
        });
        assert!(store.failures.is_poisoned());

        store.fail_next(DatastoreError::Timeout);
        let result = store.select("services", &SelectQuery::default()).await;
        assert!(matches!(result, Err(DatastoreError::Timeout)));
        assert!(store.select("services", &SelectQuery::default()).await.is_ok());
    }
}
