//! Entity-aware facade over the executor and the mutation coordinator.
//!
//! Builds keys, strategies and loaders from the entity catalogue so callers
//! only name an entity and what they want from it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use super::config::CacheConfig;
use super::entities::{EntityConfig, EntityRegistry};
use super::error::QueryError;
use super::executor::{Loader, QueryExecutor, loader};
use super::keys::{Entity, Operation, QueryFilter, QueryKey, QueryParams};
use super::mutation::{
    MutationCoordinator, MutationOutcome, MutationRequest, OptimisticUpdate, ToggleTarget,
};
use super::observer::Subscription;
use super::strategy::{CacheStrategy, StrategyResolver};
use crate::application::datastore::{
    Filter, Range, RemoteStore, Row, SelectQuery, Sort, SortDirection,
};

const DEFAULT_PAGE_SIZE: u64 = 20;
const MEMBERS: &str = "members";

/// Parameters of a paginated list read.
#[derive(Debug, Clone, PartialEq)]
pub struct ListParams {
    /// Equality filters, column to value.
    pub filters: BTreeMap<String, Value>,
    pub search: Option<String>,
    pub sort: Option<Sort>,
    pub page: u64,
    pub page_size: u64,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            filters: BTreeMap::new(),
            search: None,
            sort: None,
            page: 0,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ListParams {
    pub fn filter(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(column.into(), value.into());
        self
    }

    pub fn search(mut self, term: impl Into<String>) -> Self {
        self.search = Some(term.into());
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn page(mut self, page: u64, page_size: u64) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    fn to_params(&self) -> QueryParams {
        let mut params = QueryParams::new()
            .with("page", self.page)
            .with("page_size", self.page_size);
        if !self.filters.is_empty() {
            params.insert(
                "filters",
                Value::Object(self.filters.clone().into_iter().collect()),
            );
        }
        if let Some(term) = &self.search {
            params.insert("search", term.as_str());
        }
        if let Some(sort) = &self.sort {
            let direction = match sort.direction {
                SortDirection::Ascending => "asc",
                SortDirection::Descending => "desc",
            };
            params.insert("sort", format!("{}:{direction}", sort.column));
        }
        params
    }

    fn to_select(&self, config: &EntityConfig) -> SelectQuery {
        let mut filter = Filter::new();
        for (column, value) in &self.filters {
            filter = filter.eq(column.clone(), value.clone());
        }
        if let Some(term) = &self.search
            && !config.searchable.is_empty()
        {
            filter = filter.search(config.searchable.clone(), term.clone());
        }

        SelectQuery {
            filter,
            sort: self
                .sort
                .clone()
                .or_else(|| config.default_sort.clone())
                .into_iter()
                .collect(),
            range: Some(Range::page(self.page, self.page_size)),
            count: true,
        }
    }
}

/// One page of rows with the total number of matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListPage {
    pub rows: Vec<Row>,
    pub total: Option<u64>,
}

#[derive(Clone)]
pub struct QueryClient {
    executor: QueryExecutor,
    mutations: MutationCoordinator,
    resolver: Arc<StrategyResolver>,
    entities: Arc<EntityRegistry>,
    remote: Arc<dyn RemoteStore>,
}

impl QueryClient {
    pub fn new(
        config: &CacheConfig,
        resolver: StrategyResolver,
        entities: EntityRegistry,
        remote: Arc<dyn RemoteStore>,
    ) -> Self {
        let executor = QueryExecutor::new(config);
        Self {
            mutations: MutationCoordinator::new(executor.clone()),
            executor,
            resolver: Arc::new(resolver),
            entities: Arc::new(entities),
            remote,
        }
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn mutations(&self) -> &MutationCoordinator {
        &self.mutations
    }

    pub fn resolver(&self) -> &StrategyResolver {
        &self.resolver
    }

    pub fn entities(&self) -> &EntityRegistry {
        &self.entities
    }

    pub fn strategy(
        &self,
        entity: &Entity,
        operation: &Operation,
        context: Option<&str>,
    ) -> CacheStrategy {
        self.resolver.resolve(entity, operation, context)
    }

    /// Families to invalidate after `entity` changes.
    pub fn invalidation_targets(&self, entity: &Entity) -> Vec<QueryFilter> {
        self.entities.invalidation_targets(entity)
    }

    #[instrument(skip(self, entity, params), fields(entity = %entity))]
    pub async fn list(
        &self,
        entity: &Entity,
        params: &ListParams,
        context: Option<&str>,
    ) -> Result<ListPage, QueryError> {
        let config = self.entities.get(entity)?;
        let key = QueryKey::list(entity, &params.to_params());
        let strategy = self.strategy(entity, &Operation::List, context);
        let value = self
            .executor
            .fetch(&key, strategy, self.list_loader(config, params))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn watch_list(
        &self,
        entity: &Entity,
        params: &ListParams,
        context: Option<&str>,
    ) -> Result<Subscription, QueryError> {
        let config = self.entities.get(entity)?;
        let key = QueryKey::list(entity, &params.to_params());
        let strategy = self.strategy(entity, &Operation::List, context);
        Ok(self
            .executor
            .subscribe(&key, strategy, self.list_loader(config, params)))
    }

    /// Read one record. A missing record is [`QueryError::NotFound`].
    #[instrument(skip(self, entity), fields(entity = %entity))]
    pub async fn detail(&self, entity: &Entity, id: &str) -> Result<Row, QueryError> {
        let config = self.entities.get(entity)?;
        let key = QueryKey::detail(entity, id);
        let strategy = self.strategy(entity, &Operation::Detail, None);
        let value = self
            .executor
            .fetch(&key, strategy, self.detail_loader(config, id))
            .await?;
        into_row(value)
    }

    pub fn watch_detail(&self, entity: &Entity, id: &str) -> Result<Subscription, QueryError> {
        let config = self.entities.get(entity)?;
        let key = QueryKey::detail(entity, id);
        let strategy = self.strategy(entity, &Operation::Detail, None);
        Ok(self
            .executor
            .subscribe(&key, strategy, self.detail_loader(config, id)))
    }

    /// Rows of `entity` owned by `user_id`.
    #[instrument(skip(self, entity), fields(entity = %entity))]
    pub async fn user_rows(&self, entity: &Entity, user_id: &str) -> Result<Vec<Row>, QueryError> {
        let config = self.entities.get(entity)?;
        let owner = owner_column(config)?;
        let key = QueryKey::user(entity, user_id);
        let strategy = self.strategy(entity, &Operation::User, None);

        let query = SelectQuery {
            filter: Filter::new().eq(owner, user_id),
            sort: config.default_sort.clone().into_iter().collect(),
            range: None,
            count: false,
        };
        let value = self
            .executor
            .fetch(&key, strategy, self.select_loader(config, query, |rows| {
                Value::Array(rows.into_iter().map(Value::Object).collect())
            }))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Values of `member_column` across the rows `user_id` owns, e.g. the
    /// ids of the services a user marked as favourite.
    pub async fn memberships(
        &self,
        entity: &Entity,
        user_id: &str,
        member_column: &str,
    ) -> Result<Vec<Value>, QueryError> {
        let config = self.entities.get(entity)?;
        let owner = owner_column(config)?;
        let key = memberships_key(entity, user_id);
        let strategy = self.strategy(entity, &Operation::User, None);

        let query = SelectQuery {
            filter: Filter::new().eq(owner, user_id),
            ..SelectQuery::default()
        };
        let member_column = member_column.to_string();
        let value = self
            .executor
            .fetch(&key, strategy, self.select_loader(config, query, move |rows| {
                Value::Array(
                    rows.into_iter()
                        .filter_map(|mut row| row.remove(&member_column))
                        .collect(),
                )
            }))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn insert(&self, entity: &Entity, row: Row) -> Result<MutationOutcome<Row>, QueryError> {
        let table = self.entities.get(entity)?.source.clone();
        let request = MutationRequest::new(format!("{entity}.insert"))
            .invalidate_all(self.invalidation_targets(entity));
        let remote = Arc::clone(&self.remote);
        self.mutations
            .mutate(request, async move { Ok::<_, QueryError>(remote.insert(&table, row).await?) })
            .await
    }

    /// Patch one record. The detail entry and every cached list or user row
    /// with that id are updated optimistically.
    pub async fn update(
        &self,
        entity: &Entity,
        id: &str,
        patch: Row,
    ) -> Result<MutationOutcome<Row>, QueryError> {
        let config = self.entities.get(entity)?;
        let table = config.source.clone();
        let id_column = config.id_column.clone();

        let detail_patch = patch.clone();
        let mut request = MutationRequest::new(format!("{entity}.update"))
            .optimistic(OptimisticUpdate::update(
                QueryKey::detail(entity, id),
                move |current| current.map(|value| merge_row(value, &detail_patch)),
            ));
        for family in [QueryKey::lists(entity), QueryKey::users(entity)] {
            let patch = patch.clone();
            let id_column = id_column.clone();
            let id = Value::from(id);
            request = request.optimistic(OptimisticUpdate::update_all(
                QueryFilter::prefix(family),
                move |value| {
                    map_rows(value, |row| {
                        if row.get(&id_column) == Some(&id) {
                            Some(merge_row_map(row, &patch))
                        } else {
                            Some(row.clone())
                        }
                    })
                },
            ));
        }
        request = request.invalidate_all(self.invalidation_targets(entity));

        let remote = Arc::clone(&self.remote);
        let filter = Filter::new().eq(id_column, id);
        self.mutations
            .mutate(request, async move {
                Ok::<_, QueryError>(remote.update(&table, &filter, patch).await?)
            })
            .await
    }

    /// Delete one record, removing it optimistically from cached reads.
    pub async fn delete(&self, entity: &Entity, id: &str) -> Result<MutationOutcome<()>, QueryError> {
        let config = self.entities.get(entity)?;
        let table = config.source.clone();
        let id_column = config.id_column.clone();

        let mut request = MutationRequest::new(format!("{entity}.delete"))
            .optimistic(OptimisticUpdate::remove(QueryKey::detail(entity, id)));
        for family in [QueryKey::lists(entity), QueryKey::users(entity)] {
            let id_column = id_column.clone();
            let id = Value::from(id);
            request = request.optimistic(OptimisticUpdate::update_all(
                QueryFilter::prefix(family),
                move |value| {
                    map_rows(value, |row| {
                        (row.get(&id_column) != Some(&id)).then(|| row.clone())
                    })
                },
            ));
        }
        request = request.invalidate_all(self.invalidation_targets(entity));

        let remote = Arc::clone(&self.remote);
        let filter = Filter::new().eq(id_column, id);
        self.mutations
            .mutate(request, async move { Ok::<_, QueryError>(remote.delete(&table, &filter).await?) })
            .await
    }

    /// Add `member` to the set `user_id` owns, or remove it when present.
    /// Returns the membership state after the toggle.
    #[instrument(skip(self, entity, member), fields(entity = %entity))]
    pub async fn toggle_membership(
        &self,
        entity: &Entity,
        user_id: &str,
        member_column: &str,
        member: Value,
    ) -> Result<bool, QueryError> {
        let config = self.entities.get(entity)?;
        let owner = owner_column(config)?.to_string();
        let table = config.source.clone();
        let key = memberships_key(entity, user_id);
        let remote = Arc::clone(&self.remote);
        let member_column = member_column.to_string();
        let user_id = user_id.to_string();

        let mut added = false;
        self.mutations
            .toggle(
                key,
                ToggleTarget::Member(member.clone()),
                self.invalidation_targets(entity),
                |next| {
                    added = next;
                    async move {
                        if next {
                            let mut row = Row::new();
                            row.insert(owner, Value::String(user_id));
                            row.insert(member_column, member);
                            remote.insert(&table, row).await?;
                        } else {
                            let filter = Filter::new()
                                .eq(owner, user_id)
                                .eq(member_column, member);
                            remote.delete(&table, &filter).await?;
                        }
                        Ok::<_, QueryError>(())
                    }
                },
            )
            .await?;
        Ok(added)
    }

    fn list_loader(&self, config: &EntityConfig, params: &ListParams) -> Loader {
        let query = params.to_select(config);
        let table = config.source.clone();
        let remote = Arc::clone(&self.remote);
        loader(move || {
            let remote = Arc::clone(&remote);
            let table = table.clone();
            let query = query.clone();
            async move {
                let result = remote.select(&table, &query).await?;
                Ok::<_, QueryError>(serde_json::to_value(ListPage {
                    rows: result.rows,
                    total: result.total,
                })?)
            }
        })
    }

    fn detail_loader(&self, config: &EntityConfig, id: &str) -> Loader {
        let query = SelectQuery {
            filter: Filter::new().eq(config.id_column.clone(), id),
            range: Some(Range { offset: 0, limit: 1 }),
            ..SelectQuery::default()
        };
        let entity = config.name.to_string();
        let id = id.to_string();
        let table = config.source.clone();
        let remote = Arc::clone(&self.remote);
        loader(move || {
            let remote = Arc::clone(&remote);
            let table = table.clone();
            let query = query.clone();
            let entity = entity.clone();
            let id = id.clone();
            async move {
                let result = remote.select(&table, &query).await?;
                result
                    .rows
                    .into_iter()
                    .next()
                    .map(Value::Object)
                    .ok_or_else(|| QueryError::not_found(entity, id))
            }
        })
    }

    fn select_loader<F>(&self, config: &EntityConfig, query: SelectQuery, shape: F) -> Loader
    where
        F: Fn(Vec<Row>) -> Value + Send + Sync + 'static,
    {
        let table = config.source.clone();
        let remote = Arc::clone(&self.remote);
        let shape = Arc::new(shape);
        loader(move || {
            let remote = Arc::clone(&remote);
            let table = table.clone();
            let query = query.clone();
            let shape = Arc::clone(&shape);
            async move {
                let result = remote.select(&table, &query).await?;
                Ok::<_, QueryError>(shape(result.rows))
            }
        })
    }
}

fn memberships_key(entity: &Entity, user_id: &str) -> QueryKey {
    QueryKey::build(
        entity,
        &Operation::Custom(MEMBERS.to_string()),
        &QueryParams::new().with("user_id", user_id),
    )
}

fn owner_column(config: &EntityConfig) -> Result<&str, QueryError> {
    config
        .owner_column
        .as_deref()
        .ok_or_else(|| QueryError::Rejected {
            message: format!("entity `{}` has no owner column", config.name),
        })
}

fn into_row(value: Value) -> Result<Row, QueryError> {
    match value {
        Value::Object(row) => Ok(row),
        other => Err(QueryError::decode(format!("expected a row, got {other}"))),
    }
}

fn merge_row(value: &Value, patch: &Row) -> Value {
    match value {
        Value::Object(row) => Value::Object(merge_row_map(row, patch)),
        other => other.clone(),
    }
}

fn merge_row_map(row: &Row, patch: &Row) -> Row {
    let mut merged = row.clone();
    for (column, value) in patch {
        merged.insert(column.clone(), value.clone());
    }
    merged
}

/// Rewrite the rows of a cached list page or row array. `None` drops a row.
fn map_rows(value: &Value, mut rewrite: impl FnMut(&Row) -> Option<Row>) -> Value {
    let mut rewrite_all = |rows: &[Value]| -> (Vec<Value>, usize) {
        let mut removed = 0;
        let kept = rows
            .iter()
            .filter_map(|row| match row {
                Value::Object(row) => {
                    let next = rewrite(row).map(Value::Object);
                    if next.is_none() {
                        removed += 1;
                    }
                    next
                }
                other => Some(other.clone()),
            })
            .collect();
        (kept, removed)
    };

    match value {
        Value::Array(rows) => Value::Array(rewrite_all(rows.as_slice()).0),
        Value::Object(page) => match page.get("rows").and_then(Value::as_array) {
            Some(rows) => {
                let (kept, removed) = rewrite_all(rows.as_slice());
                let mut page = page.clone();
                page.insert("rows".to_string(), Value::Array(kept));
                if let Some(total) = page.get("total").and_then(Value::as_u64) {
                    page.insert(
                        "total".to_string(),
                        Value::from(total.saturating_sub(removed as u64)),
                    );
                }
                Value::Object(page)
            }
            None => value.clone(),
        },
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row(value: Value) -> Row {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn list_params_are_part_of_the_key() {
        let entity = Entity::new("services");
        let first = ListParams::default().filter("category", "garden");
        let second = ListParams::default().filter("category", "plumbing");

        assert_ne!(
            QueryKey::list(&entity, &first.to_params()),
            QueryKey::list(&entity, &second.to_params())
        );
        assert_eq!(
            QueryKey::list(&entity, &first.to_params()),
            QueryKey::list(&entity, &first.clone().to_params())
        );
    }

    #[test]
    fn select_falls_back_to_default_sort() {
        let config = EntityConfig::new("services")
            .default_sort(Sort::descending("created_at"))
            .searchable(&["title"]);
        let query = ListParams::default().search("hedge").page(2, 10).to_select(&config);

        assert_eq!(query.sort, vec![Sort::descending("created_at")]);
        assert_eq!(query.range, Some(Range { offset: 20, limit: 10 }));
        assert!(query.count);
        assert_eq!(query.filter.conditions.len(), 1);
    }

    #[test]
    fn map_rows_patches_pages_and_adjusts_total() {
        let page = json!({"rows": [{"id": "a", "n": 1}, {"id": "b", "n": 2}], "total": 2});

        let patched = map_rows(&page, |r| {
            if r.get("id") == Some(&json!("a")) {
                Some(merge_row_map(r, &row(json!({"n": 10}))))
            } else {
                Some(r.clone())
            }
        });
        assert_eq!(patched["rows"][0]["n"], json!(10));

        let removed = map_rows(&page, |r| (r.get("id") != Some(&json!("b"))).then(|| r.clone()));
        assert_eq!(removed["rows"].as_array().map(Vec::len), Some(1));
        assert_eq!(removed["total"], json!(1));

        let array = map_rows(&json!([{"id": "a"}]), |_| None);
        assert_eq!(array, json!([]));
    }
}
