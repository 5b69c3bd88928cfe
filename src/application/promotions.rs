//! Sponsored rotation fed from the query cache.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{instrument, warn};

use crate::{
    application::datastore::{Row, Sort},
    cache::{Entity, ListParams, MutationOutcome, QueryClient, QueryError},
    domain::{
        marketplace::{HOMEPAGE, PROMOTIONS},
        promotions::{Promotion, PromotionStatus},
    },
    rotation::CandidateSource,
};

const FEED_PAGE_SIZE: u64 = 100;

/// Active promotions as shown on the landing page.
#[derive(Clone)]
pub struct PromotionFeed {
    client: QueryClient,
    entity: Entity,
}

impl PromotionFeed {
    pub fn new(client: QueryClient) -> Self {
        Self {
            client,
            entity: Entity::new(PROMOTIONS),
        }
    }

    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    fn params() -> ListParams {
        ListParams::default()
            .filter("status", PromotionStatus::Active.as_str())
            .sort(Sort::descending("budget"))
            .page(0, FEED_PAGE_SIZE)
    }

    #[instrument(skip(self))]
    pub async fn active(&self) -> Result<Vec<Promotion>, QueryError> {
        let page = self
            .client
            .list(&self.entity, &Self::params(), Some(HOMEPAGE))
            .await?;
        Ok(page.rows.into_iter().filter_map(decode).collect())
    }

    pub async fn set_budget(
        &self,
        id: &str,
        budget: f64,
    ) -> Result<MutationOutcome<Row>, QueryError> {
        self.client
            .update(&self.entity, id, patch("budget", json!(budget)))
            .await
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: PromotionStatus,
    ) -> Result<MutationOutcome<Row>, QueryError> {
        self.client
            .update(&self.entity, id, patch("status", json!(status.as_str())))
            .await
    }
}

fn patch(column: &str, value: Value) -> Row {
    let mut row = Row::new();
    row.insert(column.to_string(), value);
    row
}

fn decode(row: Row) -> Option<Promotion> {
    let id = row.get("id").cloned();
    let promotion = serde_json::from_value::<Promotion>(Value::Object(row))
        .map_err(|err| err.to_string())
        .and_then(|promotion| {
            promotion.validate().map_err(|err| err.to_string())?;
            Ok(promotion)
        });
    match promotion {
        Ok(promotion) => Some(promotion),
        Err(reason) => {
            warn!(id = ?id, reason = %reason, "skipping malformed promotion row");
            None
        }
    }
}

#[async_trait]
impl CandidateSource<Promotion> for PromotionFeed {
    async fn candidates(&self) -> Result<Vec<Promotion>, QueryError> {
        self.active().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{
        cache::CacheConfig,
        domain::marketplace::{entity_registry, strategy_resolver},
        infra::memory_store::MemoryStore,
    };

    fn row(value: Value) -> Row {
        value.as_object().cloned().expect("object")
    }

    fn feed(store: Arc<MemoryStore>) -> PromotionFeed {
        let client = QueryClient::new(
            &CacheConfig::default(),
            strategy_resolver().expect("resolver"),
            entity_registry().expect("registry"),
            store,
        );
        PromotionFeed::new(client)
    }

    #[tokio::test]
    async fn only_active_valid_rows_are_candidates() {
        let store = Arc::new(MemoryStore::new());
        store.seed(
            PROMOTIONS,
            [
                row(json!({"id": "a", "service_id": "s1", "title": "A", "budget": 10.0, "status": "active"})),
                row(json!({"id": "b", "service_id": "s2", "title": "B", "budget": 90.0, "status": "paused"})),
                row(json!({"id": "c", "service_id": "s3", "title": "C", "status": "active"})),
            ],
        );

        let active = feed(store).active().await.expect("candidates");
        let ids: Vec<&str> = active.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let store = Arc::new(MemoryStore::new());
        store.seed(
            PROMOTIONS,
            [row(json!({"id": "a", "service_id": "s1", "title": "A", "budget": 10.0, "status": "active"}))],
        );
        let feed = feed(Arc::clone(&store));

        feed.candidates().await.expect("first");
        feed.candidates().await.expect("second");
        assert_eq!(store.select_count(), 1);
    }
}
