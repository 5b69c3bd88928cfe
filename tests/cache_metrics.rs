use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics_util::debugging::DebuggingRecorder;
use serde_json::{Value, json};
use vitrine::application::datastore::{DatastoreError, RemoteStore, Row};
use vitrine::cache::{
    CacheConfig, CacheStrategy, Entity, ListParams, QueryClient, QueryError, QueryExecutor,
    QueryKey, QueryParams, loader,
};
use vitrine::domain::marketplace::{self, SERVICES};
use vitrine::domain::promotions::{Promotion, PromotionStatus};
use vitrine::infra::{memory_store::MemoryStore, telemetry};
use vitrine::rotation::{CandidateSource, FixedRandom, RotationPolicy, Rotator};

fn row(value: Value) -> Row {
    value.as_object().cloned().expect("object")
}

#[tokio::test(start_paused = true)]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    // Hit, miss, dedup and fetch latency
    let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(10)));
    store.seed(SERVICES, [row(json!({"id": "s-1", "price": 10}))]);
    let client = QueryClient::new(
        &CacheConfig::default(),
        marketplace::strategy_resolver().expect("resolver"),
        marketplace::entity_registry().expect("registry"),
        Arc::clone(&store) as Arc<dyn RemoteStore>,
    );
    let services = Entity::new(SERVICES);
    let params = ListParams::default();
    let (first, second) = tokio::join!(
        client.list(&services, &params, None),
        client.list(&services, &params, None)
    );
    first.expect("first read");
    second.expect("second read");
    client.list(&services, &params, None).await.expect("cached read");

    // Mutation outcomes
    client
        .update(&services, "s-1", row(json!({"price": 12})))
        .await
        .expect("update");
    store.fail_next(DatastoreError::Timeout);
    assert!(client.delete(&services, "s-1").await.is_err());

    // Capacity and gc evictions
    let small = QueryExecutor::new(&CacheConfig {
        max_entries: 1,
        ..Default::default()
    });
    let short = CacheStrategy::MEDIUM.with_times(Duration::from_secs(1), Duration::from_secs(2));
    for name in ["a", "b"] {
        let key = QueryKey::list(&Entity::new(name), &QueryParams::new());
        small
            .fetch(&key, short, loader(|| async { Ok(json!(1)) }))
            .await
            .expect("load");
    }
    tokio::time::sleep(Duration::from_secs(3)).await;
    small.collect_garbage();

    // Rotation draws
    let source: Arc<dyn CandidateSource<Promotion>> = Arc::new(promotions());
    let handle = Rotator::spawn(
        RotationPolicy::default(),
        source,
        Box::new(FixedRandom(0.3)),
        Arc::new(|_: &Promotion| {}),
    );
    tokio::time::sleep(Duration::from_millis(1)).await;
    handle.stop();

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "vitrine_query_hit_total",
        "vitrine_query_miss_total",
        "vitrine_query_dedup_total",
        "vitrine_query_evict_total",
        "vitrine_query_fetch_ms",
        "vitrine_mutation_total",
        "vitrine_mutation_ms",
        "vitrine_rotation_draw_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}

struct StaticPromotions(Vec<Promotion>);

#[async_trait]
impl CandidateSource<Promotion> for StaticPromotions {
    async fn candidates(&self) -> Result<Vec<Promotion>, QueryError> {
        Ok(self.0.clone())
    }
}

fn promotions() -> StaticPromotions {
    StaticPromotions(vec![Promotion {
        id: "p-1".into(),
        service_id: "s-1".into(),
        title: "Metrics".into(),
        budget: 25.0,
        status: PromotionStatus::Active,
    }])
}
