use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use vitrine::application::datastore::{DatastoreError, Row};
use vitrine::cache::{
    CacheConfig, Entity, ListParams, MutationOutcome, QueryClient, QueryError, QueryKey,
    QueryStatus,
};
use vitrine::domain::marketplace::{self, FAVORITES, SERVICES};
use vitrine::infra::memory_store::MemoryStore;

fn row(value: Value) -> Row {
    value.as_object().cloned().expect("object")
}

fn store() -> MemoryStore {
    let store = MemoryStore::new().with_unique(FAVORITES, &["user_id", "service_id"]);
    store.seed(
        SERVICES,
        [
            row(json!({"id": "s-1", "title": "Hedge trimming", "price": 40, "created_at": 2})),
            row(json!({"id": "s-2", "title": "Tap repair", "price": 25, "created_at": 1})),
        ],
    );
    store
}

fn client(store: Arc<MemoryStore>) -> QueryClient {
    QueryClient::new(
        &CacheConfig::default(),
        marketplace::strategy_resolver().expect("resolver"),
        marketplace::entity_registry().expect("registry"),
        store,
    )
}

fn first_price(value: &Option<Value>) -> Option<Value> {
    value
        .as_ref()
        .and_then(|page| page["rows"].get(0))
        .map(|row| row["price"].clone())
}

#[tokio::test(start_paused = true)]
async fn failed_update_shows_optimistic_state_then_rolls_back() {
    let store = Arc::new(store().with_latency(Duration::from_millis(20)));
    let client = client(Arc::clone(&store));
    let services = Entity::new(SERVICES);
    let detail_key = QueryKey::detail(&services, "s-1");

    client.detail(&services, "s-1").await.expect("detail read");
    let mut list = client
        .watch_list(&services, &ListParams::default(), None)
        .expect("known entity");
    list.wait_for(|snapshot| snapshot.status == QueryStatus::Success)
        .await
        .expect("list loaded");

    store.fail_next(DatastoreError::Persistence("connection reset".into()));
    let pending = {
        let client = client.clone();
        let services = services.clone();
        tokio::spawn(async move {
            client
                .update(&services, "s-1", row(json!({"price": 99})))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(5)).await;
    let optimistic = client.executor().get_data(&detail_key).expect("cached detail");
    assert_eq!(optimistic["price"], json!(99));
    assert_eq!(first_price(&list.current().data), Some(json!(99)));
    assert_eq!(client.mutations().pending_writes(&detail_key), 1);

    let result = pending.await.expect("task joins");
    assert!(matches!(result, Err(QueryError::Transient { .. })));

    let restored = client.executor().get_data(&detail_key).expect("cached detail");
    assert_eq!(restored["price"], json!(40));
    assert_eq!(first_price(&list.current().data), Some(json!(40)));
    assert_eq!(client.mutations().pending_writes(&detail_key), 0);
    assert_eq!(store.rows(SERVICES)[0]["price"], json!(40));
}

#[tokio::test(start_paused = true)]
async fn delete_commits_and_the_record_is_gone() {
    let store = Arc::new(store());
    let client = client(Arc::clone(&store));
    let services = Entity::new(SERVICES);

    client.detail(&services, "s-2").await.expect("detail read");
    let outcome = client.delete(&services, "s-2").await.expect("delete");
    assert_eq!(outcome, MutationOutcome::Committed(()));
    assert_eq!(store.rows(SERVICES).len(), 1);

    let missing = client.detail(&services, "s-2").await;
    assert!(matches!(missing, Err(ref error) if error.is_missing()));

    let page = client
        .list(&services, &ListParams::default(), None)
        .await
        .expect("list");
    assert_eq!(page.rows.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_insert_is_treated_as_already_applied() {
    let store = Arc::new(store());
    let client = client(Arc::clone(&store));
    let favorites = Entity::new(FAVORITES);
    let favorite = row(json!({"user_id": "u-1", "service_id": "s-1"}));

    let first = client
        .insert(&favorites, favorite.clone())
        .await
        .expect("first insert");
    assert!(matches!(first, MutationOutcome::Committed(_)));

    let second = client.insert(&favorites, favorite).await.expect("duplicate");
    assert_eq!(second, MutationOutcome::AlreadyApplied);
    assert_eq!(store.rows(FAVORITES).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn toggling_membership_adds_then_removes() {
    let store = Arc::new(store());
    let client = client(Arc::clone(&store));
    let favorites = Entity::new(FAVORITES);

    let initial = client
        .memberships(&favorites, "u-1", "service_id")
        .await
        .expect("memberships");
    assert!(initial.is_empty());

    let added = client
        .toggle_membership(&favorites, "u-1", "service_id", json!("s-1"))
        .await
        .expect("add favourite");
    assert!(added);
    assert_eq!(store.rows(FAVORITES).len(), 1);
    assert_eq!(
        client
            .memberships(&favorites, "u-1", "service_id")
            .await
            .expect("memberships"),
        vec![json!("s-1")]
    );

    let added = client
        .toggle_membership(&favorites, "u-1", "service_id", json!("s-1"))
        .await
        .expect("remove favourite");
    assert!(!added);
    assert!(store.rows(FAVORITES).is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_toggle_leaves_memberships_untouched() {
    let store = Arc::new(store());
    let client = client(Arc::clone(&store));
    let favorites = Entity::new(FAVORITES);

    client
        .memberships(&favorites, "u-1", "service_id")
        .await
        .expect("memberships");

    store.fail_next(DatastoreError::Unavailable("maintenance".into()));
    let result = client
        .toggle_membership(&favorites, "u-1", "service_id", json!("s-2"))
        .await;
    assert!(matches!(result, Err(ref error) if error.is_transient()));

    let after = client
        .memberships(&favorites, "u-1", "service_id")
        .await
        .expect("memberships");
    assert!(after.is_empty());
    assert!(store.rows(FAVORITES).is_empty());
}
