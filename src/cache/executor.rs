//! Query execution: freshness checks, de-duplicated loads, retries,
//! stale-while-revalidate and garbage collection.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, instrument, warn};

use super::config::CacheConfig;
use super::error::QueryError;
use super::keys::{QueryFilter, QueryKey};
use super::observer::Subscription;
use super::store::{Lookup, QuerySnapshot, QueryStore, RefetchCandidate};
use super::strategy::CacheStrategy;

const METRIC_HIT: &str = "vitrine_query_hit_total";
const METRIC_MISS: &str = "vitrine_query_miss_total";
const METRIC_DEDUP: &str = "vitrine_query_dedup_total";
const METRIC_FETCH_MS: &str = "vitrine_query_fetch_ms";
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Produces the value of one query. Called once per attempt.
pub type Loader = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, QueryError>> + Send + Sync>;

/// Wrap an async closure as a [`Loader`].
pub fn loader<F, Fut>(load: F) -> Loader
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
{
    Arc::new(move || load().boxed())
}

type SharedFetch = Shared<BoxFuture<'static, Result<Value, QueryError>>>;

struct InFlight {
    generation: u64,
    shared: SharedFetch,
    abort: AbortHandle,
}

struct Inner {
    store: QueryStore,
    in_flight: DashMap<QueryKey, InFlight>,
    /// Callers currently awaiting a load of each key.
    waiters: DashMap<QueryKey, usize>,
    retry_delay: Duration,
    generation: AtomicU64,
}

/// Serves queries from the cache and runs their loaders.
///
/// Cheap to clone; clones share the same cache.
#[derive(Clone)]
pub struct QueryExecutor {
    inner: Arc<Inner>,
}

impl QueryExecutor {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: QueryStore::new(config.max_entries_non_zero()),
                in_flight: DashMap::new(),
                waiters: DashMap::new(),
                retry_delay: config.retry_delay(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn store(&self) -> &QueryStore {
        &self.inner.store
    }

    /// Read `key`, loading it when missing or invalidated.
    ///
    /// Stale data is returned immediately while a background refetch runs.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn fetch(
        &self,
        key: &QueryKey,
        strategy: CacheStrategy,
        loader: Loader,
    ) -> Result<Value, QueryError> {
        match self.inner.store.lookup(key, Instant::now()) {
            Lookup::Fresh(value) => {
                counter!(METRIC_HIT, "freshness" => "fresh").increment(1);
                Ok(value)
            }
            Lookup::Stale(value) => {
                counter!(METRIC_HIT, "freshness" => "stale").increment(1);
                debug!("serving stale data while revalidating");
                let _ = self.start_fetch(key, strategy, loader);
                Ok(value)
            }
            Lookup::Missing => {
                counter!(METRIC_MISS).increment(1);
                let shared = self.start_fetch(key, strategy, loader);
                self.await_fetch(key, shared).await
            }
        }
    }

    /// Load `key` now even if the cached value is fresh.
    pub async fn refetch(
        &self,
        key: &QueryKey,
        strategy: CacheStrategy,
        loader: Loader,
    ) -> Result<Value, QueryError> {
        let shared = self.start_fetch(key, strategy, loader);
        self.await_fetch(key, shared).await
    }

    async fn await_fetch(&self, key: &QueryKey, mut shared: SharedFetch) -> Result<Value, QueryError> {
        let _waiter = Waiter::register(&self.inner.waiters, key);
        loop {
            match shared.await {
                Err(QueryError::Cancelled) => {
                    // A replacement load may have started after the cancel.
                    let replacement = self
                        .inner
                        .in_flight
                        .get(key)
                        .map(|flight| flight.shared.clone());
                    match replacement {
                        Some(next) => shared = next,
                        None => return self.inner.store.data(key).ok_or(QueryError::Cancelled),
                    }
                }
                other => return other,
            }
        }
    }

    fn start_fetch(&self, key: &QueryKey, strategy: CacheStrategy, loader: Loader) -> SharedFetch {
        match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(existing) => {
                counter!(METRIC_DEDUP).increment(1);
                existing.get().shared.clone()
            }
            Entry::Vacant(slot) => {
                let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .store
                    .begin_fetch(key, strategy, loader.clone(), Instant::now());

                let task = tokio::spawn(run_fetch(
                    Arc::clone(&self.inner),
                    key.clone(),
                    generation,
                    strategy,
                    loader,
                ));
                let abort = task.abort_handle();
                let shared = async move { task.await.unwrap_or(Err(QueryError::Cancelled)) }
                    .boxed()
                    .shared();

                slot.insert(InFlight {
                    generation,
                    shared: shared.clone(),
                    abort,
                });
                shared
            }
        }
    }

    /// Abort the in-flight load of `key`. Its result will never reach the cache.
    pub fn cancel(&self, key: &QueryKey) -> bool {
        match self.inner.in_flight.remove(key) {
            Some((_, flight)) => {
                flight.abort.abort();
                self.inner.store.abort_fetch(key);
                debug!(key = %key, "cancelled in-flight query");
                true
            }
            None => false,
        }
    }

    /// Abort every in-flight load matched by `filter`.
    pub fn cancel_matching(&self, filter: &QueryFilter) -> usize {
        self.cancel_keys(filter).len()
    }

    fn cancel_keys(&self, filter: &QueryFilter) -> Vec<QueryKey> {
        let keys: Vec<QueryKey> = self
            .inner
            .in_flight
            .iter()
            .filter(|flight| filter.matches(flight.key()))
            .map(|flight| flight.key().clone())
            .collect();
        keys.into_iter().filter(|key| self.cancel(key)).collect()
    }

    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.inner.in_flight.contains_key(key)
    }

    /// Mark every entry matched by `filters` invalidated and refetch the
    /// observed ones. Loads already running for those keys are restarted, so
    /// their waiters receive the new result.
    #[instrument(skip_all, fields(filters = filters.len()))]
    pub fn invalidate(&self, filters: &[QueryFilter]) -> usize {
        let mut invalidated = 0;
        for filter in filters {
            let interrupted = self.cancel_keys(filter);
            let (matched, mut refetch) = self.inner.store.invalidate(filter);
            invalidated += matched;
            for key in interrupted {
                if refetch.iter().any(|candidate| candidate.key == key) {
                    continue;
                }
                if let Some(candidate) = self.inner.store.refetch_candidate(&key) {
                    refetch.push(candidate);
                }
            }
            self.refetch_all(refetch);
        }
        debug!(invalidated, "invalidated queries");
        invalidated
    }

    /// Refetch observed, stale entries whose strategy refetches on focus.
    pub fn on_focus(&self) -> usize {
        let candidates = self
            .inner
            .store
            .refetch_candidates(Instant::now(), |strategy| strategy.refetch_on_focus);
        self.refetch_all(candidates)
    }

    /// Refetch observed, stale entries whose strategy refetches on reconnect.
    pub fn on_reconnect(&self) -> usize {
        let candidates = self
            .inner
            .store
            .refetch_candidates(Instant::now(), |strategy| strategy.refetch_on_reconnect);
        self.refetch_all(candidates)
    }

    fn refetch_all(&self, candidates: Vec<RefetchCandidate>) -> usize {
        let count = candidates.len();
        for candidate in candidates {
            let _ = self.start_fetch(&candidate.key, candidate.strategy, candidate.loader);
        }
        count
    }

    pub fn collect_garbage(&self) -> usize {
        self.inner.store.collect_garbage(Instant::now())
    }

    /// Run [`collect_garbage`](Self::collect_garbage) every `interval` until
    /// the executor is dropped or the handle aborted. Intervals shorter than
    /// one millisecond are raised to one millisecond.
    pub fn spawn_gc_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let evicted = inner.store.collect_garbage(Instant::now());
                if evicted > 0 {
                    debug!(evicted, "garbage collection sweep");
                }
            }
        })
    }

    pub fn get_data(&self, key: &QueryKey) -> Option<Value> {
        self.inner.store.data(key)
    }

    pub fn snapshot(&self, key: &QueryKey) -> Option<QuerySnapshot> {
        self.inner.store.snapshot(key)
    }

    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Observe `key`. Mounting loads it when missing, or when stale and the
    /// strategy refetches on mount.
    pub fn subscribe(&self, key: &QueryKey, strategy: CacheStrategy, loader: Loader) -> Subscription {
        let (receiver, lookup) =
            self.inner
                .store
                .subscribe(key, strategy, loader.clone(), Instant::now());

        match lookup {
            Lookup::Missing => {
                let _ = self.start_fetch(key, strategy, loader);
            }
            Lookup::Stale(_) if strategy.refetch_on_mount => {
                let _ = self.start_fetch(key, strategy, loader);
            }
            _ => {}
        }

        Subscription::new(key.clone(), receiver, self.clone())
    }

    /// Called when a [`Subscription`] is dropped. The pending load is only
    /// cancelled when no observer and no `fetch` caller still wants it.
    pub(crate) fn release(&self, key: &QueryKey) {
        if self.inner.store.unsubscribe(key, Instant::now()) == 0 && !self.has_waiters(key) {
            self.cancel(key);
        }
    }

    fn has_waiters(&self, key: &QueryKey) -> bool {
        self.inner
            .waiters
            .get(key)
            .is_some_and(|count| *count > 0)
    }
}

/// Counts one caller awaiting a load of `key` for as long as it lives.
struct Waiter<'a> {
    waiters: &'a DashMap<QueryKey, usize>,
    key: QueryKey,
}

impl<'a> Waiter<'a> {
    fn register(waiters: &'a DashMap<QueryKey, usize>, key: &QueryKey) -> Self {
        *waiters.entry(key.clone()).or_insert(0) += 1;
        Self {
            waiters,
            key: key.clone(),
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if let Some(mut count) = self.waiters.get_mut(&self.key) {
            *count = count.saturating_sub(1);
        }
        self.waiters.remove_if(&self.key, |_, count| *count == 0);
    }
}

async fn run_fetch(
    inner: Arc<Inner>,
    key: QueryKey,
    generation: u64,
    strategy: CacheStrategy,
    loader: Loader,
) -> Result<Value, QueryError> {
    let started = Instant::now();
    let mut attempt = 0;
    let result = loop {
        match loader().await {
            Ok(value) => break Ok(value),
            Err(error) if error.is_transient() && attempt < strategy.retry_count => {
                attempt += 1;
                warn!(key = %key, attempt, error = %error, "query load failed, retrying");
                tokio::time::sleep(inner.retry_delay).await;
            }
            Err(error) => break Err(error),
        }
    };
    histogram!(METRIC_FETCH_MS).record(started.elapsed().as_secs_f64() * 1000.0);

    settle(&inner, &key, generation, strategy, result)
}

/// Write a finished load into the store, unless it was cancelled or
/// superseded in the meantime.
fn settle(
    inner: &Inner,
    key: &QueryKey,
    generation: u64,
    strategy: CacheStrategy,
    result: Result<Value, QueryError>,
) -> Result<Value, QueryError> {
    match inner.in_flight.entry(key.clone()) {
        Entry::Occupied(slot) if slot.get().generation == generation => {
            match &result {
                Ok(value) => {
                    inner
                        .store
                        .complete_fetch(key, strategy, value.clone(), Instant::now())
                }
                Err(error) => inner.store.fail_fetch(key, error.clone()),
            }
            slot.remove();
            result
        }
        _ => {
            debug!(key = %key, generation, "discarding superseded query result");
            Err(QueryError::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;
    use crate::cache::keys::{Entity, QueryParams};
    use crate::cache::store::QueryStatus;

    fn key() -> QueryKey {
        QueryKey::list(&Entity::new("services"), &QueryParams::new())
    }

    fn counting_loader(calls: Arc<AtomicUsize>) -> Loader {
        loader(move || {
            let calls = Arc::clone(&calls);
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!(call))
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_reads_do_not_load() {
        let executor = QueryExecutor::new(&CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let first = executor
            .fetch(&key(), CacheStrategy::MEDIUM, counting_loader(Arc::clone(&calls)))
            .await;
        let second = executor
            .fetch(&key(), CacheStrategy::MEDIUM, counting_loader(Arc::clone(&calls)))
            .await;

        assert_eq!(first, Ok(json!(1)));
        assert_eq!(second, Ok(json!(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let executor = QueryExecutor::new(&CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let flaky = loader(move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(QueryError::transient("reset"))
                } else {
                    Ok(json!("ok"))
                }
            }
        });

        let result = executor.fetch(&key(), CacheStrategy::MEDIUM, flaky).await;
        assert_eq!(result, Ok(json!("ok")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let executor = QueryExecutor::new(&CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let rejected = loader(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(QueryError::Rejected { message: "bad filter".into() }) }
        });

        let result = executor.fetch(&key(), CacheStrategy::HIGH, rejected).await;
        assert!(matches!(result, Err(QueryError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            executor.snapshot(&key()).map(|snapshot| snapshot.status),
            Some(QueryStatus::Error)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_after_retry_count() {
        let executor = QueryExecutor::new(&CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let down = loader(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(QueryError::transient("down")) }
        });

        let result = executor.fetch(&key(), CacheStrategy::STATIC, down).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
