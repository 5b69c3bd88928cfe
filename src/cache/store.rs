//! Query entry storage.
//!
//! Entries live in one LRU map guarded by a poison-tolerant `RwLock`. The
//! store never runs loaders; it only records what the executor and the
//! mutation coordinator tell it.

use std::num::NonZeroUsize;
use std::sync::RwLock;

use lru::LruCache;
use metrics::counter;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use super::error::QueryError;
use super::executor::Loader;
use super::keys::{QueryFilter, QueryKey};
use super::lock::{rw_read, rw_write};
use super::strategy::CacheStrategy;

const SOURCE: &str = "cache::store";
const METRIC_EVICT: &str = "vitrine_query_evict_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Idle,
    Fetching,
    Success,
    Error,
}

/// Observable state of one query.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    pub data: Option<Value>,
    pub status: QueryStatus,
    pub error: Option<QueryError>,
    pub updated_at: Option<OffsetDateTime>,
}

impl QuerySnapshot {
    fn empty() -> Self {
        Self {
            data: None,
            status: QueryStatus::Idle,
            error: None,
            updated_at: None,
        }
    }

    /// The backend answered that the record does not exist.
    pub fn is_missing(&self) -> bool {
        self.data.is_none() && self.error.as_ref().is_some_and(QueryError::is_missing)
    }

    pub fn is_loading(&self) -> bool {
        self.data.is_none() && self.status == QueryStatus::Fetching
    }
}

/// Classification of an entry at read time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Lookup {
    Fresh(Value),
    Stale(Value),
    Missing,
}

/// Everything needed to start a refetch of an observed entry.
pub(crate) struct RefetchCandidate {
    pub key: QueryKey,
    pub strategy: CacheStrategy,
    pub loader: Loader,
}

struct CacheEntry {
    data: Option<Value>,
    fetched_at: Option<Instant>,
    /// `None` until the first successful load; such entries are stale.
    stale_at: Option<Instant>,
    gc_at: Instant,
    status: QueryStatus,
    error: Option<QueryError>,
    strategy: CacheStrategy,
    loader: Option<Loader>,
    observers: usize,
    invalidated: bool,
    updated_at: Option<OffsetDateTime>,
    notifier: watch::Sender<QuerySnapshot>,
}

impl CacheEntry {
    fn new(strategy: CacheStrategy, now: Instant) -> Self {
        let (notifier, _) = watch::channel(QuerySnapshot::empty());
        Self {
            data: None,
            fetched_at: None,
            stale_at: None,
            gc_at: now + strategy.gc_time,
            status: QueryStatus::Idle,
            error: None,
            strategy,
            loader: None,
            observers: 0,
            invalidated: false,
            updated_at: None,
            notifier,
        }
    }

    fn is_stale(&self, now: Instant) -> bool {
        self.invalidated || self.stale_at.is_none_or(|stale_at| now >= stale_at)
    }

    fn lookup(&self, now: Instant) -> Lookup {
        match &self.data {
            Some(_) if self.invalidated => Lookup::Missing,
            Some(data) if self.is_stale(now) => Lookup::Stale(data.clone()),
            Some(data) => Lookup::Fresh(data.clone()),
            None => Lookup::Missing,
        }
    }

    fn evictable(&self) -> bool {
        self.observers == 0 && self.status != QueryStatus::Fetching
    }

    fn snapshot(&self) -> QuerySnapshot {
        QuerySnapshot {
            data: self.data.clone(),
            status: self.status,
            error: self.error.clone(),
            updated_at: self.updated_at,
        }
    }

    fn notify(&self) {
        self.notifier.send_replace(self.snapshot());
    }

    fn candidate(&self, key: &QueryKey) -> Option<RefetchCandidate> {
        self.loader.as_ref().map(|loader| RefetchCandidate {
            key: key.clone(),
            strategy: self.strategy,
            loader: loader.clone(),
        })
    }
}

pub(crate) struct QueryStore {
    entries: RwLock<LruCache<QueryKey, CacheEntry>>,
    capacity: NonZeroUsize,
}

impl QueryStore {
    pub(crate) fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::unbounded()),
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    /// Classify the entry for a read, refreshing its LRU position.
    pub(crate) fn lookup(&self, key: &QueryKey, now: Instant) -> Lookup {
        rw_write(&self.entries, SOURCE, "lookup")
            .get(key)
            .map_or(Lookup::Missing, |entry| entry.lookup(now))
    }

    pub(crate) fn data(&self, key: &QueryKey) -> Option<Value> {
        rw_read(&self.entries, SOURCE, "data")
            .peek(key)
            .and_then(|entry| entry.data.clone())
    }

    pub(crate) fn snapshot(&self, key: &QueryKey) -> Option<QuerySnapshot> {
        rw_read(&self.entries, SOURCE, "snapshot")
            .peek(key)
            .map(CacheEntry::snapshot)
    }

    pub(crate) fn keys_matching(&self, filter: &QueryFilter) -> Vec<QueryKey> {
        rw_read(&self.entries, SOURCE, "keys_matching")
            .iter()
            .filter(|(key, _)| filter.matches(key))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub(crate) fn begin_fetch(
        &self,
        key: &QueryKey,
        strategy: CacheStrategy,
        loader: Loader,
        now: Instant,
    ) {
        let mut entries = rw_write(&self.entries, SOURCE, "begin_fetch");
        let entry = entry_mut(&mut entries, key, strategy, now);
        entry.status = QueryStatus::Fetching;
        entry.strategy = strategy;
        entry.loader = Some(loader);
        entry.notify();
        self.trim(&mut entries);
    }

    pub(crate) fn complete_fetch(
        &self,
        key: &QueryKey,
        strategy: CacheStrategy,
        value: Value,
        now: Instant,
    ) {
        let mut entries = rw_write(&self.entries, SOURCE, "complete_fetch");
        let entry = entry_mut(&mut entries, key, strategy, now);
        entry.data = Some(value);
        entry.fetched_at = Some(now);
        entry.stale_at = Some(now + strategy.stale_time);
        entry.gc_at = now + strategy.gc_time;
        entry.status = QueryStatus::Success;
        entry.error = None;
        entry.invalidated = false;
        entry.updated_at = Some(OffsetDateTime::now_utc());
        entry.notify();
        self.trim(&mut entries);
    }

    /// Record a failed load; existing data is kept.
    pub(crate) fn fail_fetch(&self, key: &QueryKey, error: QueryError) {
        if let Some(entry) = rw_write(&self.entries, SOURCE, "fail_fetch").peek_mut(key) {
            entry.status = QueryStatus::Error;
            entry.error = Some(error);
            entry.notify();
        }
    }

    /// Roll the status back after a cancelled load.
    pub(crate) fn abort_fetch(&self, key: &QueryKey) {
        if let Some(entry) = rw_write(&self.entries, SOURCE, "abort_fetch").peek_mut(key)
            && entry.status == QueryStatus::Fetching
        {
            entry.status = if entry.data.is_some() {
                QueryStatus::Success
            } else {
                QueryStatus::Idle
            };
            entry.notify();
        }
    }

    /// Replace the data of an entry without touching its freshness window.
    pub(crate) fn write_optimistic(&self, key: &QueryKey, value: Option<Value>, now: Instant) {
        let mut entries = rw_write(&self.entries, SOURCE, "write_optimistic");
        let entry = entry_mut(&mut entries, key, CacheStrategy::MEDIUM, now);
        entry.data = value;
        entry.error = None;
        if entry.status == QueryStatus::Idle && entry.data.is_some() {
            entry.status = QueryStatus::Success;
        }
        entry.updated_at = Some(OffsetDateTime::now_utc());
        entry.notify();
        self.trim(&mut entries);
    }

    /// Put back a value captured before an optimistic write.
    ///
    /// `None` means the key had no data: the entry is removed unless someone
    /// is still observing it.
    pub(crate) fn restore(&self, key: &QueryKey, previous: Option<Value>, now: Instant) {
        let mut entries = rw_write(&self.entries, SOURCE, "restore");
        match previous {
            Some(value) => {
                let entry = entry_mut(&mut entries, key, CacheStrategy::MEDIUM, now);
                entry.data = Some(value);
                entry.updated_at = Some(OffsetDateTime::now_utc());
                entry.notify();
            }
            None => {
                let observed = entries.peek(key).is_some_and(|entry| entry.observers > 0);
                if observed {
                    if let Some(entry) = entries.peek_mut(key) {
                        entry.data = None;
                        entry.updated_at = Some(OffsetDateTime::now_utc());
                        entry.notify();
                    }
                } else {
                    entries.pop(key);
                }
            }
        }
    }

    /// Mark matching entries invalidated and return the observed ones, which
    /// should be refetched right away.
    pub(crate) fn invalidate(&self, filter: &QueryFilter) -> (usize, Vec<RefetchCandidate>) {
        let mut entries = rw_write(&self.entries, SOURCE, "invalidate");
        let mut matched = 0;
        let mut active = Vec::new();
        for (key, entry) in entries.iter_mut().filter(|(key, _)| filter.matches(key)) {
            matched += 1;
            entry.invalidated = true;
            if entry.observers > 0
                && let Some(candidate) = entry.candidate(key)
            {
                active.push(candidate);
            }
        }
        (matched, active)
    }

    /// The loader and strategy last used for `key`.
    pub(crate) fn refetch_candidate(&self, key: &QueryKey) -> Option<RefetchCandidate> {
        rw_read(&self.entries, SOURCE, "refetch_candidate")
            .peek(key)
            .and_then(|entry| entry.candidate(key))
    }

    /// Observed entries that are stale and whose strategy accepts `trigger`.
    pub(crate) fn refetch_candidates(
        &self,
        now: Instant,
        trigger: impl Fn(&CacheStrategy) -> bool,
    ) -> Vec<RefetchCandidate> {
        rw_read(&self.entries, SOURCE, "refetch_candidates")
            .iter()
            .filter(|(_, entry)| {
                entry.observers > 0 && entry.is_stale(now) && trigger(&entry.strategy)
            })
            .filter_map(|(key, entry)| entry.candidate(key))
            .collect()
    }

    /// Register an observer. Returns its receiver and the entry's state.
    pub(crate) fn subscribe(
        &self,
        key: &QueryKey,
        strategy: CacheStrategy,
        loader: Loader,
        now: Instant,
    ) -> (watch::Receiver<QuerySnapshot>, Lookup) {
        let mut entries = rw_write(&self.entries, SOURCE, "subscribe");
        let entry = entry_mut(&mut entries, key, strategy, now);
        entry.observers += 1;
        entry.strategy = strategy;
        entry.loader = Some(loader);
        let receiver = entry.notifier.subscribe();
        let lookup = entry.lookup(now);
        self.trim(&mut entries);
        (receiver, lookup)
    }

    /// Drop an observer. Returns how many remain.
    pub(crate) fn unsubscribe(&self, key: &QueryKey, now: Instant) -> usize {
        let mut entries = rw_write(&self.entries, SOURCE, "unsubscribe");
        let Some(entry) = entries.peek_mut(key) else {
            return 0;
        };
        entry.observers = entry.observers.saturating_sub(1);
        if entry.observers == 0 {
            entry.gc_at = now + entry.strategy.gc_time;
        }
        entry.observers
    }

    /// Evict unobserved, idle entries whose `gc_at` has passed.
    pub(crate) fn collect_garbage(&self, now: Instant) -> usize {
        let mut entries = rw_write(&self.entries, SOURCE, "collect_garbage");
        let expired: Vec<QueryKey> = entries
            .iter()
            .filter(|(_, entry)| entry.evictable() && entry.gc_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.pop(key);
            debug!(key = %key, "evicted expired query");
        }
        if !expired.is_empty() {
            counter!(METRIC_EVICT, "reason" => "gc").increment(expired.len() as u64);
        }
        expired.len()
    }

    fn trim(&self, entries: &mut LruCache<QueryKey, CacheEntry>) {
        while entries.len() > self.capacity.get() {
            let victim = entries
                .iter()
                .rev()
                .find(|(_, entry)| entry.evictable())
                .map(|(key, _)| key.clone());
            let Some(victim) = victim else {
                break;
            };
            entries.pop(&victim);
            counter!(METRIC_EVICT, "reason" => "capacity").increment(1);
            debug!(key = %victim, "evicted query over capacity");
        }
    }
}

fn entry_mut<'a>(
    entries: &'a mut LruCache<QueryKey, CacheEntry>,
    key: &QueryKey,
    strategy: CacheStrategy,
    now: Instant,
) -> &'a mut CacheEntry {
    entries.get_or_insert_mut(key.clone(), || CacheEntry::new(strategy, now))
}
