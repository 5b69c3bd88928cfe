//! Optimistic mutations with rollback.
//!
//! A mutation writes its expected result into the cache before the remote
//! write runs, then either keeps it (and invalidates dependent queries) or
//! puts the previous values back.
//!
//! Overlapping mutations on one key are ordered by epoch in a ledger so that
//! a late rollback never clobbers a newer optimistic value or a committed one.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use metrics::{counter, histogram};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::QueryError;
use super::executor::QueryExecutor;
use super::keys::{QueryFilter, QueryKey};
use super::lock::mutex_lock;

const SOURCE: &str = "cache::mutation";
const METRIC_MUTATION: &str = "vitrine_mutation_total";
const METRIC_MUTATION_MS: &str = "vitrine_mutation_ms";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Pending,
    OptimisticApplied,
    Settling,
    Committed,
    RolledBack,
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::OptimisticApplied => "optimistic_applied",
            Self::Settling => "settling",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        })
    }
}

/// Computes the optimistic value from the currently cached one.
pub type Updater = Arc<dyn Fn(Option<&Value>) -> Option<Value> + Send + Sync>;

/// One optimistic write, applied to an exact key or to every cached member
/// of a key family.
#[derive(Clone)]
pub struct OptimisticUpdate {
    target: QueryFilter,
    updater: Updater,
}

impl OptimisticUpdate {
    /// Replace the value of `key`.
    pub fn set(key: QueryKey, value: Value) -> Self {
        Self::update(key, move |_| Some(value.clone()))
    }

    /// Derive the new value of `key` from its cached value.
    pub fn update<F>(key: QueryKey, updater: F) -> Self
    where
        F: Fn(Option<&Value>) -> Option<Value> + Send + Sync + 'static,
    {
        Self {
            target: QueryFilter::exact(key),
            updater: Arc::new(updater),
        }
    }

    /// Rewrite every cached entry matched by `filter`. Entries without data
    /// are left alone.
    pub fn update_all<F>(filter: QueryFilter, updater: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self {
            target: filter,
            updater: Arc::new(move |current: Option<&Value>| current.map(&updater)),
        }
    }

    /// Clear the data of `key`.
    pub fn remove(key: QueryKey) -> Self {
        Self::update(key, |_| None)
    }

    pub fn target(&self) -> &QueryFilter {
        &self.target
    }
}

impl fmt::Debug for OptimisticUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticUpdate")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// What a mutation does to the cache around its remote write.
#[derive(Debug, Clone)]
pub struct MutationRequest {
    label: String,
    optimistic: Vec<OptimisticUpdate>,
    invalidate: Vec<QueryFilter>,
}

impl MutationRequest {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            optimistic: Vec::new(),
            invalidate: Vec::new(),
        }
    }

    pub fn optimistic(mut self, update: OptimisticUpdate) -> Self {
        self.optimistic.push(update);
        self
    }

    pub fn invalidate(mut self, filter: impl Into<QueryFilter>) -> Self {
        self.invalidate.push(filter.into());
        self
    }

    pub fn invalidate_all(mut self, filters: impl IntoIterator<Item = QueryFilter>) -> Self {
        self.invalidate.extend(filters);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Bookkeeping for one mutation, discarded once it settles.
#[derive(Debug, Clone)]
pub struct MutationContext {
    pub id: Uuid,
    pub epoch: u64,
    pub previous_snapshot: Vec<(QueryKey, Option<Value>)>,
    pub optimistic_values: Vec<(QueryKey, Option<Value>)>,
    pub affected_keys: Vec<QueryKey>,
    pub started_at: Instant,
    pub state: MutationState,
}

impl MutationContext {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch: 0,
            previous_snapshot: Vec::new(),
            optimistic_values: Vec::new(),
            affected_keys: Vec::new(),
            started_at: Instant::now(),
            state: MutationState::Pending,
        }
    }

    fn transition(&mut self, state: MutationState) {
        debug!(mutation = %self.id, from = %self.state, to = %state, "mutation state");
        self.state = state;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome<T> {
    Committed(T),
    /// The backend reported the write as a duplicate; the optimistic state
    /// is kept.
    AlreadyApplied,
}

impl<T> MutationOutcome<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Committed(value) => Some(value),
            Self::AlreadyApplied => None,
        }
    }
}

/// What a toggle flips.
#[derive(Debug, Clone, PartialEq)]
pub enum ToggleTarget {
    /// The cached value is a boolean.
    Flag,
    /// The cached value is an array; flip membership of this element.
    Member(Value),
}

impl ToggleTarget {
    fn is_on(&self, current: Option<&Value>) -> bool {
        match self {
            Self::Flag => current.and_then(Value::as_bool).unwrap_or(false),
            Self::Member(member) => current
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(member)),
        }
    }

    fn apply(&self, current: Option<&Value>, on: bool) -> Value {
        match self {
            Self::Flag => Value::Bool(on),
            Self::Member(member) => {
                let mut items: Vec<Value> = current
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                items.retain(|item| item != member);
                if on {
                    items.push(member.clone());
                }
                Value::Array(items)
            }
        }
    }
}

#[derive(Debug)]
struct PendingWrite {
    epoch: u64,
    snapshot: Option<Value>,
    superseded: bool,
}

type Ledger = HashMap<QueryKey, Vec<PendingWrite>>;

struct CoordinatorInner {
    executor: QueryExecutor,
    ledger: Mutex<Ledger>,
    epoch: AtomicU64,
}

/// Runs writes with optimistic cache updates.
#[derive(Clone)]
pub struct MutationCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl MutationCoordinator {
    pub fn new(executor: QueryExecutor) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                executor,
                ledger: Mutex::new(HashMap::new()),
                epoch: AtomicU64::new(1),
            }),
        }
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.inner.executor
    }

    /// Number of unsettled optimistic writes touching `key`.
    pub fn pending_writes(&self, key: &QueryKey) -> usize {
        mutex_lock(&self.inner.ledger, SOURCE, "pending_writes")
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Apply the optimistic updates of `request`, await `writer`, then commit
    /// or roll back. Invalidation targets are invalidated either way.
    pub async fn mutate<T, Fut>(
        &self,
        request: MutationRequest,
        writer: Fut,
    ) -> Result<MutationOutcome<T>, QueryError>
    where
        Fut: Future<Output = Result<T, QueryError>>,
    {
        let mut context = MutationContext::new();
        self.inner.apply(&request, &mut context);
        context.transition(MutationState::OptimisticApplied);

        let mut guard = SettleGuard {
            inner: &self.inner,
            context: Some(context),
        };
        let result = writer.await;
        let Some(mut context) = guard.context.take() else {
            return Err(QueryError::Cancelled);
        };
        context.transition(MutationState::Settling);

        let outcome = match result {
            Ok(value) => {
                self.inner.commit(&mut context);
                Ok(MutationOutcome::Committed(value))
            }
            Err(error) if error.is_conflict() => {
                self.inner.commit(&mut context);
                Ok(MutationOutcome::AlreadyApplied)
            }
            Err(error) => {
                self.inner.rollback(&mut context);
                Err(error)
            }
        };

        self.inner.executor.invalidate(&request.invalidate);

        let label = match &outcome {
            Ok(MutationOutcome::Committed(_)) => "committed",
            Ok(MutationOutcome::AlreadyApplied) => "already_applied",
            Err(_) => "rolled_back",
        };
        counter!(METRIC_MUTATION, "outcome" => label).increment(1);
        histogram!(METRIC_MUTATION_MS)
            .record(context.started_at.elapsed().as_secs_f64() * 1000.0);
        match &outcome {
            Err(error) => warn!(
                mutation = %context.id,
                request = request.label(),
                error = %error,
                "mutation rolled back"
            ),
            Ok(_) => info!(
                mutation = %context.id,
                request = request.label(),
                outcome = label,
                keys = context.affected_keys.len(),
                "mutation settled"
            ),
        }

        outcome
    }

    /// Flip a boolean or set membership at `key`, deriving the next state
    /// from the cached value at call time. `writer` receives the new state.
    pub async fn toggle<T, F, Fut>(
        &self,
        key: QueryKey,
        target: ToggleTarget,
        invalidate: Vec<QueryFilter>,
        writer: F,
    ) -> Result<MutationOutcome<T>, QueryError>
    where
        F: FnOnce(bool) -> Fut,
        Fut: Future<Output = Result<T, QueryError>>,
    {
        let current = self.inner.executor.get_data(&key);
        let next = !target.is_on(current.as_ref());

        let request = MutationRequest::new("toggle")
            .optimistic(OptimisticUpdate::update(key, move |current| {
                Some(target.apply(current, next))
            }))
            .invalidate_all(invalidate);

        self.mutate(request, writer(next)).await
    }
}

impl CoordinatorInner {
    fn apply(&self, request: &MutationRequest, context: &mut MutationContext) {
        for update in &request.optimistic {
            if update.target.is_exact() {
                self.executor.cancel(update.target.key());
            } else {
                self.executor.cancel_matching(&update.target);
            }
        }

        let store = self.executor.store();
        let now = Instant::now();
        let mut ledger = mutex_lock(&self.ledger, SOURCE, "apply");
        context.epoch = self.epoch.fetch_add(1, Ordering::Relaxed);

        for update in &request.optimistic {
            let keys = if update.target.is_exact() {
                vec![update.target.key().clone()]
            } else {
                store.keys_matching(&update.target)
            };

            for key in keys {
                let current = store.data(&key);
                let next = (update.updater)(current.as_ref());
                if current.is_none() && next.is_none() {
                    continue;
                }

                if !context.affected_keys.contains(&key) {
                    context.affected_keys.push(key.clone());
                    context.previous_snapshot.push((key.clone(), current.clone()));
                    ledger.entry(key.clone()).or_default().push(PendingWrite {
                        epoch: context.epoch,
                        snapshot: current,
                        superseded: false,
                    });
                }

                store.write_optimistic(&key, next.clone(), now);
                context.optimistic_values.push((key, next));
            }
        }
    }

    /// Drop this mutation's pending writes and supersede older ones.
    fn commit(&self, context: &mut MutationContext) {
        let mut ledger = mutex_lock(&self.ledger, SOURCE, "commit");
        for key in &context.affected_keys {
            let Some(writes) = ledger.get_mut(key) else {
                continue;
            };
            writes.retain(|write| write.epoch != context.epoch);
            for write in writes.iter_mut().filter(|write| write.epoch < context.epoch) {
                write.superseded = true;
            }
            if writes.is_empty() {
                ledger.remove(key);
            }
        }
        context.transition(MutationState::Committed);
    }

    /// Undo this mutation's optimistic writes where it is still the newest
    /// writer; otherwise pass its snapshot on to the next newer write.
    fn rollback(&self, context: &mut MutationContext) {
        let store = self.executor.store();
        let now = Instant::now();
        let mut ledger = mutex_lock(&self.ledger, SOURCE, "rollback");

        for key in &context.affected_keys {
            let Some(writes) = ledger.get_mut(key) else {
                continue;
            };
            let Some(position) = writes.iter().position(|write| write.epoch == context.epoch)
            else {
                continue;
            };
            let own = writes.remove(position);

            if !own.superseded {
                match writes.iter_mut().find(|write| write.epoch > own.epoch) {
                    Some(newer) => newer.snapshot = own.snapshot,
                    None => store.restore(key, own.snapshot, now),
                }
            }
            if writes.is_empty() {
                ledger.remove(key);
            }
        }
        context.transition(MutationState::RolledBack);
    }
}

/// Rolls back a mutation whose future was dropped before settling.
struct SettleGuard<'a> {
    inner: &'a CoordinatorInner,
    context: Option<MutationContext>,
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut context) = self.context.take() {
            warn!(mutation = %context.id, "mutation dropped before settling, rolling back");
            self.inner.rollback(&mut context);
        }
    }
}
