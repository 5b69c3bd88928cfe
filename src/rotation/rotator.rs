//! Timed rotation of sponsored items.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::draw::{RandomSource, draw};
use super::weights::{Sponsored, compute_weights};
use crate::cache::QueryError;

const METRIC_DRAW: &str = "vitrine_rotation_draw_total";
const DEFAULT_INTERVAL_MS: u64 = 8000;
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub interval: Duration,
    /// Never show the same item twice in a row when an alternative exists.
    pub exclude_previous: bool,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            exclude_previous: false,
        }
    }
}

/// Supplies the current candidates on every tick.
#[async_trait]
pub trait CandidateSource<T>: Send + Sync {
    async fn candidates(&self) -> Result<Vec<T>, QueryError>;
}

pub type SelectCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct RotationShared<T> {
    paused: AtomicBool,
    current: watch::Sender<Option<T>>,
    on_select: SelectCallback<T>,
}

impl<T: Clone> RotationShared<T> {
    fn publish(&self, item: T) {
        (self.on_select)(&item);
        self.current.send_replace(Some(item));
    }
}

pub struct Rotator;

impl Rotator {
    /// Start rotating. The first draw happens immediately, then once per
    /// `policy.interval` (at least one millisecond).
    pub fn spawn<T>(
        policy: RotationPolicy,
        source: Arc<dyn CandidateSource<T>>,
        rng: Box<dyn RandomSource>,
        on_select: SelectCallback<T>,
    ) -> RotationHandle<T>
    where
        T: Sponsored + Clone + Send + Sync + 'static,
    {
        let (current, _) = watch::channel(None);
        let shared = Arc::new(RotationShared {
            paused: AtomicBool::new(false),
            current,
            on_select,
        });

        let task = tokio::spawn(run(policy, source, rng, Arc::clone(&shared)));
        RotationHandle { shared, task }
    }
}

async fn run<T>(
    policy: RotationPolicy,
    source: Arc<dyn CandidateSource<T>>,
    mut rng: Box<dyn RandomSource>,
    shared: Arc<RotationShared<T>>,
) where
    T: Sponsored + Clone + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(policy.interval.max(MIN_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if shared.paused.load(Ordering::Acquire) {
            continue;
        }

        let candidates = match source.candidates().await {
            Ok(candidates) => candidates,
            Err(error) => {
                warn!(error = %error, "rotation candidates unavailable, keeping selection");
                continue;
            }
        };
        if shared.paused.load(Ordering::Acquire) {
            continue;
        }

        let previous = shared
            .current
            .borrow()
            .as_ref()
            .map(|item| item.id().to_string());
        let mut weighted = compute_weights(candidates);
        if policy.exclude_previous
            && weighted.len() > 1
            && let Some(previous) = previous
        {
            weighted = compute_weights(
                weighted
                    .into_iter()
                    .map(|entry| entry.item)
                    .filter(|item| item.id() != previous),
            );
        }

        match draw(&weighted, rng.as_mut()) {
            Some(item) => {
                counter!(METRIC_DRAW).increment(1);
                debug!(item = item.id(), candidates = weighted.len(), "rotation draw");
                shared.publish(item.clone());
            }
            None => {
                shared.current.send_replace(None);
            }
        }
    }
}

/// Controls a running rotation. Dropping it stops the timer.
pub struct RotationHandle<T> {
    shared: Arc<RotationShared<T>>,
    task: JoinHandle<()>,
}

impl<T: Clone> RotationHandle<T> {
    /// Stop drawing; the current selection stays visible.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    pub fn current(&self) -> Option<T> {
        self.shared.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<T>> {
        self.shared.current.subscribe()
    }

    /// Show `item` and pause automatic rotation.
    pub fn select_manually(&self, item: T) {
        self.pause();
        self.shared.publish(item);
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl<T> Drop for RotationHandle<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
