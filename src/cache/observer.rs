//! Query observers.

use tokio::sync::watch;

use super::executor::QueryExecutor;
use super::keys::QueryKey;
use super::store::QuerySnapshot;

/// Live view of one query. Dropping it unregisters the observer.
pub struct Subscription {
    key: QueryKey,
    receiver: watch::Receiver<QuerySnapshot>,
    executor: QueryExecutor,
}

impl Subscription {
    pub(crate) fn new(
        key: QueryKey,
        receiver: watch::Receiver<QuerySnapshot>,
        executor: QueryExecutor,
    ) -> Self {
        Self {
            key,
            receiver,
            executor,
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Latest published state.
    pub fn current(&self) -> QuerySnapshot {
        self.receiver.borrow().clone()
    }

    /// Wait for the next update. `None` once the entry is gone.
    pub async fn changed(&mut self) -> Option<QuerySnapshot> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Wait until `predicate` holds for the published state.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&QuerySnapshot) -> bool,
    ) -> Option<QuerySnapshot> {
        self.receiver
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .ok()
            .map(|snapshot| snapshot.clone())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.executor.release(&self.key);
    }
}
