use std::future::Future;
use std::pin::Pin;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, watch};

use super::error::StorageResult;
use super::ids::SessionId;

/// Default capacity of the change broadcast. Lagging listeners reload instead of failing.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

pub type SubscriptionWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Fan-out of "session X changed" notifications to every live subscription.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<SessionId>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Announces a committed write. Having no listeners is not an error.
    pub fn publish(&self, session_id: &SessionId) {
        let listeners = self.sender.send(session_id.clone()).unwrap_or(0);
        tracing::trace!(session_id = %session_id, listeners, "published chat change");
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn listen(&self) -> broadcast::Receiver<SessionId> {
        self.sender.subscribe()
    }
}

/// Live view over a store query. Every item is a complete snapshot, never a delta.
///
/// Only the newest undelivered snapshot is kept; older ones are replaced.
pub struct Subscription<T> {
    updates: watch::Receiver<Option<T>>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct SubscriptionHandle<T> {
    pub subscription: Subscription<T>,
    pub worker: SubscriptionWorker,
}

impl<T: Clone> Subscription<T> {
    /// Waits for a snapshot newer than the last one returned.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            self.updates.changed().await.ok()?;
            if let Some(snapshot) = self.updates.borrow_and_update().clone() {
                return Some(snapshot);
            }
        }
    }

    /// Newest snapshot not yet returned, without waiting.
    pub fn try_latest(&mut self) -> Option<T> {
        let latest = self.updates.borrow_and_update();
        if latest.has_changed() {
            (*latest).clone()
        } else {
            None
        }
    }
}

impl<T> Subscription<T> {
    /// Stops delivery and releases the listener. Returns false if already cancelled.
    pub fn unsubscribe(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Builds a subscription that delivers `load()` once immediately and again after every
/// change to `scope` (or to any session when `scope` is `None`).
pub(crate) fn snapshot_subscription<T, F, Fut>(
    label: &'static str,
    feed: &ChangeFeed,
    scope: Option<SessionId>,
    load: F,
) -> SubscriptionHandle<T>
where
    T: Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StorageResult<T>> + Send + 'static,
{
    let (updates_tx, updates_rx) = watch::channel(None);
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

    // Listen before the first load so a write racing the initial read still triggers a reload.
    let mut changes = feed.listen();

    let worker = Box::pin(async move {
        tracing::debug!(subscription = label, scope = ?scope, "subscription started");

        if !deliver(label, &load, &updates_tx).await {
            return;
        }

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(subscription = label, "subscription cancelled");
                    break;
                }
                change = changes.recv() => {
                    match change {
                        Ok(changed) => {
                            if scope.as_ref().is_some_and(|wanted| *wanted != changed) {
                                continue;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                subscription = label,
                                skipped,
                                "subscription lagged behind change feed; re-delivering current state"
                            );
                        }
                        Err(RecvError::Closed) => {
                            tracing::debug!(subscription = label, "change feed closed");
                            break;
                        }
                    }

                    if !deliver(label, &load, &updates_tx).await {
                        break;
                    }
                }
            }
        }
    });

    SubscriptionHandle {
        subscription: Subscription {
            updates: updates_rx,
            cancel_tx: Some(cancel_tx),
        },
        worker,
    }
}

/// Returns false once the receiving side is gone.
async fn deliver<T, F, Fut>(
    label: &'static str,
    load: &F,
    updates_tx: &watch::Sender<Option<T>>,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    match load().await {
        Ok(snapshot) => updates_tx.send(Some(snapshot)).is_ok(),
        Err(error) => {
            // The next change notification retries the load.
            tracing::warn!(
                subscription = label,
                stage = error.stage(),
                "failed to load snapshot: {error}"
            );
            !updates_tx.is_closed()
        }
    }
}
