//! In-flight request deduplication
//!
//! At most one computation runs per key. Later callers for the same key join
//! the running computation and observe its outcome.

use crate::fingerprint::CacheKey;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type ComputationChannel<T> = Shared<oneshot::Receiver<T>>;

struct Pending<T> {
    id: u64,
    channel: ComputationChannel<T>,
}

/// Handle to a computation running in the registry
pub struct PendingHandle<T> {
    key: CacheKey,
    channel: ComputationChannel<T>,
}

impl<T> Clone for PendingHandle<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            channel: self.channel.clone(),
        }
    }
}

impl<T: Clone> PendingHandle<T> {
    pub fn key(&self) -> CacheKey {
        self.key
    }

    /// Wait for the outcome. `None` if the computation panicked or was
    /// cancelled before producing one.
    pub async fn wait(self) -> Option<T> {
        self.channel.await.ok()
    }
}

pub struct InFlightRegistry<T> {
    pending: Arc<DashMap<CacheKey, Pending<T>>>,
    next_id: AtomicU64,
}

impl<T> Default for InFlightRegistry<T> {
    fn default() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> InFlightRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<PendingHandle<T>> {
        self.pending.get(key).map(|pending| PendingHandle {
            key: *key,
            channel: pending.channel.clone(),
        })
    }

    /// Run the computation produced by `start` for `key`, unless one is
    /// already running, in which case that one is joined and `start` is
    /// never called.
    ///
    /// The computation runs on its own task, so it completes even if every
    /// waiter goes away. Its entry is removed once it finishes, fails, or
    /// panics.
    pub fn register<F, Fut>(&self, key: CacheKey, start: F) -> PendingHandle<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let slot = match self.pending.entry(key) {
            Entry::Occupied(occupied) => {
                tracing::trace!(key = %key, "Joining in-flight computation");
                return PendingHandle {
                    key,
                    channel: occupied.get().channel.clone(),
                };
            }
            Entry::Vacant(vacant) => vacant,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        slot.insert(Pending {
            id,
            channel: channel.clone(),
        });

        let token = RemoveOnDrop {
            pending: self.pending.clone(),
            key,
            id,
        };
        let computation = start();
        tokio::spawn(async move {
            let token = token;
            let value = computation.await;
            // Deregister before publishing so that woken waiters never see
            // the finished computation as still in flight.
            drop(token);
            sender.send(value).ok();
        });

        PendingHandle { key, channel }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

struct RemoveOnDrop<T> {
    pending: Arc<DashMap<CacheKey, Pending<T>>>,
    key: CacheKey,
    id: u64,
}

impl<T> Drop for RemoveOnDrop<T> {
    fn drop(&mut self) {
        self.pending
            .remove_if(&self.key, |_, pending| pending.id == self.id);
    }
}
