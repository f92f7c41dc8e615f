//! Background refresh of popular entries nearing expiry

use crate::entry::EntryMeta;
use crate::fingerprint::CacheKey;
use codeassist_core::{CacheOptions, Timestamp};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Recomputes and re-stores the value for a key.
///
/// Store the fresh value with `ResponseCache::set`. Registered computations
/// return the still-fresh stored value instead of calling upstream.
///
/// Implemented for any `Fn(CacheKey) -> impl Future<Output = Result<(), BoxError>>`.
pub trait RefreshHook: Send + Sync + 'static {
    fn refresh(&self, key: CacheKey) -> BoxFuture<'static, Result<(), BoxError>>;
}

impl<F, Fut> RefreshHook for F
where
    F: Fn(CacheKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    fn refresh(&self, key: CacheKey) -> BoxFuture<'static, Result<(), BoxError>> {
        Box::pin(self(key))
    }
}

/// When a hit should trigger a refresh
#[derive(Clone, Copy, Debug)]
pub struct RefreshPolicy {
    pub enabled: bool,
    pub threshold: u64,
    pub ttl: Duration,
    pub delay: Duration,
}

impl RefreshPolicy {
    pub fn from_options(options: &CacheOptions) -> Self {
        Self {
            enabled: options.background_refresh,
            threshold: options.refresh_threshold,
            ttl: options.ttl,
            delay: options.refresh_delay,
        }
    }

    /// Popular enough and past three quarters of its lifetime
    pub fn is_due(&self, meta: &EntryMeta, now: Timestamp) -> bool {
        if !self.enabled || meta.access_count < self.threshold {
            return false;
        }
        let age = now.saturating_since(meta.created_at).as_millis();
        age * 4 > self.ttl.as_millis() * 3
    }
}

struct Scheduled {
    id: u64,
    task: AbortHandle,
}

pub struct RefreshScheduler {
    policy: RefreshPolicy,
    hook: Option<Arc<dyn RefreshHook>>,
    scheduled: Arc<DashMap<CacheKey, Scheduled>>,
    next_id: AtomicU64,
}

impl RefreshScheduler {
    pub fn new(policy: RefreshPolicy, hook: Option<Arc<dyn RefreshHook>>) -> Self {
        Self {
            policy,
            hook,
            scheduled: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Schedule a refresh for the entry behind a hit, if it is due.
    ///
    /// Returns whether a new refresh was scheduled.
    pub fn maybe_schedule(&self, meta: &EntryMeta, now: Timestamp) -> bool {
        if self.is_scheduled(&meta.key) || !self.policy.is_due(meta, now) {
            return false;
        }
        self.schedule(meta.key)
    }

    /// Schedule a refresh for `key` unless one is already pending.
    ///
    /// Without a hook there is nothing to run and this is a no-op. The
    /// marker is cleared once the refresh finishes, fails, panics or is
    /// cancelled.
    pub fn schedule(&self, key: CacheKey) -> bool {
        let Some(hook) = self.hook.clone() else {
            return false;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %key, "No async runtime, skipping background refresh");
            return false;
        };

        let slot = match self.scheduled.entry(key) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(vacant) => vacant,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = ClearOnDrop {
            scheduled: self.scheduled.clone(),
            key,
            id,
        };
        let delay = self.policy.delay;
        let task = runtime.spawn(async move {
            let _token = token;
            tokio::time::sleep(delay).await;
            tracing::debug!(key = %key, "Refreshing cache entry");
            if let Err(e) = hook.refresh(key).await {
                tracing::warn!(key = %key, error = %e, "Background refresh failed");
            }
        });
        slot.insert(Scheduled {
            id,
            task: task.abort_handle(),
        });
        true
    }

    pub fn is_scheduled(&self, key: &CacheKey) -> bool {
        self.scheduled.contains_key(key)
    }

    pub fn pending(&self) -> usize {
        self.scheduled.len()
    }

    /// Cancel every pending refresh. Returns how many were cancelled.
    pub fn dispose(&self) -> usize {
        let keys: Vec<CacheKey> = self.scheduled.iter().map(|r| *r.key()).collect();
        let mut cancelled = 0;
        for key in keys {
            if let Some((_, scheduled)) = self.scheduled.remove(&key) {
                scheduled.task.abort();
                cancelled += 1;
            }
        }
        cancelled
    }
}

struct ClearOnDrop {
    scheduled: Arc<DashMap<CacheKey, Scheduled>>,
    key: CacheKey,
    id: u64,
}

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        self.scheduled
            .remove_if(&self.key, |_, scheduled| scheduled.id == self.id);
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}
