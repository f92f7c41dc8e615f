//! Response cache facade
//!
//! [`ResponseCache`] is the only type callers need. It composes the entry
//! store, persistence, in-flight deduplication and background refresh behind
//! one cheaply cloneable handle.

use crate::clock::{ClockHandle, SystemClock};
use crate::entry::CacheValue;
use crate::fingerprint::CacheKey;
use crate::inflight::{InFlightRegistry, PendingHandle};
use crate::metrics::{CacheMetrics, MetricsSnapshot};
use crate::persistence::DiskPersistence;
use crate::refresh::{BoxError, RefreshHook, RefreshPolicy, RefreshScheduler};
use crate::store::{EntryStore, Lookup};
use codeassist_core::CacheOptions;
use std::future::Future;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;

/// Failure of an upstream computation, shared by every deduplicated waiter
pub type ComputeError = Arc<dyn std::error::Error + Send + Sync>;

/// Outcome observed by callers waiting on an in-flight computation
pub type ComputeResult<V> = Result<V, ComputeError>;

/// The computation for a key went away without producing an outcome
#[derive(Debug, Error)]
#[error("computation for {0} was abandoned")]
pub struct ComputationAbandoned(pub CacheKey);

pub struct ResponseCache<V: CacheValue> {
    inner: Arc<CacheInner<V>>,
}

impl<V: CacheValue> Clone for ResponseCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct CacheInner<V: CacheValue> {
    options: CacheOptions,
    store: EntryStore<V>,
    inflight: InFlightRegistry<ComputeResult<V>>,
    refresh: RefreshScheduler,
    metrics: Arc<CacheMetrics>,
    clock: ClockHandle,
    initialized: OnceCell<()>,
}

/// Builder for [`ResponseCache`]
pub struct ResponseCacheBuilder<V> {
    options: CacheOptions,
    clock: ClockHandle,
    refresh_hook: Option<Arc<dyn RefreshHook>>,
    _value: PhantomData<fn() -> V>,
}

impl<V: CacheValue> ResponseCacheBuilder<V> {
    pub fn with_clock(mut self, clock: ClockHandle) -> Self {
        self.clock = clock;
        self
    }

    /// Hook invoked for hot entries nearing expiry when background refresh
    /// is enabled
    pub fn with_refresh_hook(mut self, hook: impl RefreshHook) -> Self {
        self.refresh_hook = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> ResponseCache<V> {
        let metrics = Arc::new(CacheMetrics::new());
        let persistence = self.options.persistence_dir().map(DiskPersistence::new);
        if self.options.persist && persistence.is_none() {
            tracing::warn!("Cache persistence enabled without a cache directory, keeping entries in memory");
        }

        let store = EntryStore::new(
            &self.options,
            persistence,
            metrics.clone(),
            self.clock.clone(),
        );
        let refresh = RefreshScheduler::new(
            RefreshPolicy::from_options(&self.options),
            self.refresh_hook,
        );

        ResponseCache {
            inner: Arc::new(CacheInner {
                options: self.options,
                store,
                inflight: InFlightRegistry::new(),
                refresh,
                metrics,
                clock: self.clock,
                initialized: OnceCell::new(),
            }),
        }
    }
}

impl<V: CacheValue> ResponseCache<V> {
    pub fn new(options: CacheOptions) -> Self {
        Self::builder(options).build()
    }

    pub fn builder(options: CacheOptions) -> ResponseCacheBuilder<V> {
        ResponseCacheBuilder {
            options,
            clock: Arc::new(SystemClock),
            refresh_hook: None,
            _value: PhantomData,
        }
    }

    /// Load persisted entries. Runs once; every other operation calls it
    /// implicitly, so an explicit call only moves the disk load earlier.
    pub async fn initialize(&self) {
        self.inner
            .initialized
            .get_or_init(|| async {
                let loaded = self.inner.store.load().await;
                tracing::info!(
                    entries = loaded,
                    max_entries = self.inner.options.max_entries,
                    persist = self.inner.options.persist,
                    "Response cache initialized"
                );
            })
            .await;
    }

    /// Cached value for `key`, or `None` on a miss
    pub async fn get(&self, key: &CacheKey) -> Option<V> {
        self.initialize().await;

        match self.inner.store.lookup(key).await {
            Lookup::Hit(value, meta) => {
                self.inner.refresh.maybe_schedule(&meta, self.inner.clock.now());
                Some(value)
            }
            Lookup::Miss | Lookup::Stale(_) => None,
        }
    }

    pub async fn set(&self, key: CacheKey, value: V, file_dependencies: Vec<PathBuf>) {
        self.initialize().await;
        self.inner.store.insert(key, value, file_dependencies).await;
    }

    /// Return the cached value for `key`, joining a running computation for
    /// it or starting `compute` if neither exists.
    ///
    /// A successful result is stored with `file_dependencies` before any
    /// waiter observes it. Failures are shared with every waiter and never
    /// cached.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: CacheKey,
        file_dependencies: Vec<PathBuf>,
        compute: F,
    ) -> ComputeResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        if let Some(pending) = self.pending(&key) {
            return settle(pending).await;
        }

        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }

        let pending = self.register_with(key, file_dependencies, compute);
        settle(pending).await
    }

    /// Handle to the running computation for `key`, if any
    pub fn pending(&self, key: &CacheKey) -> Option<PendingHandle<ComputeResult<V>>> {
        self.inner.inflight.lookup(key)
    }

    /// Register an upstream call driven by the caller. Joins the existing
    /// computation instead if one is already running for `key`.
    pub fn register_pending<Fut, E>(
        &self,
        key: CacheKey,
        file_dependencies: Vec<PathBuf>,
        upstream: Fut,
    ) -> PendingHandle<ComputeResult<V>>
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.register_with(key, file_dependencies, move || upstream)
    }

    /// The registered computation checks the store once more before awaiting
    /// `compute`, since another caller may have stored a value between this
    /// caller's miss and the registration.
    fn register_with<F, Fut, E>(
        &self,
        key: CacheKey,
        file_dependencies: Vec<PathBuf>,
        compute: F,
    ) -> PendingHandle<ComputeResult<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let cache = self.clone();
        self.inner.inflight.register(key, move || {
            let upstream = compute();
            async move {
                cache.initialize().await;
                if let Some(value) = cache.inner.store.peek(&key).await {
                    tracing::trace!(key = %key, "Value stored meanwhile, skipping upstream call");
                    return Ok(value);
                }
                match upstream.await {
                    Ok(value) => {
                        cache.set(key, value.clone(), file_dependencies).await;
                        Ok(value)
                    }
                    Err(e) => {
                        let error: BoxError = e.into();
                        let error: ComputeError = Arc::from(error);
                        tracing::debug!(key = %key, error = %error, "Upstream computation failed");
                        Err(error)
                    }
                }
            }
        })
    }

    pub async fn invalidate(&self, key: &CacheKey) -> bool {
        self.initialize().await;
        self.inner.store.remove(key).await
    }

    /// Drop entries depending on any of `paths` or on files beneath them
    pub async fn invalidate_by_files(&self, paths: &[PathBuf]) -> usize {
        self.initialize().await;
        let removed = self.inner.store.remove_dependents(paths).await;
        if removed > 0 {
            tracing::debug!(removed, files = paths.len(), "Invalidated entries by file");
        }
        removed
    }

    pub async fn clear(&self) -> usize {
        self.initialize().await;
        let removed = self.inner.store.clear().await;
        tracing::info!(removed, "Response cache cleared");
        removed
    }

    /// Drop entries older than `max_age`
    pub async fn purge_older_than(&self, max_age: Duration) -> usize {
        self.initialize().await;
        self.inner.store.purge_older_than(max_age).await
    }

    /// Drop oldest entries until the stored bytes fit into `max_bytes`
    pub async fn evict_oldest_until(&self, max_bytes: u64) -> usize {
        self.initialize().await;
        self.inner.store.evict_oldest_until(max_bytes).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.initialize().await;
        self.inner.store.contains(key).await
    }

    pub async fn len(&self) -> usize {
        self.initialize().await;
        self.inner.store.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn storage_size(&self) -> u64 {
        self.initialize().await;
        self.inner.store.storage_size().await
    }

    pub fn options(&self) -> &CacheOptions {
        &self.inner.options
    }

    /// Background refreshes waiting for their timer or running
    pub fn scheduled_refreshes(&self) -> usize {
        self.inner.refresh.pending()
    }

    /// Cancel scheduled refreshes. Cached entries stay usable.
    pub fn dispose(&self) {
        let cancelled = self.inner.refresh.dispose();
        tracing::debug!(cancelled_refreshes = cancelled, "Response cache disposed");
    }
}

async fn settle<V: CacheValue>(pending: PendingHandle<ComputeResult<V>>) -> ComputeResult<V> {
    let key = pending.key();
    match pending.wait().await {
        Some(outcome) => outcome,
        None => Err(Arc::new(ComputationAbandoned(key))),
    }
}
