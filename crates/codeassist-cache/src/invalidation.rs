//! Cache invalidation
//!
//! Turns external signals (file edits, preference changes, application
//! updates, the periodic sweep) into removals on a [`ResponseCache`].

use crate::cache::ResponseCache;
use crate::entry::CacheValue;
use codeassist_core::{
    CacheError, ConfigChangeEvent, FileChangeEvent, FileChangeKind, InvalidationConfig,
    StoragePressurePolicy, Timestamp,
};
use glob::Pattern;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;

/// File holding the last observed application version
pub const APP_VERSION_FILE: &str = "app-version";

/// What a sweep did about storage pressure
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "entries")]
pub enum StorageAction {
    #[default]
    None,
    Cleared(usize),
    Evicted(usize),
}

/// Outcome of one sweep
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SweepReport {
    /// Entries older than the sweep TTL
    pub expired: usize,
    pub app_version_changed: bool,
    /// Stored bytes before storage pressure was handled
    pub storage_before: u64,
    pub storage_action: StorageAction,
}

pub struct InvalidationCoordinator<V: CacheValue> {
    cache: ResponseCache<V>,
    config: InvalidationConfig,
    patterns: Vec<Pattern>,
    version_file: Option<PathBuf>,
    app_version: tokio::sync::Mutex<Option<String>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl<V: CacheValue> InvalidationCoordinator<V> {
    pub fn new(cache: ResponseCache<V>, config: InvalidationConfig) -> Arc<Self> {
        let patterns = compile_patterns(&config.watch_patterns);
        let version_file = cache
            .options()
            .persistence_dir()
            .map(|dir| dir.join(APP_VERSION_FILE));

        Arc::new(Self {
            cache,
            config,
            patterns,
            version_file,
            app_version: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &InvalidationConfig {
        &self.config
    }

    /// Check the application version once, then sweep on every interval.
    ///
    /// Does nothing when invalidation is disabled; the explicit entry points
    /// keep working either way.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            tracing::debug!("Cache invalidation disabled, not starting sweeps");
            return;
        }

        let coordinator = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        let task = tokio::spawn(async move {
            if let Some(this) = coordinator.upgrade() {
                if this.config.invalidate_on_app_update {
                    this.check_app_version().await;
                }
            }

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(this) = coordinator.upgrade() else {
                    break;
                };
                this.sweep().await;
            }
        });

        tracing::info!(interval_secs = interval.as_secs(), "Cache invalidation started");
        self.track(task.abort_handle());
    }

    /// Forward file change events from a watcher until the channel closes
    pub fn listen_files(self: &Arc<Self>, mut events: broadcast::Receiver<FileChangeEvent>) {
        let coordinator = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(this) = coordinator.upgrade() else {
                            break;
                        };
                        this.on_file_change(&event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "File change listener lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.track(task.abort_handle());
    }

    /// Forward preference change events until the channel closes
    pub fn listen_config(self: &Arc<Self>, mut events: broadcast::Receiver<ConfigChangeEvent>) {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(this) = coordinator.upgrade() else {
                            break;
                        };
                        this.on_config_change(&event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Configuration listener lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.track(task.abort_handle());
    }

    /// Drop entries depending on the changed file. Returns the number removed.
    pub async fn on_file_change(&self, event: &FileChangeEvent) -> usize {
        self.on_files_changed(std::slice::from_ref(event)).await
    }

    pub async fn on_files_changed(&self, events: &[FileChangeEvent]) -> usize {
        if !self.config.watch_files {
            return 0;
        }

        let paths: Vec<PathBuf> = events
            .iter()
            .filter(|event| event.kind.affects_existing_content())
            .filter(|event| self.is_watched(&event.path, event.kind))
            .map(|event| event.path.clone())
            .collect();
        if paths.is_empty() {
            return 0;
        }

        let removed = self.cache.invalidate_by_files(&paths).await;
        if removed > 0 {
            tracing::info!(removed, files = paths.len(), "Invalidated cache entries after file change");
        }
        removed
    }

    /// Clear the cache if the changed key lives in a watched namespace.
    pub async fn on_config_change(&self, event: &ConfigChangeEvent) -> bool {
        if !self.config.watch_config {
            return false;
        }
        let watched = self
            .config
            .config_namespaces
            .iter()
            .any(|ns| event.is_in_namespace(ns));
        if !watched {
            return false;
        }

        let removed = self.cache.clear().await;
        tracing::info!(key = %event.key, removed, "Cleared cache after configuration change");
        true
    }

    /// Whether a change to `path` is relevant
    pub fn is_watched(&self, path: &Path, kind: FileChangeKind) -> bool {
        let relative = if self.config.workspace_roots.is_empty() {
            path
        } else {
            match self
                .config
                .workspace_roots
                .iter()
                .find_map(|root| path.strip_prefix(root).ok())
            {
                Some(relative) => relative,
                None => return false,
            }
        };

        let excluded = relative.components().any(|component| match component {
            Component::Normal(name) => self
                .config
                .excluded_dirs
                .iter()
                .any(|dir| name == OsStr::new(dir)),
            _ => false,
        });
        if excluded {
            return false;
        }

        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) => {
                if !self.config.source_extensions.is_empty()
                    && !self.config.source_extensions.iter().any(|known| known == ext)
                {
                    return false;
                }
            }
            // A deleted directory takes its dependents with it.
            None if kind == FileChangeKind::Deleted => {}
            None => {
                if !self.config.source_extensions.is_empty() {
                    return false;
                }
            }
        }

        self.patterns.is_empty()
            || self
                .patterns
                .iter()
                .any(|pattern| pattern.matches_path(relative) || pattern.matches_path(path))
    }

    /// Expire old entries, react to an application update and enforce the
    /// storage ceiling.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        if self.config.invalidate_on_app_update {
            report.app_version_changed = self.check_app_version().await;
        }

        report.expired = self.cache.purge_older_than(self.config.ttl).await;

        report.storage_before = self.cache.storage_size().await;
        if report.storage_before > self.config.max_storage_bytes {
            tracing::warn!(
                storage = report.storage_before,
                limit = self.config.max_storage_bytes,
                policy = ?self.config.storage_policy,
                "Cache storage over limit"
            );
            report.storage_action = match self.config.storage_policy {
                StoragePressurePolicy::ClearAll => StorageAction::Cleared(self.cache.clear().await),
                StoragePressurePolicy::EvictOldest => StorageAction::Evicted(
                    self.cache
                        .evict_oldest_until(self.config.max_storage_bytes)
                        .await,
                ),
            };
        }

        tracing::info!(
            expired = report.expired,
            app_version_changed = report.app_version_changed,
            storage = report.storage_before,
            action = ?report.storage_action,
            "Cache sweep finished"
        );
        report
    }

    /// Compare the current application version with the recorded one and
    /// clear the cache if it changed. The first observation only records it.
    pub async fn check_app_version(&self) -> bool {
        let current = self.app_version_fingerprint().await;
        let mut recorded = self.app_version.lock().await;

        if recorded.is_none() {
            *recorded = self.read_recorded_version().await;
        }

        let changed = match recorded.as_deref() {
            Some(previous) if previous == current => return false,
            Some(_) => true,
            None => false,
        };

        if changed {
            let removed = self.cache.clear().await;
            tracing::info!(removed, version = %current, "Application updated, cache cleared");
        } else {
            tracing::debug!(version = %current, "Recorded application version");
        }

        self.write_recorded_version(&current).await;
        *recorded = Some(current);
        changed
    }

    /// Hash over every manifest's path, contents and modification time
    pub async fn app_version_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for manifest in self.manifest_paths() {
            hasher.update(manifest.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            match tokio::fs::read(&manifest).await {
                Ok(contents) => hasher.update(&contents),
                Err(_) => hasher.update(b"<missing>"),
            }
            hasher.update([0u8]);
            let modified = tokio::fs::metadata(&manifest)
                .await
                .and_then(|m| m.modified())
                .map(|t| Timestamp::from_system_time(t).as_millis())
                .unwrap_or(0);
            hasher.update(modified.to_le_bytes());
        }
        hex::encode(hasher.finalize())
    }

    fn manifest_paths(&self) -> Vec<PathBuf> {
        let root = self.config.workspace_roots.first();
        self.config
            .manifest_files
            .iter()
            .map(|manifest| match root {
                Some(root) if manifest.is_relative() => root.join(manifest),
                _ => manifest.clone(),
            })
            .collect()
    }

    async fn read_recorded_version(&self) -> Option<String> {
        let path = self.version_file.as_ref()?;
        match tokio::fs::read_to_string(path).await {
            Ok(version) => Some(version.trim().to_string()).filter(|v| !v.is_empty()),
            Err(e) => {
                let e = CacheError::from(e);
                if !e.is_not_found() {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to read recorded application version");
                }
                None
            }
        }
    }

    async fn write_recorded_version(&self, version: &str) {
        let Some(path) = &self.version_file else {
            return;
        };
        let result = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, version).await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "Failed to record application version");
        }
    }

    fn track(&self, task: AbortHandle) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Stop the sweep timer and every listener
    pub fn dispose(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl<V: CacheValue> Drop for InvalidationCoordinator<V> {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn compile_patterns(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|pattern| match Pattern::new(pattern) {
            Ok(compiled) => Some(compiled),
            Err(e) => {
                let error = CacheError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.msg.to_string(),
                };
                tracing::warn!(error = %error, "Ignoring watch pattern");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fingerprint::{fingerprint_value, CacheKey};
    use codeassist_core::CacheOptions;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn key(n: u32) -> CacheKey {
        fingerprint_value(&json!({ "prompt": n }))
    }

    fn workspace_config(root: &Path) -> InvalidationConfig {
        InvalidationConfig {
            workspace_roots: vec![root.to_path_buf()],
            ..Default::default()
        }
    }

    async fn wait_for_len(cache: &ResponseCache<String>, expected: usize) {
        for _ in 0..100 {
            if cache.len().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cache.len().await, expected);
    }

    #[test]
    fn test_is_watched() {
        let cache: ResponseCache<String> = ResponseCache::new(CacheOptions::default());
        let coordinator = InvalidationCoordinator::new(
            cache,
            InvalidationConfig {
                watch_patterns: vec!["src/**".to_string()],
                ..workspace_config(Path::new("/ws"))
            },
        );
        let updated = FileChangeKind::Updated;

        assert!(coordinator.is_watched(Path::new("/ws/src/lib.rs"), updated));
        assert!(coordinator.is_watched(Path::new("/ws/src/deep/mod.ts"), updated));
        assert!(!coordinator.is_watched(Path::new("/ws/docs/guide.md"), updated));
        assert!(!coordinator.is_watched(Path::new("/other/src/lib.rs"), updated));
        assert!(!coordinator.is_watched(Path::new("/ws/src/node_modules/x/index.js"), updated));
        assert!(!coordinator.is_watched(Path::new("/ws/src/logo.png"), updated));
        assert!(!coordinator.is_watched(Path::new("/ws/src/module"), updated));
        assert!(coordinator.is_watched(Path::new("/ws/src/module"), FileChangeKind::Deleted));
    }

    #[test]
    fn test_invalid_patterns_are_skipped() {
        let patterns = compile_patterns(&["src/[".to_string(), "**/*.rs".to_string()]);
        assert_eq!(patterns.len(), 1);
    }

    #[tokio::test]
    async fn test_file_change_invalidates_dependents() {
        let cache: ResponseCache<String> = ResponseCache::new(CacheOptions::default());
        let coordinator =
            InvalidationCoordinator::new(cache.clone(), workspace_config(Path::new("/ws")));

        cache
            .set(key(1), "a".to_string(), vec![PathBuf::from("/ws/src/a.rs")])
            .await;
        cache
            .set(key(2), "b".to_string(), vec![PathBuf::from("/ws/target/gen.rs")])
            .await;
        cache
            .set(key(3), "c".to_string(), vec![PathBuf::from("/ws/src/c.rs")])
            .await;

        assert_eq!(
            coordinator
                .on_file_change(&FileChangeEvent::created("/ws/src/a.rs"))
                .await,
            0
        );
        assert_eq!(
            coordinator
                .on_file_change(&FileChangeEvent::updated("/ws/target/gen.rs"))
                .await,
            0
        );
        assert_eq!(
            coordinator
                .on_files_changed(&[
                    FileChangeEvent::updated("/ws/src/a.rs"),
                    FileChangeEvent::deleted("/ws/src/c.rs"),
                ])
                .await,
            2
        );
        assert_eq!(cache.len().await, 1);
        assert!(cache.contains(&key(2)).await);
    }

    #[tokio::test]
    async fn test_deleted_directory_invalidates_contents() {
        let cache: ResponseCache<String> = ResponseCache::new(CacheOptions::default());
        let coordinator =
            InvalidationCoordinator::new(cache.clone(), workspace_config(Path::new("/ws")));
        cache
            .set(key(1), "a".to_string(), vec![PathBuf::from("/ws/src/util/a.rs")])
            .await;

        let removed = coordinator
            .on_file_change(&FileChangeEvent::deleted("/ws/src/util"))
            .await;
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_config_change_clears_namespace() {
        let cache: ResponseCache<String> = ResponseCache::new(CacheOptions::default());
        let coordinator = InvalidationCoordinator::new(cache.clone(), InvalidationConfig::default());
        cache.set(key(1), "a".to_string(), Vec::new()).await;
        cache.set(key(2), "b".to_string(), Vec::new()).await;

        let unrelated = ConfigChangeEvent::new("editor.fontSize", Some(json!(12)), Some(json!(14)));
        assert!(!coordinator.on_config_change(&unrelated).await);
        assert_eq!(cache.len().await, 2);

        let model = ConfigChangeEvent::new("codeassist.model", None, Some(json!("gpt-4o")));
        assert!(coordinator.on_config_change(&model).await);
        assert_eq!(cache.metrics().size, 0);
    }

    #[tokio::test]
    async fn test_listeners_forward_events() {
        let cache: ResponseCache<String> = ResponseCache::new(CacheOptions::default());
        let coordinator =
            InvalidationCoordinator::new(cache.clone(), workspace_config(Path::new("/ws")));
        let (file_tx, file_rx) = broadcast::channel(16);
        let (config_tx, config_rx) = broadcast::channel(16);
        coordinator.listen_files(file_rx);
        coordinator.listen_config(config_rx);

        cache
            .set(key(1), "a".to_string(), vec![PathBuf::from("/ws/src/a.rs")])
            .await;
        cache.set(key(2), "b".to_string(), Vec::new()).await;

        file_tx.send(FileChangeEvent::updated("/ws/src/a.rs")).unwrap();
        wait_for_len(&cache, 1).await;

        config_tx
            .send(ConfigChangeEvent::new("codeassist", None, None))
            .unwrap();
        wait_for_len(&cache, 0).await;
    }

    #[tokio::test]
    async fn test_dispose_stops_listeners() {
        let cache: ResponseCache<String> = ResponseCache::new(CacheOptions::default());
        let coordinator = InvalidationCoordinator::new(cache.clone(), InvalidationConfig::default());
        let (config_tx, config_rx) = broadcast::channel(16);
        coordinator.listen_config(config_rx);
        cache.set(key(1), "a".to_string(), Vec::new()).await;

        coordinator.dispose();
        tokio::time::sleep(Duration::from_millis(20)).await;

        config_tx
            .send(ConfigChangeEvent::new("codeassist.model", None, None))
            .ok();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_app_update_clears_cache() {
        let workspace = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let manifest = workspace.path().join("Cargo.toml");
        std::fs::write(&manifest, "[package]\nversion = \"1.0.0\"\n").unwrap();

        let cache: ResponseCache<String> = ResponseCache::new(CacheOptions {
            persist: true,
            cache_dir: Some(cache_dir.path().to_path_buf()),
            ..Default::default()
        });
        let coordinator =
            InvalidationCoordinator::new(cache.clone(), workspace_config(workspace.path()));
        cache.set(key(1), "a".to_string(), Vec::new()).await;

        let report = coordinator.sweep().await;
        assert!(!report.app_version_changed);
        assert_eq!(cache.len().await, 1);
        assert!(cache_dir.path().join(APP_VERSION_FILE).exists());

        std::fs::write(&manifest, "[package]\nversion = \"1.1.0\"\n").unwrap();
        let report = coordinator.sweep().await;
        assert!(report.app_version_changed);
        assert_eq!(cache.len().await, 0);

        // A fresh coordinator picks up the persisted version.
        let restarted =
            InvalidationCoordinator::new(cache.clone(), workspace_config(workspace.path()));
        cache.set(key(2), "b".to_string(), Vec::new()).await;
        assert!(!restarted.check_app_version().await);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_sweep_expires_by_own_ttl() {
        let clock = ManualClock::new(Timestamp(5_000_000));
        let cache: ResponseCache<String> = ResponseCache::builder(CacheOptions::default())
            .with_clock(Arc::new(clock.clone()))
            .build();
        let coordinator = InvalidationCoordinator::new(
            cache.clone(),
            InvalidationConfig {
                ttl: Duration::from_secs(60),
                invalidate_on_app_update: false,
                ..Default::default()
            },
        );

        cache.set(key(1), "old".to_string(), Vec::new()).await;
        clock.advance(Duration::from_secs(90));
        cache.set(key(2), "new".to_string(), Vec::new()).await;

        let report = coordinator.sweep().await;
        assert_eq!(report.expired, 1);
        assert!(cache.contains(&key(2)).await);
        assert_eq!(cache.metrics().invalidations, 1);
    }

    #[tokio::test]
    async fn test_storage_pressure_policies() {
        for (policy, expect_empty) in [
            (StoragePressurePolicy::ClearAll, true),
            (StoragePressurePolicy::EvictOldest, false),
        ] {
            let clock = ManualClock::new(Timestamp(5_000_000));
            let cache: ResponseCache<String> = ResponseCache::builder(CacheOptions::default())
                .with_clock(Arc::new(clock.clone()))
                .build();
            for n in 0..4 {
                cache.set(key(n), "x".repeat(200), Vec::new()).await;
                clock.advance(Duration::from_millis(10));
            }
            let total = cache.storage_size().await;

            let coordinator = InvalidationCoordinator::new(
                cache.clone(),
                InvalidationConfig {
                    max_storage_bytes: total - 1,
                    storage_policy: policy,
                    invalidate_on_app_update: false,
                    ..Default::default()
                },
            );
            let report = coordinator.sweep().await;

            assert_eq!(report.storage_before, total);
            if expect_empty {
                assert_eq!(report.storage_action, StorageAction::Cleared(4));
                assert!(cache.is_empty().await);
            } else {
                assert_eq!(report.storage_action, StorageAction::Evicted(1));
                assert!(!cache.contains(&key(0)).await);
                assert_eq!(cache.len().await, 3);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep() {
        let clock = ManualClock::new(Timestamp(5_000_000));
        let cache: ResponseCache<String> = ResponseCache::builder(CacheOptions::default())
            .with_clock(Arc::new(clock.clone()))
            .build();
        let coordinator = InvalidationCoordinator::new(
            cache.clone(),
            InvalidationConfig {
                sweep_interval: Duration::from_secs(60),
                ttl: Duration::from_secs(10),
                invalidate_on_app_update: false,
                ..Default::default()
            },
        );
        coordinator.start();

        cache.set(key(1), "a".to_string(), Vec::new()).await;
        clock.advance(Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(cache.len().await, 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(cache.len().await, 0);

        coordinator.dispose();
    }
}
