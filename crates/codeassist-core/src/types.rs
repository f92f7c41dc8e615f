//! Core types for codeassist

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Timestamp in milliseconds since Unix epoch
#[derive(Clone, Copy, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Converts a system time, clamping anything before the epoch to zero.
    pub fn from_system_time(time: SystemTime) -> Self {
        let millis = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Time elapsed between `earlier` and `self`, zero if `earlier` is in the future
    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    pub fn saturating_add(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_millis() as u64))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// File change event reported by the editor's file watcher
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileChangeEvent {
    /// Absolute path of the file
    pub path: PathBuf,

    /// Type of change
    pub kind: FileChangeKind,
}

impl FileChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: FileChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    pub fn updated(path: impl Into<PathBuf>) -> Self {
        Self::new(path, FileChangeKind::Updated)
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self::new(path, FileChangeKind::Deleted)
    }

    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self::new(path, FileChangeKind::Created)
    }
}

/// Type of file change
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    Created,
    Updated,
    Deleted,
}

impl FileChangeKind {
    /// Whether content that was read before this change may now be outdated
    pub fn affects_existing_content(&self) -> bool {
        matches!(self, Self::Updated | Self::Deleted)
    }
}

/// Preference change event reported by the editor's configuration service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigChangeEvent {
    /// Fully qualified preference key, e.g. `codeassist.model`
    pub key: String,

    #[serde(default)]
    pub old_value: Option<serde_json::Value>,

    #[serde(default)]
    pub new_value: Option<serde_json::Value>,
}

impl ConfigChangeEvent {
    pub fn new(
        key: impl Into<String>,
        old_value: Option<serde_json::Value>,
        new_value: Option<serde_json::Value>,
    ) -> Self {
        Self {
            key: key.into(),
            old_value,
            new_value,
        }
    }

    /// Whether the key equals `namespace` or lives beneath it (`namespace.*`)
    pub fn is_in_namespace(&self, namespace: &str) -> bool {
        match self.key.strip_prefix(namespace) {
            Some(rest) => rest.is_empty() || rest.starts_with('.'),
            None => false,
        }
    }
}
