//! Error types for codeassist

use thiserror::Error;

/// Main error type for the cache subsystem
///
/// None of these reach callers of the cache facade; they are logged and the
/// cache degrades instead.
#[derive(Error, Debug)]
pub enum CacheError {
    // Storage errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt cache entry {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    // Configuration errors
    #[error("invalid watch pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Result type alias for codeassist
pub type Result<T> = std::result::Result<T, CacheError>;
