//! Error types for tabkv operations

use thiserror::Error;

/// Cache-inclusion pattern errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("Invalid pattern {pattern:?}: wildcard at position {position} is not the final character")]
    InvalidPattern { pattern: String, position: usize },
}

/// Lifecycle misuse of a cached storage instance.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Cached storage already started")]
    AlreadyStarted,

    #[error("Cached storage not started")]
    NotStarted,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("A shared storage instance requires a non-empty identity")]
    MissingIdentity,
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Quota exceeded writing {key}: {requested} bytes requested, quota is {quota} bytes")]
    QuotaExceeded {
        key: String,
        requested: usize,
        quota: usize,
    },

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Timer unavailable: {reason}")]
    Timer { reason: String },
}

/// Master error type for all tabkv errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TabKvError {
    #[error("Pattern error: {0}")]
    Pattern(#[from] PatternError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type alias for tabkv operations.
pub type TabKvResult<T> = Result<T, TabKvError>;

impl From<serde_json::Error> for TabKvError {
    fn from(err: serde_json::Error) -> Self {
        TabKvError::Storage(StorageError::Serialization {
            reason: err.to_string(),
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
