//! Error types for bundle management
//!
//! This module contains the error taxonomy used by the bundle manager and its
//! collaborators: store failures, replication failures, and the `BundleError`
//! type that unifies them.
//!
//! All errors are `Clone` so a single outcome can be shared between every
//! waiter of a memoized operation (store open, swarm join, pending writes).

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failures reported by a versioned store or one of its views
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Store is not open")]
    NotOpen,
    #[error("Store is closed")]
    Closed,
    #[error("Store is not writable")]
    ReadOnly,
    #[error("Batch has already been flushed")]
    BatchFlushed,
    #[error("Version {requested} is not available (store length {length})")]
    VersionUnavailable { requested: u64, length: u64 },
    #[error("Store I/O error: {reason}")]
    Io { reason: String },
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            reason: err.to_string(),
        }
    }
}

/// Failures reported by a swarm while joining or leaving a topic
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicationError {
    #[error("Swarm join failed: {reason}")]
    JoinFailed { reason: String },
    #[error("Swarm leave failed: {reason}")]
    LeaveFailed { reason: String },
}

// ----------------------------------------------------------------------------
// Bundle Error
// ----------------------------------------------------------------------------

/// Core error type for bundle management
#[derive(Debug, Clone, thiserror::Error)]
pub enum BundleError {
    /// Misuse of the API that no retry can fix
    #[error("Internal platform error: {reason}")]
    Programmer { reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),

    /// An absorbed write stream failed before reaching its batch
    #[error("Write to {key} failed: {reason}")]
    Write { key: String, reason: String },

    #[error("Malformed input: {reason}")]
    MalformedInput { reason: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Bundle is closed, cannot {operation}")]
    Closed { operation: &'static str },

    #[error("Bundler error: {reason}")]
    Bundler { reason: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Background task failed: {reason}")]
    Task { reason: String },
}

impl From<bincode::Error> for BundleError {
    fn from(err: bincode::Error) -> Self {
        BundleError::Serialization {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BundleError {
    fn from(err: serde_json::Error) -> Self {
        BundleError::MalformedInput {
            reason: err.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl BundleError {
    /// Create a programmer error with a reason
    pub fn programmer<T: Into<String>>(reason: T) -> Self {
        BundleError::Programmer {
            reason: reason.into(),
        }
    }

    /// Create a malformed input error with a reason
    pub fn malformed<T: Into<String>>(reason: T) -> Self {
        BundleError::MalformedInput {
            reason: reason.into(),
        }
    }

    /// Create a write failure for a key
    pub fn write_failed<K: Into<String>, R: ToString>(key: K, reason: R) -> Self {
        BundleError::Write {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        BundleError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a background task error with a reason
    pub fn task_failed<T: ToString>(reason: T) -> Self {
        BundleError::Task {
            reason: reason.to_string(),
        }
    }

    /// True for failures caused by misuse rather than by the environment
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, BundleError::Programmer { .. })
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type StoreResult<T> = core::result::Result<T, StoreError>;
pub type BundleResult<T> = core::result::Result<T, BundleError>;
