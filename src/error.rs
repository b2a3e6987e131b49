//! Error types for latchkey.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for lock and rate limiter operations.
#[derive(Error, Debug)]
pub enum LatchkeyError {
    /// The lock is held by someone else. Expected under contention.
    #[error("lock not acquired")]
    NotAcquired,

    /// The stored token belongs to another instance.
    #[error("lock not owned by this instance")]
    NotOwned,

    /// The lock key is gone, nobody holds it anymore.
    #[error("lock has expired")]
    Expired,

    /// Admission denied by the sliding window.
    #[error("rate limited")]
    RateLimited,

    /// The operation context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation context deadline passed.
    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    /// Communication with the key-value store failed
    #[error("store error during {op} on {key}: {source}")]
    Store {
        op: &'static str,
        key: String,
        #[source]
        source: StoreError,
    },

    /// One or more locks could not be released by `release_all`
    #[error("release all locks failed: {}", describe_failures(.0))]
    ReleaseAll(Vec<ReleaseFailure>),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single failed release collected by `LockManager::release_all`.
#[derive(Debug)]
pub struct ReleaseFailure {
    pub key: String,
    pub error: LatchkeyError,
}

fn describe_failures(failures: &[ReleaseFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.key, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl LatchkeyError {
    pub(crate) fn store(op: &'static str, key: &str, source: StoreError) -> Self {
        LatchkeyError::Store {
            op,
            key: key.to_string(),
            source,
        }
    }

    /// Whether this is a throttling signal (maps to HTTP 429 at the edge).
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, LatchkeyError::RateLimited)
    }

    /// Whether the caller should simply try again later.
    pub fn is_contention(&self) -> bool {
        matches!(self, LatchkeyError::NotAcquired | LatchkeyError::RateLimited)
    }
}

/// Result type alias for latchkey operations.
pub type Result<T> = std::result::Result<T, LatchkeyError>;
