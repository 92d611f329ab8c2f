use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure of the storage layer behind a [`CacheStore`](crate::store::CacheStore).
///
/// Never reaches a request caller: reads degrade to a miss and writes are dropped.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage quota exceeded: {needed} needed, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt cache entry at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to serialize cache entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failure of the underlying network fetch.
///
/// Cloneable because a single coalesced fetch hands its result to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("network request failed: {0}")]
    Transport(String),

    #[error("network request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network request cancelled")]
    Cancelled,
}

impl NetworkError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        NetworkError::Transport(err.to_string())
    }
}
