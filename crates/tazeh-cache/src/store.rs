use crate::entry::{CacheEntry, CacheKey, EntryMeta};
use crate::error::StorageError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Predicate over entry metadata, used for bulk deletion.
pub type MetaPredicate<'a> = &'a (dyn Fn(&EntryMeta) -> bool + Send + Sync);

/// Result of a `delete_where` pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub removed: usize,
    pub failed: usize,
}

/// Keyed storage for response payloads, scoped by generation.
///
/// Implementations must be safe to call concurrently from many tasks without
/// external locking. A single `put` is atomic; there are no cross-entry
/// transactions.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up an entry. No side effects.
    async fn get(&self, key: &CacheKey) -> Result<Option<Arc<CacheEntry>>, StorageError>;

    /// Insert or overwrite the entry stored under `entry.key`.
    async fn put(&self, entry: CacheEntry) -> Result<(), StorageError>;

    /// Remove one entry. Returns whether it existed.
    async fn delete(&self, key: &CacheKey) -> Result<bool, StorageError>;

    /// Remove every entry whose metadata matches `predicate`.
    ///
    /// Per-entry failures are logged, counted and skipped.
    async fn delete_where(&self, predicate: MetaPredicate<'_>) -> Result<SweepSummary, StorageError>;

    /// Lazily enumerate entry metadata. Finite; call again to restart.
    fn keys(&self) -> BoxStream<'_, Result<EntryMeta, StorageError>>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}
