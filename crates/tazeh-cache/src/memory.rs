use crate::entry::{CacheEntry, CacheKey, EntryMeta};
use crate::error::StorageError;
use crate::store::{CacheStore, MetaPredicate, SweepSummary};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Number of shards. Must be a power of two for fast modulo via bitmask.
const NUM_SHARDS: usize = 64;
const SHARD_MASK: u64 = (NUM_SHARDS as u64) - 1;

type Shard = HashMap<CacheKey, Arc<CacheEntry>>;

/// Thread-safe sharded in-memory store.
///
/// Keys are spread across 64 independent shards, each behind its own
/// `RwLock`. Lookups take a read lock on one shard; writes take a write lock
/// on one shard and leave the other 63 uncontested.
///
/// An optional quota bounds the number of entries and their total size. A
/// `put` that would exceed it fails with [`StorageError::QuotaExceeded`]
/// instead of evicting anything; the previous entry for the key stays in place.
pub struct MemoryStore {
    shards: Box<[RwLock<Shard>; NUM_SHARDS]>,
    entries: AtomicUsize,
    bytes: AtomicUsize,
    max_entries: Option<usize>,
    max_bytes: Option<usize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Unbounded store.
    pub fn new() -> Self {
        Self::with_quota(None, None)
    }

    pub fn with_quota(max_entries: Option<usize>, max_bytes: Option<usize>) -> Self {
        let shards: Vec<RwLock<Shard>> = (0..NUM_SHARDS)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();

        let shards: Box<[RwLock<Shard>; NUM_SHARDS]> = shards
            .into_boxed_slice()
            .try_into()
            .unwrap_or_else(|_| unreachable!());

        Self {
            shards,
            entries: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            max_entries,
            max_bytes,
        }
    }

    /// Hash a key and return the shard index.
    #[inline]
    fn shard_index(key: &CacheKey) -> usize {
        let hash = ahash::RandomState::with_seeds(1, 2, 3, 4).hash_one(key.as_str());
        (hash & SHARD_MASK) as usize
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let idx = Self::shard_index(key);
        self.shards[idx].read().get(key).cloned()
    }

    /// Insert or overwrite. Takes a write lock on one shard.
    pub fn insert(&self, entry: CacheEntry) -> Result<(), StorageError> {
        let idx = Self::shard_index(&entry.key);
        let mut shard = self.shards[idx].write();

        let new_size = entry.size();
        let old_size = shard.get(&entry.key).map(|e| e.size());

        let grow = new_size.saturating_sub(old_size.unwrap_or(0));
        reserve(&self.bytes, grow, self.max_bytes)?;

        if old_size.is_none() {
            if let Err(err) = reserve(&self.entries, 1, self.max_entries) {
                self.bytes.fetch_sub(grow, Ordering::Relaxed);
                return Err(err);
            }
        }

        if let Some(old) = old_size {
            let shrink = old.saturating_sub(new_size);
            self.bytes.fetch_sub(shrink, Ordering::Relaxed);
        }

        shard.insert(entry.key.clone(), Arc::new(entry));
        Ok(())
    }

    /// Remove a key explicitly.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let idx = Self::shard_index(key);
        let removed = self.shards[idx].write().remove(key);
        match removed {
            Some(entry) => {
                self.release(&entry);
                true
            }
            None => false,
        }
    }

    fn release(&self, entry: &CacheEntry) {
        self.entries.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(entry.size(), Ordering::Relaxed);
    }

    /// Number of entries across all shards.
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total accounted size of all entries.
    pub fn size_bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Atomically add `amount` to `counter` unless that would pass `limit`.
fn reserve(counter: &AtomicUsize, amount: usize, limit: Option<usize>) -> Result<(), StorageError> {
    let Some(limit) = limit else {
        counter.fetch_add(amount, Ordering::Relaxed);
        return Ok(());
    };

    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            current
                .checked_add(amount)
                .filter(|&next| next <= limit)
        })
        .map(|_| ())
        .map_err(|current| StorageError::QuotaExceeded {
            needed: amount,
            available: limit.saturating_sub(current),
        })
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Arc<CacheEntry>>, StorageError> {
        Ok(self.lookup(key))
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), StorageError> {
        self.insert(entry)
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, StorageError> {
        Ok(self.remove(key))
    }

    async fn delete_where(&self, predicate: MetaPredicate<'_>) -> Result<SweepSummary, StorageError> {
        let mut summary = SweepSummary::default();
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            shard.retain(|_, entry| {
                if predicate(&entry.meta()) {
                    self.release(entry);
                    summary.removed += 1;
                    false
                } else {
                    true
                }
            });
        }
        Ok(summary)
    }

    fn keys(&self) -> BoxStream<'_, Result<EntryMeta, StorageError>> {
        // Snapshot one shard at a time so no lock is held across a yield.
        stream::iter(self.shards.iter())
            .flat_map(|shard| {
                let metas: Vec<_> = shard.read().values().map(|e| Ok(e.meta())).collect();
                stream::iter(metas)
            })
            .boxed()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Generation, ResourceRequest, Response};
    use futures::TryStreamExt;

    fn entry(path: &str, gen: &str) -> CacheEntry {
        let key = ResourceRequest::parse("GET", &format!("https://app.example/{path}"))
            .unwrap()
            .key();
        CacheEntry::new(key, Response::new(200, "test"), Generation::new(gen))
    }

    fn key(path: &str) -> CacheKey {
        entry(path, "g").key
    }

    #[test]
    fn basic_insert_and_lookup() {
        let store = MemoryStore::new();
        store.insert(entry("hello", "g1")).unwrap();
        assert!(store.lookup(&key("hello")).is_some());
        assert!(store.lookup(&key("missing")).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn overwrite_replaces_wholesale() {
        let store = MemoryStore::new();
        store.insert(entry("a", "g1")).unwrap();
        store.insert(entry("a", "g2")).unwrap();

        assert_eq!(store.len(), 1);
        let got = store.lookup(&key("a")).unwrap();
        assert_eq!(got.generation.as_str(), "g2");
        assert_eq!(store.size_bytes(), got.size());
    }

    #[test]
    fn distributes_across_shards() {
        let store = MemoryStore::new();
        for i in 0..200 {
            store.insert(entry(&format!("key-{i}"), "g1")).unwrap();
        }

        assert_eq!(store.len(), 200);

        let nonempty_shards = store
            .shards
            .iter()
            .filter(|s| !s.read().is_empty())
            .count();
        assert!(
            nonempty_shards > 1,
            "expected keys distributed across multiple shards, got {}",
            nonempty_shards
        );
    }

    #[test]
    fn remove_works() {
        let store = MemoryStore::new();
        store.insert(entry("a", "g1")).unwrap();
        assert!(store.remove(&key("a")));
        assert!(store.lookup(&key("a")).is_none());
        assert!(!store.remove(&key("a"))); // already gone
        assert_eq!(store.size_bytes(), 0);
    }

    #[test]
    fn entry_quota_rejects_new_keys_but_allows_overwrite() {
        let store = MemoryStore::with_quota(Some(2), None);
        store.insert(entry("a", "g1")).unwrap();
        store.insert(entry("b", "g1")).unwrap();

        let err = store.insert(entry("c", "g1")).unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { .. }));
        assert!(store.lookup(&key("c")).is_none());

        store.insert(entry("a", "g2")).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn byte_quota_keeps_previous_entry() {
        let small = entry("a", "g1");
        let limit = small.size();
        let store = MemoryStore::with_quota(None, Some(limit));
        store.insert(small).unwrap();

        let mut big = entry("a", "g2");
        big.response.body = bytes::Bytes::from(vec![0u8; 1024]);
        let err = store.insert(big).unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { available: 0, .. }));

        let kept = store.lookup(&key("a")).unwrap();
        assert_eq!(kept.generation.as_str(), "g1");
        assert_eq!(store.size_bytes(), limit);
    }

    #[tokio::test]
    async fn keys_enumerates_every_entry_and_restarts() {
        let store = MemoryStore::new();
        for i in 0..50 {
            store.insert(entry(&format!("k{i}"), "g1")).unwrap();
        }

        let first: Vec<EntryMeta> = store.keys().try_collect().await.unwrap();
        let second: Vec<EntryMeta> = store.keys().try_collect().await.unwrap();
        assert_eq!(first.len(), 50);
        assert_eq!(second.len(), 50);
    }

    #[tokio::test]
    async fn delete_where_removes_matching_only() {
        let store = MemoryStore::new();
        store.insert(entry("old-1", "gen1")).unwrap();
        store.insert(entry("new-1", "gen2")).unwrap();
        store.insert(entry("old-2", "gen1")).unwrap();

        let summary = store
            .delete_where(&|meta: &EntryMeta| meta.generation.as_str() == "gen1")
            .await
            .unwrap();

        assert_eq!(summary, SweepSummary { removed: 2, failed: 0 });
        assert_eq!(store.len(), 1);
        assert!(store.lookup(&key("new-1")).is_some());
    }

    #[test]
    fn concurrent_access() {
        use std::thread;

        let store = Arc::new(MemoryStore::new());

        for i in 0..1000 {
            store.insert(entry(&format!("key-{i}"), "g1")).unwrap();
        }

        let mut handles = vec![];

        for t in 0..8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    let path = format!("key-{}", (t * 1000 + i) % 2000);
                    if i % 3 == 0 {
                        store.insert(entry(&path, "g1")).unwrap();
                    } else {
                        store.lookup(&key(&path));
                    }
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        let counted: usize = store.shards.iter().map(|s| s.read().len()).sum();
        assert_eq!(store.len(), counted);
    }

    #[test]
    fn is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MemoryStore>();
    }
}
