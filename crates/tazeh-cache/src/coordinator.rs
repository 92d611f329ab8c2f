use crate::entry::{CacheEntry, CacheKey, Generation, ResourceRequest, Response};
use crate::error::NetworkError;
use crate::policy::{Policy, PolicyDecision};
use crate::store::CacheStore;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// The network side of the coordinator.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &ResourceRequest) -> Result<Response, NetworkError>;
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cache,
    Network,
}

/// A response handed back to the host, tagged with how it was produced.
#[derive(Debug, Clone)]
pub struct Served {
    pub response: Response,
    pub source: Source,
    pub policy: Policy,
    /// Insertion time of the cached copy, when served from cache.
    pub stored_at: Option<SystemTime>,
}

impl Served {
    fn cached(entry: &CacheEntry, policy: Policy) -> Self {
        Self {
            response: entry.response.clone(),
            source: Source::Cache,
            policy,
            stored_at: Some(entry.stored_at),
        }
    }

    fn network(response: Response, policy: Policy) -> Self {
        Self {
            response,
            source: Source::Network,
            policy,
            stored_at: None,
        }
    }

    pub fn is_hit(&self) -> bool {
        self.source == Source::Cache
    }
}

#[derive(Clone, Debug, Default)]
pub struct CoordinatorConfig {
    /// Responses with a larger body are served but never stored.
    pub max_entry_bytes: Option<usize>,
}

/// Snapshot of coordinator counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub hits: u64,
    pub misses: u64,
    pub network_fetches: u64,
    pub network_errors: u64,
    pub coalesced: u64,
    pub stores: u64,
    pub store_failures: u64,
    pub revalidations: u64,
    pub revalidation_failures: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    network_fetches: AtomicU64,
    network_errors: AtomicU64,
    coalesced: AtomicU64,
    stores: AtomicU64,
    store_failures: AtomicU64,
    revalidations: AtomicU64,
    revalidation_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

type FetchResult = Result<Response, NetworkError>;
type FetchFuture = BoxFuture<'static, FetchResult>;

/// Registry slot for the one network fetch currently running for a key.
///
/// Holds only a weak handle: once every waiter is gone the fetch is dropped
/// (and never writes), even though the slot may linger until its guard runs.
struct InFlight {
    id: u64,
    fetch: WeakShared<FetchFuture>,
}

enum Slot {
    Started(Shared<FetchFuture>),
    Joined(Shared<FetchFuture>),
}

struct Inner {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    generation: Generation,
    config: CoordinatorConfig,
    in_flight: Mutex<HashMap<CacheKey, InFlight>>,
    next_id: AtomicU64,
    counters: Counters,
}

/// Removes the registry slot when its fetch settles or is dropped.
struct InFlightGuard {
    inner: Arc<Inner>,
    key: CacheKey,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.inner.in_flight.lock();
        if in_flight.get(&self.key).map(|f| f.id) == Some(self.id) {
            in_flight.remove(&self.key);
        }
    }
}

/// Executes freshness policies against a store and the network.
///
/// Enforces at most one in-flight network fetch per key for the caching
/// policies: concurrent misses share a single fetch and all receive its
/// result. Cheap to clone; clones share the registry and counters.
#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<Inner>,
}

impl FetchCoordinator {
    pub fn new(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        generation: Generation,
    ) -> Self {
        Self::with_config(store, fetcher, generation, CoordinatorConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        generation: Generation,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                fetcher,
                generation,
                config,
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    pub fn generation(&self) -> &Generation {
        &self.inner.generation
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.inner.store
    }

    /// Number of keys with a network fetch currently registered.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let c = &self.inner.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        CoordinatorStats {
            hits: load(&c.hits),
            misses: load(&c.misses),
            network_fetches: load(&c.network_fetches),
            network_errors: load(&c.network_errors),
            coalesced: load(&c.coalesced),
            stores: load(&c.stores),
            store_failures: load(&c.store_failures),
            revalidations: load(&c.revalidations),
            revalidation_failures: load(&c.revalidation_failures),
        }
    }

    pub async fn execute(
        &self,
        decision: PolicyDecision,
        request: &ResourceRequest,
    ) -> Result<Served, NetworkError> {
        match decision.policy {
            Policy::CacheFirst => self.cache_first(request).await,
            Policy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
            Policy::NetworkOnly => self.network_only(request).await,
        }
    }

    /// Serve from cache; on a miss, fetch (coalesced), store a 2xx copy, then return.
    pub async fn cache_first(&self, request: &ResourceRequest) -> Result<Served, NetworkError> {
        let key = request.key();

        if let Some(entry) = self.lookup(&key).await {
            bump(&self.inner.counters.hits);
            tracing::debug!(key = %key, policy = "cache-first", "cache HIT");
            return Ok(Served::cached(&entry, Policy::CacheFirst));
        }

        bump(&self.inner.counters.misses);
        tracing::debug!(key = %key, policy = "cache-first", "cache MISS");
        let response = self.join_fetch(&key, request).await?;
        Ok(Served::network(response, Policy::CacheFirst))
    }

    /// Serve the cached copy immediately and revalidate in the background.
    ///
    /// On a miss the caller waits for the (coalesced) network fetch. When this
    /// returns, the background write may not have landed yet.
    pub async fn stale_while_revalidate(
        &self,
        request: &ResourceRequest,
    ) -> Result<Served, NetworkError> {
        let key = request.key();

        if let Some(entry) = self.lookup(&key).await {
            bump(&self.inner.counters.hits);
            tracing::debug!(key = %key, policy = "stale-while-revalidate", "cache HIT");
            self.spawn_revalidation(&key, request);
            return Ok(Served::cached(&entry, Policy::StaleWhileRevalidate));
        }

        bump(&self.inner.counters.misses);
        tracing::debug!(key = %key, policy = "stale-while-revalidate", "cache MISS");
        let response = self.join_fetch(&key, request).await?;
        Ok(Served::network(response, Policy::StaleWhileRevalidate))
    }

    /// Fetch without touching the store or the in-flight registry.
    pub async fn network_only(&self, request: &ResourceRequest) -> Result<Served, NetworkError> {
        bump(&self.inner.counters.network_fetches);
        match self.inner.fetcher.fetch(request).await {
            Ok(response) => Ok(Served::network(response, Policy::NetworkOnly)),
            Err(e) => {
                bump(&self.inner.counters.network_errors);
                Err(e)
            }
        }
    }

    /// Read through the store. Errors and foreign generations count as a miss.
    async fn lookup(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        match self.inner.store.get(key).await {
            Ok(Some(entry)) if entry.generation == self.inner.generation => Some(entry),
            Ok(Some(entry)) => {
                tracing::debug!(
                    key = %key,
                    generation = %entry.generation,
                    "ignoring entry from stale generation"
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, key = %key, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn join_fetch(&self, key: &CacheKey, request: &ResourceRequest) -> FetchResult {
        match self.slot(key, request) {
            Slot::Started(fetch) => fetch.await,
            Slot::Joined(fetch) => {
                bump(&self.inner.counters.coalesced);
                tracing::debug!(key = %key, "joined in-flight fetch");
                fetch.await
            }
        }
    }

    fn spawn_revalidation(&self, key: &CacheKey, request: &ResourceRequest) {
        let fetch = match self.slot(key, request) {
            Slot::Started(fetch) => fetch,
            Slot::Joined(_) => {
                tracing::trace!(key = %key, "revalidation already in flight");
                return;
            }
        };

        bump(&self.inner.counters.revalidations);
        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        tokio::spawn(async move {
            if fetch.await.is_err() {
                bump(&inner.counters.revalidation_failures);
                tracing::debug!(key = %key, "revalidation failed, keeping stale entry");
            }
        });
    }

    /// Join the running fetch for `key`, or register a new one.
    fn slot(&self, key: &CacheKey, request: &ResourceRequest) -> Slot {
        let mut in_flight = self.inner.in_flight.lock();

        if let Some(fetch) = in_flight.get(key).and_then(|f| f.fetch.upgrade()) {
            return Slot::Joined(fetch);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let fetch = Inner::fetch_and_store(
            Arc::clone(&self.inner),
            id,
            key.clone(),
            request.clone(),
        )
        .boxed()
        .shared();

        if let Some(weak) = fetch.downgrade() {
            in_flight.insert(key.clone(), InFlight { id, fetch: weak });
        }
        Slot::Started(fetch)
    }
}

impl Inner {
    async fn fetch_and_store(
        inner: Arc<Inner>,
        id: u64,
        key: CacheKey,
        request: ResourceRequest,
    ) -> FetchResult {
        let _guard = InFlightGuard {
            inner: Arc::clone(&inner),
            key: key.clone(),
            id,
        };

        bump(&inner.counters.network_fetches);
        let response = match inner.fetcher.fetch(&request).await {
            Ok(response) => response,
            Err(e) => {
                bump(&inner.counters.network_errors);
                tracing::warn!(error = %e, key = %key, "network fetch failed");
                return Err(e);
            }
        };

        inner.store_if_cacheable(&key, &response).await;
        Ok(response)
    }

    async fn store_if_cacheable(&self, key: &CacheKey, response: &Response) {
        if !response.is_success() {
            tracing::debug!(key = %key, status = response.status, "not caching unsuccessful response");
            return;
        }
        if let Some(limit) = self.config.max_entry_bytes {
            if response.body.len() > limit {
                tracing::debug!(
                    key = %key,
                    size = response.body.len(),
                    limit,
                    "not caching oversized response"
                );
                return;
            }
        }

        let entry = CacheEntry::new(key.clone(), response.clone(), self.generation.clone());
        match self.store.put(entry).await {
            Ok(()) => {
                bump(&self.counters.stores);
                tracing::debug!(key = %key, generation = %self.generation, "stored response");
            }
            Err(e) => {
                bump(&self.counters.store_failures);
                tracing::warn!(error = %e, key = %key, "cache write failed, dropping");
            }
        }
    }
}
