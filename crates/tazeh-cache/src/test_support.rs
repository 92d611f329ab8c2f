use crate::coordinator::Fetcher;
use crate::entry::{CacheEntry, CacheKey, EntryMeta, ResourceRequest, Response};
use crate::error::{NetworkError, StorageError};
use crate::store::{CacheStore, MetaPredicate, SweepSummary};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scripted network: a canned result per URL, optional latency, call counting.
#[derive(Default)]
pub(crate) struct MockFetcher {
    routes: Mutex<HashMap<String, Result<Response, NetworkError>>>,
    latency: Mutex<Duration>,
    calls: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, url: &str, result: Result<Response, NetworkError>) {
        self.routes.lock().insert(url.to_string(), result);
    }

    pub fn ok(&self, url: &str, body: &'static str) {
        self.respond(url, Ok(Response::new(200, body)));
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &ResourceRequest) -> Result<Response, NetworkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.routes
            .lock()
            .get(request.url.as_str())
            .cloned()
            .unwrap_or_else(|| Err(NetworkError::Transport("no route".into())))
    }
}

/// Store whose backend is permanently down.
pub(crate) struct BrokenStore;

#[async_trait]
impl CacheStore for BrokenStore {
    async fn get(&self, _key: &CacheKey) -> Result<Option<Arc<CacheEntry>>, StorageError> {
        Err(StorageError::Unavailable("backend down".into()))
    }

    async fn put(&self, _entry: CacheEntry) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("backend down".into()))
    }

    async fn delete(&self, _key: &CacheKey) -> Result<bool, StorageError> {
        Err(StorageError::Unavailable("backend down".into()))
    }

    async fn delete_where(&self, _predicate: MetaPredicate<'_>) -> Result<SweepSummary, StorageError> {
        Err(StorageError::Unavailable("backend down".into()))
    }

    fn keys(&self) -> BoxStream<'_, Result<EntryMeta, StorageError>> {
        stream::once(async { Err(StorageError::Unavailable("backend down".into())) }).boxed()
    }

    fn name(&self) -> &'static str {
        "broken"
    }
}

pub(crate) fn request(url: &str) -> ResourceRequest {
    ResourceRequest::parse("GET", url).unwrap()
}
