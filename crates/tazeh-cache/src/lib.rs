//! Resource freshness cache.
//!
//! Requests are classified into a freshness [`Policy`](policy::Policy) by the
//! [`PolicySelector`](policy::PolicySelector), executed against a
//! generation-scoped [`CacheStore`](store::CacheStore) by the
//! [`FetchCoordinator`](coordinator::FetchCoordinator), and stale generations
//! are swept by the [`GarbageCollector`](gc::GarbageCollector) before a
//! [`Worker`](worker::Worker) accepts its first request.

pub mod coordinator;
pub mod disk;
pub mod entry;
pub mod error;
pub mod gc;
pub mod memory;
pub mod policy;
pub mod store;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use coordinator::{CoordinatorStats, FetchCoordinator, Fetcher, Served, Source};
pub use disk::DiskStore;
pub use entry::{CacheEntry, CacheKey, EntryMeta, Generation, ResourceRequest, Response};
pub use error::{NetworkError, StorageError};
pub use gc::{GarbageCollector, GcReport};
pub use memory::MemoryStore;
pub use policy::{MatchedRule, Policy, PolicyDecision, PolicySelector, RoutingRules};
pub use store::{CacheStore, SweepSummary};
pub use worker::{Interception, Worker, WorkerBuilder};
