//! Activation and interception hooks for a hosting shell.
//!
//! A [`Worker`] can only be obtained from [`WorkerBuilder::activate`], which
//! runs the generation sweep to completion first. No request is ever served
//! against entries of a generation the current build no longer understands.

use crate::coordinator::{CoordinatorConfig, CoordinatorStats, FetchCoordinator, Fetcher, Served};
use crate::entry::{Generation, ResourceRequest};
use crate::error::NetworkError;
use crate::gc::{GarbageCollector, GcReport};
use crate::policy::{PolicyDecision, PolicySelector, RoutingRules};
use crate::store::CacheStore;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// What the host should do with an intercepted request.
#[derive(Debug)]
pub enum Interception {
    /// Not handled: the host performs the request itself, untouched.
    PassThrough(PolicyDecision),
    /// Handled: a response or the network failure no cache could cover.
    Respond(Result<Served, NetworkError>),
}

pub struct WorkerBuilder {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    generation: Generation,
    rules: RoutingRules,
    config: CoordinatorConfig,
}

impl WorkerBuilder {
    pub fn new(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        generation: Generation,
        rules: RoutingRules,
    ) -> Self {
        Self {
            store,
            fetcher,
            generation,
            rules,
            config: CoordinatorConfig::default(),
        }
    }

    pub fn max_entry_bytes(mut self, limit: Option<usize>) -> Self {
        self.config.max_entry_bytes = limit;
        self
    }

    /// Sweep stale generations, then start accepting requests.
    pub async fn activate(self) -> (Worker, GcReport) {
        let report = GarbageCollector::new(Arc::clone(&self.store), self.generation.clone())
            .run()
            .await;

        tracing::info!(
            generation = %self.generation,
            store = self.store.name(),
            app_origin = %self.rules.app_origin,
            "worker activated"
        );

        let coordinator =
            FetchCoordinator::with_config(self.store, self.fetcher, self.generation, self.config);
        let worker = Worker {
            selector: ArcSwap::from_pointee(PolicySelector::new(self.rules)),
            coordinator,
        };
        (worker, report)
    }
}

pub struct Worker {
    selector: ArcSwap<PolicySelector>,
    coordinator: FetchCoordinator,
}

impl Worker {
    pub fn classify(&self, request: &ResourceRequest) -> PolicyDecision {
        self.selector.load().classify(request)
    }

    /// Per-request hook. Network-only requests are left to the host.
    pub async fn intercept(&self, request: &ResourceRequest) -> Interception {
        let decision = self.classify(request);
        if !decision.policy.uses_cache() {
            tracing::trace!(request = %request, rule = decision.rule.as_str(), "pass through");
            return Interception::PassThrough(decision);
        }
        Interception::Respond(self.coordinator.execute(decision, request).await)
    }

    /// Like [`intercept`](Self::intercept), but also performs network-only fetches.
    pub async fn handle(&self, request: &ResourceRequest) -> Result<Served, NetworkError> {
        let decision = self.classify(request);
        self.coordinator.execute(decision, request).await
    }

    /// Atomically replace the routing rules. In-flight requests keep the old ones.
    pub fn update_rules(&self, rules: RoutingRules) {
        tracing::info!(app_origin = %rules.app_origin, "routing rules updated");
        self.selector.store(Arc::new(PolicySelector::new(rules)));
    }

    pub fn rules(&self) -> RoutingRules {
        self.selector.load().rules().clone()
    }

    pub fn generation(&self) -> &Generation {
        self.coordinator.generation()
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.coordinator.stats()
    }

    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.coordinator
    }
}
