use crate::proxy::AppState;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tazeh_cache::{CoordinatorStats, RoutingRules};
use tokio_util::sync::CancellationToken;

/// Body of `GET /api/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub generation: String,
    pub store: &'static str,
    pub hit_rate: f64,
    pub in_flight: usize,
    pub counters: CoordinatorStats,
    pub rules: RoutingRules,
}

impl StatsSnapshot {
    fn collect(state: &AppState) -> Self {
        let coordinator = state.worker.coordinator();
        let counters = state.worker.stats();
        Self {
            generation: state.worker.generation().to_string(),
            store: coordinator.store().name(),
            hit_rate: hit_rate(&counters),
            in_flight: coordinator.in_flight(),
            counters,
            rules: state.worker.rules(),
        }
    }
}

fn hit_rate(stats: &CoordinatorStats) -> f64 {
    let total = stats.hits + stats.misses;
    if total > 0 {
        stats.hits as f64 / total as f64
    } else {
        0.0
    }
}

/// GET /api/stats: one-shot stats endpoint.
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<StatsSnapshot> {
    Json(StatsSnapshot::collect(&state))
}

/// Background task that mirrors coordinator counters into the metrics
/// recorder every 500ms, until shutdown.
pub async fn metrics_reporter(state: Arc<AppState>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => publish(&StatsSnapshot::collect(&state)),
        }
    }
}

fn publish(snapshot: &StatsSnapshot) {
    let c = &snapshot.counters;
    metrics::counter!("tazeh_cache_hits_total").absolute(c.hits);
    metrics::counter!("tazeh_cache_misses_total").absolute(c.misses);
    metrics::counter!("tazeh_cache_network_fetches_total").absolute(c.network_fetches);
    metrics::counter!("tazeh_cache_network_errors_total").absolute(c.network_errors);
    metrics::counter!("tazeh_cache_coalesced_total").absolute(c.coalesced);
    metrics::counter!("tazeh_cache_stores_total").absolute(c.stores);
    metrics::counter!("tazeh_cache_store_failures_total").absolute(c.store_failures);
    metrics::counter!("tazeh_cache_revalidations_total").absolute(c.revalidations);
    metrics::counter!("tazeh_cache_revalidation_failures_total")
        .absolute(c.revalidation_failures);
    metrics::gauge!("tazeh_cache_in_flight").set(snapshot.in_flight as f64);
    metrics::gauge!("tazeh_cache_hit_rate").set(snapshot.hit_rate);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_handles_empty_and_mixed() {
        assert_eq!(hit_rate(&CoordinatorStats::default()), 0.0);
        let stats = CoordinatorStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(hit_rate(&stats), 0.75);
    }

    #[test]
    fn snapshot_serializes_counters_and_rules() {
        let counters = CoordinatorStats {
            hits: 2,
            coalesced: 5,
            ..Default::default()
        };
        let snapshot = StatsSnapshot {
            generation: "build-7".into(),
            store: "memory",
            hit_rate: hit_rate(&counters),
            in_flight: 1,
            counters,
            rules: RoutingRules::for_origin(url::Url::parse("https://app.example").unwrap()),
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["generation"], "build-7");
        assert_eq!(json["counters"]["coalesced"], 5);
        assert_eq!(json["hit_rate"], 1.0);
        assert_eq!(json["rules"]["immutable_prefixes"][0], "/assets/");
    }
}
