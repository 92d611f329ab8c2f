mod config;
mod fetcher;
mod metrics;
mod proxy;

use axum::routing::{any, get};
use axum::Router;
use clap::Parser;
use config::{Config, StoreBackend};
use crate::metrics::{metrics_reporter, stats_handler};
use fetcher::{HyperFetcher, Upstream};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use proxy::{proxy_handler, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tazeh_cache::{CacheStore, DiskStore, Generation, MemoryStore, WorkerBuilder};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tazeh-proxy", about = "Caching proxy with per-request freshness policies")]
struct Args {
    /// Path to the TOML config file. Watched for routing changes.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let args = Args::parse();

    // Load config
    let config = if args.config.exists() {
        match Config::load(&args.config) {
            Ok(c) => {
                tracing::info!(path = %args.config.display(), "loaded config");
                c
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    path = %args.config.display(),
                    "failed to load config, using defaults"
                );
                Config::default_config()
            }
        }
    } else {
        tracing::info!(path = %args.config.display(), "no config found, using defaults");
        Config::default_config()
    };

    // Install Prometheus metrics recorder
    let prom_handle = match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()
    {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(error = %e, "failed to install prometheus recorder");
            return;
        }
    };

    // Both of these were checked by Config::load; default_config is valid too.
    let (upstream_url, rules) = match (config.upstream_url(), config.routing_rules()) {
        (Ok(url), Ok(rules)) => (url, rules),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "invalid config");
            return;
        }
    };

    if upstream_url.scheme() != "http" {
        tracing::warn!(upstream = %upstream_url, "only http:// upstreams are supported");
    }

    let store = build_store(&config).await;

    // Build HTTP client for upstream requests
    let timeout = Duration::from_millis(config.upstream.timeout_ms);
    let client = Client::builder(TokioExecutor::new()).build_http();
    let upstream = Arc::new(Upstream::new(upstream_url, rules.app_origin.clone()));
    let fetcher = Arc::new(HyperFetcher::new(
        client.clone(),
        Arc::clone(&upstream),
        timeout,
    ));

    // Sweep stale generations, then start the worker
    let (worker, report) = WorkerBuilder::new(
        store,
        fetcher,
        Generation::new(&config.cache.generation),
        rules,
    )
    .max_entry_bytes(Some(config.cache.max_entry_bytes))
    .activate()
    .await;

    tracing::info!(
        scanned = report.scanned,
        removed = report.removed,
        failed = report.failed,
        stale_generations = ?report.stale_generations,
        "startup sweep finished"
    );

    let state = Arc::new(AppState {
        worker,
        client,
        upstream,
        timeout,
    });

    // Shutdown token for graceful shutdown
    let shutdown = CancellationToken::new();

    // Start metrics reporter
    tokio::spawn(metrics_reporter(Arc::clone(&state), shutdown.clone()));

    // Build admin router (separate port)
    let admin_router = Router::new()
        .route("/api/stats", get(stats_handler))
        .route(
            "/metrics",
            get(move || {
                let h = prom_handle.clone();
                async move { h.render() }
            }),
        )
        .with_state(Arc::clone(&state));

    // Build proxy router (main port)
    let proxy_router = Router::new()
        .route("/{*path}", any(proxy_handler))
        .route("/", any(proxy_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    // Start both servers
    let proxy_addr = config.server.listen_addr.clone();
    let metrics_addr = config.server.metrics_addr.clone();

    tracing::info!(
        proxy = %proxy_addr,
        metrics = %metrics_addr,
        upstream = %config.upstream.url,
        generation = %config.cache.generation,
        backend = ?config.cache.backend,
        "tazeh proxy starting"
    );

    let proxy_listener = match tokio::net::TcpListener::bind(&proxy_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %proxy_addr, "failed to bind proxy");
            return;
        }
    };
    let metrics_listener = match tokio::net::TcpListener::bind(&metrics_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %metrics_addr, "failed to bind metrics");
            return;
        }
    };

    // Spawn config file watcher
    spawn_config_watcher(args.config, config, Arc::clone(&state));

    // Spawn shutdown signal handler
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    // Run both servers with graceful shutdown
    let proxy_future = axum::serve(proxy_listener, proxy_router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let metrics_future = axum::serve(metrics_listener, admin_router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tokio::select! {
        result = proxy_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "proxy server error");
            }
        }
        result = metrics_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        }
    }

    shutdown.cancel();
    tracing::info!("tazeh proxy shut down");
}

/// Open the configured store. A disk store that cannot be opened falls back
/// to memory so the proxy still serves, just without persistence.
async fn build_store(config: &Config) -> Arc<dyn CacheStore> {
    let memory = || {
        Arc::new(MemoryStore::with_quota(
            config.cache.max_entries,
            config.cache.max_bytes,
        )) as Arc<dyn CacheStore>
    };

    match config.cache.backend {
        StoreBackend::Memory => memory(),
        StoreBackend::Disk => match DiskStore::open(config.cache.disk_path.clone()).await {
            Ok(store) => {
                tracing::info!(path = %store.root().display(), "disk store opened");
                Arc::new(store)
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    path = %config.cache.disk_path.display(),
                    "failed to open disk store, falling back to memory"
                );
                memory()
            }
        },
    }
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "no SIGTERM handler, waiting for ctrl-c only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections...");
    token.cancel();
}

/// Watch the config file and apply safe changes at runtime.
fn spawn_config_watcher(config_path: PathBuf, initial_config: Config, state: Arc<AppState>) {
    let current_config = Arc::new(Mutex::new(initial_config));

    let watched_path = config_path.clone();
    let mut watcher = match notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                match Config::load(&watched_path) {
                    Ok(new_config) => {
                        let mut old = current_config.lock();
                        config::diff_and_apply(&old, &new_config, &state.worker, &state.upstream);
                        *old = new_config;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to reload config");
                    }
                }
            }
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to start config watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, path = %config_path.display(), "failed to watch config");
        return;
    }

    // Lives for the process lifetime.
    std::mem::forget(watcher);
    tracing::info!(path = %config_path.display(), "config file watcher started");
}
