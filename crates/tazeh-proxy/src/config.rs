use serde::Deserialize;
use std::path::{Path, PathBuf};
use crate::fetcher::Upstream;
use tazeh_cache::{RoutingRules, Worker};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid url in `{field}`: {source}")]
    InvalidUrl {
        field: &'static str,
        source: url::ParseError,
    },

    #[error("cache.generation must not be empty")]
    EmptyGeneration,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Disk,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CacheConfig {
    /// Build identifier. Entries from any other generation are swept at startup.
    #[serde(default = "default_generation")]
    pub generation: String,
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_disk_path")]
    pub disk_path: PathBuf,
    #[serde(default)]
    pub max_entries: Option<usize>,
    #[serde(default)]
    pub max_bytes: Option<usize>,
    #[serde(default = "default_max_entry_bytes")]
    pub max_entry_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoutingConfig {
    /// Origin clients address the app by. Origin-form requests are keyed
    /// under it and sent to the upstream. Defaults to the upstream origin.
    #[serde(default)]
    pub app_origin: Option<String>,
    #[serde(default = "default_immutable_prefixes")]
    pub immutable_prefixes: Vec<String>,
    #[serde(default = "default_font_file_hosts")]
    pub font_file_hosts: Vec<String>,
    #[serde(default = "default_font_stylesheet_hosts")]
    pub font_stylesheet_hosts: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Config {
            server: ServerConfig::default(),
            upstream: UpstreamConfig {
                url: "http://127.0.0.1:3000".to_string(),
                timeout_ms: default_timeout_ms(),
            },
            cache: CacheConfig::default(),
            routing: RoutingConfig::default(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.generation.trim().is_empty() {
            return Err(ConfigError::EmptyGeneration);
        }
        self.upstream_url()?;
        self.routing_rules()?;
        Ok(())
    }

    pub fn upstream_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.upstream.url).map_err(|source| ConfigError::InvalidUrl {
            field: "upstream.url",
            source,
        })
    }

    pub fn routing_rules(&self) -> Result<RoutingRules, ConfigError> {
        let app_origin = match &self.routing.app_origin {
            Some(origin) => Url::parse(origin).map_err(|source| ConfigError::InvalidUrl {
                field: "routing.app_origin",
                source,
            })?,
            None => self.upstream_url()?,
        };

        Ok(RoutingRules {
            app_origin,
            immutable_prefixes: self.routing.immutable_prefixes.clone(),
            font_file_hosts: self.routing.font_file_hosts.clone(),
            font_stylesheet_hosts: self.routing.font_stylesheet_hosts.clone(),
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            generation: default_generation(),
            backend: default_backend(),
            disk_path: default_disk_path(),
            max_entries: None,
            max_bytes: None,
            max_entry_bytes: default_max_entry_bytes(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            app_origin: None,
            immutable_prefixes: default_immutable_prefixes(),
            font_file_hosts: default_font_file_hosts(),
            font_stylesheet_hosts: default_font_stylesheet_hosts(),
        }
    }
}

/// Compare old and new config, apply safe changes, reject unsafe ones.
///
/// - Routing rules changed: swapped on the live worker, app origin remapped
/// - Generation changed: WARN, ignored. A new generation needs a sweep, so restart
/// - Store backend or quota changed: WARN, ignored (restart required)
/// - Upstream changed: WARN, ignored (restart required)
pub fn diff_and_apply(old: &Config, new: &Config, worker: &Worker, upstream: &Upstream) {
    if old.cache.generation != new.cache.generation {
        tracing::warn!(
            old = %old.cache.generation,
            new = %new.cache.generation,
            "generation change detected, ignoring. Restart to sweep and switch generations"
        );
    }

    if old.cache.backend != new.cache.backend
        || old.cache.disk_path != new.cache.disk_path
        || old.cache.max_entries != new.cache.max_entries
        || old.cache.max_bytes != new.cache.max_bytes
        || old.cache.max_entry_bytes != new.cache.max_entry_bytes
    {
        tracing::warn!("cache store change detected, ignoring. Restart to apply");
    }

    if old.upstream != new.upstream {
        tracing::warn!(
            old = %old.upstream.url,
            new = %new.upstream.url,
            "upstream change detected, ignoring. Restart to apply"
        );
    }

    if old.routing != new.routing {
        match new.routing_rules() {
            Ok(rules) => {
                upstream.set_app_origin(rules.app_origin.clone());
                worker.update_rules(rules);
                tracing::info!("config reloaded: routing rules changed");
            }
            Err(e) => {
                tracing::error!(error = %e, "rejected routing change");
            }
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_generation() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}
fn default_disk_path() -> PathBuf {
    PathBuf::from("cache")
}
fn default_max_entry_bytes() -> usize {
    1_048_576
}
fn default_immutable_prefixes() -> Vec<String> {
    vec!["/assets/".to_string()]
}
fn default_font_file_hosts() -> Vec<String> {
    vec!["fonts.gstatic.com".to_string()]
}
fn default_font_stylesheet_hosts() -> Vec<String> {
    vec!["fonts.googleapis.com".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tazeh_cache::{
        Fetcher, Generation, MemoryStore, NetworkError, ResourceRequest, Response, WorkerBuilder,
    };

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::parse(
            r#"
            [upstream]
            url = "http://127.0.0.1:3000"
            "#,
        )
        .unwrap();

        assert_eq!(config.server, ServerConfig::default());
        assert_eq!(config.cache.backend, StoreBackend::Memory);
        assert_eq!(config.cache.max_entry_bytes, 1_048_576);

        let rules = config.routing_rules().unwrap();
        assert_eq!(rules.app_origin.as_str(), "http://127.0.0.1:3000/");
        assert_eq!(rules.immutable_prefixes, vec!["/assets/"]);
    }

    #[test]
    fn full_config() {
        let config = Config::parse(
            r#"
            [server]
            listen_addr = "127.0.0.1:8081"

            [upstream]
            url = "http://127.0.0.1:4000"
            timeout_ms = 250

            [cache]
            generation = "build-42"
            backend = "disk"
            disk_path = "/var/cache/tazeh"
            max_entries = 500

            [routing]
            app_origin = "https://app.example"
            immutable_prefixes = ["/assets/", "/_next/static/"]
            "#,
        )
        .unwrap();

        assert_eq!(config.upstream.timeout_ms, 250);
        assert_eq!(config.cache.generation, "build-42");
        assert_eq!(config.cache.backend, StoreBackend::Disk);
        assert_eq!(config.cache.disk_path, PathBuf::from("/var/cache/tazeh"));
        assert_eq!(config.cache.max_entries, Some(500));

        let rules = config.routing_rules().unwrap();
        assert_eq!(rules.app_origin.as_str(), "https://app.example/");
        assert_eq!(rules.immutable_prefixes.len(), 2);
        assert_eq!(rules.font_file_hosts, vec!["fonts.gstatic.com"]);
    }

    #[test]
    fn rejects_empty_generation() {
        let err = Config::parse(
            r#"
            [upstream]
            url = "http://127.0.0.1:3000"
            [cache]
            generation = "  "
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyGeneration));
    }

    #[test]
    fn rejects_bad_urls() {
        let err = Config::parse(
            r#"
            [upstream]
            url = "not a url"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { field: "upstream.url", .. }));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[upstream]\nurl = \"http://10.0.0.1:80\"\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.upstream.url, "http://10.0.0.1:80");

        assert!(matches!(
            Config::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    struct NoNetwork;

    #[async_trait::async_trait]
    impl Fetcher for NoNetwork {
        async fn fetch(&self, _request: &ResourceRequest) -> Result<Response, NetworkError> {
            Err(NetworkError::Transport("offline".into()))
        }
    }

    #[tokio::test]
    async fn routing_changes_apply_live_but_generation_does_not() {
        let old = Config::default_config();
        let (worker, _) = WorkerBuilder::new(
            Arc::new(MemoryStore::new()),
            Arc::new(NoNetwork),
            Generation::new(&old.cache.generation),
            old.routing_rules().unwrap(),
        )
        .activate()
        .await;

        let upstream = Upstream::new(
            old.upstream_url().unwrap(),
            old.routing_rules().unwrap().app_origin,
        );

        let mut new = old.clone();
        new.routing.immutable_prefixes.push("/static/".into());
        new.routing.app_origin = Some("https://app.example".into());
        new.cache.generation = "next-build".into();
        diff_and_apply(&old, &new, &worker, &upstream);

        assert!(worker
            .rules()
            .immutable_prefixes
            .contains(&"/static/".to_string()));
        assert_eq!(worker.rules().app_origin.as_str(), "https://app.example/");
        assert_eq!(upstream.app_origin().as_str(), "https://app.example/");
        assert_eq!(worker.generation().as_str(), old.cache.generation);
    }
}
