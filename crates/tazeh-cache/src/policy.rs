//! Request classification into freshness policies.

use crate::entry::ResourceRequest;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::{Origin, Url};

/// Caching strategy applied to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// Serve from cache if present; only hit the network on a miss.
    CacheFirst,
    /// Serve the cached value immediately and refresh it in the background.
    StaleWhileRevalidate,
    /// No cache interaction at all.
    NetworkOnly,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheFirst => "cache-first",
            Self::StaleWhileRevalidate => "stale-while-revalidate",
            Self::NetworkOnly => "network-only",
        }
    }

    /// Whether this policy reads or writes the store.
    pub fn uses_cache(&self) -> bool {
        !matches!(self, Self::NetworkOnly)
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which classification rule produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchedRule {
    NonGetMethod,
    ImmutableAsset,
    FontFile,
    FontStylesheet,
    Unclassified,
}

impl MatchedRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NonGetMethod => "non-get",
            Self::ImmutableAsset => "immutable-asset",
            Self::FontFile => "font-file",
            Self::FontStylesheet => "font-stylesheet",
            Self::Unclassified => "unclassified",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyDecision {
    pub policy: Policy,
    pub rule: MatchedRule,
}

impl PolicyDecision {
    fn new(policy: Policy, rule: MatchedRule) -> Self {
        Self { policy, rule }
    }
}

/// Static routing rules the selector evaluates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRules {
    /// Origin of the application itself. Only its scheme, host and port matter.
    pub app_origin: Url,
    /// Path prefixes of content-hashed build output.
    #[serde(default = "default_immutable_prefixes")]
    pub immutable_prefixes: Vec<String>,
    /// Hosts serving static font files.
    #[serde(default = "default_font_file_hosts")]
    pub font_file_hosts: Vec<String>,
    /// Hosts serving font stylesheets, which reference other assets.
    #[serde(default = "default_font_stylesheet_hosts")]
    pub font_stylesheet_hosts: Vec<String>,
}

impl RoutingRules {
    /// Default rules for an application served from `app_origin`.
    pub fn for_origin(app_origin: Url) -> Self {
        Self {
            app_origin,
            immutable_prefixes: default_immutable_prefixes(),
            font_file_hosts: default_font_file_hosts(),
            font_stylesheet_hosts: default_font_stylesheet_hosts(),
        }
    }
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

/// Total, stateless classifier. First matching rule wins:
///
/// 1. non-GET method: network-only
/// 2. same-origin path under an immutable prefix: cache-first
/// 3. cross-origin font file host: cache-first
/// 4. cross-origin font stylesheet host: stale-while-revalidate
/// 5. anything else: network-only
#[derive(Debug, Clone)]
pub struct PolicySelector {
    rules: RoutingRules,
    origin: Origin,
}

impl PolicySelector {
    pub fn new(rules: RoutingRules) -> Self {
        let origin = rules.app_origin.origin();
        Self { rules, origin }
    }

    pub fn rules(&self) -> &RoutingRules {
        &self.rules
    }

    pub fn classify(&self, request: &ResourceRequest) -> PolicyDecision {
        if !request.is_get() {
            return PolicyDecision::new(Policy::NetworkOnly, MatchedRule::NonGetMethod);
        }

        let same_origin = request.url.origin() == self.origin;

        if same_origin {
            let path = request.url.path();
            if self
                .rules
                .immutable_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
            {
                return PolicyDecision::new(Policy::CacheFirst, MatchedRule::ImmutableAsset);
            }
        } else if let Some(host) = request.url.host_str() {
            if host_listed(&self.rules.font_file_hosts, host) {
                return PolicyDecision::new(Policy::CacheFirst, MatchedRule::FontFile);
            }
            if host_listed(&self.rules.font_stylesheet_hosts, host) {
                return PolicyDecision::new(
                    Policy::StaleWhileRevalidate,
                    MatchedRule::FontStylesheet,
                );
            }
        }

        PolicyDecision::new(Policy::NetworkOnly, MatchedRule::Unclassified)
    }
}

fn host_listed(hosts: &[String], host: &str) -> bool {
    hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
}
