use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use std::sync::Arc;
use std::time::Duration;
use tazeh_cache::{Fetcher, NetworkError, ResourceRequest, Response};
use url::Url;

/// Plain-HTTP client. There is no TLS connector, so `https://` targets
/// fail with [`NetworkError::Transport`] and cross-origin font hosts are
/// only reachable over `http://`.
pub type HttpClient = Client<hyper_util::client::legacy::connect::HttpConnector, Body>;

/// Maps request identities onto the upstream that actually serves them.
///
/// Requests are keyed and classified under the app origin clients see.
/// Only when a request leaves the proxy is the app origin swapped for the
/// upstream; cross-origin requests go out unchanged.
pub struct Upstream {
    url: Url,
    app_origin: ArcSwap<Url>,
}

impl Upstream {
    pub fn new(url: Url, app_origin: Url) -> Self {
        Self {
            url,
            app_origin: ArcSwap::from_pointee(app_origin),
        }
    }

    pub fn app_origin(&self) -> Arc<Url> {
        self.app_origin.load_full()
    }

    pub fn set_app_origin(&self, app_origin: Url) {
        self.app_origin.store(Arc::new(app_origin));
    }

    /// Where a request for `url` is sent.
    pub fn target(&self, url: &Url) -> Url {
        if url.origin() != self.app_origin.load().origin() {
            return url.clone();
        }
        let mut target = self.url.clone();
        let base = self.url.path().trim_end_matches('/');
        target.set_path(&format!("{base}{}", url.path()));
        target.set_query(url.query());
        target
    }
}

/// Network side of the worker: upstream fetches over the shared hyper client.
pub struct HyperFetcher {
    client: HttpClient,
    upstream: Arc<Upstream>,
    timeout: Duration,
}

impl HyperFetcher {
    pub fn new(client: HttpClient, upstream: Arc<Upstream>, timeout: Duration) -> Self {
        Self {
            client,
            upstream,
            timeout,
        }
    }

    async fn fetch_inner(&self, request: &ResourceRequest) -> Result<Response, NetworkError> {
        let target = self.upstream.target(&request.url);
        if target.scheme() != "http" {
            return Err(NetworkError::Transport(format!(
                "unsupported scheme `{}` for {target}",
                target.scheme()
            )));
        }

        let method =
            Method::from_bytes(request.method.as_bytes()).map_err(NetworkError::transport)?;
        let upstream_req = Request::builder()
            .method(method)
            .uri(target.as_str())
            .body(Body::empty())
            .map_err(NetworkError::transport)?;

        let upstream_resp = self
            .client
            .request(upstream_req)
            .await
            .map_err(NetworkError::transport)?;

        let status = upstream_resp.status().as_u16();
        let headers = replayable_headers(upstream_resp.headers());
        let body = upstream_resp
            .into_body()
            .collect()
            .await
            .map_err(NetworkError::transport)?
            .to_bytes();

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Fetcher for HyperFetcher {
    async fn fetch(&self, request: &ResourceRequest) -> Result<Response, NetworkError> {
        match tokio::time::timeout(self.timeout, self.fetch_inner(request)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout(self.timeout)),
        }
    }
}

/// Hop-by-hop headers never travel with a stored or forwarded response.
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "transfer-encoding" | "connection" | "keep-alive" | "upgrade" | "te" | "trailer"
    )
}

fn replayable_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(k, _)| !is_hop_by_hop(k.as_str()))
        .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
        .collect()
}
