use crate::fetcher::{is_hop_by_hop, HttpClient, Upstream};
use axum::body::Body;
use axum::extract::State;
use axum::http::request::Parts;
use axum::http::{HeaderValue, Request, Response, StatusCode, Uri};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tazeh_cache::{Interception, NetworkError, Policy, ResourceRequest, Served, Worker};
use url::Url;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub worker: Worker,
    pub client: HttpClient,
    pub upstream: Arc<Upstream>,
    pub timeout: Duration,
}

/// Main proxy handler. Every request goes through the worker's interception
/// hook; requests it does not handle are forwarded untouched.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response<Body> {
    let start = Instant::now();
    let (parts, body) = req.into_parts();

    let resource = match resource_request(&state.upstream.app_origin(), &parts) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, uri = %parts.uri, "unroutable request");
            return plain(StatusCode::BAD_REQUEST, "Bad Request");
        }
    };

    let (response, cache_status, policy) = match state.worker.intercept(&resource).await {
        Interception::Respond(Ok(served)) => {
            let status = hit_label(&served);
            let policy = served.policy.as_str();
            (replay(served), status, policy)
        }
        Interception::Respond(Err(e)) => {
            tracing::error!(error = %e, request = %resource, "upstream request failed");
            let policy = state.worker.classify(&resource).policy.as_str();
            (network_failure(&e), "MISS", policy)
        }
        Interception::PassThrough(_) => (
            forward(&state, &resource, parts, body).await,
            "PASS",
            Policy::NetworkOnly.as_str(),
        ),
    };

    let elapsed = start.elapsed();
    metrics::counter!("tazeh_proxy_requests_total", "cache" => cache_status, "policy" => policy)
        .increment(1);
    metrics::histogram!("tazeh_proxy_request_duration_seconds", "cache" => cache_status)
        .record(elapsed.as_secs_f64());
    tracing::debug!(
        request = %resource,
        status = response.status().as_u16(),
        cache = cache_status,
        policy,
        latency_us = elapsed.as_micros() as u64,
        "request served"
    );

    with_cache_headers(response, cache_status, policy)
}

/// Absolute-form request URIs are used as-is; origin-form ones are resolved
/// against the app origin, so keys and classification use the app's identity.
pub fn resource_request(
    app_origin: &Url,
    parts: &Parts,
) -> Result<ResourceRequest, url::ParseError> {
    let url = absolute_url(app_origin, &parts.uri)?;
    Ok(ResourceRequest::new(parts.method.as_str(), url))
}

fn absolute_url(app_origin: &Url, uri: &Uri) -> Result<Url, url::ParseError> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Url::parse(&uri.to_string());
    }
    Url::parse(&format!(
        "{}{}",
        app_origin.origin().ascii_serialization(),
        uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    ))
}

fn hit_label(served: &Served) -> &'static str {
    if served.is_hit() {
        "HIT"
    } else {
        "MISS"
    }
}

/// Build an HTTP response from a served payload.
fn replay(served: Served) -> Response<Body> {
    let mut response = Response::builder().status(served.response.status);

    for (key, value) in &served.response.headers {
        if let Ok(v) = HeaderValue::from_str(value) {
            response = response.header(key.as_str(), v);
        }
    }

    response
        .body(Body::from(served.response.body))
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to build response from payload");
            plain(StatusCode::BAD_GATEWAY, "Bad Gateway")
        })
}

/// Forward a request the worker did not handle, streaming both bodies.
async fn forward(
    state: &AppState,
    resource: &ResourceRequest,
    parts: Parts,
    body: Body,
) -> Response<Body> {
    let target = state.upstream.target(&resource.url);
    let mut upstream_req = Request::builder()
        .method(parts.method)
        .uri(target.as_str());
    for (key, value) in parts.headers.iter() {
        if key == "host" || is_hop_by_hop(key.as_str()) {
            continue;
        }
        upstream_req = upstream_req.header(key, value);
    }

    let upstream_req = match upstream_req.body(body) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "failed to build upstream request");
            return plain(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
    };

    let upstream_resp =
        match tokio::time::timeout(state.timeout, state.client.request(upstream_req)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                tracing::error!(error = %e, request = %resource, "upstream request failed");
                return plain(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
            Err(_) => {
                tracing::error!(
                    request = %resource,
                    timeout_ms = state.timeout.as_millis() as u64,
                    "upstream request timed out"
                );
                return plain(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout");
            }
        };

    let (resp_parts, resp_body) = upstream_resp.into_parts();
    let mut response = Response::builder().status(resp_parts.status);
    for (key, value) in resp_parts.headers.iter() {
        if is_hop_by_hop(key.as_str()) {
            continue;
        }
        response = response.header(key, value);
    }

    response
        .body(Body::new(resp_body))
        .unwrap_or_else(|_| plain(StatusCode::BAD_GATEWAY, "Bad Gateway"))
}

fn network_failure(e: &NetworkError) -> Response<Body> {
    match e {
        NetworkError::Timeout(_) => plain(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout"),
        _ => plain(StatusCode::BAD_GATEWAY, "Bad Gateway"),
    }
}

fn with_cache_headers(
    mut response: Response<Body>,
    cache_status: &'static str,
    policy: &'static str,
) -> Response<Body> {
    let headers = response.headers_mut();
    headers.insert("x-cache", HeaderValue::from_static(cache_status));
    headers.insert("x-cache-policy", HeaderValue::from_static(policy));
    response
}

fn plain(status: StatusCode, msg: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(msg));
    *response.status_mut() = status;
    response
}
