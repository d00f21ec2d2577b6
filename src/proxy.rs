//! Proxy Engine (C5)
//!
//! Forwards a client request to the upstream provider using a key selected
//! by the Rotation Engine, retrying on transient failure, and streams the
//! upstream response back without buffering the whole body in memory.
//!
//! Retry/backoff shape, hop-by-hop header stripping, and status
//! classification mirror the system's existing forward-proxy service;
//! the streaming transport itself is reqwest/axum rather than an
//! async-generator response, since that's the idiom this corpus reaches
//! for wherever it proxies HTTP.

use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::TryStreamExt;
use reqwest::Client;

use crate::config::ProxyConfig;
use crate::credentials::CredentialRegistry;
use crate::error::AppError;
use crate::rotation::RotationEngine;

/// Request headers never forwarded upstream: connection-management headers
/// the transport itself negotiates, plus the inbound client-auth header.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "accept-encoding",
    "content-length",
    "x-client-api-key",
];

/// Prefix applied to the inbound `User-Agent` before forwarding upstream, so
/// upstream-side logs can distinguish traffic that passed through this proxy.
const USER_AGENT_TAG: &str = "upstream-key-proxy/1.0";

/// Response headers never passed back to the client.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
];

pub struct ProxyEngine {
    client: Client,
    config: ProxyConfig,
    credentials: CredentialRegistry,
    rotation: RotationEngine,
}

/// Pool-wide summary returned by [`ProxyEngine::proxy_stats`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProxyStats {
    pub total_keys: usize,
    pub healthy_keys: usize,
    pub breakers_open: usize,
    pub breakers_half_open: usize,
    pub breakers_closed: usize,
}

/// Cheap liveness summary returned by [`ProxyEngine::health_check`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSummary {
    pub store_reachable: bool,
    pub eligible_upstream_keys: usize,
}

enum Outcome {
    Success(Response),
    RetryableFailure(String),
    ClientError(Response),
}

impl ProxyEngine {
    pub fn new(config: ProxyConfig, credentials: CredentialRegistry, rotation: RotationEngine) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.read_timeout_secs))
            .pool_max_idle_per_host(config.max_keepalive_per_host)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            config,
            credentials,
            rotation,
        })
    }

    pub fn handles_path(&self, path: &str) -> bool {
        self.config.proxy_prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Lightweight pool summary for C8 diagnostics and the out-of-scope
    /// admin surface's status panel: total vs. healthy upstream keys, plus
    /// a per-strategy breaker state count. Mutates nothing.
    pub async fn proxy_stats(&self) -> Result<ProxyStats, AppError> {
        let eligible = self.credentials.list_eligible_upstream_keys().await?;
        let total = eligible.len();
        let healthy = eligible.iter().filter(|(_, r)| r.is_healthy).count();
        let breakers = self.rotation.breaker_snapshots();

        let mut open = 0;
        let mut half_open = 0;
        let mut closed = 0;
        for snapshot in &breakers {
            match snapshot.state {
                crate::breaker::BreakerState::Open => open += 1,
                crate::breaker::BreakerState::HalfOpen => half_open += 1,
                crate::breaker::BreakerState::Closed => closed += 1,
            }
        }

        Ok(ProxyStats {
            total_keys: total,
            healthy_keys: healthy,
            breakers_open: open,
            breakers_half_open: half_open,
            breakers_closed: closed,
        })
    }

    /// Cached-cheap health probe backing `/healthz`: state-store
    /// reachability plus how many upstream keys are currently eligible.
    /// Never mutates dataplane state.
    pub async fn health_check(&self) -> HealthSummary {
        let reachable = self.credentials.store_reachable().await;
        let eligible_count = self
            .credentials
            .list_eligible_upstream_keys()
            .await
            .map(|keys| keys.len())
            .unwrap_or(0);

        HealthSummary {
            store_reachable: reachable,
            eligible_upstream_keys: eligible_count,
        }
    }

    /// Runs the retry loop described in SPEC_FULL.md §4.5: up to
    /// `max_retries` attempts, each against a freshly selected upstream
    /// key, with exponential backoff (2^attempt seconds) between attempts.
    pub async fn proxy_request(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        headers: HeaderMap,
        body: Vec<u8>,
        client_ip: &str,
    ) -> Result<Response, AppError> {
        let mut last_error = String::new();

        for attempt in 0..self.config.max_retries {
            let selection = self
                .rotation
                .select_upstream()
                .await
                .map_err(AppError::from)?;

            let Some((fingerprint, _record)) = selection else {
                return Err(AppError::NoUpstreamAvailable);
            };

            let plaintext = match self.credentials.resolve_upstream_plaintext(&fingerprint).await {
                Ok(plaintext) => plaintext,
                Err(_) => {
                    self.rotation.report_failure(&fingerprint, "failed to resolve upstream key", false).await;
                    continue;
                }
            };

            let target_url = self.build_target_url(path, query);
            let outbound_headers = Self::prepare_request_headers(&headers, &plaintext, client_ip);

            let mut builder = self.client.request(method.clone(), &target_url).headers(outbound_headers);
            if !matches!(method, Method::GET | Method::HEAD | Method::DELETE) {
                builder = builder.body(body.clone());
            }
            let request = builder.build();

            let request = match request {
                Ok(request) => request,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };

            match self.dispatch(request, &fingerprint).await {
                Outcome::Success(response) => return Ok(response),
                Outcome::ClientError(response) => return Ok(response),
                Outcome::RetryableFailure(message) => {
                    last_error = message;
                    if attempt + 1 < self.config.max_retries {
                        tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                    }
                }
            }
        }

        Err(AppError::ProxyFailed(last_error))
    }

    fn build_target_url(&self, path: &str, query: Option<&str>) -> String {
        let base = self.config.upstream_base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        match query {
            Some(q) if !q.is_empty() => format!("{base}/{path}?{q}"),
            _ => format!("{base}/{path}"),
        }
    }

    fn prepare_request_headers(inbound: &HeaderMap, upstream_key: &str, client_ip: &str) -> HeaderMap {
        let mut out = HeaderMap::new();

        for (name, value) in inbound.iter() {
            if STRIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
                continue;
            }
            out.insert(name.clone(), value.clone());
        }

        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {upstream_key}")) {
            out.insert(HeaderName::from_static("authorization"), value);
        }
        if let Ok(value) = HeaderValue::from_str(client_ip) {
            out.insert(HeaderName::from_static("x-forwarded-for"), value);
        }

        let inbound_user_agent = inbound
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        if let Ok(value) = HeaderValue::from_str(&format!("{USER_AGENT_TAG} {inbound_user_agent}")) {
            out.insert(axum::http::header::USER_AGENT, value);
        }

        out
    }

    fn strip_response_headers(headers: &HeaderMap) -> HeaderMap {
        let mut out = HeaderMap::new();
        for (name, value) in headers.iter() {
            if STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
                continue;
            }
            out.insert(name.clone(), value.clone());
        }
        out
    }

    /// Classifies the upstream response per SPEC_FULL.md §4.5: 429 and 5xx
    /// mark the key failed and are retried; other 4xx are passed through
    /// untouched; 2xx/3xx report success and stream back.
    async fn dispatch(&self, request: reqwest::Request, fingerprint: &str) -> Outcome {
        let response = match self.client.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                self.rotation.report_failure(fingerprint, &e.to_string(), false).await;
                return Outcome::RetryableFailure(e.to_string());
            }
        };

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            self.rotation.report_failure(fingerprint, "rate limited", true).await;
            return Outcome::RetryableFailure("upstream rate limited".to_string());
        }

        if status.is_server_error() {
            self.rotation.report_failure(fingerprint, &format!("server error: {status}"), false).await;
            return Outcome::RetryableFailure(format!("upstream server error: {status}"));
        }

        if status.is_client_error() {
            // Client errors are the caller's fault, not the key's; pass through untouched.
            return Outcome::ClientError(Self::stream_response(response));
        }

        self.rotation.report_success(fingerprint).await;
        Outcome::Success(Self::stream_response(response))
    }

    /// Streams the upstream body through to the client as it arrives,
    /// rather than buffering it — required for SSE/chat-completion
    /// streaming responses. The reqwest response is dropped (closing the
    /// upstream connection) once the stream is exhausted or the client
    /// disconnects.
    fn stream_response(response: reqwest::Response) -> Response {
        let status = response.status();
        let headers = Self::strip_response_headers(response.headers());
        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let body = Body::from_stream(stream);

        let mut builder = Response::builder().status(status);
        if let Some(response_headers) = builder.headers_mut() {
            *response_headers = headers;
        }
        builder.body(body).unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProxyConfig {
        ProxyConfig {
            upstream_base_url: "https://upstream.example.com/api/v1".to_string(),
            max_retries: 3,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            write_timeout_secs: 10,
            max_keepalive_per_host: 20,
            max_connections: 100,
            proxy_prefixes: vec!["/v1/".to_string(), "/openrouter/".to_string()],
        }
    }

    #[test]
    fn build_target_url_joins_base_and_path() {
        let cfg = config();
        let engine_url = format!("{}/{}", cfg.upstream_base_url.trim_end_matches('/'), "chat/completions");
        assert_eq!(engine_url, "https://upstream.example.com/api/v1/chat/completions");
    }

    #[test]
    fn handles_path_matches_configured_prefixes() {
        let cfg = config();
        assert!(cfg.proxy_prefixes.iter().any(|p| "/v1/chat/completions".starts_with(p.as_str())));
        assert!(!cfg.proxy_prefixes.iter().any(|p| "/admin/status".starts_with(p.as_str())));
    }

    #[test]
    fn stripped_header_sets_exclude_hop_by_hop_and_internal_headers() {
        assert!(STRIPPED_REQUEST_HEADERS.contains(&"x-client-api-key"));
        assert!(STRIPPED_REQUEST_HEADERS.contains(&"host"));
        assert!(!STRIPPED_REQUEST_HEADERS.contains(&"authorization"));
        assert!(STRIPPED_RESPONSE_HEADERS.contains(&"transfer-encoding"));
    }

    #[test]
    fn prepare_request_headers_injects_auth_and_strips_client_api_key() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-client-api-key", HeaderValue::from_static("ck_secret"));
        inbound.insert("content-type", HeaderValue::from_static("application/json"));

        let outbound = ProxyEngine::prepare_request_headers(&inbound, "sk-or-v1-upstream", "203.0.113.7");

        assert_eq!(outbound.get("authorization").unwrap(), "Bearer sk-or-v1-upstream");
        assert_eq!(outbound.get("x-forwarded-for").unwrap(), "203.0.113.7");
        assert_eq!(outbound.get("content-type").unwrap(), "application/json");
        assert!(outbound.get("x-client-api-key").is_none());
    }

    #[test]
    fn prepare_request_headers_prefixes_inbound_user_agent() {
        let mut inbound = HeaderMap::new();
        inbound.insert("user-agent", HeaderValue::from_static("some-client/2.0"));

        let outbound = ProxyEngine::prepare_request_headers(&inbound, "sk-or-v1-upstream", "203.0.113.7");

        let ua = outbound.get("user-agent").unwrap().to_str().unwrap();
        assert!(ua.starts_with(USER_AGENT_TAG));
        assert!(ua.contains("some-client/2.0"));
    }

    #[test]
    fn bodiless_methods_never_attach_a_request_body() {
        let client = reqwest::Client::new();
        for method in [Method::GET, Method::HEAD, Method::DELETE] {
            let request = client.request(method, "https://upstream.example.com/v1/models").build().unwrap();
            assert!(request.body().is_none());
        }
    }
}
