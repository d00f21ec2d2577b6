//! Upstream-key proxy main application entry point.
//!
//! This module contains the HTTP server implementation and main application logic.
//! It provides:
//! - A multi-tenant reverse proxy surface for a single upstream LLM API provider
//! - Client-key authentication and per-minute rate limiting
//! - Adaptive upstream-key rotation with circuit-breaker protection
//! - Graceful shutdown handling
//! - CORS and tracing middleware
//!
//! The server is built using Axum framework for high-performance async HTTP handling.

// Module declarations - each module handles a specific domain of functionality
mod auth_gate;    // Client API key authentication middleware (C6)
mod breaker;      // Per-upstream-key circuit breaker (C3)
mod config;       // Configuration loading from environment variables
mod credentials;  // Client/upstream key CRUD and rate limiting (C2)
mod error;        // Application-wide error types and HTTP error envelope
mod proxy;        // Upstream request forwarding engine (C5)
mod rotation;      // Upstream key selection strategies (C4)
mod secrets;      // Upstream-key plaintext vault (AES-256-GCM at rest)
mod store;        // Durable state store abstraction over Redis (C1)
mod types;        // Type definitions and serialization structs

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::{middleware, Router};
use serde_json::{json, Value};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use auth_gate::require_client_key;
use breaker::CircuitBreakerRegistry;
use config::Config;
use credentials::CredentialRegistry;
use error::AppError;
use proxy::ProxyEngine;
use rotation::RotationEngine;
use secrets::VaultKey;
use store::StateStore;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Generates a UUID v4 per request and runs the rest of the stack inside a
/// tracing span carrying it, so every log line for this request — across
/// the auth gate, rotation, and proxy — shares one `request_id` field (the
/// event contract SPEC_FULL.md §6.2/§4.8 requires).
async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let span = info_span!("request", request_id = %request_id, method = %request.method(), path = %request.uri().path());
    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Application state container shared across all request handlers.
///
/// Cloned cheaply: every field is itself a cheap-to-clone handle
/// (`Arc`-backed or a `ConnectionManager` clone) onto shared state.
#[derive(Clone)]
struct AppState {
    credentials: CredentialRegistry,
    proxy: Arc<ProxyEngine>,
}

/// Health check endpoint for monitoring and load balancer probes. Outside
/// the proxy-prefix set and unauthenticated, per SPEC_FULL.md §4.7/§6.1.
///
/// Reports process liveness plus the cached C5 pool summary, so an
/// unhealthy backend or an exhausted upstream pool is visible to the
/// orchestrator instead of only surfacing on the next proxied request.
async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let summary = state.proxy.health_check().await;
    Json(json!({
        "status": if summary.store_reachable { "healthy" } else { "degraded" },
        "store_reachable": summary.store_reachable,
        "eligible_upstream_keys": summary.eligible_upstream_keys,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Catch-all handler for every proxied path. The Client Auth Gate
/// middleware has already validated the request and rate limit by the
/// time this runs; this handler owns only the forward-to-upstream step.
async fn proxy_handler(
    State(state): State<AppState>,
    method: Method,
    request: Request,
) -> Result<axum::response::Response, AppError> {
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(|q| q.to_string());
    let headers = request.headers().clone();

    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let body_bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| AppError::ProxyFailed(e.to_string()))?
        .to_vec();

    state
        .proxy
        .proxy_request(method, &path, query.as_deref(), headers, body_bytes, &client_ip)
        .await
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}

/// Create and configure the Axum router with all routes and middleware.
///
/// The middleware stack is applied in reverse order:
/// 1. CORS (outermost - handles preflight requests)
/// 2. Tracing (logs all requests and responses)
/// 3. Client auth gate (validates API key + rate limit)
/// 4. Route handlers (innermost - actual business logic)
fn create_router(state: AppState, allowed_origins: &[String]) -> Router {
    let cors = if allowed_origins.is_empty() {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let proxied = Router::new()
        .route("/*path", any(proxy_handler))
        .route_layer(middleware::from_fn_with_state(
            state.credentials.clone(),
            require_client_key,
        ))
        .with_state(state.clone());

    Router::new()
        .route("/healthz", get(health_check))
        .with_state(state.clone())
        .nest("/v1", proxied.clone())
        .nest("/openrouter", proxied)
        .fallback(not_found)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(request_id_middleware))
                .layer(cors),
        )
}

/// Application entry point.
///
/// Startup sequence:
/// 1. Initialize structured logging with tracing
/// 2. Load configuration from environment variables
/// 3. Connect the state store and construct the credential/rotation/proxy stack
/// 4. Build the HTTP router with middleware
/// 5. Start the server with graceful shutdown handling, spawning the
///    background maintenance sweep alongside it
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
        .init();

    let config = Config::from_env();

    info!("Starting upstream-key-proxy...");
    info!("Bind address: {}", config.bind_address);
    info!("Upstream base URL: {}", config.proxy.upstream_base_url);
    info!("Rotation strategy: {:?}", config.rotation_strategy);

    let store = StateStore::connect(&config.store.redis_url)
        .await
        .context("failed to connect to the state store")?;

    let vault_key = match &config.vault_key_base64 {
        Some(encoded) => VaultKey::from_base64(encoded).context("invalid VAULT_KEY_BASE64")?,
        None => {
            tracing::warn!(
                "VAULT_KEY_BASE64 not set; generating an ephemeral vault key. \
                 Every stored upstream key will need to be re-added after this process restarts. \
                 Set VAULT_KEY_BASE64 in any non-development environment."
            );
            VaultKey::generate_ephemeral()
        }
    };

    let credentials = CredentialRegistry::new(store, vault_key, config.registry.clone());

    let breakers = Arc::new(CircuitBreakerRegistry::new(
        config.breaker.failure_threshold,
        config.breaker.recovery_timeout_secs,
        config.breaker.max_half_open_probes,
    ));

    let rotation = RotationEngine::new(credentials.clone(), breakers, config.rotation_strategy);

    let proxy = Arc::new(
        ProxyEngine::new(config.proxy.clone(), credentials.clone(), rotation)
            .context("failed to build upstream HTTP client")?,
    );

    let state = AppState {
        credentials: credentials.clone(),
        proxy: proxy.clone(),
    };

    let maintenance_cancel = CancellationToken::new();
    let maintenance_handle = tokio::spawn(run_maintenance_loop(credentials, maintenance_cancel.clone()));

    let app = create_router(state, &config.allowed_origins);

    let addr: SocketAddr = config.bind_address.parse().context("invalid bind address")?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(maintenance_cancel))
        .await?;

    // The token is already cancelled by `shutdown_signal`; wait for the
    // current sweep (if any) to finish rather than aborting it mid-write.
    if let Err(e) = maintenance_handle.await {
        tracing::warn!("maintenance task panicked during shutdown: {e}");
    }

    Ok(())
}

/// Periodic maintenance sweep: every 5 minutes, recovers upstream keys past
/// their rate-limit deadline. Retries after 1 minute on store error rather
/// than waiting out the full interval, so a transient outage doesn't delay
/// recovery by up to 5 minutes on top of the outage itself.
///
/// Cancellable via `cancel`: the sleep is raced against cancellation so
/// shutdown never waits out a full 5-minute interval, but a sweep already in
/// flight always runs to completion before the loop exits.
async fn run_maintenance_loop(credentials: CredentialRegistry, cancel: CancellationToken) {
    loop {
        let sleep_secs = match credentials.recover_expired_rate_limits().await {
            Ok(recovered) => {
                if recovered > 0 {
                    info!("maintenance sweep recovered {} upstream key(s)", recovered);
                }
                300
            }
            Err(e) => {
                tracing::warn!("maintenance sweep failed, retrying in 60s: {}", e);
                60
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(sleep_secs)) => {}
            _ = cancel.cancelled() => {
                info!("maintenance sweep stopping for shutdown");
                return;
            }
        }
    }
}

/// Graceful shutdown signal handler.
///
/// Listens for system signals that indicate the server should shut down:
/// - SIGTERM: Sent by process managers (Docker, systemd, etc.)
/// - SIGINT: Sent by Ctrl+C from terminal
///
/// Cancels the background maintenance task's token so it stops alongside
/// the HTTP server instead of lingering until its next sleep elapses.
async fn shutdown_signal(maintenance_cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }

    maintenance_cancel.cancel();
}
