//! Client Auth Gate (C6)
//!
//! Axum middleware that authenticates every request under a proxied path:
//! extracts `X-Client-API-Key` (case-insensitive, since HTTP header names
//! already are), validates it against the Credential Registry, applies the
//! per-minute rate limit, and attaches the resolved identity to the request
//! so downstream handlers never touch the Credential Registry directly.
//!
//! Mirrors this system's existing client-auth middleware: same header name,
//! same missing/invalid/rate-limited error split, same `X-RateLimit-*`
//! response headers on success.

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;

use crate::credentials::CredentialRegistry;
use crate::error::AppError;
use crate::types::ClientKeyRecord;

const API_KEY_HEADER: &str = "x-client-api-key";

/// Identity resolved for an authenticated request, attached as a request
/// extension for downstream extraction.
#[derive(Clone)]
pub struct AuthenticatedClient {
    pub user_id: String,
    pub record: ClientKeyRecord,
}

pub async fn require_client_key(
    State(registry): State<CredentialRegistry>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let api_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::MissingApiKey)?
        .to_string();

    let record = registry
        .validate_client_key(&api_key)
        .await?
        .ok_or(AppError::InvalidApiKey)?;

    let (allowed, limit, remaining) = registry
        .check_client_rate_limit(&record.user_id, record.rate_limit)
        .await
        .unwrap_or((true, record.rate_limit, record.rate_limit));

    if !allowed {
        return Err(AppError::ClientRateLimited { limit, remaining });
    }

    let user_id = record.user_id.clone();
    request
        .extensions_mut()
        .insert(AuthenticatedClient { user_id, record });

    let mut response = next.run(request).await;

    if let Ok(limit_header) = HeaderValue::from_str(&limit.to_string()) {
        response.headers_mut().insert("x-ratelimit-limit", limit_header);
    }
    if let Ok(remaining_header) = HeaderValue::from_str(&remaining.to_string()) {
        response.headers_mut().insert("x-ratelimit-remaining", remaining_header);
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_header_name_is_lowercase_canonical() {
        // HTTP header lookups are case-insensitive; this constant is kept
        // lowercase purely for readability at the call site.
        assert_eq!(API_KEY_HEADER, "x-client-api-key");
    }
}
