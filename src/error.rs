//! Error types for the dataplane, and their mapping onto the HTTP error
//! envelope every component boundary ultimately surfaces to the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Top-level error type returned by handlers. Each variant corresponds to
/// one of the error kinds in the dataplane's error-handling design.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("missing API key")]
    MissingApiKey,

    #[error("invalid API key")]
    InvalidApiKey,

    #[error("rate limit exceeded")]
    ClientRateLimited { limit: u32, remaining: u32 },

    #[error("no healthy upstream key available")]
    NoUpstreamAvailable,

    #[error("proxy failed after exhausting retries: {0}")]
    ProxyFailed(String),

    #[error("fingerprint collision")]
    Conflict,

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),
}

/// Errors from the State Store (C1). Any of these must be treated by
/// callers as "the operation did not happen" — never partially applied.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record missing required field: {0}")]
    MissingField(&'static str),

    #[error("record field malformed: {0}")]
    MalformedField(&'static str),
}

/// Errors from the upstream-key plaintext vault (§11 open question resolution).
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault key must be exactly 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed: wrong key or corrupted ciphertext")]
    DecryptFailed,

    #[error("ciphertext too short to contain a nonce")]
    CiphertextTooShort,

    #[error("no plaintext stored for fingerprint")]
    NotFound,

    #[error("stored plaintext was not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    kind: &'static str,
    message: String,
    code: u16,
}

impl AppError {
    fn kind(&self) -> &'static str {
        match self {
            AppError::MissingApiKey => "missing-api-key",
            AppError::InvalidApiKey => "invalid-api-key",
            AppError::ClientRateLimited { .. } => "rate-limit-exceeded",
            AppError::NoUpstreamAvailable => "no-upstream-available",
            AppError::ProxyFailed(_) => "proxy-failed",
            AppError::Conflict => "conflict",
            AppError::Store(_) => "state-store-unavailable",
            AppError::Vault(_) => "internal-error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::MissingApiKey | AppError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            AppError::ClientRateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::NoUpstreamAvailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ProxyFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::Conflict => StatusCode::CONFLICT,
            AppError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Vault(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        // Internal details never reach the client; log them, emit a generic message.
        tracing::warn!(error = %self, kind, status = status.as_u16(), "request failed");

        let mut response = Json(ErrorBody {
            error: ErrorDetail {
                kind,
                message: client_facing_message(&self),
                code: status.as_u16(),
            },
        })
        .into_response();
        *response.status_mut() = status;

        if let AppError::ClientRateLimited { limit, remaining } = &self {
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", (*limit).into());
            headers.insert("X-RateLimit-Remaining", (*remaining).into());
        }

        response
    }
}

fn client_facing_message(err: &AppError) -> String {
    match err {
        AppError::MissingApiKey => "missing X-Client-API-Key header".to_string(),
        AppError::InvalidApiKey => "invalid or inactive API key".to_string(),
        AppError::ClientRateLimited { .. } => "rate limit exceeded".to_string(),
        AppError::NoUpstreamAvailable => "no healthy upstream key available".to_string(),
        AppError::ProxyFailed(_) => "upstream request failed".to_string(),
        AppError::Conflict => "resource already exists".to_string(),
        AppError::Store(_) => "temporarily unavailable".to_string(),
        AppError::Vault(_) => "internal error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_expected_status_codes() {
        assert_eq!(AppError::MissingApiKey.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::InvalidApiKey.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AppError::ClientRateLimited { limit: 60, remaining: 0 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::NoUpstreamAvailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::ProxyFailed("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn client_facing_message_never_echoes_internal_detail() {
        let err = AppError::ProxyFailed("connect refused by 10.0.0.1:443".to_string());
        let msg = client_facing_message(&err);
        assert!(!msg.contains("10.0.0.1"));
    }
}
