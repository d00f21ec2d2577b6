//! Type Definitions and Data Structures
//!
//! Shared record types for the two entities the Credential Registry owns
//! (`ClientKeyRecord`, `UpstreamKeyRecord`) plus the small set of permission
//! and wire types used at the HTTP boundary. Field-by-field shape follows
//! the persisted record layout; unknown fields on read are ignored so the
//! State Store can gain fields across deploys without a migration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The closed set of permissions a client key may be issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    ChatCompletions,
    ModelsList,
    Embeddings,
    ImagesGenerate,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ChatCompletions => "chat-completions",
            Permission::ModelsList => "models-list",
            Permission::Embeddings => "embeddings",
            Permission::ImagesGenerate => "images-generate",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "chat-completions" => Some(Permission::ChatCompletions),
            "models-list" => Some(Permission::ModelsList),
            "embeddings" => Some(Permission::Embeddings),
            "images-generate" => Some(Permission::ImagesGenerate),
            _ => None,
        }
    }
}

/// A client-issued API key, as persisted under `client-key:<fingerprint>`.
///
/// The plaintext secret itself is never part of this record — only its
/// SHA-256 fingerprint is, and that fingerprint is the record's own key in
/// the State Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientKeyRecord {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub permissions: Vec<Permission>,
    pub usage_count: u64,
    pub rate_limit: u32,
}

impl ClientKeyRecord {
    pub fn new(user_id: String, permissions: Vec<Permission>, rate_limit: u32) -> Self {
        Self {
            user_id,
            created_at: Utc::now(),
            last_used: None,
            is_active: true,
            permissions,
            usage_count: 0,
            rate_limit,
        }
    }
}

/// One credential for the upstream provider, as persisted under
/// `upstream-key:<fingerprint>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamKeyRecord {
    pub fingerprint: String,
    pub added_at: DateTime<Utc>,
    pub is_active: bool,
    pub is_healthy: bool,
    pub failure_count: u32,
    pub last_used: Option<DateTime<Utc>>,
    pub rate_limit_reset: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub last_error: Option<String>,
}

impl UpstreamKeyRecord {
    pub fn new(fingerprint: String) -> Self {
        Self {
            fingerprint,
            added_at: Utc::now(),
            is_active: true,
            is_healthy: true,
            failure_count: 0,
            last_used: None,
            rate_limit_reset: None,
            usage_count: 0,
            last_error: None,
        }
    }

    /// Whether the rate-limit-reset deadline is set and still in the future.
    pub fn is_rate_limited(&self) -> bool {
        match self.rate_limit_reset {
            Some(reset) => Utc::now() < reset,
            None => false,
        }
    }

    /// Eligible iff active ∧ healthy ∧ ¬rate-limited.
    pub fn is_eligible(&self) -> bool {
        self.is_active && self.is_healthy && !self.is_rate_limited()
    }

    pub fn should_disable(&self, disable_threshold: u32) -> bool {
        self.failure_count >= disable_threshold
    }
}

/// Read-only usage snapshot surfaced for diagnostics (C8) and the
/// out-of-scope admin surface; never mutated through this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyUsageStats {
    pub fingerprint: String,
    pub usage_count: u64,
    pub failure_count: u32,
    pub is_healthy: bool,
    pub last_used: Option<DateTime<Utc>>,
}

/// Result of a bulk upstream-key import, one entry error-isolated per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkImportResult {
    pub total: usize,
    pub ok: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub ok_fingerprints: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_round_trips_through_its_string_form() {
        for p in [
            Permission::ChatCompletions,
            Permission::ModelsList,
            Permission::Embeddings,
            Permission::ImagesGenerate,
        ] {
            assert_eq!(Permission::parse(p.as_str()), Some(p));
        }
        assert_eq!(Permission::parse("not-a-permission"), None);
    }

    #[test]
    fn upstream_key_eligibility_requires_all_three_conditions() {
        let mut key = UpstreamKeyRecord::new("f".repeat(64));
        assert!(key.is_eligible());

        key.is_healthy = false;
        assert!(!key.is_eligible());
        key.is_healthy = true;

        key.rate_limit_reset = Some(Utc::now() + chrono::Duration::hours(1));
        assert!(key.is_rate_limited());
        assert!(!key.is_eligible());

        key.rate_limit_reset = Some(Utc::now() - chrono::Duration::hours(1));
        assert!(!key.is_rate_limited());
        assert!(key.is_eligible());

        key.is_active = false;
        assert!(!key.is_eligible());
    }

    #[test]
    fn should_disable_respects_threshold() {
        let mut key = UpstreamKeyRecord::new("f".repeat(64));
        key.failure_count = 4;
        assert!(!key.should_disable(5));
        key.failure_count = 5;
        assert!(key.should_disable(5));
    }
}
