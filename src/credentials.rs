//! Credential Registry (C2)
//!
//! Client-key and upstream-key CRUD, fingerprint-based hashing, bulk
//! import, and rate-limit/usage accounting. Owns these State Store
//! namespaces exclusively: `client-key`, `upstream-key`, `user-index:*`,
//! and `upstream-active`.
//!
//! Ground truth for the operation set and field semantics is the source
//! system's key manager; the rewrite replaces its stringified-hash records
//! with the schema'd [`ClientKeyRecord`]/[`UpstreamKeyRecord`] types and
//! drives every mutation through the State Store's typed contract instead
//! of ad hoc field writes.

use chrono::{DateTime, Utc};
use rand::RngCore;

use crate::config::RegistryConfig;
use crate::error::StoreError;
use crate::secrets::{self, VaultKey};
use crate::store::StateStore;
use crate::types::{BulkImportResult, ClientKeyRecord, KeyUsageStats, Permission, UpstreamKeyRecord};

const CLIENT_KEY_NS: &str = "client-key";
const UPSTREAM_KEY_NS: &str = "upstream-key";
const UPSTREAM_ACTIVE_SET: &str = "upstream-active";
const MAX_BULK_IMPORT: usize = 100;

fn user_index_set(user_id: &str) -> String {
    format!("user-index:{user_id}")
}

/// Generates a URL-safe opaque secret with at least 24 bytes of entropy,
/// matching the teacher's `ak_<uuid>`-style generated-credential idiom but
/// sized to the spec's entropy floor rather than a fixed UUID.
fn generate_plaintext_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("ck_{}", base64_url(&bytes))
}

fn base64_url(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Clone)]
pub struct CredentialRegistry {
    store: StateStore,
    vault_key: std::sync::Arc<VaultKey>,
    config: RegistryConfig,
}

impl CredentialRegistry {
    pub fn new(store: StateStore, vault_key: VaultKey, config: RegistryConfig) -> Self {
        Self {
            store,
            vault_key: std::sync::Arc::new(vault_key),
            config,
        }
    }

    /// Cheap liveness probe surfaced through `/healthz` (C8).
    pub async fn store_reachable(&self) -> bool {
        self.store.ping().await.is_ok()
    }

    // ---------------------------------------------------------------
    // Client keys
    // ---------------------------------------------------------------

    /// Generates a plaintext, stores only its fingerprint record, and
    /// indexes it under the user. The plaintext is returned exactly once —
    /// every other read path returns only the fingerprint.
    pub async fn issue_client_key(
        &self,
        user_id: String,
        permissions: Vec<Permission>,
        rate_limit: Option<u32>,
    ) -> Result<(String, String), StoreError> {
        let plaintext = generate_plaintext_secret();
        let fingerprint = secrets::fingerprint(&plaintext);

        if self
            .store
            .get_record::<ClientKeyRecord>(CLIENT_KEY_NS, &fingerprint)
            .await?
            .is_some()
        {
            return Err(StoreError::MalformedField("fingerprint collision"));
        }

        let rate_limit = rate_limit.unwrap_or(self.config.default_client_rate_limit_per_hour);
        let record = ClientKeyRecord::new(user_id.clone(), permissions, rate_limit);
        self.store.put_record(CLIENT_KEY_NS, &fingerprint, &record).await?;
        self.store.set_add(&user_index_set(&user_id), &fingerprint).await?;

        Ok((plaintext, fingerprint))
    }

    /// Fingerprints `plaintext`, loads the record, and — on an active hit —
    /// atomically updates last-used and usage count before returning it.
    /// Returns `None` for an absent or inactive key; never returns the
    /// plaintext back to the caller.
    pub async fn validate_client_key(
        &self,
        plaintext: &str,
    ) -> Result<Option<ClientKeyRecord>, StoreError> {
        let fingerprint = secrets::fingerprint(plaintext);
        let Some(mut record) = self
            .store
            .get_record::<ClientKeyRecord>(CLIENT_KEY_NS, &fingerprint)
            .await?
        else {
            return Ok(None);
        };

        if !record.is_active {
            return Ok(None);
        }

        record.last_used = Some(Utc::now());
        record.usage_count += 1;
        self.store.put_record(CLIENT_KEY_NS, &fingerprint, &record).await?;

        Ok(Some(record))
    }

    pub async fn deactivate_client_key(&self, fingerprint: &str) -> Result<bool, StoreError> {
        self.set_client_key_active(fingerprint, false).await
    }

    pub async fn reactivate_client_key(&self, fingerprint: &str) -> Result<bool, StoreError> {
        self.set_client_key_active(fingerprint, true).await
    }

    async fn set_client_key_active(&self, fingerprint: &str, active: bool) -> Result<bool, StoreError> {
        let Some(mut record) = self
            .store
            .get_record::<ClientKeyRecord>(CLIENT_KEY_NS, fingerprint)
            .await?
        else {
            return Ok(false);
        };
        record.is_active = active;
        self.store.put_record(CLIENT_KEY_NS, fingerprint, &record).await?;
        Ok(true)
    }

    /// Irreversible: also removes the fingerprint from its user's index.
    pub async fn delete_client_key(&self, fingerprint: &str) -> Result<bool, StoreError> {
        let Some(record) = self
            .store
            .get_record::<ClientKeyRecord>(CLIENT_KEY_NS, fingerprint)
            .await?
        else {
            return Ok(false);
        };
        self.store.set_remove(&user_index_set(&record.user_id), fingerprint).await?;
        self.store.delete_record(CLIENT_KEY_NS, fingerprint).await
    }

    // ---------------------------------------------------------------
    // Client-side rate limiting
    // ---------------------------------------------------------------

    /// Checks and increments the rolling per-minute counter for `user_id`.
    /// The per-minute limit is `max(1, hourly_limit / 60)` — an
    /// approximation of a true sliding window, intentionally carried
    /// forward (see SPEC_FULL.md §11). Returns `(allowed, limit, remaining)`.
    pub async fn check_client_rate_limit(
        &self,
        user_id: &str,
        hourly_limit: u32,
    ) -> Result<(bool, u32, u32), StoreError> {
        let per_minute_limit = std::cmp::max(1, hourly_limit / 60);
        let minute = Utc::now().timestamp() / 60;
        let key = format!("rate:{user_id}:{minute}");

        let count = self.store.atomic_increment_with_ttl(&key, 60).await?;
        let allowed = count <= per_minute_limit as i64;
        let remaining = (per_minute_limit as i64 - count).max(0) as u32;
        Ok((allowed, per_minute_limit, remaining))
    }

    // ---------------------------------------------------------------
    // Upstream keys
    // ---------------------------------------------------------------

    /// Adds an upstream key, storing its plaintext encrypted at rest (§11)
    /// alongside the schema'd record. Returns `None` on a duplicate
    /// fingerprint.
    pub async fn add_upstream_key(&self, plaintext: &str) -> Result<Option<String>, StoreError> {
        let fingerprint = secrets::fingerprint(plaintext);
        if self
            .store
            .get_record::<UpstreamKeyRecord>(UPSTREAM_KEY_NS, &fingerprint)
            .await?
            .is_some()
        {
            return Ok(None);
        }

        let record = UpstreamKeyRecord::new(fingerprint.clone());
        self.store.put_record(UPSTREAM_KEY_NS, &fingerprint, &record).await?;
        self.store.set_add(UPSTREAM_ACTIVE_SET, &fingerprint).await?;

        let ciphertext = secrets::encrypt(plaintext, &self.vault_key)
            .map_err(|_| StoreError::MalformedField("vault encryption failed"))?;
        self.store
            .put_record("upstream-key-vault", &fingerprint, &ciphertext)
            .await?;

        Ok(Some(fingerprint))
    }

    /// Per-key error isolation: one bad key does not abort the batch.
    /// Maximum 100 keys per call.
    pub async fn bulk_add_upstream_keys(&self, plaintexts: Vec<String>) -> BulkImportResult {
        let total = plaintexts.len();
        let mut ok = 0;
        let mut errors = Vec::new();
        let mut ok_fingerprints = Vec::new();

        for plaintext in plaintexts.into_iter().take(MAX_BULK_IMPORT) {
            match self.add_upstream_key(&plaintext).await {
                Ok(Some(fingerprint)) => {
                    ok += 1;
                    ok_fingerprints.push(fingerprint);
                }
                Ok(None) => errors.push("duplicate key".to_string()),
                Err(e) => errors.push(e.to_string()),
            }
        }

        let failed = total.min(MAX_BULK_IMPORT) - ok;
        let skipped = total.saturating_sub(MAX_BULK_IMPORT);
        let mut errors = errors;
        if skipped > 0 {
            errors.push(format!("{skipped} keys skipped, exceeds max {MAX_BULK_IMPORT} per call"));
        }

        BulkImportResult {
            total,
            ok,
            failed: failed + skipped,
            errors,
            ok_fingerprints,
        }
    }

    /// Resolves the plaintext for an upstream fingerprint from the vault.
    /// Used only by the Proxy Engine, immediately before setting the
    /// outbound `Authorization` header.
    pub async fn resolve_upstream_plaintext(&self, fingerprint: &str) -> Result<String, StoreError> {
        let ciphertext: Option<String> = self
            .store
            .get_record("upstream-key-vault", fingerprint)
            .await?;
        let ciphertext = ciphertext.ok_or(StoreError::MissingField("upstream-key-vault"))?;
        secrets::decrypt(&ciphertext, &self.vault_key)
            .map_err(|_| StoreError::MalformedField("vault decryption failed"))
    }

    pub async fn mark_upstream_unhealthy(&self, fingerprint: &str, error_text: &str) -> Result<(), StoreError> {
        let Some(mut record) = self
            .store
            .get_record::<UpstreamKeyRecord>(UPSTREAM_KEY_NS, fingerprint)
            .await?
        else {
            return Ok(());
        };

        record.failure_count += 1;
        record.last_error = Some(error_text.to_string());

        if record.should_disable(self.config.upstream_disable_threshold) {
            record.is_healthy = false;
            self.store.set_remove(UPSTREAM_ACTIVE_SET, fingerprint).await?;
        }

        self.store.put_record(UPSTREAM_KEY_NS, fingerprint, &record).await?;
        Ok(())
    }

    /// Stays in `upstream-active`; re-eligibility is evaluated through the
    /// derived predicate rather than by removing the key from the index.
    pub async fn mark_upstream_rate_limited(
        &self,
        fingerprint: &str,
        reset_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let Some(mut record) = self
            .store
            .get_record::<UpstreamKeyRecord>(UPSTREAM_KEY_NS, fingerprint)
            .await?
        else {
            return Ok(());
        };

        record.rate_limit_reset = Some(reset_time);
        record.is_healthy = false;
        self.store.put_record(UPSTREAM_KEY_NS, fingerprint, &record).await?;
        Ok(())
    }

    pub async fn mark_upstream_success(&self, fingerprint: &str) -> Result<(), StoreError> {
        let Some(mut record) = self
            .store
            .get_record::<UpstreamKeyRecord>(UPSTREAM_KEY_NS, fingerprint)
            .await?
        else {
            return Ok(());
        };

        record.is_healthy = true;
        record.failure_count = 0;
        record.last_used = Some(Utc::now());
        record.usage_count += 1;
        self.store.put_record(UPSTREAM_KEY_NS, fingerprint, &record).await?;
        Ok(())
    }

    /// Returns `upstream-active` members filtered by the derived
    /// eligibility predicate; the intersection with breaker state happens
    /// one layer up, in the Rotation Engine.
    pub async fn list_eligible_upstream_keys(
        &self,
    ) -> Result<Vec<(String, UpstreamKeyRecord)>, StoreError> {
        let records = self
            .store
            .get_records_in_set::<UpstreamKeyRecord>(UPSTREAM_KEY_NS, UPSTREAM_ACTIVE_SET)
            .await?;
        Ok(records
            .into_iter()
            .filter(|(_, record)| record.is_eligible())
            .collect())
    }

    /// Read-only aggregate view of one upstream key, exposed for the
    /// out-of-scope admin surface and C8 diagnostics. Touches no new durable
    /// state beyond the existing record read.
    pub async fn key_usage_stats(&self, fingerprint: &str) -> Result<Option<KeyUsageStats>, StoreError> {
        let record = self
            .store
            .get_record::<UpstreamKeyRecord>(UPSTREAM_KEY_NS, fingerprint)
            .await?;
        Ok(record.map(|r| KeyUsageStats {
            fingerprint: r.fingerprint,
            usage_count: r.usage_count,
            failure_count: r.failure_count,
            is_healthy: r.is_healthy,
            last_used: r.last_used,
        }))
    }

    /// Runs the 5-minute maintenance sweep described in SPEC_FULL.md §4.4:
    /// restores any key whose rate-limit deadline has passed but is still
    /// marked unhealthy.
    pub async fn recover_expired_rate_limits(&self) -> Result<usize, StoreError> {
        let all_fingerprints = self.store.scan(&format!("{UPSTREAM_KEY_NS}:*")).await?;
        let mut recovered = 0;
        for key in all_fingerprints {
            let Some(fingerprint) = key.strip_prefix(&format!("{UPSTREAM_KEY_NS}:")) else {
                continue;
            };
            let Some(mut record) = self
                .store
                .get_record::<UpstreamKeyRecord>(UPSTREAM_KEY_NS, fingerprint)
                .await?
            else {
                continue;
            };

            let reset_in_past = record
                .rate_limit_reset
                .map(|r| r <= Utc::now())
                .unwrap_or(false);

            if reset_in_past && !record.is_healthy {
                record.rate_limit_reset = None;
                record.is_healthy = true;
                record.failure_count = 0;
                self.store.put_record(UPSTREAM_KEY_NS, fingerprint, &record).await?;
                self.store.set_add(UPSTREAM_ACTIVE_SET, fingerprint).await?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_plaintext_has_sufficient_entropy_and_is_url_safe() {
        let secret = generate_plaintext_secret();
        assert!(secret.starts_with("ck_"));
        // 32 random bytes >> the 24-byte floor the spec requires.
        assert!(secret.len() > 24);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }

    #[test]
    fn per_minute_limit_floors_at_one() {
        assert_eq!(std::cmp::max(1, 60u32 / 60), 1);
        assert_eq!(std::cmp::max(1, 30u32 / 60), 1);
        assert_eq!(std::cmp::max(1, 1000u32 / 60), 16);
    }
}
