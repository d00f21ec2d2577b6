//! Rotation Engine (C4)
//!
//! Picks one eligible upstream key per outbound request according to the
//! configured [`RotationStrategy`](crate::config::RotationStrategy), and
//! runs the periodic maintenance sweep that recovers keys whose rate-limit
//! window has elapsed.
//!
//! Selection formulas (weighted and health-based scoring) are carried over
//! from the rotation algorithms this system already used for exactly this
//! purpose; round-robin/random/least-used are the simpler strategies from
//! the same source.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use rand::Rng;

use crate::breaker::CircuitBreakerRegistry;
use crate::config::RotationStrategy;
use crate::credentials::CredentialRegistry;
use crate::types::UpstreamKeyRecord;

/// How recently a fingerprint was last selected, to discourage rapid reuse
/// in the weighted strategy.
const RECENCY_PENALTY_WINDOW_SECS: u64 = 60;

/// The in-memory `RotationContext` of SPEC_FULL.md §3: a fingerprint →
/// last-selection-timestamp map, kept separate from [`RotationEngine`] so
/// the recency penalty can be unit-tested without a live state store.
#[derive(Default)]
struct SelectionHistory {
    last_selected: Mutex<HashMap<String, Instant>>,
}

impl SelectionHistory {
    fn mark_selected(&self, fingerprint: &str) {
        let mut last_selected = self.last_selected.lock().expect("rotation cursor mutex poisoned");
        last_selected.insert(fingerprint.to_string(), Instant::now());
    }

    /// Whether `fingerprint` was selected within the recency-penalty window.
    fn recently_selected(&self, fingerprint: &str) -> bool {
        let last_selected = self.last_selected.lock().expect("rotation cursor mutex poisoned");
        last_selected
            .get(fingerprint)
            .is_some_and(|t| t.elapsed().as_secs() < RECENCY_PENALTY_WINDOW_SECS)
    }
}

pub struct RotationEngine {
    credentials: CredentialRegistry,
    breakers: Arc<CircuitBreakerRegistry>,
    strategy: RotationStrategy,
    round_robin_cursor: AtomicUsize,
    history: SelectionHistory,
}

impl RotationEngine {
    pub fn new(credentials: CredentialRegistry, breakers: Arc<CircuitBreakerRegistry>, strategy: RotationStrategy) -> Self {
        Self {
            credentials,
            breakers,
            strategy,
            round_robin_cursor: AtomicUsize::new(0),
            history: SelectionHistory::default(),
        }
    }

    /// Loads every eligible upstream key, drops any whose breaker currently
    /// forbids a request, and applies the configured strategy to the
    /// remainder. Returns `None` when nothing is available to route to.
    pub async fn select_upstream(&self) -> Result<Option<(String, UpstreamKeyRecord)>, crate::error::StoreError> {
        let eligible = self.credentials.list_eligible_upstream_keys().await?;
        let available: Vec<(String, UpstreamKeyRecord)> = eligible
            .into_iter()
            .filter(|(fingerprint, _)| self.breakers.can_execute(fingerprint))
            .collect();

        if available.is_empty() {
            return Ok(None);
        }

        let selected = match self.strategy {
            RotationStrategy::RoundRobin => {
                let index = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) % available.len();
                available[index].clone()
            }
            RotationStrategy::Random => Self::random(&available),
            RotationStrategy::LeastUsed => Self::least_used(&available),
            RotationStrategy::Weighted => self.weighted(&available),
            RotationStrategy::HealthBased => Self::health_based(&available),
        };

        // Per the select-upstream algorithm's step 4: the key we're about to
        // hand out, specifically, counts as one admitted probe if it's
        // currently half-open. Candidates merely considered during the
        // filter above never do.
        self.breakers.mark_probe(&selected.0);
        self.history.mark_selected(&selected.0);
        Ok(Some(selected))
    }

    pub async fn report_success(&self, fingerprint: &str) {
        self.breakers.report_success(fingerprint);
        let _ = self.credentials.mark_upstream_success(fingerprint).await;
    }

    /// `is_rate_limit` distinguishes a 429 from every other failure: a 429
    /// marks the key rate-limited (with a reset deadline) instead of
    /// unhealthy, since the key itself isn't broken, just throttled. The
    /// breaker doesn't care about the distinction — any failure counts
    /// against it the same way.
    pub async fn report_failure(&self, fingerprint: &str, error_text: &str, is_rate_limit: bool) {
        self.breakers.report_failure(fingerprint);
        if is_rate_limit {
            // Upstream rarely tells us exactly when its window resets; one
            // hour is this system's standing estimate (mirrors S2's expected
            // ~1h reset window).
            let reset_time = chrono::Utc::now() + chrono::Duration::hours(1);
            let _ = self.credentials.mark_upstream_rate_limited(fingerprint, reset_time).await;
        } else {
            let _ = self.credentials.mark_upstream_unhealthy(fingerprint, error_text).await;
        }
    }

    /// Runs the periodic background sweep: recovers keys past their
    /// rate-limit deadline. Returns the count recovered, purely for logging.
    pub async fn run_maintenance_sweep(&self) -> Result<usize, crate::error::StoreError> {
        self.credentials.recover_expired_rate_limits().await
    }

    /// Read-only breaker snapshots for every fingerprint seen so far, for
    /// C8 diagnostics and the out-of-scope admin surface's status panel.
    pub fn breaker_snapshots(&self) -> Vec<crate::breaker::BreakerSnapshot> {
        self.breakers.snapshot_all()
    }

    fn random(available: &[(String, UpstreamKeyRecord)]) -> (String, UpstreamKeyRecord) {
        let index = rand::thread_rng().gen_range(0..available.len());
        available[index].clone()
    }

    /// Oldest `last_used` first; never-used keys (`None`) sort before any
    /// used key.
    fn least_used(available: &[(String, UpstreamKeyRecord)]) -> (String, UpstreamKeyRecord) {
        available
            .iter()
            .min_by_key(|(_, record)| record.last_used.unwrap_or(chrono::DateTime::<Utc>::MIN_UTC))
            .cloned()
            .expect("available is non-empty")
    }

    /// Weight starts at 1.0, drops 0.2 per recorded failure (floor 0.1),
    /// gains up to +0.5 for hours since last use (or a flat +0.5 bonus for
    /// never-used keys), and is halved if this fingerprint was handed out
    /// within the last `RECENCY_PENALTY_WINDOW_SECS`. A uniform draw over
    /// the cumulative weight picks the key whose cumulative bucket contains
    /// it — inverse-CDF sampling over a cryptographic RNG.
    fn weighted(&self, available: &[(String, UpstreamKeyRecord)]) -> (String, UpstreamKeyRecord) {
        let weights: Vec<f64> = available
            .iter()
            .map(|(fingerprint, r)| Self::key_weight(&self.history, fingerprint, r))
            .collect();
        let total: f64 = weights.iter().sum();

        if total <= 0.0 {
            return Self::random(available);
        }

        let draw = rand::thread_rng().gen_range(0.0..total);
        let mut cumulative = 0.0;
        for (i, weight) in weights.iter().enumerate() {
            cumulative += weight;
            if draw <= cumulative {
                return available[i].clone();
            }
        }
        available.last().expect("available is non-empty").clone()
    }

    fn key_weight(history: &SelectionHistory, fingerprint: &str, record: &UpstreamKeyRecord) -> f64 {
        let mut weight = 1.0 - (record.failure_count as f64 * 0.2);
        weight = weight.max(0.1);

        match record.last_used {
            Some(last_used) => {
                let hours_since = (Utc::now() - last_used).num_seconds() as f64 / 3600.0;
                weight += (hours_since * 0.1).min(0.5);
            }
            None => weight += 0.5,
        }

        if history.recently_selected(fingerprint) {
            weight /= 2.0;
        }

        weight.max(0.1)
    }

    /// Score starts at 100, loses 10 per failure, loses 30 if currently
    /// rate-limited, loses up to 20 for usage approaching a 1000-request
    /// normalization ceiling, and gains 10 for use within the last hour.
    /// Highest score wins, ties broken by iteration order.
    fn health_based(available: &[(String, UpstreamKeyRecord)]) -> (String, UpstreamKeyRecord) {
        available
            .iter()
            .max_by(|(_, a), (_, b)| {
                Self::health_score(a)
                    .partial_cmp(&Self::health_score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
            .expect("available is non-empty")
    }

    fn health_score(record: &UpstreamKeyRecord) -> f64 {
        let mut score = 100.0;
        score -= record.failure_count as f64 * 10.0;

        if record.is_rate_limited() {
            score -= 30.0;
        }

        let usage_factor = (record.usage_count as f64 / 1000.0).min(1.0);
        score -= usage_factor * 20.0;

        if let Some(last_used) = record.last_used {
            let hours_since = (Utc::now() - last_used).num_seconds() as f64 / 3600.0;
            if hours_since < 1.0 {
                score += 10.0;
            }
        }

        score.max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key_with(failures: u32, usage: u64, last_used_hours_ago: Option<i64>) -> UpstreamKeyRecord {
        let mut record = UpstreamKeyRecord::new("f".repeat(64));
        record.failure_count = failures;
        record.usage_count = usage;
        record.last_used = last_used_hours_ago.map(|h| Utc::now() - Duration::hours(h));
        record
    }

    #[test]
    fn least_used_prefers_never_used_over_recently_used() {
        let never = key_with(0, 0, None);
        let recent = key_with(0, 0, Some(1));
        let available = vec![("recent".to_string(), recent), ("never".to_string(), never)];
        let (fingerprint, _) = RotationEngine::least_used(&available);
        assert_eq!(fingerprint, "never");
    }

    #[test]
    fn weight_floors_at_point_one_under_heavy_failures() {
        let record = key_with(10, 0, None);
        let history = SelectionHistory::default();
        assert_eq!(RotationEngine::key_weight(&history, "fp", &record), 0.1 + 0.5);
    }

    #[test]
    fn recency_penalty_halves_weight_of_a_just_selected_key() {
        let record = key_with(0, 0, None);
        let history = SelectionHistory::default();
        let fresh_weight = RotationEngine::key_weight(&history, "fp", &record);

        history.mark_selected("fp");
        let penalized_weight = RotationEngine::key_weight(&history, "fp", &record);

        assert_eq!(penalized_weight, fresh_weight / 2.0);
    }

    #[test]
    fn health_score_penalizes_failures_and_rate_limiting() {
        let healthy = key_with(0, 0, None);
        let mut limited = key_with(0, 0, None);
        limited.rate_limit_reset = Some(Utc::now() + Duration::hours(1));
        assert!(RotationEngine::health_score(&healthy) > RotationEngine::health_score(&limited));
    }

    #[test]
    fn health_based_selects_highest_scoring_key() {
        let weak = key_with(5, 900, None);
        let strong = key_with(0, 0, None);
        let available = vec![("weak".to_string(), weak), ("strong".to_string(), strong)];
        let (fingerprint, _) = RotationEngine::health_based(&available);
        assert_eq!(fingerprint, "strong");
    }
}
