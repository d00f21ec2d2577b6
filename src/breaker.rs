//! Circuit Breaker (C3)
//!
//! One three-state breaker per upstream-key fingerprint: closed, open, and
//! half-open. Protects the rotation engine from hammering a key that is
//! failing hard, independent of (and faster-acting than) the Credential
//! Registry's failure-count/disable-threshold bookkeeping.
//!
//! State lives in-process, guarded by a mutex per fingerprint rather than
//! the State Store — the breaker must react within the same request that
//! observed the failure, with no round-trip latency.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_probes_in_flight: u32,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_probes_in_flight: 0,
        }
    }
}

/// Read-only view of a single breaker's state, for diagnostics (C8) and the
/// out-of-scope admin surface's status panel.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub fingerprint: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub probes_in_flight: u32,
}

pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Breaker>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    max_half_open_probes: u32,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, recovery_timeout_secs: u64, max_half_open_probes: u32) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            failure_threshold,
            recovery_timeout: Duration::from_secs(recovery_timeout_secs),
            max_half_open_probes,
        }
    }

    /// Whether a request may currently be routed to `fingerprint`. Side-effect
    /// free except for the Open→HalfOpen transition itself once the recovery
    /// timeout has elapsed (per the state table, that transition is part of
    /// answering the query) — it never counts a probe as in-flight. Callers
    /// filtering a whole pool of candidates should use this, then call
    /// [`mark_probe`](Self::mark_probe) once, only for the key they actually
    /// select, so probes admitted are exactly probes attempted.
    pub fn can_execute(&self, fingerprint: &str) -> bool {
        let mut breakers = self.breakers.lock().expect("breaker mutex poisoned");
        let breaker = breakers.entry(fingerprint.to_string()).or_insert_with(Breaker::new);

        match breaker.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = breaker.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.recovery_timeout {
                    breaker.state = BreakerState::HalfOpen;
                    breaker.half_open_probes_in_flight = 0;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => breaker.half_open_probes_in_flight < self.max_half_open_probes,
        }
    }

    /// Counts one probe as in-flight against a HalfOpen breaker. Called
    /// exactly once, only for the fingerprint `select_upstream` actually
    /// hands out — never for candidates merely considered during filtering.
    /// A no-op outside HalfOpen (Closed needs no count; Open means the probe
    /// was never admitted in the first place).
    pub fn mark_probe(&self, fingerprint: &str) {
        let mut breakers = self.breakers.lock().expect("breaker mutex poisoned");
        let breaker = breakers.entry(fingerprint.to_string()).or_insert_with(Breaker::new);
        if breaker.state == BreakerState::HalfOpen {
            breaker.half_open_probes_in_flight += 1;
        }
    }

    /// A success in HalfOpen closes the breaker outright (single good probe
    /// is sufficient evidence of recovery); a success in Closed just resets
    /// the failure counter.
    pub fn report_success(&self, fingerprint: &str) {
        let mut breakers = self.breakers.lock().expect("breaker mutex poisoned");
        let breaker = breakers.entry(fingerprint.to_string()).or_insert_with(Breaker::new);

        breaker.consecutive_failures = 0;
        breaker.opened_at = None;
        breaker.half_open_probes_in_flight = 0;
        breaker.state = BreakerState::Closed;
    }

    /// A failure in HalfOpen immediately reopens the breaker. A failure in
    /// Closed only opens it once `consecutive_failures` reaches the
    /// threshold.
    pub fn report_failure(&self, fingerprint: &str) {
        let mut breakers = self.breakers.lock().expect("breaker mutex poisoned");
        let breaker = breakers.entry(fingerprint.to_string()).or_insert_with(Breaker::new);

        match breaker.state {
            BreakerState::HalfOpen => {
                breaker.state = BreakerState::Open;
                breaker.opened_at = Some(Instant::now());
                breaker.half_open_probes_in_flight = 0;
            }
            BreakerState::Closed | BreakerState::Open => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= self.failure_threshold {
                    breaker.state = BreakerState::Open;
                    breaker.opened_at = Some(Instant::now());
                }
            }
        }
    }

    pub fn snapshot(&self, fingerprint: &str) -> BreakerSnapshot {
        let mut breakers = self.breakers.lock().expect("breaker mutex poisoned");
        let breaker = breakers.entry(fingerprint.to_string()).or_insert_with(Breaker::new);
        BreakerSnapshot {
            fingerprint: fingerprint.to_string(),
            state: breaker.state,
            consecutive_failures: breaker.consecutive_failures,
            probes_in_flight: breaker.half_open_probes_in_flight,
        }
    }

    pub fn snapshot_all(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.lock().expect("breaker mutex poisoned");
        breakers
            .iter()
            .map(|(fingerprint, breaker)| BreakerSnapshot {
                fingerprint: fingerprint.clone(),
                state: breaker.state,
                consecutive_failures: breaker.consecutive_failures,
                probes_in_flight: breaker.half_open_probes_in_flight,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_breaker_allows_requests_until_threshold() {
        let registry = CircuitBreakerRegistry::new(3, 60, 1);
        assert!(registry.can_execute("fp"));
        registry.report_failure("fp");
        registry.report_failure("fp");
        assert!(registry.can_execute("fp"));
        registry.report_failure("fp");
        assert!(!registry.can_execute("fp"));
        assert_eq!(registry.snapshot("fp").state, BreakerState::Open);
    }

    #[test]
    fn success_resets_failure_count() {
        let registry = CircuitBreakerRegistry::new(3, 60, 1);
        registry.report_failure("fp");
        registry.report_failure("fp");
        registry.report_success("fp");
        assert_eq!(registry.snapshot("fp").consecutive_failures, 0);
        registry.report_failure("fp");
        registry.report_failure("fp");
        assert!(registry.can_execute("fp"));
    }

    #[test]
    fn open_breaker_transitions_to_half_open_after_recovery_timeout() {
        let registry = CircuitBreakerRegistry::new(1, 0, 1);
        registry.report_failure("fp");
        assert_eq!(registry.snapshot("fp").state, BreakerState::Open);
        assert!(registry.can_execute("fp"));
        assert_eq!(registry.snapshot("fp").state, BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let registry = CircuitBreakerRegistry::new(1, 0, 1);
        registry.report_failure("fp");
        registry.can_execute("fp");
        registry.mark_probe("fp");
        assert_eq!(registry.snapshot("fp").state, BreakerState::HalfOpen);
        registry.report_failure("fp");
        assert_eq!(registry.snapshot("fp").state, BreakerState::Open);
    }

    #[test]
    fn half_open_probe_cap_rejects_extra_concurrent_probes() {
        let registry = CircuitBreakerRegistry::new(1, 0, 2);
        registry.report_failure("fp");
        assert!(registry.can_execute("fp"));
        registry.mark_probe("fp");
        assert!(registry.can_execute("fp"));
        registry.mark_probe("fp");
        assert!(!registry.can_execute("fp"));
    }

    /// Regression: `can_execute` is the filter-time check used over an
    /// entire candidate pool and must never itself count a probe — only
    /// `mark_probe`, called once for the key actually selected, may.
    #[test]
    fn can_execute_does_not_consume_a_probe_slot() {
        let registry = CircuitBreakerRegistry::new(1, 0, 1);
        registry.report_failure("fp");
        for _ in 0..5 {
            assert!(registry.can_execute("fp"));
            assert_eq!(registry.snapshot("fp").probes_in_flight, 0);
        }
        registry.mark_probe("fp");
        assert_eq!(registry.snapshot("fp").probes_in_flight, 1);
        assert!(!registry.can_execute("fp"));
    }
}
