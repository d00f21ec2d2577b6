//! Upstream-key proxy library interface.
//!
//! Re-exports the dataplane components (C1–C6) so they can be exercised
//! from crate-root integration tests, and to give the binary crate's
//! module tree a documented single entry point. The binary itself declares
//! its own copies of these modules, mirroring the teacher's split between
//! `lib.rs` and `main.rs`.
//!
//! - [`store`] — the State Store (C1), a typed record/set abstraction over Redis.
//! - [`credentials`] — the Credential Registry (C2): client/upstream key CRUD and rate limiting.
//! - [`breaker`] — the per-upstream-key Circuit Breaker (C3).
//! - [`rotation`] — the Rotation Engine (C4) and its selection strategies.
//! - [`proxy`] — the Proxy Engine (C5): retry/backoff and streaming passthrough.
//! - [`auth_gate`] — the Client Auth Gate (C6) axum middleware.
//! - [`secrets`] — fingerprinting and the upstream-key plaintext vault.
//! - [`config`] — environment-driven configuration for every component.
//! - [`error`] — the crate-wide error type and its HTTP error envelope.
//! - [`types`] — the persisted record shapes and wire DTOs.

pub mod auth_gate;
pub mod breaker;
pub mod config;
pub mod credentials;
pub mod error;
pub mod proxy;
pub mod rotation;
pub mod secrets;
pub mod store;
pub mod types;

/// Integration test exercising the pieces that don't require a live Redis:
/// fingerprinting, eligibility, breaker state, and rotation selection
/// working together the way [`proxy::ProxyEngine::proxy_request`] drives
/// them — the S3/S4 breaker-trip and half-open-probe scenarios, run
/// directly against the circuit breaker and rotation strategies rather
/// than through a full HTTP round trip.
#[cfg(test)]
mod tests {
    use crate::breaker::{BreakerState, CircuitBreakerRegistry};
    use crate::config::RotationStrategy;
    use crate::secrets::fingerprint;
    use crate::types::{Permission, UpstreamKeyRecord};
    use std::sync::Arc;

    #[test]
    fn fingerprint_is_deterministic_and_distinguishes_secrets() {
        let a = fingerprint("sk-or-v1-aaa");
        let b = fingerprint("sk-or-v1-aaa");
        let c = fingerprint("sk-or-v1-bbb");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn config_loads_the_documented_defaults() {
        let config = crate::config::Config::from_env();
        assert_eq!(config.rotation_strategy, RotationStrategy::RoundRobin);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.recovery_timeout_secs, 60);
        assert_eq!(config.breaker.max_half_open_probes, 3);
    }

    #[test]
    fn permission_set_is_closed_and_round_trips() {
        for p in [
            Permission::ChatCompletions,
            Permission::ModelsList,
            Permission::Embeddings,
            Permission::ImagesGenerate,
        ] {
            assert_eq!(Permission::parse(p.as_str()), Some(p));
        }
    }

    /// Mirrors S3 from SPEC_FULL.md §8: five consecutive failures trip the
    /// breaker, and a sixth attempt is denied with no upstream call made.
    #[test]
    fn breaker_trip_after_five_consecutive_failures_blocks_the_sixth_attempt() {
        let registry = Arc::new(CircuitBreakerRegistry::new(5, 60, 3));
        let fp = fingerprint("upstream-key-one");

        for _ in 0..5 {
            assert!(registry.can_execute(&fp));
            registry.report_failure(&fp);
        }

        assert!(!registry.can_execute(&fp));
        assert_eq!(registry.snapshot(&fp).state, BreakerState::Open);
    }

    /// Mirrors S4: once open, a breaker with a zero recovery timeout admits
    /// exactly one half-open probe, and a success on that probe closes it.
    #[test]
    fn half_open_probe_success_closes_the_breaker() {
        let registry = CircuitBreakerRegistry::new(1, 0, 1);
        let fp = fingerprint("upstream-key-two");

        registry.report_failure(&fp);
        assert_eq!(registry.snapshot(&fp).state, BreakerState::Open);

        assert!(registry.can_execute(&fp));
        registry.mark_probe(&fp);
        assert_eq!(registry.snapshot(&fp).state, BreakerState::HalfOpen);

        registry.report_success(&fp);
        assert_eq!(registry.snapshot(&fp).state, BreakerState::Closed);
        assert!(registry.can_execute(&fp));
    }

    /// Mirrors invariant 3 from SPEC_FULL.md §8: eligibility requires all
    /// three flags, independent of which one is false.
    #[test]
    fn eligibility_requires_active_healthy_and_not_rate_limited() {
        let mut key = UpstreamKeyRecord::new(fingerprint("upstream-key-three"));
        assert!(key.is_eligible());

        key.is_active = false;
        assert!(!key.is_eligible());
        key.is_active = true;

        key.is_healthy = false;
        assert!(!key.is_eligible());
        key.is_healthy = true;

        key.rate_limit_reset = Some(chrono::Utc::now() + chrono::Duration::hours(1));
        assert!(!key.is_eligible());
    }
}
