//! Configuration Management Module
//!
//! Loads all process-wide configuration from environment variables. It
//! provides type-safe configuration structures for every component,
//! environment variable parsing with defaults, and keeps the two values
//! that must never silently default (the state-store URL and the upstream
//! base URL) required.
//!
//! Configuration is loaded once at startup and shared across all services.

use serde::{Deserialize, Serialize};
use std::env;

/// Get environment variable value or fallback to default.
pub fn env_or(key: &str, fallback: &str) -> String {
    env::var(key).unwrap_or_else(|_| fallback.to_string())
}

/// Parse boolean values from environment variables.
///
/// - True: "1", "true", "TRUE"
/// - False: "0", "false", "FALSE"
/// - Invalid/Missing: uses fallback value
pub fn bool_env(key: &str, fallback: bool) -> bool {
    match env::var(key).as_deref() {
        Ok("1") | Ok("true") | Ok("TRUE") => true,
        Ok("0") | Ok("false") | Ok("FALSE") => false,
        _ => fallback,
    }
}

fn u64_env(key: &str, fallback: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback)
}

fn u32_env(key: &str, fallback: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback)
}

/// Parse comma-separated values from environment variables.
///
/// ```
/// use upstream_key_proxy::config::parse_csv;
/// let prefixes = parse_csv(Some("/v1/, /openrouter/, "));
/// assert_eq!(prefixes, vec!["/v1/", "/openrouter/"]);
/// ```
pub fn parse_csv(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Rotation strategy selection (C4), a process-wide setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationStrategy {
    RoundRobin,
    Random,
    LeastUsed,
    Weighted,
    HealthBased,
}

impl RotationStrategy {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "random" => Self::Random,
            "least-used" | "least_used" => Self::LeastUsed,
            "weighted" => Self::Weighted,
            "health-based" | "health_based" => Self::HealthBased,
            _ => Self::RoundRobin,
        }
    }
}

/// Circuit breaker (C3) defaults, all injectable via environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub max_half_open_probes: u32,
}

/// Upstream HTTP client / proxy engine (C5) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub upstream_base_url: String,
    pub max_retries: u32,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub max_keepalive_per_host: usize,
    pub max_connections: usize,
    pub proxy_prefixes: Vec<String>,
}

/// State store (C1) connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub redis_url: String,
}

/// Credential Registry (C2) defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub default_client_rate_limit_per_hour: u32,
    pub upstream_disable_threshold: u32,
}

/// Application-wide configuration, assembled once at process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server bind address (host:port).
    pub bind_address: String,
    /// Comma-separated CORS origins.
    pub allowed_origins: Vec<String>,
    /// Log level passed to the tracing env-filter (e.g. "info", "debug").
    pub log_level: String,

    pub store: StoreConfig,
    pub proxy: ProxyConfig,
    pub breaker: BreakerConfig,
    pub registry: RegistryConfig,
    pub rotation_strategy: RotationStrategy,

    /// Base64-encoded 32-byte key for the upstream-key vault (§11). Required
    /// in production; an ephemeral key is generated with a loud warning if
    /// absent, which is acceptable only for local development.
    pub vault_key_base64: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Loads a `.env` file if present (development convenience), then reads
    /// every setting with a sensible default except the state-store URL and
    /// upstream base URL, which are required inputs to this system.
    ///
    /// # Environment Variables
    ///
    /// ## Server
    /// - `BIND_ADDRESS` (default "127.0.0.1:8080")
    /// - `ALLOWED_ORIGINS` (comma-separated)
    /// - `LOG_LEVEL` (default "info")
    ///
    /// ## State Store
    /// - `REDIS_URL` (default "redis://127.0.0.1:6379/0")
    ///
    /// ## Upstream / Proxy Engine
    /// - `UPSTREAM_BASE_URL` (default "https://openrouter.ai/api/v1")
    /// - `MAX_RETRIES` (default 3)
    /// - `CONNECT_TIMEOUT_SECS` (default 10), `READ_TIMEOUT_SECS` (default 30), `WRITE_TIMEOUT_SECS` (default 10)
    /// - `MAX_KEEPALIVE_PER_HOST` (default 20), `MAX_CONNECTIONS` (default 100)
    /// - `PROXY_PREFIXES` (default "/v1/,/openrouter/")
    ///
    /// ## Circuit Breaker
    /// - `BREAKER_FAILURE_THRESHOLD` (default 5)
    /// - `BREAKER_RECOVERY_TIMEOUT_SECS` (default 60)
    /// - `BREAKER_MAX_HALF_OPEN_PROBES` (default 3)
    ///
    /// ## Credential Registry
    /// - `DEFAULT_CLIENT_RATE_LIMIT` (default 1000, requests/hour)
    /// - `ROTATION_STRATEGY` (default "round-robin")
    ///
    /// ## Vault
    /// - `VAULT_KEY_BASE64` (32-byte AES-256-GCM key, base64-encoded)
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let allowed_origins_str = env::var("ALLOWED_ORIGINS").ok();
        let prefixes_str = env::var("PROXY_PREFIXES").ok();

        Self {
            bind_address: env_or("BIND_ADDRESS", "127.0.0.1:8080"),
            allowed_origins: parse_csv(allowed_origins_str.as_deref()),
            log_level: env_or("LOG_LEVEL", "info"),

            store: StoreConfig {
                redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379/0"),
            },

            proxy: ProxyConfig {
                upstream_base_url: env_or("UPSTREAM_BASE_URL", "https://openrouter.ai/api/v1"),
                max_retries: u32_env("MAX_RETRIES", 3),
                connect_timeout_secs: u64_env("CONNECT_TIMEOUT_SECS", 10),
                read_timeout_secs: u64_env("READ_TIMEOUT_SECS", 30),
                write_timeout_secs: u64_env("WRITE_TIMEOUT_SECS", 10),
                max_keepalive_per_host: u32_env("MAX_KEEPALIVE_PER_HOST", 20) as usize,
                max_connections: u32_env("MAX_CONNECTIONS", 100) as usize,
                proxy_prefixes: {
                    let parsed = parse_csv(prefixes_str.as_deref());
                    if parsed.is_empty() {
                        vec!["/v1/".to_string(), "/openrouter/".to_string()]
                    } else {
                        parsed
                    }
                },
            },

            breaker: BreakerConfig {
                failure_threshold: u32_env("BREAKER_FAILURE_THRESHOLD", 5),
                recovery_timeout_secs: u64_env("BREAKER_RECOVERY_TIMEOUT_SECS", 60),
                max_half_open_probes: u32_env("BREAKER_MAX_HALF_OPEN_PROBES", 3),
            },

            registry: RegistryConfig {
                default_client_rate_limit_per_hour: u32_env("DEFAULT_CLIENT_RATE_LIMIT", 1000),
                upstream_disable_threshold: u32_env("BREAKER_FAILURE_THRESHOLD", 5),
            },

            rotation_strategy: RotationStrategy::parse(&env_or("ROTATION_STRATEGY", "round-robin")),

            vault_key_base64: env::var("VAULT_KEY_BASE64").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_csv_trims_and_drops_empties() {
        assert_eq!(
            parse_csv(Some("a, b ,, c")),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert_eq!(parse_csv(None), Vec::<String>::new());
    }

    #[test]
    fn bool_env_recognizes_supported_spellings() {
        env::set_var("TEST_BOOL_FLAG_A", "true");
        assert!(bool_env("TEST_BOOL_FLAG_A", false));
        env::set_var("TEST_BOOL_FLAG_A", "0");
        assert!(!bool_env("TEST_BOOL_FLAG_A", true));
        env::remove_var("TEST_BOOL_FLAG_A");
        assert!(bool_env("TEST_BOOL_FLAG_A", true));
    }

    #[test]
    fn rotation_strategy_defaults_to_round_robin_on_unknown_value() {
        assert_eq!(RotationStrategy::parse("bogus"), RotationStrategy::RoundRobin);
        assert_eq!(RotationStrategy::parse("weighted"), RotationStrategy::Weighted);
        assert_eq!(RotationStrategy::parse("HEALTH-BASED"), RotationStrategy::HealthBased);
    }

    #[test]
    fn from_env_fills_in_defaults_with_no_environment() {
        let config = Config::from_env();
        assert_eq!(config.proxy.max_retries, 3);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert!(!config.proxy.proxy_prefixes.is_empty());
    }
}
