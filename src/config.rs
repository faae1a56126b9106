// =============================================================================
// Service Configuration — environment-driven with safe defaults
// =============================================================================
//
// Everything tunable lives here. Values come from the environment (dotenv is
// loaded in main) so the same binary runs against a local memory store, a
// direct Postgres connection, or a REST gateway, selected by
// DECIDER_PERSIST_BACKEND. There is exactly ONE server binary; no per-deploy
// variants.
//
// A bad configuration is a startup error: main exits non-zero.
// =============================================================================

use std::fmt;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_cache_capacity() -> usize {
    1024
}

fn default_cache_ttl_seconds() -> u64 {
    60
}

fn default_max_connections() -> u32 {
    10
}

fn default_decision_budget_ms() -> u64 {
    2_000
}

fn default_calibration_read_budget_ms() -> u64 {
    300
}

fn default_trace_enqueue_budget_ms() -> u64 {
    50
}

fn default_feedback_budget_ms() -> u64 {
    5_000
}

fn default_min_samples() -> u32 {
    50
}

fn default_retrain_interval_days() -> i64 {
    1
}

// =============================================================================
// Persistence backend selection
// =============================================================================

/// Which FeedbackStore implementation backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistBackend {
    /// Direct SQL against a Postgres-compatible host.
    Sql,
    /// PostgREST-style REST gateway (Supabase et al.).
    Rest,
    /// In-process store. No durability; local runs and tests only.
    Memory,
}

impl Default for PersistBackend {
    fn default() -> Self {
        Self::Memory
    }
}

impl fmt::Display for PersistBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sql => write!(f, "sql"),
            Self::Rest => write!(f, "rest"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

// =============================================================================
// Calibration cache settings
// =============================================================================

/// Bounds for the in-memory calibration read cache that absorbs the EA's
/// once-per-second polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_seconds")]
    pub ttl_seconds: u64,
    /// Upper bound on concurrent store connections (SQL pool size).
    #[serde(default = "default_max_connections")]
    pub max_concurrent: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_seconds: default_cache_ttl_seconds(),
            max_concurrent: default_max_connections(),
        }
    }
}

// =============================================================================
// Request budgets
// =============================================================================

/// Per-stage deadlines, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budgets {
    /// Overall budget for POST /decision.
    #[serde(default = "default_decision_budget_ms")]
    pub decision_ms: u64,
    /// Sub-budget for the calibration read inside the decision path. On
    /// timeout the decision is served with drift_factor = 1.0.
    #[serde(default = "default_calibration_read_budget_ms")]
    pub calibration_read_ms: u64,
    /// Hard enqueue deadline for the prediction trace. On exceeded, drop.
    #[serde(default = "default_trace_enqueue_budget_ms")]
    pub trace_enqueue_ms: u64,
    /// Budget for POST /feedback; it must be durable, so on timeout the EA
    /// gets a 503 and retries.
    #[serde(default = "default_feedback_budget_ms")]
    pub feedback_ms: u64,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            decision_ms: default_decision_budget_ms(),
            calibration_read_ms: default_calibration_read_budget_ms(),
            trace_enqueue_ms: default_trace_enqueue_budget_ms(),
            feedback_ms: default_feedback_budget_ms(),
        }
    }
}

// =============================================================================
// ServiceConfig
// =============================================================================

/// Top-level configuration for the decision service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default)]
    pub backend: PersistBackend,

    /// Postgres connection URL. Required for the `sql` backend. TLS is
    /// required whenever the host is a managed hosted service; pass
    /// `sslmode=require` in the URL.
    #[serde(default)]
    pub database_url: Option<String>,

    /// REST gateway base URL and API key. Required for the `rest` backend.
    #[serde(default)]
    pub rest_url: Option<String>,
    #[serde(default)]
    pub rest_key: Option<String>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub budgets: Budgets,

    /// Minimum feedback samples before a key is eligible for retraining.
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,

    /// Minimum days since the last recorded training before a key is
    /// eligible again.
    #[serde(default = "default_retrain_interval_days")]
    pub retrain_interval_days: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            backend: PersistBackend::Memory,
            database_url: None,
            rest_url: None,
            rest_key: None,
            cache: CacheConfig::default(),
            budgets: Budgets::default(),
            min_samples: default_min_samples(),
            retrain_interval_days: default_retrain_interval_days(),
        }
    }
}

impl ServiceConfig {
    /// Build the configuration from environment variables, then validate it.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("DECIDER_BIND_ADDR") {
            config.bind_addr = addr;
        } else if let Ok(port) = std::env::var("PORT") {
            config.bind_addr = format!("0.0.0.0:{port}");
        }

        if let Ok(backend) = std::env::var("DECIDER_PERSIST_BACKEND") {
            config.backend = match backend.to_lowercase().as_str() {
                "sql" => PersistBackend::Sql,
                "rest" => PersistBackend::Rest,
                "memory" => PersistBackend::Memory,
                other => bail!("invalid DECIDER_PERSIST_BACKEND: '{other}' (use sql, rest, or memory)"),
            };
        }

        config.database_url = std::env::var("DATABASE_URL").ok();
        config.rest_url = std::env::var("SUPABASE_URL").ok();
        config.rest_key = std::env::var("SUPABASE_KEY").ok();

        if let Ok(v) = std::env::var("DECIDER_CACHE_CAPACITY") {
            config.cache.capacity = v.parse().context("DECIDER_CACHE_CAPACITY must be an integer")?;
        }
        if let Ok(v) = std::env::var("DECIDER_CACHE_TTL_SECONDS") {
            config.cache.ttl_seconds = v.parse().context("DECIDER_CACHE_TTL_SECONDS must be an integer")?;
        }
        if let Ok(v) = std::env::var("DECIDER_MAX_CONNECTIONS") {
            config.cache.max_concurrent = v.parse().context("DECIDER_MAX_CONNECTIONS must be an integer")?;
        }
        if let Ok(v) = std::env::var("DECIDER_MIN_SAMPLES") {
            config.min_samples = v.parse().context("DECIDER_MIN_SAMPLES must be an integer")?;
        }
        if let Ok(v) = std::env::var("DECIDER_RETRAIN_INTERVAL_DAYS") {
            config.retrain_interval_days = v.parse().context("DECIDER_RETRAIN_INTERVAL_DAYS must be an integer")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot possibly start.
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            PersistBackend::Sql if self.database_url.is_none() => {
                bail!("backend=sql requires DATABASE_URL");
            }
            PersistBackend::Rest if self.rest_url.is_none() || self.rest_key.is_none() => {
                bail!("backend=rest requires SUPABASE_URL and SUPABASE_KEY");
            }
            _ => {}
        }
        if self.cache.capacity == 0 {
            bail!("cache capacity must be positive");
        }
        if self.cache.max_concurrent == 0 {
            bail!("max_concurrent must be positive");
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = ServiceConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.backend, PersistBackend::Memory);
        assert_eq!(cfg.cache.capacity, 1024);
        assert_eq!(cfg.cache.ttl_seconds, 60);
        assert_eq!(cfg.cache.max_concurrent, 10);
        assert_eq!(cfg.budgets.decision_ms, 2_000);
        assert_eq!(cfg.budgets.calibration_read_ms, 300);
        assert_eq!(cfg.budgets.trace_enqueue_ms, 50);
        assert_eq!(cfg.budgets.feedback_ms, 5_000);
        assert_eq!(cfg.min_samples, 50);
        assert_eq!(cfg.retrain_interval_days, 1);
    }

    #[test]
    fn sql_backend_requires_database_url() {
        let cfg = ServiceConfig {
            backend: PersistBackend::Sql,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rest_backend_requires_url_and_key() {
        let mut cfg = ServiceConfig {
            backend: PersistBackend::Rest,
            rest_url: Some("https://example.supabase.co".into()),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        cfg.rest_key = Some("key".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_capacity_rejected() {
        let mut cfg = ServiceConfig::default();
        cfg.cache.capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "backend": "memory", "bind_addr": "127.0.0.1:9000" }"#;
        let cfg: ServiceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.cache.capacity, 1024);
        assert_eq!(cfg.budgets.feedback_ms, 5_000);
    }
}
