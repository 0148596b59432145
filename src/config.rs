//! Environment-variable-driven configuration for the orchestrator, worker
//! pool, and support services, per the tunables named in the
//! specification. Every value has a documented default; nothing here is
//! required to run the crate against the in-memory/local backends.

use std::time::Duration;

/// Process-wide tunables. Constructed once at worker/orchestrator startup
/// (the Rate Limiter and Cache clients are process-global per the design
/// notes, and both are sized from this config).
#[derive(Clone, Debug)]
pub struct ExamflowConfig {
    /// `MAX_CONCURRENT_RUNS_PER_WORKER` — local backpressure bound on how
    /// many runs one worker process drives at once. Default 8.
    pub max_concurrent_runs_per_worker: usize,
    /// `WORKER_LEASE_SECONDS` — how long a claimed run's lease lasts
    /// before the janitor considers the worker dead. Default 30.
    pub worker_lease: Duration,
    /// `DEFAULT_NODE_TIMEOUT_SECONDS` — wall-clock budget for a single
    /// node invocation. Default 120.
    pub default_node_timeout: Duration,
    /// Wall-clock budget for the segmentation node specifically; the
    /// specification calls out 300s here versus 120s for grading nodes.
    pub segmentation_node_timeout: Duration,
    /// `CACHE_TTL_DAYS` — semantic cache entry lifetime. Default 30.
    pub cache_ttl: Duration,
    /// `CONFIDENCE_REVIEW_THRESHOLD` — below this, a run gates to human
    /// review. Default 0.75.
    pub confidence_review_threshold: f64,
    /// `CONFIDENCE_CACHE_THRESHOLD` — above this, a grading result is
    /// worth caching. Default 0.90.
    pub confidence_cache_threshold: f64,
    /// Per-run fan-out concurrency cap (§4.1). Default 10.
    pub fanout_concurrency_cap: usize,
}

impl Default for ExamflowConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs_per_worker: 8,
            worker_lease: Duration::from_secs(30),
            default_node_timeout: Duration::from_secs(120),
            segmentation_node_timeout: Duration::from_secs(300),
            cache_ttl: Duration::from_secs(60 * 60 * 24 * 30),
            confidence_review_threshold: 0.75,
            confidence_cache_threshold: 0.90,
            fanout_concurrency_cap: 10,
        }
    }
}

impl ExamflowConfig {
    /// Loads `.env` (if present) then reads every tunable from its
    /// environment variable, falling back to the documented default for
    /// anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        Self {
            max_concurrent_runs_per_worker: env_usize(
                "MAX_CONCURRENT_RUNS_PER_WORKER",
                defaults.max_concurrent_runs_per_worker,
            ),
            worker_lease: Duration::from_secs(env_u64(
                "WORKER_LEASE_SECONDS",
                defaults.worker_lease.as_secs(),
            )),
            default_node_timeout: Duration::from_secs(env_u64(
                "DEFAULT_NODE_TIMEOUT_SECONDS",
                defaults.default_node_timeout.as_secs(),
            )),
            segmentation_node_timeout: defaults.segmentation_node_timeout,
            cache_ttl: Duration::from_secs(
                env_u64("CACHE_TTL_DAYS", 30) * 24 * 60 * 60,
            ),
            confidence_review_threshold: env_f64(
                "CONFIDENCE_REVIEW_THRESHOLD",
                defaults.confidence_review_threshold,
            ),
            confidence_cache_threshold: env_f64(
                "CONFIDENCE_CACHE_THRESHOLD",
                defaults.confidence_cache_threshold,
            ),
            fanout_concurrency_cap: defaults.fanout_concurrency_cap,
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
