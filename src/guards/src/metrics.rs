//! Guard metrics, system statistics and health classification

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::cache::CacheStats;

/// Error rate below which the system is healthy
pub const HEALTHY_MAX_ERROR_RATE: f64 = 0.01;
/// Average latency below which the system is healthy
pub const HEALTHY_MAX_LATENCY_MS: f64 = 10.0;
/// Error rate up to which the system is degraded rather than unhealthy
pub const DEGRADED_MAX_ERROR_RATE: f64 = 0.05;
/// Average latency up to which the system is degraded rather than unhealthy
pub const DEGRADED_MAX_LATENCY_MS: f64 = 50.0;

/// Guard check metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GuardMetrics {
    /// Total number of guard checks
    pub total_checks: u64,

    /// Checks that allowed the request
    pub allowed: u64,

    /// Checks that failed closed for any reason
    pub denied: u64,

    /// Denials caused by the system (source failures, timeouts)
    pub errors: u64,

    /// Permission-check cache hits
    pub cache_hits: u64,

    /// Permission-check cache misses
    pub cache_misses: u64,

    pub avg_latency_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
}

impl GuardMetrics {
    /// System failures over total checks
    pub fn error_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.errors as f64 / self.total_checks as f64
        }
    }

    /// Calculate cache hit rate
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Calculate allow rate
    pub fn allow_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.allowed as f64 / self.total_checks as f64
        }
    }
}

/// Lock-free counters plus a bounded ring of latency samples
pub struct MetricsCollector {
    total_checks: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    errors: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    latency_total_us: AtomicU64,
    latency_count: AtomicU64,

    /// Latency samples for percentile calculation (ring buffer)
    latency_samples: Arc<RwLock<Vec<f64>>>,

    /// Maximum samples to keep
    max_samples: usize,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(max_samples: usize) -> Self {
        Self {
            total_checks: AtomicU64::new(0),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            latency_total_us: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            latency_samples: Arc::new(RwLock::new(Vec::with_capacity(max_samples.min(10_000)))),
            max_samples: max_samples.max(1),
        }
    }

    /// Record a check outcome
    pub fn record_check(&self, allowed: bool, system_failure: bool) {
        self.total_checks.fetch_add(1, Ordering::Relaxed);
        if allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
        }
        if system_failure {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record check latency
    pub async fn record_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_total_us.fetch_add(micros, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);

        let mut samples = self.latency_samples.write().await;
        samples.push(latency.as_secs_f64() * 1000.0);

        // Keep only recent samples
        if samples.len() > self.max_samples {
            let excess = samples.len() - self.max_samples;
            let drop = excess.max(self.max_samples / 10).min(samples.len());
            samples.drain(0..drop);
        }
    }

    /// Get current metrics snapshot
    pub async fn get_metrics(&self) -> GuardMetrics {
        let mut sorted = self.latency_samples.read().await.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let latency_count = self.latency_count.load(Ordering::Relaxed);
        let avg_latency_ms = if latency_count == 0 {
            0.0
        } else {
            self.latency_total_us.load(Ordering::Relaxed) as f64 / latency_count as f64 / 1000.0
        };

        GuardMetrics {
            total_checks: self.total_checks.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            avg_latency_ms,
            latency_p50_ms: Self::percentile(&sorted, 0.50),
            latency_p95_ms: Self::percentile(&sorted, 0.95),
            latency_p99_ms: Self::percentile(&sorted, 0.99),
        }
    }

    /// Reset all metrics
    pub async fn reset(&self) {
        for counter in [
            &self.total_checks,
            &self.allowed,
            &self.denied,
            &self.errors,
            &self.cache_hits,
            &self.cache_misses,
            &self.latency_total_us,
            &self.latency_count,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.latency_samples.write().await.clear();
    }

    /// Export metrics in Prometheus format
    pub async fn export_prometheus(&self) -> String {
        let metrics = self.get_metrics().await;

        format!(
            r#"# HELP routeguards_checks_total Total number of guard checks
# TYPE routeguards_checks_total counter
routeguards_checks_total {}

# HELP routeguards_allowed_total Checks that allowed the request
# TYPE routeguards_allowed_total counter
routeguards_allowed_total {}

# HELP routeguards_denied_total Checks that denied the request
# TYPE routeguards_denied_total counter
routeguards_denied_total {}

# HELP routeguards_errors_total Denials caused by system failures
# TYPE routeguards_errors_total counter
routeguards_errors_total {}

# HELP routeguards_check_cache_hits_total Permission-check cache hits
# TYPE routeguards_check_cache_hits_total counter
routeguards_check_cache_hits_total {}

# HELP routeguards_check_cache_misses_total Permission-check cache misses
# TYPE routeguards_check_cache_misses_total counter
routeguards_check_cache_misses_total {}

# HELP routeguards_latency_seconds Check latency percentiles
# TYPE routeguards_latency_seconds summary
routeguards_latency_seconds{{quantile="0.5"}} {}
routeguards_latency_seconds{{quantile="0.95"}} {}
routeguards_latency_seconds{{quantile="0.99"}} {}
"#,
            metrics.total_checks,
            metrics.allowed,
            metrics.denied,
            metrics.errors,
            metrics.cache_hits,
            metrics.cache_misses,
            metrics.latency_p50_ms / 1000.0,
            metrics.latency_p95_ms / 1000.0,
            metrics.latency_p99_ms / 1000.0,
        )
    }

    /// Calculate percentile from sorted data
    fn percentile(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }

        let idx = ((sorted.len() as f64) * p) as usize;
        let idx = idx.min(sorted.len() - 1);
        sorted[idx]
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Operational snapshot of a guard instance
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub metrics: GuardMetrics,
    pub token_cache: CacheStats,
    pub context_cache: CacheStats,
    pub check_cache: CacheStats,
    /// Known concrete permissions
    pub registry_size: usize,
    pub cache_epoch: u64,
}

impl SystemStats {
    /// Hit ratio across every cache
    pub fn cache_hit_rate(&self) -> f64 {
        self.token_cache
            .merge(&self.context_cache)
            .merge(&self.check_cache)
            .hit_rate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Healthy below both healthy bounds, unhealthy past either degraded
    /// bound, degraded in between
    pub fn classify(error_rate: f64, average_latency_ms: f64) -> Self {
        if error_rate < HEALTHY_MAX_ERROR_RATE && average_latency_ms < HEALTHY_MAX_LATENCY_MS {
            Self::Healthy
        } else if error_rate <= DEGRADED_MAX_ERROR_RATE
            && average_latency_ms <= DEGRADED_MAX_LATENCY_MS
        {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub error_rate: f64,
    pub average_latency_ms: f64,
    pub details: HashMap<String, String>,
}

impl HealthReport {
    pub fn from_stats(stats: &SystemStats) -> Self {
        let error_rate = stats.metrics.error_rate();
        let average_latency_ms = stats.metrics.avg_latency_ms;
        let status = HealthStatus::classify(error_rate, average_latency_ms);

        let mut details = HashMap::new();
        details.insert("total_checks".to_string(), stats.metrics.total_checks.to_string());
        details.insert("errors".to_string(), stats.metrics.errors.to_string());
        details.insert(
            "cache_hit_rate".to_string(),
            format!("{:.3}", stats.cache_hit_rate()),
        );
        details.insert("registry_size".to_string(), stats.registry_size.to_string());
        details.insert(
            "shared_tier_degradations".to_string(),
            (stats.token_cache.degraded + stats.context_cache.degraded + stats.check_cache.degraded)
                .to_string(),
        );

        Self {
            status,
            error_rate,
            average_latency_ms,
            details,
        }
    }
}
