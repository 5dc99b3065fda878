//! Metrics Registry: Prometheus-text counters, histograms, and gauges.
//!
//! Grounded on the teacher's `routes::metrics::MetricsCollector` (atomic
//! counters, fixed-bucket histograms), restructured around the labeled
//! series this gateway's pipeline needs instead of one flat global counter
//! per kind. Recording never panics or returns an error to the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::breaker::CircuitState;

/// Histogram bucket boundaries for `api_response_time_seconds`, per
/// SPEC_FULL.md §4.5.
pub const RESPONSE_TIME_BUCKETS: [f64; 8] = [0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0];

#[derive(Default)]
struct Histogram {
    bucket_counts: Vec<AtomicU64>,
    sum_millis: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            bucket_counts: (0..RESPONSE_TIME_BUCKETS.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_millis: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, seconds: f64) {
        for (i, bound) in RESPONSE_TIME_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_millis.fetch_add((seconds * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// The registry. All recording methods take `&self` and are safe to call
/// from any number of concurrent request tasks.
pub struct MetricsRegistry {
    requests_total: RwLock<HashMap<(String, String, String), u64>>,
    response_time: RwLock<HashMap<(String, String), Histogram>>,
    breaker_state: RwLock<HashMap<String, CircuitState>>,
    breaker_failures_total: RwLock<HashMap<(String, String), u64>>,
    active_requests: AtomicU64,
    started_at: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requests_total: RwLock::new(HashMap::new()),
            response_time: RwLock::new(HashMap::new()),
            breaker_state: RwLock::new(HashMap::new()),
            breaker_failures_total: RwLock::new(HashMap::new()),
            active_requests: AtomicU64::new(0),
            started_at: Instant::now(),
        })
    }

    pub fn request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_finished(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub async fn record_request(&self, route: &str, method: &str, status_code: u16, duration_seconds: f64) {
        let key = (route.to_string(), method.to_string(), status_code.to_string());
        *self.requests_total.write().await.entry(key).or_insert(0) += 1;

        let hist_key = (route.to_string(), method.to_string());
        let mut histograms = self.response_time.write().await;
        histograms.entry(hist_key).or_insert_with(Histogram::new).observe(duration_seconds);
    }

    pub async fn set_breaker_state(&self, service_id: &str, state: CircuitState) {
        self.breaker_state.write().await.insert(service_id.to_string(), state);
    }

    /// No counter is defined for breaker successes (SPEC_FULL.md §4.5 only
    /// requires `circuit_breaker_failures_total`); this exists so callers
    /// have a symmetric recording entry point and so a future success
    /// series has somewhere to land. Currently a no-op beyond that.
    pub async fn record_breaker_success(&self, _service_id: &str) {}

    pub async fn record_breaker_failure(&self, service_id: &str, error_type: &str) {
        let key = (service_id.to_string(), error_type.to_string());
        *self.breaker_failures_total.write().await.entry(key).or_insert(0) += 1;
    }

    /// Renders the current state as Prometheus text exposition format.
    pub async fn snapshot_text(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP api_requests_total Total number of gateway requests.\n");
        out.push_str("# TYPE api_requests_total counter\n");
        for ((route, method, status), count) in self.requests_total.read().await.iter() {
            out.push_str(&format!(
                "api_requests_total{{route=\"{route}\",method=\"{method}\",status_code=\"{status}\"}} {count}\n"
            ));
        }

        out.push_str("# HELP api_response_time_seconds Gateway response latency.\n");
        out.push_str("# TYPE api_response_time_seconds histogram\n");
        for ((route, method), histogram) in self.response_time.read().await.iter() {
            let mut cumulative = 0u64;
            for (i, bound) in RESPONSE_TIME_BUCKETS.iter().enumerate() {
                cumulative = histogram.bucket_counts[i].load(Ordering::Relaxed).max(cumulative);
                out.push_str(&format!(
                    "api_response_time_seconds_bucket{{route=\"{route}\",method=\"{method}\",le=\"{bound}\"}} {cumulative}\n"
                ));
            }
            let count = histogram.count.load(Ordering::Relaxed);
            out.push_str(&format!(
                "api_response_time_seconds_bucket{{route=\"{route}\",method=\"{method}\",le=\"+Inf\"}} {count}\n"
            ));
            let sum = histogram.sum_millis.load(Ordering::Relaxed) as f64 / 1000.0;
            out.push_str(&format!("api_response_time_seconds_sum{{route=\"{route}\",method=\"{method}\"}} {sum}\n"));
            out.push_str(&format!("api_response_time_seconds_count{{route=\"{route}\",method=\"{method}\"}} {count}\n"));
        }

        out.push_str("# HELP circuit_breaker_state Current circuit breaker state (0=closed,1=open,2=half-open).\n");
        out.push_str("# TYPE circuit_breaker_state gauge\n");
        for (service_id, state) in self.breaker_state.read().await.iter() {
            out.push_str(&format!("circuit_breaker_state{{service_id=\"{service_id}\"}} {}\n", *state as u8));
        }

        out.push_str("# HELP circuit_breaker_failures_total Total recorded circuit breaker failures.\n");
        out.push_str("# TYPE circuit_breaker_failures_total counter\n");
        for ((service_id, error_type), count) in self.breaker_failures_total.read().await.iter() {
            out.push_str(&format!(
                "circuit_breaker_failures_total{{service_id=\"{service_id}\",error_type=\"{error_type}\"}} {count}\n"
            ));
        }

        out.push_str("# HELP process_uptime_seconds Gateway process uptime.\n");
        out.push_str("# TYPE process_uptime_seconds gauge\n");
        out.push_str(&format!("process_uptime_seconds {}\n", self.started_at.elapsed().as_secs_f64()));

        out.push_str("# HELP process_active_requests Requests currently in flight.\n");
        out.push_str("# TYPE process_active_requests gauge\n");
        out.push_str(&format!("process_active_requests {}\n", self.active_requests.load(Ordering::Relaxed)));

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self {
            requests_total: RwLock::new(HashMap::new()),
            response_time: RwLock::new(HashMap::new()),
            breaker_state: RwLock::new(HashMap::new()),
            breaker_failures_total: RwLock::new(HashMap::new()),
            active_requests: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_request_and_renders_snapshot() {
        let registry = MetricsRegistry::new();
        registry.record_request("svc", "GET", 200, 0.02).await;
        let text = registry.snapshot_text().await;
        assert!(text.contains("api_requests_total{route=\"svc\",method=\"GET\",status_code=\"200\"} 1"));
        assert!(text.contains("api_response_time_seconds_bucket"));
    }

    #[tokio::test]
    async fn breaker_state_and_failures_render() {
        let registry = MetricsRegistry::new();
        registry.set_breaker_state("svc", CircuitState::Open).await;
        registry.record_breaker_failure("svc", "upstream_5xx").await;
        let text = registry.snapshot_text().await;
        assert!(text.contains("circuit_breaker_state{service_id=\"svc\"} 1"));
        assert!(text.contains("circuit_breaker_failures_total{service_id=\"svc\",error_type=\"upstream_5xx\"} 1"));
    }
}
