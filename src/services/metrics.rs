//! Per-backend request metrics: counts, latency percentiles, status-code
//! histograms and arbitrary string-labeled counters.
//!
//! This crate only accumulates and snapshots; rendering the snapshot as
//! Prometheus text, JSON, or anything else is an external exporter's job.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::events::{EventSink, ProxyEvent};

const LATENCY_WINDOW: usize = 100;
const MIN_SAMPLES_FOR_PERCENTILES: usize = 10;

#[derive(Debug, Default)]
struct BackendMetrics {
    request_count: u64,
    error_count: u64,
    last_latency: Duration,
    latencies: VecDeque<Duration>,
    status_codes: HashMap<u16, u64>,
    circuit_status: Option<String>,
    labels: HashMap<String, HashMap<String, u64>>,
}

impl BackendMetrics {
    fn record(&mut self, success: bool, latency: Duration, status_code: u16) {
        self.request_count += 1;
        if !success {
            self.error_count += 1;
        }
        self.last_latency = latency;
        *self.status_codes.entry(status_code).or_insert(0) += 1;

        self.latencies.push_back(latency);
        if self.latencies.len() > LATENCY_WINDOW {
            self.latencies.pop_front();
        }
    }

    fn percentiles(&self) -> Option<LatencyPercentiles> {
        if self.latencies.len() < MIN_SAMPLES_FOR_PERCENTILES {
            return None;
        }
        let mut sorted: Vec<f64> = self.latencies.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

        Some(LatencyPercentiles {
            p50: percentile_of(&sorted, 0.50),
            p90: percentile_of(&sorted, 0.90),
            p95: percentile_of(&sorted, 0.95),
            p99: percentile_of(&sorted, 0.99),
        })
    }
}

fn percentile_of(sorted: &[f64], p: f64) -> f64 {
    let rank = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[rank]
}

/// Latency percentiles in milliseconds, populated once a backend has
/// accumulated at least [`MIN_SAMPLES_FOR_PERCENTILES`] samples.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LatencyPercentiles {
    /// 50th percentile latency, in milliseconds.
    pub p50: f64,
    /// 90th percentile latency, in milliseconds.
    pub p90: f64,
    /// 95th percentile latency, in milliseconds.
    pub p95: f64,
    /// 99th percentile latency, in milliseconds.
    pub p99: f64,
}

/// Per-backend metrics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackendMetricsSnapshot {
    /// Total requests recorded.
    pub request_count: u64,
    /// Requests recorded as failures.
    pub error_count: u64,
    /// `error_count / request_count`, or 0 if no requests yet.
    pub error_rate: f64,
    /// Most recent request's latency, in milliseconds.
    pub latency_ms: f64,
    /// Status code → count histogram.
    pub status_codes: HashMap<u16, u64>,
    /// Most recently reported circuit breaker state name, if any.
    pub circuit_status: Option<String>,
    /// Latency percentiles, present once enough samples are in the window.
    pub latency_percentiles_ms: Option<LatencyPercentiles>,
    /// Arbitrary string-labeled counters (label name → value → count).
    pub metadata: Option<HashMap<String, HashMap<String, u64>>>,
}

/// Snapshot of every backend's metrics plus process uptime.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Seconds since the collector was constructed.
    pub uptime_seconds: u64,
    /// Per-backend metrics, keyed by backend id.
    pub backends: HashMap<String, BackendMetricsSnapshot>,
}

/// Accumulates request metrics across all backends.
///
/// A single `RwLock` guards every backend's map; writers take the write
/// lock, readers take the read lock and receive an owned copy so a snapshot
/// is always internally consistent.
pub struct MetricsCollector {
    started_at: Instant,
    backends: RwLock<HashMap<String, BackendMetrics>>,
}

impl MetricsCollector {
    /// Builds a collector with no backends recorded yet.
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            backends: RwLock::new(HashMap::new()),
        }
    }

    /// Records one completed request against `backend_id`.
    pub async fn record_request(
        &self,
        backend_id: &str,
        success: bool,
        latency: Duration,
        status_code: u16,
    ) {
        let mut backends = self.backends.write().await;
        backends
            .entry(backend_id.to_string())
            .or_default()
            .record(success, latency, status_code);
    }

    /// Records the current circuit breaker state string for `backend_id`,
    /// surfaced verbatim in the next snapshot.
    pub async fn set_circuit_status(&self, backend_id: &str, state: impl Into<String>) {
        let mut backends = self.backends.write().await;
        backends.entry(backend_id.to_string()).or_default().circuit_status = Some(state.into());
    }

    /// Increments an arbitrary string-valued label counter for `backend_id`.
    pub async fn record_label(&self, backend_id: &str, label: &str, value: &str) {
        let mut backends = self.backends.write().await;
        let metrics = backends.entry(backend_id.to_string()).or_default();
        *metrics
            .labels
            .entry(label.to_string())
            .or_default()
            .entry(value.to_string())
            .or_insert(0) += 1;
    }

    /// A consistent, point-in-time view of every backend's metrics.
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let backends = self.backends.read().await;
        let snapshot = backends
            .iter()
            .map(|(id, metrics)| {
                let error_rate = if metrics.request_count == 0 {
                    0.0
                } else {
                    metrics.error_count as f64 / metrics.request_count as f64
                };
                let metadata = if metrics.labels.is_empty() {
                    None
                } else {
                    Some(metrics.labels.clone())
                };
                (
                    id.clone(),
                    BackendMetricsSnapshot {
                        request_count: metrics.request_count,
                        error_count: metrics.error_count,
                        error_rate,
                        latency_ms: metrics.last_latency.as_secs_f64() * 1000.0,
                        status_codes: metrics.status_codes.clone(),
                        circuit_status: metrics.circuit_status.clone(),
                        latency_percentiles_ms: metrics.percentiles(),
                        metadata,
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            backends: snapshot,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Bridges circuit-breaker call events into labeled metrics counters.
///
/// Every `ProxyEvent::CircuitBreakerCall` becomes one `circuit_pre_call_state`
/// label increment against the call's backend, giving every `execute` call a
/// metrics sample independent of whether the caller later records a request
/// outcome through [`MetricsCollector::record_request`]. Other event kinds
/// are ignored here; they're for the externally-configured sink to handle.
pub struct MetricsEventSink {
    collector: Arc<MetricsCollector>,
}

impl MetricsEventSink {
    /// Builds a sink that feeds circuit-breaker call events into `collector`.
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self { collector }
    }
}

impl EventSink for MetricsEventSink {
    fn publish(&self, event: ProxyEvent) {
        if let ProxyEvent::CircuitBreakerCall {
            backend_id,
            pre_call_state,
        } = event
        {
            let collector = self.collector.clone();
            tokio::spawn(async move {
                collector
                    .record_label(&backend_id, "circuit_pre_call_state", &pre_call_state)
                    .await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_count_and_error_rate_accumulate() {
        let collector = MetricsCollector::new();
        collector
            .record_request("svc", true, Duration::from_millis(10), 200)
            .await;
        collector
            .record_request("svc", false, Duration::from_millis(20), 500)
            .await;

        let snapshot = collector.snapshot().await;
        let backend = &snapshot.backends["svc"];
        assert_eq!(backend.request_count, 2);
        assert_eq!(backend.error_count, 1);
        assert_eq!(backend.error_rate, 0.5);
        assert_eq!(backend.latency_ms, 20.0);
    }

    #[tokio::test]
    async fn percentiles_absent_below_minimum_sample_count() {
        let collector = MetricsCollector::new();
        for _ in 0..5 {
            collector
                .record_request("svc", true, Duration::from_millis(10), 200)
                .await;
        }
        let snapshot = collector.snapshot().await;
        assert!(snapshot.backends["svc"].latency_percentiles_ms.is_none());
    }

    #[tokio::test]
    async fn percentiles_present_at_minimum_sample_count() {
        let collector = MetricsCollector::new();
        for ms in 1..=10u64 {
            collector
                .record_request("svc", true, Duration::from_millis(ms), 200)
                .await;
        }
        let snapshot = collector.snapshot().await;
        let percentiles = snapshot.backends["svc"].latency_percentiles_ms.as_ref().unwrap();
        assert_eq!(percentiles.p50, 6.0);
        assert_eq!(percentiles.p99, 10.0);
    }

    #[tokio::test]
    async fn latency_window_evicts_oldest_sample_past_capacity() {
        let collector = MetricsCollector::new();
        for ms in 0..150u64 {
            collector
                .record_request("svc", true, Duration::from_millis(ms), 200)
                .await;
        }
        let backends = collector.backends.read().await;
        assert_eq!(backends["svc"].latencies.len(), LATENCY_WINDOW);
        assert_eq!(backends["svc"].latencies.front().copied().unwrap(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn status_code_histogram_counts_each_code() {
        let collector = MetricsCollector::new();
        collector.record_request("svc", true, Duration::ZERO, 200).await;
        collector.record_request("svc", true, Duration::ZERO, 200).await;
        collector.record_request("svc", false, Duration::ZERO, 503).await;

        let snapshot = collector.snapshot().await;
        assert_eq!(snapshot.backends["svc"].status_codes[&200], 2);
        assert_eq!(snapshot.backends["svc"].status_codes[&503], 1);
    }

    #[tokio::test]
    async fn metrics_event_sink_records_pre_call_state_as_a_label() {
        let collector = Arc::new(MetricsCollector::new());
        let sink = MetricsEventSink::new(collector.clone());

        sink.publish(ProxyEvent::CircuitBreakerCall {
            backend_id: "svc".into(),
            pre_call_state: "closed".into(),
        });
        sink.publish(ProxyEvent::CircuitBreakerCall {
            backend_id: "svc".into(),
            pre_call_state: "closed".into(),
        });

        // publish() spawns the recording onto the runtime; give it a moment
        // to land before reading the snapshot back.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snapshot = collector.snapshot().await;
        let metadata = snapshot.backends["svc"].metadata.as_ref().unwrap();
        assert_eq!(metadata["circuit_pre_call_state"]["closed"], 2);
    }

    #[tokio::test]
    async fn labels_are_grouped_by_name_then_value() {
        let collector = MetricsCollector::new();
        collector.record_label("svc", "tenant", "acme").await;
        collector.record_label("svc", "tenant", "acme").await;
        collector.record_label("svc", "tenant", "globex").await;

        let snapshot = collector.snapshot().await;
        let metadata = snapshot.backends["svc"].metadata.as_ref().unwrap();
        assert_eq!(metadata["tenant"]["acme"], 2);
        assert_eq!(metadata["tenant"]["globex"], 1);
    }
}
