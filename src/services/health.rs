//! Background health probing, decoupled from the circuit breaker by a thin
//! provider callback rather than a direct reference to a breaker registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::events::{noop_sink, ProxyEvent, SharedEventSink};
use crate::models::error::HealthCheckError;
use crate::utils::path::join_path_segment;

/// Per-backend configuration the checker needs to run its probe loop.
#[derive(Debug, Clone)]
pub struct BackendTarget {
    /// Backend base URL, e.g. `http://payments.internal:9000`.
    pub url: String,
    /// Overrides the global probe interval for this backend.
    pub interval: Option<Duration>,
    /// Overrides the global health endpoint (absolute URL or path) for this backend.
    pub health_endpoint: Option<String>,
    /// Whether this backend is probed at all.
    pub enabled: bool,
}

impl BackendTarget {
    /// A target with no per-backend overrides.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            interval: None,
            health_endpoint: None,
            enabled: true,
        }
    }
}

/// Global defaults applied to every backend that doesn't override them.
#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    /// Default tick interval between probes.
    pub interval: Duration,
    /// Timeout applied to each probe's HTTP call.
    pub probe_timeout: Duration,
    /// Status codes considered a passing probe.
    pub expected_status_codes: Vec<u16>,
    /// Default health endpoint (absolute URL or path) when a backend doesn't override it.
    pub health_endpoint: Option<String>,
    /// If a backend received live traffic more recently than this, the probe is
    /// skipped entirely and `checks_skipped` is incremented. Zero disables suppression.
    pub recent_request_threshold: Duration,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            expected_status_codes: vec![200],
            health_endpoint: Some("/health".to_string()),
            recent_request_threshold: Duration::ZERO,
        }
    }
}

/// Circuit breaker signal for one backend, as seen by the health checker.
#[derive(Debug, Clone)]
pub struct CircuitSignal {
    /// True if the breaker is currently Open.
    pub open: bool,
    /// Lowercase state name (`"closed"`, `"open"`, `"half_open"`).
    pub state: String,
    /// Current failure count.
    pub failures: u64,
}

/// Callback the checker consults to fold circuit-breaker state into `healthy`,
/// without owning a reference to whatever registry produces it.
pub type CbProvider = Arc<dyn Fn(&str) -> Option<CircuitSignal> + Send + Sync>;

/// Point-in-time health view of one backend.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    /// Backend id.
    pub backend_id: String,
    /// Backend base URL.
    pub url: String,
    /// `health_check_passing && !circuit_breaker_open`.
    pub healthy: bool,
    /// Timestamp of the most recent probe attempt, as milliseconds since start.
    #[serde(skip)]
    pub last_check: Option<Instant>,
    /// Timestamp of the most recent successful probe.
    #[serde(skip)]
    pub last_success: Option<Instant>,
    /// Most recent probe error, if any.
    pub last_error: Option<String>,
    /// Duration of the most recent probe's HTTP call.
    pub response_time: Option<Duration>,
    /// Whether the most recent DNS resolution succeeded.
    pub dns_resolved: bool,
    /// IPs resolved for the backend host during the most recent probe.
    pub resolved_ips: Vec<String>,
    /// Timestamp of the most recent live request the checker was told about.
    #[serde(skip)]
    pub last_request: Option<Instant>,
    /// Number of probes skipped due to `recent_request_threshold` suppression.
    pub checks_skipped: u64,
    /// Total probes attempted (excludes skipped).
    pub total_checks: u64,
    /// Probes that passed both DNS and HTTP stages.
    pub successful_checks: u64,
    /// Whether this backend's circuit breaker is currently Open.
    pub circuit_breaker_open: bool,
    /// This backend's circuit breaker state name.
    pub circuit_breaker_state: String,
    /// This backend's circuit breaker failure count.
    pub circuit_failure_count: u64,
    /// Result of the most recent probe alone, ignoring circuit breaker state.
    pub health_check_passing: bool,
}

impl HealthStatus {
    fn new(backend_id: String, url: String) -> Self {
        Self {
            backend_id,
            url,
            healthy: false,
            last_check: None,
            last_success: None,
            last_error: None,
            response_time: None,
            dns_resolved: false,
            resolved_ips: Vec::new(),
            last_request: None,
            checks_skipped: 0,
            total_checks: 0,
            successful_checks: 0,
            circuit_breaker_open: false,
            circuit_breaker_state: "closed".to_string(),
            circuit_failure_count: 0,
            health_check_passing: false,
        }
    }
}

/// Aggregate health across every registered backend.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OverallHealthStatus {
    /// `total_backends > 0 && healthy_backends == total_backends`.
    pub healthy: bool,
    /// Number of registered backends.
    pub total_backends: usize,
    /// Number of currently healthy backends.
    pub healthy_backends: usize,
    /// Number of currently unhealthy backends.
    pub unhealthy_backends: usize,
    /// Number of backends whose circuit breaker is Open.
    pub circuit_open_count: usize,
    /// Most recent probe timestamp across all backends, as elapsed seconds.
    #[serde(skip)]
    pub last_check: Option<Instant>,
}

/// Concurrently probes every registered backend and exposes per-backend and
/// aggregate health snapshots.
///
/// One cooperative worker per backend; all share a single stop signal that's
/// recreated each time `start` is called, so `start`/`stop` are idempotent
/// and safely re-entrant.
pub struct HealthChecker {
    targets: RwLock<HashMap<String, BackendTarget>>,
    statuses: RwLock<HashMap<String, HealthStatus>>,
    config: HealthCheckerConfig,
    client: reqwest::Client,
    cb_provider: RwLock<Option<CbProvider>>,
    events: SharedEventSink,
    stop_tx: RwLock<Option<watch::Sender<bool>>>,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
    running: AtomicBool,
}

impl HealthChecker {
    /// Builds a checker for `targets`, not yet started.
    pub fn new(targets: HashMap<String, BackendTarget>, config: HealthCheckerConfig) -> Arc<Self> {
        Self::with_event_sink(targets, config, noop_sink())
    }

    /// Builds a checker that publishes `BackendHealthy`/`BackendUnhealthy` transitions to `events`.
    pub fn with_event_sink(
        targets: HashMap<String, BackendTarget>,
        config: HealthCheckerConfig,
        events: SharedEventSink,
    ) -> Arc<Self> {
        let statuses = targets
            .iter()
            .map(|(id, t)| (id.clone(), HealthStatus::new(id.clone(), t.url.clone())))
            .collect();

        Arc::new(Self {
            targets: RwLock::new(targets),
            statuses: RwLock::new(statuses),
            config,
            client: reqwest::Client::new(),
            cb_provider: RwLock::new(None),
            events,
            stop_tx: RwLock::new(None),
            workers: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Installs the circuit-breaker provider callback. Must not block.
    pub async fn set_cb_provider(&self, provider: CbProvider) {
        *self.cb_provider.write().await = Some(provider);
    }

    /// Starts one worker per currently-registered backend. Idempotent: calling
    /// `start` while already running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let (tx, _) = watch::channel(false);
        *self.stop_tx.write().await = Some(tx.clone());

        let ids: Vec<String> = self.targets.read().await.keys().cloned().collect();
        for id in ids {
            self.spawn_worker(id, tx.subscribe()).await;
        }
    }

    /// Signals every worker to stop and waits for them to exit. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(tx) = self.stop_tx.write().await.take() {
            let _ = tx.send(true);
        }
        let mut workers = self.workers.lock().await;
        for (_, handle) in workers.drain() {
            let _ = handle.await;
        }
    }

    async fn spawn_worker(self: &Arc<Self>, id: String, mut stop_rx: watch::Receiver<bool>) {
        let checker = self.clone();
        let worker_id = id.clone();
        let handle = tokio::spawn(async move {
            loop {
                let interval = checker
                    .targets
                    .read()
                    .await
                    .get(&worker_id)
                    .and_then(|t| t.interval)
                    .unwrap_or(checker.config.interval);

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        checker.probe_once(&worker_id).await;
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        self.workers.lock().await.insert(id, handle);
    }

    /// Adds, removes or updates registered backends. Existing entries keep
    /// their accumulated status history; removed backends stop being probed
    /// and their status entry is dropped.
    pub async fn update_backends(self: &Arc<Self>, new_targets: HashMap<String, BackendTarget>) {
        let newly_added: Vec<String> = {
            let mut targets = self.targets.write().await;
            let mut statuses = self.statuses.write().await;
            let mut workers = self.workers.lock().await;

            let removed: Vec<String> = targets
                .keys()
                .filter(|id| !new_targets.contains_key(*id))
                .cloned()
                .collect();
            for id in &removed {
                targets.remove(id);
                statuses.remove(id);
                if let Some(handle) = workers.remove(id) {
                    handle.abort();
                }
            }

            let mut newly_added = Vec::new();
            for (id, target) in new_targets {
                if !targets.contains_key(&id) {
                    statuses
                        .entry(id.clone())
                        .or_insert_with(|| HealthStatus::new(id.clone(), target.url.clone()));
                    newly_added.push(id.clone());
                }
                targets.insert(id, target);
            }
            newly_added
        };

        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let stop_rx = self.stop_tx.read().await.as_ref().map(|tx| tx.subscribe());
        if let Some(stop_rx) = stop_rx {
            for id in newly_added {
                self.spawn_worker(id, stop_rx.clone()).await;
            }
        }
    }

    /// Tells the checker a live request just hit `backend_id`, for
    /// recent-request suppression.
    pub async fn record_backend_request(&self, backend_id: &str) {
        if let Some(status) = self.statuses.write().await.get_mut(backend_id) {
            status.last_request = Some(Instant::now());
        }
    }

    async fn probe_once(&self, backend_id: &str) {
        let target = match self.targets.read().await.get(backend_id).cloned() {
            Some(t) => t,
            None => return,
        };

        if !self.config.recent_request_threshold.is_zero() {
            let recently_live = {
                let statuses = self.statuses.read().await;
                statuses
                    .get(backend_id)
                    .and_then(|s| s.last_request)
                    .is_some_and(|t| t.elapsed() < self.config.recent_request_threshold)
            };
            if recently_live {
                if let Some(status) = self.statuses.write().await.get_mut(backend_id) {
                    status.checks_skipped += 1;
                }
                return;
            }
        }

        if !target.enabled {
            return;
        }

        {
            let mut statuses = self.statuses.write().await;
            if let Some(status) = statuses.get_mut(backend_id) {
                status.total_checks += 1;
            }
        }

        let probe_url = self.resolve_probe_url(&target);
        let host = reqwest::Url::parse(&target.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));

        let dns_result = match &host {
            Some(h) => resolve_host(h).await,
            None => Err(HealthCheckError::Dns {
                host: target.url.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "no hostname in URL"),
            }),
        };

        let (dns_ok, resolved_ips, dns_error) = match dns_result {
            Ok(ips) => (true, ips, None),
            Err(e) => (false, Vec::new(), Some(e.to_string())),
        };

        let started = Instant::now();
        let http_result = if dns_ok {
            self.probe_http(&probe_url).await
        } else {
            Err(dns_error.clone().unwrap_or_default())
        };
        let response_time = started.elapsed();

        let was_healthy = self
            .statuses
            .read()
            .await
            .get(backend_id)
            .map(|s| s.healthy)
            .unwrap_or(false);

        {
            let mut statuses = self.statuses.write().await;
            if let Some(status) = statuses.get_mut(backend_id) {
                status.last_check = Some(Instant::now());
                status.response_time = Some(response_time);
                status.dns_resolved = dns_ok;
                status.resolved_ips = resolved_ips;
                status.health_check_passing = dns_ok && http_result.is_ok();
                match &http_result {
                    Ok(()) => {
                        status.last_success = Some(Instant::now());
                        status.successful_checks += 1;
                        status.last_error = None;
                    }
                    Err(e) => {
                        status.last_error = Some(e.clone());
                    }
                }
            }
        }

        self.refresh_cb_signal(backend_id).await;

        let is_healthy = self
            .statuses
            .read()
            .await
            .get(backend_id)
            .map(|s| s.healthy)
            .unwrap_or(false);

        if is_healthy != was_healthy {
            let event = if is_healthy {
                ProxyEvent::BackendHealthy {
                    backend_id: backend_id.to_string(),
                }
            } else {
                ProxyEvent::BackendUnhealthy {
                    backend_id: backend_id.to_string(),
                }
            };
            self.events.publish(event);
        }
    }

    fn resolve_probe_url(&self, target: &BackendTarget) -> String {
        let endpoint = match target
            .health_endpoint
            .clone()
            .or_else(|| self.config.health_endpoint.clone())
        {
            Some(endpoint) => endpoint,
            // Neither a per-backend nor a global endpoint is configured: probe
            // the base URL itself.
            None => return target.url.clone(),
        };

        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint
        } else {
            join_path_segment(&target.url, &endpoint)
        }
    }

    async fn probe_http(&self, url: &str) -> Result<(), String> {
        let response = tokio::time::timeout(
            self.config.probe_timeout,
            self.client
                .get(url)
                .header("User-Agent", "modular-reverseproxy-health-check/1.0")
                .header("Accept", "*/*")
                .send(),
        )
        .await
        .map_err(|_| "probe timed out".to_string())?
        .map_err(|e| e.to_string())?;

        let status = response.status().as_u16();
        if self.config.expected_status_codes.contains(&status) {
            Ok(())
        } else {
            Err(HealthCheckError::UnexpectedStatusCode(status).to_string())
        }
    }

    async fn refresh_cb_signal(&self, backend_id: &str) {
        let signal = match self.cb_provider.read().await.as_ref() {
            Some(provider) => provider(backend_id),
            None => None,
        };
        let mut statuses = self.statuses.write().await;
        if let Some(status) = statuses.get_mut(backend_id) {
            if let Some(signal) = signal {
                status.circuit_breaker_open = signal.open;
                status.circuit_breaker_state = signal.state;
                status.circuit_failure_count = signal.failures;
            }
            status.healthy = status.health_check_passing && !status.circuit_breaker_open;
        }
    }

    /// Snapshot of every backend's health.
    pub async fn get_status(&self) -> HashMap<String, HealthStatus> {
        self.statuses.read().await.clone()
    }

    /// Snapshot of a single backend's health, if registered.
    pub async fn get_backend_status(&self, backend_id: &str) -> Option<HealthStatus> {
        self.statuses.read().await.get(backend_id).cloned()
    }

    /// Aggregate health across all registered backends.
    pub async fn get_overall(&self) -> OverallHealthStatus {
        let statuses = self.statuses.read().await;
        let total = statuses.len();
        let healthy = statuses.values().filter(|s| s.healthy).count();
        let circuit_open = statuses.values().filter(|s| s.circuit_breaker_open).count();
        let last_check = statuses.values().filter_map(|s| s.last_check).max();

        OverallHealthStatus {
            healthy: total > 0 && healthy == total,
            total_backends: total,
            healthy_backends: healthy,
            unhealthy_backends: total - healthy,
            circuit_open_count: circuit_open,
            last_check,
        }
    }
}

async fn resolve_host(host: &str) -> Result<Vec<String>, HealthCheckError> {
    let lookup_target = format!("{host}:0");
    tokio::net::lookup_host(&lookup_target)
        .await
        .map(|addrs| addrs.map(|a| a.ip().to_string()).collect())
        .map_err(|source| HealthCheckError::Dns {
            host: host.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn overall_health_is_true_only_when_every_backend_is_healthy() {
        let mut targets = HashMap::new();
        targets.insert("a".to_string(), BackendTarget::new("http://a"));
        targets.insert("b".to_string(), BackendTarget::new("http://b"));
        let checker = HealthChecker::new(targets, HealthCheckerConfig::default());

        {
            let mut statuses = checker.statuses.write().await;
            statuses.get_mut("a").unwrap().healthy = true;
            statuses.get_mut("b").unwrap().healthy = false;
        }
        let overall = checker.get_overall().await;
        assert!(!overall.healthy);
        assert_eq!(overall.healthy_backends, 1);
        assert_eq!(overall.total_backends, 2);

        checker.statuses.write().await.get_mut("b").unwrap().healthy = true;
        assert!(checker.get_overall().await.healthy);
    }

    #[tokio::test]
    async fn empty_checker_reports_unhealthy_overall() {
        let checker = HealthChecker::new(HashMap::new(), HealthCheckerConfig::default());
        let overall = checker.get_overall().await;
        assert!(!overall.healthy);
        assert_eq!(overall.total_backends, 0);
    }

    #[tokio::test]
    async fn recent_request_suppresses_the_probe() {
        let mut targets = HashMap::new();
        targets.insert("a".to_string(), BackendTarget::new("http://a"));
        let checker = HealthChecker::new(
            targets,
            HealthCheckerConfig {
                recent_request_threshold: Duration::from_secs(60),
                ..Default::default()
            },
        );
        checker.record_backend_request("a").await;
        checker.probe_once("a").await;

        let status = checker.get_backend_status("a").await.unwrap();
        assert_eq!(status.checks_skipped, 1);
        assert_eq!(status.total_checks, 0);
    }

    #[tokio::test]
    async fn dns_failure_marks_health_check_not_passing() {
        let mut targets = HashMap::new();
        targets.insert(
            "a".to_string(),
            BackendTarget::new("http://this-host-does-not-resolve.invalid"),
        );
        let checker = HealthChecker::new(targets, HealthCheckerConfig::default());
        checker.probe_once("a").await;

        let status = checker.get_backend_status("a").await.unwrap();
        assert!(!status.dns_resolved);
        assert!(!status.health_check_passing);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn healthy_requires_both_probe_and_open_circuit_to_be_clear() {
        let mut targets = HashMap::new();
        targets.insert("a".to_string(), BackendTarget::new("http://a"));
        let checker = HealthChecker::new(targets, HealthCheckerConfig::default());

        checker
            .set_cb_provider(Arc::new(|_id: &str| {
                Some(CircuitSignal {
                    open: true,
                    state: "open".to_string(),
                    failures: 5,
                })
            }))
            .await;

        {
            let mut statuses = checker.statuses.write().await;
            statuses.get_mut("a").unwrap().health_check_passing = true;
        }
        checker.refresh_cb_signal("a").await;

        let status = checker.get_backend_status("a").await.unwrap();
        assert!(!status.healthy);
        assert!(status.circuit_breaker_open);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let called = Arc::new(AtomicUsize::new(0));
        let _ = called.clone();
        let mut targets = HashMap::new();
        targets.insert(
            "a".to_string(),
            BackendTarget {
                url: "http://127.0.0.1:1".to_string(),
                interval: Some(Duration::from_secs(3600)),
                health_endpoint: None,
                enabled: true,
            },
        );
        let checker = HealthChecker::new(targets, HealthCheckerConfig::default());
        checker.start().await;
        checker.start().await;
        checker.stop().await;
        checker.stop().await;
    }
}
