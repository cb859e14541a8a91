//! Resolves (tenant, path) to a route, applies feature-flag gating and
//! tenant overlays, and dispatches to the matching handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::events::{noop_sink, FanOutEventSink, SharedEventSink};
use crate::models::error::{ProxyError, RouterError};
use crate::models::router::{Backend, RouteConfig, RouteKind, TenantOverlay};
use crate::services::cache::ResponseCache;
use crate::services::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot};
use crate::services::composite::CompositeHandler;
use crate::services::dryrun::DryRunHandler;
use crate::services::metrics::{MetricsCollector, MetricsEventSink};
use crate::services::proxy::{ProxyRequest, ProxyResponse, SingleBackendProxy};
use crate::utils::route_matcher::RouteMatcher;

const DEFAULT_TENANT_HEADER: &str = "X-Tenant-ID";

/// Evaluates a feature flag for a request. Total and side-effect-free from
/// the dispatcher's perspective.
pub type FlagEvaluator = Arc<dyn Fn(&str, &ProxyRequest) -> bool + Send + Sync>;

fn default_flag_evaluator() -> FlagEvaluator {
    Arc::new(|_flag_id, _req| true)
}

/// Per-backend-id circuit breakers, lazily created on first use and shared
/// across every request and tenant that references that backend id.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
    events: SharedEventSink,
}

impl CircuitBreakerRegistry {
    fn new(config: CircuitBreakerConfig, events: SharedEventSink) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
            events,
        }
    }

    async fn get_or_create(&self, backend_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().await.get(backend_id) {
            return existing.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(backend_id.to_string())
            .or_insert_with(|| {
                CircuitBreaker::with_event_sink(backend_id.to_string(), self.config.clone(), self.events.clone())
            })
            .clone()
    }

    /// Satisfies the `/debug/circuit-breakers` reporting contract.
    pub async fn snapshot(&self) -> HashMap<String, CircuitBreakerSnapshot> {
        self.breakers
            .read()
            .await
            .iter()
            .map(|(id, breaker)| (id.clone(), breaker.snapshot()))
            .collect()
    }
}

/// Static facts about the registered routing configuration.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DebugInfo {
    /// Number of globally registered routes.
    pub route_count: usize,
    /// Number of registered tenant overlays.
    pub tenant_count: usize,
    /// Number of globally registered backends.
    pub backend_count: usize,
}

/// One backend's identity, for the `/debug/backends` reporting surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackendDebugView {
    /// Backend id.
    pub id: String,
    /// Backend base URL.
    pub url: String,
}

/// Everything needed to construct a [`Dispatcher`].
pub struct DispatcherConfig {
    /// Header carrying the tenant id; defaults to `X-Tenant-ID`.
    pub tenant_header: Option<String>,
    /// Globally registered backends, keyed by id.
    pub backends: Vec<Backend>,
    /// Globally registered routes.
    pub routes: Vec<RouteConfig>,
    /// Backend used when no route matches the request path.
    pub default_backend_id: Option<String>,
    /// Circuit breaker configuration applied to every backend id.
    pub circuit_breaker_config: CircuitBreakerConfig,
    /// Shared response cache for composite routes; `None` disables caching.
    pub cache: Option<Arc<ResponseCache>>,
    /// External feature-flag evaluator; defaults to "always enabled".
    pub flag_evaluator: Option<FlagEvaluator>,
    /// Observability sink for circuit breaker state transitions.
    pub events: Option<SharedEventSink>,
}

/// Resolves an inbound request to a route and dispatches it to the matching
/// handler, applying tenant overlays and feature-flag gating along the way.
pub struct Dispatcher {
    tenant_header: String,
    global_backends: HashMap<String, Backend>,
    global_routes: Vec<RouteConfig>,
    global_route_matcher: RouteMatcher<RouteConfig>,
    default_backend_id: Option<String>,
    tenant_overlays: RwLock<HashMap<String, TenantOverlay>>,
    circuit_breakers: CircuitBreakerRegistry,
    pub metrics: Arc<MetricsCollector>,
    cache: Option<Arc<ResponseCache>>,
    flag_evaluator: FlagEvaluator,
}

impl Dispatcher {
    /// Builds a dispatcher from `config`. Fails if any route pattern is malformed.
    pub fn new(config: DispatcherConfig) -> Result<Self, RouterError> {
        let global_backends = config
            .backends
            .into_iter()
            .map(|b| (b.id.clone(), b))
            .collect::<HashMap<_, _>>();

        let global_route_matcher = RouteMatcher::new(
            config
                .routes
                .iter()
                .map(|r| (r.pattern.clone(), r.clone()))
                .collect(),
        )
        .map_err(|e| RouterError::InvalidPattern(e.to_string()))?;

        let external_events = config.events.unwrap_or_else(noop_sink);
        let metrics = Arc::new(MetricsCollector::new());
        let metrics_sink: SharedEventSink = Arc::new(MetricsEventSink::new(metrics.clone()));
        let events: SharedEventSink = Arc::new(FanOutEventSink::new(vec![external_events, metrics_sink]));

        Ok(Self {
            tenant_header: config.tenant_header.unwrap_or_else(|| DEFAULT_TENANT_HEADER.to_string()),
            global_backends,
            global_routes: config.routes,
            global_route_matcher,
            default_backend_id: config.default_backend_id,
            tenant_overlays: RwLock::new(HashMap::new()),
            circuit_breakers: CircuitBreakerRegistry::new(config.circuit_breaker_config, events),
            metrics,
            cache: config.cache,
            flag_evaluator: config.flag_evaluator.unwrap_or_else(default_flag_evaluator),
        })
    }

    /// Registers (or replaces) a tenant's overlay.
    pub async fn register_tenant(&self, overlay: TenantOverlay) {
        self.tenant_overlays
            .write()
            .await
            .insert(overlay.tenant_id.clone(), overlay);
    }

    /// Removes a tenant's overlay, if any.
    pub async fn unregister_tenant(&self, tenant_id: &str) {
        self.tenant_overlays.write().await.remove(tenant_id);
    }

    /// This dispatcher's circuit breaker registry.
    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.circuit_breakers
    }

    /// Resolves and dispatches `req`.
    pub async fn dispatch(&self, req: &ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let tenant_id = find_header(&req.headers, &self.tenant_header);
        let overlay = match &tenant_id {
            Some(id) => self.tenant_overlays.read().await.get(id).cloned(),
            None => None,
        };

        let mut route = self.find_route(&req.path, overlay.as_ref())?;

        if let Some(flag_id) = route.feature_flag_id.clone() {
            if !flag_id.is_empty() && !(self.flag_evaluator)(&flag_id, req) {
                match &route.alternative_backend {
                    Some(backend_id) => {
                        route = RouteConfig {
                            pattern: route.pattern.clone(),
                            kind: RouteKind::Simple {
                                backend_id: backend_id.clone(),
                            },
                            feature_flag_id: None,
                            alternative_backend: None,
                            retry: route.retry.clone(),
                        };
                    }
                    None => {
                        return Err(ProxyError::RouteNotFound {
                            path: req.path.clone(),
                        })
                    }
                }
            }
        }

        let backends = self.effective_backends(overlay.as_ref());
        let started = Instant::now();
        let result = self.dispatch_route(&route, &backends, req).await;
        self.record_metrics(&route, &result, started.elapsed()).await;
        result
    }

    async fn dispatch_route(
        &self,
        route: &RouteConfig,
        backends: &HashMap<String, Backend>,
        req: &ProxyRequest,
    ) -> Result<ProxyResponse, ProxyError> {
        match &route.kind {
            RouteKind::Simple { backend_id } => {
                let backend = resolve_backend(backend_id, backends)?;
                let breaker = self.circuit_breakers.get_or_create(backend_id).await;
                let proxy = SingleBackendProxy::new(backend, breaker, route.retry.clone());
                proxy.forward(req).await
            }
            RouteKind::Composite(composite) => {
                let mut proxies = Vec::with_capacity(composite.backends.len());
                for backend_id in &composite.backends {
                    let backend = resolve_backend(backend_id, backends)?;
                    let breaker = self.circuit_breakers.get_or_create(backend_id).await;
                    proxies.push(Arc::new(SingleBackendProxy::new(backend, breaker, None)));
                }
                let handler = CompositeHandler::new(
                    proxies,
                    composite.parallel,
                    composite.timeout,
                    self.cache.clone(),
                );
                handler.handle(req).await
            }
            RouteKind::DryRun(dry_run) => {
                let primary = resolve_backend(&dry_run.primary_id, backends)?;
                let secondary = resolve_backend(&dry_run.secondary_id, backends)?;
                let primary_breaker = self.circuit_breakers.get_or_create(&dry_run.primary_id).await;
                let secondary_breaker = self.circuit_breakers.get_or_create(&dry_run.secondary_id).await;
                let handler = DryRunHandler::new(
                    Arc::new(SingleBackendProxy::new(primary, primary_breaker, None)),
                    Arc::new(SingleBackendProxy::new(secondary, secondary_breaker, None)),
                    dry_run.default_response_backend,
                    dry_run.log_responses,
                    dry_run.max_response_size,
                );
                handler.handle(req).await
            }
        }
    }

    async fn record_metrics(
        &self,
        route: &RouteConfig,
        result: &Result<ProxyResponse, ProxyError>,
        latency: std::time::Duration,
    ) {
        let label = match &route.kind {
            RouteKind::Simple { backend_id } => backend_id.clone(),
            RouteKind::Composite(_) => format!("composite:{}", route.pattern),
            RouteKind::DryRun(_) => format!("dryrun:{}", route.pattern),
        };
        let (success, status) = match result {
            Ok(response) => (response.status < 500, response.status),
            Err(e) => (false, e.status_code()),
        };
        self.metrics.record_request(&label, success, latency, status).await;

        if let RouteKind::Simple { backend_id } = &route.kind {
            let state = self.circuit_breakers.get_or_create(backend_id).await.get_state();
            self.metrics.set_circuit_status(backend_id, state.as_str()).await;
        }
    }

    fn find_route(&self, path: &str, overlay: Option<&TenantOverlay>) -> Result<RouteConfig, ProxyError> {
        let needs_merge = overlay.is_some_and(|o| {
            !o.routes.is_empty() || !o.composite_routes.is_empty() || !o.route_configs.is_empty()
        });

        let matched = if needs_merge {
            let merged = self.merge_route_configs(overlay.unwrap());
            let matcher = RouteMatcher::new(merged)
                .map_err(|e| ProxyError::Internal(format!("tenant overlay produced an invalid route pattern: {e}")))?;
            matcher.find_match(path)
        } else {
            self.global_route_matcher.find_match(path)
        };

        match matched {
            Ok(route) => Ok(route),
            Err(_) => match &self.default_backend_id {
                Some(backend_id) => Ok(RouteConfig {
                    pattern: path.to_string(),
                    kind: RouteKind::Simple {
                        backend_id: backend_id.clone(),
                    },
                    feature_flag_id: None,
                    alternative_backend: None,
                    retry: None,
                }),
                None => Err(ProxyError::RouteNotFound { path: path.to_string() }),
            },
        }
    }

    fn merge_route_configs(&self, overlay: &TenantOverlay) -> Vec<(String, RouteConfig)> {
        let mut merged: HashMap<String, RouteConfig> = self
            .global_routes
            .iter()
            .map(|r| (r.pattern.clone(), r.clone()))
            .collect();

        for (pattern, backend_id) in &overlay.routes {
            merged.insert(
                pattern.clone(),
                RouteConfig {
                    pattern: pattern.clone(),
                    kind: RouteKind::Simple {
                        backend_id: backend_id.clone(),
                    },
                    feature_flag_id: None,
                    alternative_backend: None,
                    retry: None,
                },
            );
        }
        for (pattern, composite) in &overlay.composite_routes {
            merged.insert(
                pattern.clone(),
                RouteConfig {
                    pattern: pattern.clone(),
                    kind: RouteKind::Composite(composite.clone()),
                    feature_flag_id: None,
                    alternative_backend: None,
                    retry: None,
                },
            );
        }
        for (pattern, route_config) in &overlay.route_configs {
            merged.insert(pattern.clone(), route_config.clone());
        }

        merged.into_iter().collect()
    }

    fn effective_backends(&self, overlay: Option<&TenantOverlay>) -> HashMap<String, Backend> {
        let mut backends = self.global_backends.clone();
        if let Some(overlay) = overlay {
            for (backend_id, url) in &overlay.backend_services {
                backends.insert(backend_id.clone(), Backend::with_default_client(backend_id.clone(), url.clone()));
            }
        }
        backends
    }

    /// Route/tenant/backend counts, for the `/debug/info` reporting surface.
    pub async fn debug_info(&self) -> DebugInfo {
        DebugInfo {
            route_count: self.global_routes.len(),
            tenant_count: self.tenant_overlays.read().await.len(),
            backend_count: self.global_backends.len(),
        }
    }

    /// Identity of every globally registered backend.
    pub fn debug_backends(&self) -> Vec<BackendDebugView> {
        self.global_backends
            .values()
            .map(|b| BackendDebugView {
                id: b.id.clone(),
                url: b.url.clone(),
            })
            .collect()
    }

    /// Flag ids referenced by any registered route.
    pub fn debug_flags(&self) -> Vec<String> {
        self.global_routes
            .iter()
            .filter_map(|r| r.feature_flag_id.clone())
            .collect()
    }
}

fn resolve_backend(id: &str, backends: &HashMap<String, Backend>) -> Result<Backend, ProxyError> {
    backends
        .get(id)
        .cloned()
        .ok_or_else(|| ProxyError::BackendServiceNotFound {
            backend_id: id.to_string(),
        })
}

fn find_header(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::router::{CompositeRoute, DryRunArm, DryRunRoute};
    use std::time::Duration;

    fn req(path: &str, tenant: Option<&str>) -> ProxyRequest {
        let mut headers = vec![];
        if let Some(t) = tenant {
            headers.push(("X-Tenant-ID".to_string(), t.to_string()));
        }
        ProxyRequest {
            method: reqwest::Method::GET,
            path: path.to_string(),
            query: None,
            headers,
            host: "client.example".to_string(),
            body: vec![],
        }
    }

    fn dispatcher_with_routes(routes: Vec<RouteConfig>) -> Dispatcher {
        Dispatcher::new(DispatcherConfig {
            tenant_header: None,
            backends: vec![
                Backend::with_default_client("a", "http://127.0.0.1:1"),
                Backend::with_default_client("b", "http://127.0.0.1:1"),
            ],
            routes,
            default_backend_id: None,
            circuit_breaker_config: CircuitBreakerConfig::default(),
            cache: None,
            flag_evaluator: None,
            events: None,
        })
        .unwrap()
    }

    fn simple_route(pattern: &str, backend_id: &str) -> RouteConfig {
        RouteConfig {
            pattern: pattern.to_string(),
            kind: RouteKind::Simple {
                backend_id: backend_id.to_string(),
            },
            feature_flag_id: None,
            alternative_backend: None,
            retry: None,
        }
    }

    #[tokio::test]
    async fn unmatched_path_without_default_backend_is_404() {
        let dispatcher = dispatcher_with_routes(vec![simple_route("/api/a", "a")]);
        let result = dispatcher.dispatch(&req("/nope", None)).await;
        assert!(matches!(result, Err(ProxyError::RouteNotFound { .. })));
    }

    #[tokio::test]
    async fn feature_flag_false_routes_to_alternative_backend() {
        let mut route = simple_route("/api/a", "a");
        route.feature_flag_id = Some("new-flow".to_string());
        route.alternative_backend = Some("b".to_string());

        let dispatcher = Dispatcher::new(DispatcherConfig {
            tenant_header: None,
            backends: vec![
                Backend::with_default_client("a", "http://127.0.0.1:1"),
                Backend::with_default_client("b", "http://127.0.0.1:1"),
            ],
            routes: vec![route],
            default_backend_id: None,
            circuit_breaker_config: CircuitBreakerConfig::default(),
            cache: None,
            flag_evaluator: Some(Arc::new(|_flag, _req| false)),
            events: None,
        })
        .unwrap();

        // Both "a" and "b" are unreachable; what matters is that dispatch
        // gets far enough to attempt "b" rather than bailing out before
        // the alternative backend substitution runs.
        let result = dispatcher.dispatch(&req("/api/a", None)).await;
        assert!(result.is_err());
        assert!(!matches!(result, Err(ProxyError::RouteNotFound { .. })));
    }

    #[tokio::test]
    async fn feature_flag_false_without_alternative_is_404() {
        let mut route = simple_route("/api/a", "a");
        route.feature_flag_id = Some("new-flow".to_string());

        let dispatcher = Dispatcher::new(DispatcherConfig {
            tenant_header: None,
            backends: vec![Backend::with_default_client("a", "http://127.0.0.1:1")],
            routes: vec![route],
            default_backend_id: None,
            circuit_breaker_config: CircuitBreakerConfig::default(),
            cache: None,
            flag_evaluator: Some(Arc::new(|_flag, _req| false)),
            events: None,
        })
        .unwrap();

        let result = dispatcher.dispatch(&req("/api/a", None)).await;
        assert!(matches!(result, Err(ProxyError::RouteNotFound { .. })));
    }

    #[tokio::test]
    async fn tenant_overlay_route_overrides_global_backend_choice() {
        let dispatcher = dispatcher_with_routes(vec![simple_route("/api/a", "a")]);
        let mut overlay = TenantOverlay::empty("acme");
        overlay.routes.insert("/api/a".to_string(), "b".to_string());
        dispatcher.register_tenant(overlay).await;

        let route = dispatcher
            .find_route("/api/a", dispatcher.tenant_overlays.read().await.get("acme"))
            .unwrap();
        assert!(matches!(route.kind, RouteKind::Simple { backend_id } if backend_id == "b"));
    }

    #[tokio::test]
    async fn missing_backend_for_a_route_is_backend_service_not_found() {
        let dispatcher = dispatcher_with_routes(vec![simple_route("/api/missing", "ghost")]);
        let result = dispatcher.dispatch(&req("/api/missing", None)).await;
        assert!(matches!(result, Err(ProxyError::BackendServiceNotFound { .. })));
    }

    #[tokio::test]
    async fn composite_and_dryrun_routes_are_dispatchable_without_panicking() {
        let composite_route = RouteConfig {
            pattern: "/api/composite".to_string(),
            kind: RouteKind::Composite(CompositeRoute {
                backends: vec!["a".to_string(), "b".to_string()],
                parallel: true,
                timeout: Duration::from_millis(200),
                cache_ttl: None,
            }),
            feature_flag_id: None,
            alternative_backend: None,
            retry: None,
        };
        let dry_run_route = RouteConfig {
            pattern: "/api/dryrun".to_string(),
            kind: RouteKind::DryRun(DryRunRoute {
                primary_id: "a".to_string(),
                secondary_id: "b".to_string(),
                default_response_backend: DryRunArm::Primary,
                log_responses: false,
                max_response_size: 1024,
            }),
            feature_flag_id: None,
            alternative_backend: None,
            retry: None,
        };
        let dispatcher = dispatcher_with_routes(vec![composite_route, dry_run_route]);

        let composite_result = dispatcher.dispatch(&req("/api/composite", None)).await;
        assert!(matches!(composite_result, Err(ProxyError::NoSuccessfulResponses)));

        let dryrun_result = dispatcher.dispatch(&req("/api/dryrun", None)).await;
        assert!(dryrun_result.is_err());
    }

    #[tokio::test]
    async fn debug_surfaces_report_registered_configuration() {
        let dispatcher = dispatcher_with_routes(vec![simple_route("/api/a", "a")]);
        let info = dispatcher.debug_info().await;
        assert_eq!(info.route_count, 1);
        assert_eq!(info.backend_count, 2);
        assert_eq!(dispatcher.debug_backends().len(), 2);
        assert!(dispatcher.debug_flags().is_empty());
    }
}
