//! Fan-out to multiple backends with per-backend circuit breaker gating,
//! merged into a single response by declared backend order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::models::error::ProxyError;
use crate::services::cache::{fingerprint, ResponseCache};
use crate::services::proxy::{ProxyRequest, ProxyResponse, SingleBackendProxy};

/// One sub-backend's outcome in a fan-out round: either its response, or
/// nothing if its circuit was open or the call failed.
type SubResult = Option<ProxyResponse>;

/// Runs a fan-out request across `backends` and merges their responses.
pub struct CompositeHandler {
    /// Participating backends, in declared order; order determines merge
    /// precedence when multiple responses are available.
    backends: Vec<Arc<SingleBackendProxy>>,
    /// Fan out concurrently, or one at a time.
    parallel: bool,
    /// Deadline bounding the whole fan-out.
    timeout: Duration,
    /// Optional response cache for idempotent GETs.
    cache: Option<Arc<ResponseCache>>,
}

impl CompositeHandler {
    /// Builds a handler over `backends`, in the order merge precedence uses.
    pub fn new(
        backends: Vec<Arc<SingleBackendProxy>>,
        parallel: bool,
        timeout: Duration,
        cache: Option<Arc<ResponseCache>>,
    ) -> Self {
        Self {
            backends,
            parallel,
            timeout,
            cache,
        }
    }

    /// Runs the fan-out for `req` and returns the merged response.
    pub async fn handle(&self, req: &ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let full_url = format!(
            "{}{}{}",
            req.host,
            req.path,
            req.query.as_deref().map(|q| format!("?{q}")).unwrap_or_default()
        );
        let cache_key = fingerprint(req.method.as_str(), &full_url);

        if let Some(cache) = &self.cache {
            if req.method == reqwest::Method::GET {
                if let Some(hit) = cache.get(cache_key).await {
                    return Ok(ProxyResponse {
                        status: hit.status_code,
                        headers: hit.headers,
                        body: hit.body,
                    });
                }
            }
        }

        let results = tokio::time::timeout(self.timeout, self.fan_out(req))
            .await
            .unwrap_or_else(|_elapsed| vec![None; self.backends.len()]);

        let merged = results.into_iter().flatten().next();

        match merged {
            Some(response) => {
                if let Some(cache) = &self.cache {
                    if cache.is_cacheable(req.method.as_str(), response.status) {
                        cache
                            .put(cache_key, response.status, response.headers.clone(), response.body.clone())
                            .await;
                    }
                }
                Ok(response)
            }
            None => Err(ProxyError::NoSuccessfulResponses),
        }
    }

    async fn fan_out(&self, req: &ProxyRequest) -> Vec<SubResult> {
        if self.parallel {
            let results = Arc::new(Mutex::new(vec![None; self.backends.len()]));
            let mut handles = Vec::with_capacity(self.backends.len());

            for (index, backend) in self.backends.iter().cloned().enumerate() {
                let req = req.clone();
                let results = results.clone();
                handles.push(tokio::spawn(async move {
                    let outcome = call_one(&backend, &req).await;
                    results.lock().await[index] = outcome;
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
            results.lock().await.clone()
        } else {
            let mut results = Vec::with_capacity(self.backends.len());
            for backend in &self.backends {
                results.push(call_one(backend, req).await);
            }
            results
        }
    }
}

async fn call_one(backend: &Arc<SingleBackendProxy>, req: &ProxyRequest) -> SubResult {
    if backend.circuit_breaker().is_open().await {
        return None;
    }
    backend.forward(req).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    use crate::models::router::Backend as BackendModel;

    fn proxy(id: &str, url: &str) -> Arc<SingleBackendProxy> {
        let backend = BackendModel::with_default_client(id, url);
        let breaker = CircuitBreaker::new(id.to_string(), CircuitBreakerConfig::default());
        Arc::new(SingleBackendProxy::new(backend, breaker, None))
    }

    #[tokio::test]
    async fn merge_picks_base_response_by_declared_order_not_completion_order() {
        // Neither backend is reachable here; this only exercises the
        // "no successful responses" fallback path, since both sub-calls fail.
        let handler = CompositeHandler::new(
            vec![proxy("a", "http://127.0.0.1:1"), proxy("b", "http://127.0.0.1:1")],
            true,
            Duration::from_millis(200),
            None,
        );
        let req = ProxyRequest {
            method: reqwest::Method::GET,
            path: "/x".into(),
            query: None,
            headers: vec![],
            host: "client.example".into(),
            body: vec![],
        };
        let result = handler.handle(&req).await;
        assert!(matches!(result, Err(ProxyError::NoSuccessfulResponses)));
    }

    #[tokio::test]
    async fn skips_backend_whose_circuit_is_open() {
        let b = proxy("down", "http://127.0.0.1:1");
        for _ in 0..5 {
            b.circuit_breaker().record_failure().await;
        }
        assert!(b.circuit_breaker().is_open().await);

        let req = ProxyRequest {
            method: reqwest::Method::GET,
            path: "/x".into(),
            query: None,
            headers: vec![],
            host: "client.example".into(),
            body: vec![],
        };
        assert_eq!(call_one(&b, &req).await, None);
    }
}
