//! Reverse-proxy forwarding to a single backend.
//!
//! The one property every other handler in this crate builds on: the
//! outbound `Host` header is the original client's `Host`, never the
//! backend's authority. Getting this backwards is the single most common
//! reverse-proxy bug, which is why it's called out as its own invariant
//! rather than folded into "headers pass through".

use std::sync::Arc;

use reqwest::Method;

use crate::models::error::ProxyError;
use crate::models::router::Backend;
use crate::services::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::services::retry::RetryPolicy;
use crate::utils::path::join_backend_url;

/// Headers stripped before forwarding, per RFC 7230 §6.1, plus whatever an
/// inbound `Connection` header names.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// An inbound request, already decoupled from whatever web framework
/// terminated it.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// HTTP method.
    pub method: Method,
    /// Request path, e.g. `/api/v1/test`.
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: Option<String>,
    /// All inbound headers, including `Host`, in their original casing.
    pub headers: Vec<(String, String)>,
    /// The original client-facing `Host`: the inbound `Host` header if
    /// present, else the authority of the request URL.
    pub host: String,
    /// Request body.
    pub body: Vec<u8>,
}

/// A response ready to be written back to the client.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    /// HTTP status code returned by the backend.
    pub status: u16,
    /// Response headers, in the order the backend sent them.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
}

/// Forwards requests to exactly one backend, under circuit breaker
/// protection and an optional retry policy.
pub struct SingleBackendProxy {
    backend: Backend,
    circuit_breaker: Arc<CircuitBreaker>,
    retry: Option<RetryPolicy>,
}

impl SingleBackendProxy {
    /// Builds a proxy for `backend`, guarded by `circuit_breaker` and
    /// (optionally) retried per `retry`.
    pub fn new(backend: Backend, circuit_breaker: Arc<CircuitBreaker>, retry: Option<RetryPolicy>) -> Self {
        Self {
            backend,
            circuit_breaker,
            retry,
        }
    }

    /// Forwards `req` to this proxy's backend.
    pub async fn forward(&self, req: &ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        match &self.retry {
            Some(policy) => self.forward_with_retry(req, policy).await,
            None => self.forward_once(req).await,
        }
    }

    async fn forward_with_retry(
        &self,
        req: &ProxyRequest,
        policy: &RetryPolicy,
    ) -> Result<ProxyResponse, ProxyError> {
        let max_attempts = policy.max_attempts();
        let mut last_error = None;

        for attempt in 0..max_attempts {
            match self.forward_once(req).await {
                Ok(response) => return Ok(response),
                Err(ProxyError::CircuitOpen { backend_id }) => {
                    // The breaker denied admission outright; no amount of
                    // retrying a single open circuit helps.
                    return Err(ProxyError::CircuitOpen { backend_id });
                }
                Err(ProxyError::Upstream { backend_id, status }) => {
                    if !policy.is_retryable_status(status) {
                        return Err(ProxyError::Upstream { backend_id, status });
                    }
                    last_error = Some(ProxyError::Upstream { backend_id, status });
                }
                Err(other) => {
                    last_error = Some(other);
                }
            }

            if attempt + 1 < max_attempts {
                tokio::time::sleep(policy.calculate_backoff(attempt)).await;
            }
        }

        Err(last_error.unwrap_or(ProxyError::MaxRetriesReached {
            backend_id: self.backend.id.clone(),
        }))
    }

    async fn forward_once(&self, req: &ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let url = join_backend_url(&self.backend.url, &req.path, req.query.as_deref());
        let headers = filter_hop_by_hop(&req.headers);

        let result = self
            .circuit_breaker
            .execute(
                send_request(&self.backend, &url, req, &headers),
                |outcome: &Result<ProxyResponse, ProxyError>| {
                    matches!(outcome, Err(e) if e.counts_as_cb_failure())
                        || matches!(outcome, Ok(r) if r.status >= 500)
                },
            )
            .await;

        match result {
            Ok(Ok(response)) => {
                if response.status >= 500 {
                    Err(ProxyError::Upstream {
                        backend_id: self.backend.id.clone(),
                        status: response.status,
                    })
                } else {
                    Ok(response)
                }
            }
            Ok(Err(e)) => Err(e),
            Err(CircuitBreakerError::CircuitOpen) => Err(ProxyError::CircuitOpen {
                backend_id: self.backend.id.clone(),
            }),
            Err(CircuitBreakerError::Timeout) => Err(ProxyError::Internal(format!(
                "call to backend {} exceeded the circuit breaker's request timeout",
                self.backend.id
            ))),
            Err(CircuitBreakerError::OperationFailed(e)) => Err(e),
        }
    }

    /// The backend this proxy forwards to.
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// This proxy's circuit breaker.
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }
}

async fn send_request(
    backend: &Backend,
    url: &str,
    req: &ProxyRequest,
    headers: &[(String, String)],
) -> Result<ProxyResponse, ProxyError> {
    let mut builder = backend.client.request(req.method.clone(), url);

    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder = builder.header("Host", req.host.as_str());
    builder = builder.body(req.body.clone());

    let response = builder
        .send()
        .await
        .map_err(|source| ProxyError::Transport {
            backend_id: backend.id.clone(),
            source,
        })?;

    let status = response.status().as_u16();
    let response_headers = response
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();
    let body = response
        .bytes()
        .await
        .map_err(|source| ProxyError::Transport {
            backend_id: backend.id.clone(),
            source,
        })?
        .to_vec();

    Ok(ProxyResponse {
        status,
        headers: response_headers,
        body,
    })
}

fn filter_hop_by_hop(headers: &[(String, String)]) -> Vec<(String, String)> {
    let mut extra: Vec<String> = Vec::new();
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("connection") {
            extra.extend(value.split(',').map(|s| s.trim().to_ascii_lowercase()));
        }
    }

    headers
        .iter()
        .filter(|(name, _)| {
            let lower = name.to_ascii_lowercase();
            lower != "host" && !HOP_BY_HOP.contains(&lower.as_str()) && !extra.contains(&lower)
        })
        .cloned()
        .collect()
}
