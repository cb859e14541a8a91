//! Error taxonomy for the reverse proxy core.
//!
//! Every per-request failure mode the dispatcher, proxy, composite and
//! dry-run handlers can produce is represented here. Variants map to the
//! boundary sentinels and HTTP status codes described by the error handling
//! design: admission failures are never retried, transport and upstream
//! failures feed the circuit breaker, configuration failures are fatal only
//! to the route that referenced them.

use thiserror::Error;

/// Errors surfaced at the proxy/dispatcher boundary.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The backend's circuit breaker is open; the call was never attempted.
    #[error("circuit open for backend {backend_id}")]
    CircuitOpen {
        /// Backend the circuit guards.
        backend_id: String,
    },

    /// The backend is administratively disabled.
    #[error("backend {backend_id} is disabled")]
    BackendDisabled {
        /// Backend that was skipped.
        backend_id: String,
    },

    /// A network-level failure talking to a backend (includes timeouts).
    #[error("transport error calling {backend_id}: {source}")]
    Transport {
        /// Backend the failing call targeted.
        backend_id: String,
        /// Underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The backend returned a 5xx response.
    #[error("upstream error from {backend_id}: status {status}")]
    Upstream {
        /// Backend that returned the error.
        backend_id: String,
        /// HTTP status code returned.
        status: u16,
    },

    /// Retries were exhausted without a non-retryable success.
    #[error("max retries reached for backend {backend_id}")]
    MaxRetriesReached {
        /// Backend the retry loop gave up on.
        backend_id: String,
    },

    /// No route configuration references this backend id.
    #[error("backend service not found: {backend_id}")]
    BackendServiceNotFound {
        /// Backend id that failed to resolve.
        backend_id: String,
    },

    /// No route matched the request path and no default backend is configured.
    #[error("no route matches path {path}")]
    RouteNotFound {
        /// Request path that failed to match.
        path: String,
    },

    /// A matched route rejected the request's HTTP method.
    #[error("method {method} not allowed for path {path}")]
    MethodNotAllowed {
        /// Rejected method.
        method: String,
        /// Path that was matched.
        path: String,
    },

    /// A backend URL carries no hostname.
    #[error("backend URL has no hostname")]
    NoHostname,

    /// A health probe or upstream call returned a status outside the expected set.
    #[error("unexpected status code {status}")]
    UnexpectedStatusCode {
        /// Status code observed.
        status: u16,
    },

    /// Every backend in a composite fan-out failed or was skipped.
    #[error("no successful responses from backends")]
    NoSuccessfulResponses,

    /// Catch-all for invariant violations that should never reach a client visibly.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// HTTP status this error should be reported to the client as.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::CircuitOpen { .. } => 503,
            ProxyError::BackendDisabled { .. } => 503,
            ProxyError::Transport { .. } => 502,
            ProxyError::Upstream { status, .. } => *status,
            ProxyError::MaxRetriesReached { .. } => 502,
            ProxyError::BackendServiceNotFound { .. } => 502,
            ProxyError::RouteNotFound { .. } => 404,
            ProxyError::MethodNotAllowed { .. } => 405,
            ProxyError::NoHostname => 502,
            ProxyError::UnexpectedStatusCode { .. } => 502,
            ProxyError::NoSuccessfulResponses => 502,
            ProxyError::Internal(_) => 502,
        }
    }

    /// True when this error should count as a circuit breaker failure.
    pub fn counts_as_cb_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::Transport { .. } | ProxyError::Upstream { .. }
        )
    }
}

/// Errors from circuit breaker route construction / registry lookups.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A route referenced a backend id that was never registered.
    #[error("backend service not found: {0}")]
    BackendServiceNotFound(String),

    /// A route pattern was malformed (e.g. a non-trailing wildcard).
    #[error("invalid route pattern: {0}")]
    InvalidPattern(String),
}

/// Errors from the health checker's lifecycle operations.
#[derive(Debug, Error)]
pub enum HealthCheckError {
    /// DNS resolution of the backend host failed.
    #[error("dns resolution failed for {host}: {source}")]
    Dns {
        /// Hostname that failed to resolve.
        host: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The probe request itself failed at the transport layer.
    #[error("probe transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The probe succeeded but returned an unexpected status.
    #[error("unexpected status code {0}")]
    UnexpectedStatusCode(u16),
}
