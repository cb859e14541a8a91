//! Observability events and the narrow publish interface that carries them.
//!
//! The circuit breaker and health checker both need to tell the outside
//! world "something changed" without depending on a concrete metrics or
//! alerting backend. Rather than reach for a module-level singleton, both
//! take a shared `Arc<dyn EventSink>` at construction time and call
//! `publish` on every state transition worth surfacing.

use std::fmt;
use std::sync::Arc;

/// A named, structured event the core emits for external consumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    /// A backend's circuit breaker tripped open.
    CircuitBreakerOpen {
        /// Backend whose circuit opened.
        backend_id: String,
    },
    /// A backend's circuit breaker closed after a successful probe.
    CircuitBreakerClosed {
        /// Backend whose circuit closed.
        backend_id: String,
    },
    /// A backend's circuit breaker began testing recovery.
    CircuitBreakerHalfOpen {
        /// Backend whose circuit entered half-open.
        backend_id: String,
    },
    /// A backend's health probe transitioned from unhealthy to healthy.
    BackendHealthy {
        /// Backend that recovered.
        backend_id: String,
    },
    /// A backend's health probe transitioned from healthy to unhealthy.
    BackendUnhealthy {
        /// Backend that degraded.
        backend_id: String,
    },
    /// Emitted exactly once per `CircuitBreaker::execute` call, carrying the
    /// state the breaker was in immediately before admission was decided.
    CircuitBreakerCall {
        /// Backend the call was made against.
        backend_id: String,
        /// `"closed"`, `"open"` or `"half_open"` as observed before the call.
        pre_call_state: String,
    },
}

impl fmt::Display for ProxyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyEvent::CircuitBreakerOpen { backend_id } => {
                write!(f, "circuit_breaker_open backend={backend_id}")
            }
            ProxyEvent::CircuitBreakerClosed { backend_id } => {
                write!(f, "circuit_breaker_closed backend={backend_id}")
            }
            ProxyEvent::CircuitBreakerHalfOpen { backend_id } => {
                write!(f, "circuit_breaker_half_open backend={backend_id}")
            }
            ProxyEvent::BackendHealthy { backend_id } => {
                write!(f, "backend_healthy backend={backend_id}")
            }
            ProxyEvent::BackendUnhealthy { backend_id } => {
                write!(f, "backend_unhealthy backend={backend_id}")
            }
            ProxyEvent::CircuitBreakerCall {
                backend_id,
                pre_call_state,
            } => {
                write!(f, "circuit_breaker_call backend={backend_id} pre_call_state={pre_call_state}")
            }
        }
    }
}

/// Narrow publish capability for observability events.
///
/// Implementations must not block the caller for long; the circuit breaker
/// and health checker may call `publish` while holding an internal lock.
pub trait EventSink: Send + Sync {
    /// Publish a single event. Must not panic.
    fn publish(&self, event: ProxyEvent);
}

/// An `EventSink` that discards every event. The default when no sink is
/// configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn publish(&self, _event: ProxyEvent) {}
}

/// An `EventSink` that forwards every event to the `log` facade.
///
/// Circuit-open and backend-unhealthy events log at `warn`; recoveries log
/// at `info`. This is the one concrete sink the crate ships, since it adds
/// no dependency beyond the `log` facade already required for the rest of
/// the ambient stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn publish(&self, event: ProxyEvent) {
        match &event {
            ProxyEvent::CircuitBreakerOpen { .. } | ProxyEvent::BackendUnhealthy { .. } => {
                log::warn!("{event}");
            }
            ProxyEvent::CircuitBreakerClosed { .. }
            | ProxyEvent::CircuitBreakerHalfOpen { .. }
            | ProxyEvent::BackendHealthy { .. } => {
                log::info!("{event}");
            }
            ProxyEvent::CircuitBreakerCall { .. } => {
                log::debug!("{event}");
            }
        }
    }
}

/// An `EventSink` that forwards every event to each of `sinks`, in order.
///
/// Lets a dispatcher hand one breaker both an externally-configured sink
/// (logging, alerting, ...) and an internal one (feeding its own metrics
/// collector) without either knowing the other exists.
pub struct FanOutEventSink {
    sinks: Vec<SharedEventSink>,
}

impl FanOutEventSink {
    /// Builds a sink that republishes every event to each of `sinks`.
    pub fn new(sinks: Vec<SharedEventSink>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanOutEventSink {
    fn publish(&self, event: ProxyEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone());
        }
    }
}

/// Convenience alias used throughout the crate for a shared sink handle.
pub type SharedEventSink = Arc<dyn EventSink>;

/// Builds the default sink (no-op) as an `Arc<dyn EventSink>`.
pub fn noop_sink() -> SharedEventSink {
    Arc::new(NoopEventSink)
}
