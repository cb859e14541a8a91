//! Per-backend circuit breaker.
//!
//! Protects a single upstream from cascading failures by failing fast once
//! a failure threshold is crossed, and self-healing after a reset timeout
//! by probing with a single half-open trial.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::events::{noop_sink, ProxyEvent, SharedEventSink};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests pass through.
    Closed = 0,
    /// Circuit is open - failing fast.
    Open = 1,
    /// Single-trial recovery probe in flight.
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl CircuitState {
    /// Lowercase name used in metrics labels and debug endpoints.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Configuration parameters for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (in Closed state) required to trip the circuit.
    pub failure_threshold: u64,
    /// Per-call timeout applied by `execute`.
    pub request_timeout: Duration,
    /// Time the circuit stays Open before a half-open probe is allowed.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            request_timeout: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-backend circuit breaker.
///
/// State transitions are mutually exclusive under `last_failure_time`'s
/// lock; the hot-path reads (`get_state`, `get_failure_count`) are lock-free
/// atomics so every request can check admission without contending.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU64,
    last_failure_time: RwLock<Option<Instant>>,
    name: String,
    events: SharedEventSink,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker for `name`, starting Closed.
    pub fn new(name: String, config: CircuitBreakerConfig) -> Arc<Self> {
        Self::with_event_sink(name, config, noop_sink())
    }

    /// Creates a new circuit breaker that publishes state transitions to `events`.
    pub fn with_event_sink(
        name: String,
        config: CircuitBreakerConfig,
        events: SharedEventSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU64::new(0),
            last_failure_time: RwLock::new(None),
            name,
            events,
        })
    }

    /// Returns `false` (admitted) when Closed or HalfOpen. When Open, atomically
    /// promotes to HalfOpen and returns `false` once the reset timeout has
    /// elapsed since the last recorded failure; otherwise returns `true` (still
    /// failing fast).
    pub async fn is_open(&self) -> bool {
        let current_state = CircuitState::from(self.state.load(Ordering::Acquire));

        match current_state {
            CircuitState::Closed | CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let elapsed_enough = {
                    let guard = self.last_failure_time.read().await;
                    matches!(*guard, Some(last) if last.elapsed() >= self.config.reset_timeout)
                };
                if !elapsed_enough {
                    return true;
                }
                // Double-checked promotion: only the caller that actually flips
                // Open->HalfOpen treats this as an admission; a racing caller
                // that finds the state already HalfOpen just proceeds too.
                let guard = self.last_failure_time.write().await;
                let still_open = self.state.load(Ordering::Acquire) == CircuitState::Open as u8;
                if still_open
                    && matches!(*guard, Some(last) if last.elapsed() >= self.config.reset_timeout)
                {
                    self.state
                        .store(CircuitState::HalfOpen as u8, Ordering::Release);
                    drop(guard);
                    log::info!("circuit breaker {} half-open probe admitted", self.name);
                    self.events.publish(ProxyEvent::CircuitBreakerHalfOpen {
                        backend_id: self.name.clone(),
                    });
                }
                // else: another caller already promoted it, or the failure
                // window moved; either way this caller just proceeds.
                false
            }
        }
    }

    /// Records a success. Closed stays Closed with the counter zeroed;
    /// HalfOpen unconditionally closes on any single success.
    pub async fn record_success(&self) {
        let previous = CircuitState::from(self.state.swap(CircuitState::Closed as u8, Ordering::AcqRel));
        self.failure_count.store(0, Ordering::Release);
        if matches!(previous, CircuitState::Open | CircuitState::HalfOpen) {
            log::info!("circuit breaker {} closed", self.name);
            self.events.publish(ProxyEvent::CircuitBreakerClosed {
                backend_id: self.name.clone(),
            });
        }
    }

    /// Records a failure. In Closed, increments the failure counter
    /// (saturating at the threshold) and trips to Open once the threshold is
    /// reached. In HalfOpen, any single failure re-opens the circuit. In
    /// Open, just refreshes `last_failure_time`.
    pub async fn record_failure(&self) {
        let current = CircuitState::from(self.state.load(Ordering::Acquire));
        match current {
            CircuitState::Closed => {
                let threshold = self.config.failure_threshold;
                let new_count = {
                    let prev = self.failure_count.load(Ordering::Acquire);
                    let next = (prev + 1).min(threshold);
                    self.failure_count.store(next, Ordering::Release);
                    next
                };
                *self.last_failure_time.write().await = Some(Instant::now());
                if new_count >= threshold {
                    self.state.store(CircuitState::Open as u8, Ordering::Release);
                    log::warn!(
                        "circuit breaker {} opened after {} failures",
                        self.name,
                        new_count
                    );
                    self.events.publish(ProxyEvent::CircuitBreakerOpen {
                        backend_id: self.name.clone(),
                    });
                }
            }
            CircuitState::HalfOpen => {
                self.state.store(CircuitState::Open as u8, Ordering::Release);
                *self.last_failure_time.write().await = Some(Instant::now());
                log::warn!("circuit breaker {} reopened after half-open failure", self.name);
                self.events.publish(ProxyEvent::CircuitBreakerOpen {
                    backend_id: self.name.clone(),
                });
            }
            CircuitState::Open => {
                *self.last_failure_time.write().await = Some(Instant::now());
            }
        }
    }

    /// Resets the breaker unconditionally to Closed with a zeroed counter.
    pub async fn reset(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        *self.last_failure_time.write().await = None;
    }

    /// Executes `operation` under breaker protection. Fails fast with
    /// `CircuitBreakerError::CircuitOpen` without invoking `operation` when the
    /// circuit denies admission; otherwise runs it and records the outcome
    /// based on the caller-supplied classifier `is_failure`.
    ///
    /// Publishes exactly one `ProxyEvent::CircuitBreakerCall` per invocation,
    /// labeled with the state observed immediately before the admission
    /// check, regardless of how the call is ultimately classified.
    pub async fn execute<F, T, E>(
        &self,
        operation: F,
        is_failure: impl Fn(&Result<T, E>) -> bool,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        let pre_call_state = self.get_state();
        self.events.publish(ProxyEvent::CircuitBreakerCall {
            backend_id: self.name.clone(),
            pre_call_state: pre_call_state.as_str().to_string(),
        });

        if self.is_open().await {
            return Err(CircuitBreakerError::CircuitOpen);
        }

        let result = tokio::time::timeout(self.config.request_timeout, operation).await;
        match result {
            Ok(outcome) => {
                if is_failure(&outcome) {
                    self.record_failure().await;
                } else {
                    self.record_success().await;
                }
                outcome.map_err(CircuitBreakerError::OperationFailed)
            }
            Err(_elapsed) => {
                self.record_failure().await;
                Err(CircuitBreakerError::Timeout)
            }
        }
    }

    /// Current circuit state.
    pub fn get_state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Current failure count (0..=failure_threshold).
    pub fn get_failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Name this breaker was constructed with (the backend id).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot used by the debug/circuit-breakers reporting surface.
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            state: self.get_state().as_str().to_string(),
            failures: self.get_failure_count(),
        }
    }
}

/// A point-in-time view of one breaker's state, serializable for the
/// `/debug/circuit-breakers` reporting contract.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitBreakerSnapshot {
    /// `"closed"`, `"open"` or `"half_open"`.
    pub state: String,
    /// Current failure count.
    pub failures: u64,
}

/// Errors surfaced by `CircuitBreaker::execute`.
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// The circuit was open; `operation` was never invoked.
    #[error("circuit breaker is open")]
    CircuitOpen,
    /// `operation` ran and returned an error (or was classified as a failure).
    #[error("operation failed: {0}")]
    OperationFailed(E),
    /// `operation` did not complete within the configured request timeout.
    #[error("operation timed out")]
    Timeout,
}
