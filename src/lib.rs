//! # reverse-proxy-core
//!
//! Core routing and resilience primitives for a multi-tenant HTTP reverse
//! proxy: a [`services::dispatcher::Dispatcher`] resolves a request to a
//! route (honoring per-tenant overlays and feature flags) and hands it to
//! one of three handlers:
//!
//! - [`services::proxy::SingleBackendProxy`] — forward to one backend.
//! - [`services::composite::CompositeHandler`] — fan out to several and
//!   merge.
//! - [`services::dryrun::DryRunHandler`] — shadow a candidate backend
//!   against a primary without the candidate affecting the client response.
//!
//! Every outbound call to a backend is gated by that backend's
//! [`services::circuit_breaker::CircuitBreaker`] and, when a route configures
//! one, retried per [`services::retry::RetryPolicy`]. A
//! [`services::health::HealthChecker`] probes backends independently of
//! request traffic and feeds its signal back into the circuit breaker's
//! admission decisions. A [`services::metrics::MetricsCollector`] and the
//! [`events`] module's `EventSink` trait give an embedding application two
//! different ways to observe what's happening without this crate reaching
//! for a concrete metrics or logging backend itself.
//!
//! ## What this crate does not do
//!
//! Configuration loading (parsing TOML/JSON/env into the types in
//! [`models::router`]), CLI/bootstrap, metrics serialization (Prometheus
//! text, StatsD, ...), TLS termination, authentication and rate limiting are
//! all left to the embedding application. This crate's types derive
//! `serde::{Serialize, Deserialize}` so a configuration layer can build them
//! directly; it never reads a file or an environment variable itself.
//!
//! ## Module organization
//!
//! - [`models`] — data model and error taxonomy.
//! - [`services`] — the handlers and supporting services listed above.
//! - [`utils`] — URL joining and route-pattern matching.
//! - [`events`] — the observability event sink trait.
//! - [`logs`] — an optional `env_logger`-based initializer a binary
//!   embedding this crate may call; the crate itself only ever calls the
//!   `log` facade.

pub mod events;
pub mod logs;
pub mod models;
pub mod services;
pub mod utils;
