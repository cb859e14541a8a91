//! Routing data model: backends, route descriptors, composite routes and
//! per-tenant overlays.
//!
//! These types are plain, serde-derived data — constructing them from a
//! configuration file or environment is an external collaborator's job; this
//! crate only consumes already-built values.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::services::retry::RetryPolicy;

/// A named upstream HTTP service the proxy can forward to.
///
/// Immutable after construction; a backend is replaced wholesale (never
/// mutated in place) when a tenant overlay or reconfiguration changes its URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    /// Stable identifier referenced by routes and tenant overlays.
    pub id: String,
    /// Absolute base URL, e.g. `http://payments.internal:9000`.
    pub url: String,
    /// Shared HTTP client handle. Not part of the wire representation —
    /// an external loader builds `Backend`s with `Backend::new`, which
    /// attaches a client; deserialized backends get a fresh default client.
    #[serde(skip, default = "default_client")]
    pub client: reqwest::Client,
}

fn default_client() -> reqwest::Client {
    reqwest::Client::new()
}

impl Backend {
    /// Builds a backend with a dedicated client handle.
    pub fn new(id: impl Into<String>, url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            client,
        }
    }

    /// Builds a backend sharing the default client configuration.
    pub fn with_default_client(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(id, url, default_client())
    }
}

/// One backend's contribution to a composite route, and the declared order
/// used to pick the "base" response on merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeRoute {
    /// Backend ids in declared order; order determines merge precedence.
    pub backends: Vec<String>,
    /// Fan out concurrently (`true`) or one at a time (`false`).
    pub parallel: bool,
    /// Per-request deadline bounding the whole fan-out.
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    /// TTL for cached responses; `None` disables caching for this route.
    #[serde(with = "option_duration_millis", default)]
    pub cache_ttl: Option<Duration>,
}

/// A route that shadows a primary backend against a secondary one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunRoute {
    /// Backend whose response is (by default) returned to the client.
    pub primary_id: String,
    /// Backend run in the background for comparison.
    pub secondary_id: String,
    /// Which arm's response is actually streamed back to the client.
    pub default_response_backend: DryRunArm,
    /// Log the full bodies of both arms, not just the comparison verdict.
    pub log_responses: bool,
    /// Bytes captured from the background arm for comparison.
    pub max_response_size: usize,
}

/// Which arm of a dry-run route is authoritative for the client response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DryRunArm {
    /// The primary backend's response is returned to the client.
    Primary,
    /// The secondary backend's response is returned to the client.
    Secondary,
}

/// What kind of handler a matched route dispatches to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteKind {
    /// Forward to a single backend.
    Simple {
        /// Backend id to forward to.
        backend_id: String,
    },
    /// Fan out to multiple backends and merge.
    Composite(CompositeRoute),
    /// Shadow-compare a primary and a secondary backend.
    DryRun(DryRunRoute),
}

/// A configured route: the pattern it matches plus everything needed to
/// dispatch a request that matches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Path pattern: exact, or a trailing `/*` wildcard.
    pub pattern: String,
    /// What to dispatch a matching request to.
    pub kind: RouteKind,
    /// Feature flag gating this route; `None` means always enabled.
    pub feature_flag_id: Option<String>,
    /// Backend to use instead when the feature flag evaluates false.
    pub alternative_backend: Option<String>,
    /// Retry policy applied to simple-route dispatch; `None` disables retries.
    pub retry: Option<RetryPolicy>,
}

impl RouteConfig {
    /// True if `pattern` is a trailing wildcard (`/*`-suffixed).
    pub fn is_wildcard(&self) -> bool {
        self.pattern.ends_with("/*")
    }
}

/// Per-tenant overrides layered over the global configuration at request
/// time. Constructed once at tenant registration and replaced wholesale
/// (copy-on-write) on update; never mutated field-by-field concurrently with
/// a request in flight.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantOverlay {
    /// Tenant this overlay applies to.
    pub tenant_id: String,
    /// Backend id → URL overrides, replacing the global backend's URL only
    /// within this tenant's routing.
    pub backend_services: HashMap<String, String>,
    /// Pattern → backend id overrides for simple routes.
    pub routes: HashMap<String, String>,
    /// Pattern → composite route overrides.
    pub composite_routes: HashMap<String, CompositeRoute>,
    /// Pattern → full route config overrides (covers dry-run routes and
    /// anything needing more than a bare backend id).
    pub route_configs: HashMap<String, RouteConfig>,
}

impl TenantOverlay {
    /// An overlay with no overrides, for a tenant with no registered overlay.
    pub fn empty(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Default::default()
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_detection_matches_trailing_star_only() {
        let simple = RouteConfig {
            pattern: "/api/users".into(),
            kind: RouteKind::Simple {
                backend_id: "a".into(),
            },
            feature_flag_id: None,
            alternative_backend: None,
            retry: None,
        };
        assert!(!simple.is_wildcard());

        let wildcard = RouteConfig {
            pattern: "/api/*".into(),
            ..simple
        };
        assert!(wildcard.is_wildcard());
    }

    #[test]
    fn empty_overlay_has_no_overrides() {
        let overlay = TenantOverlay::empty("acme");
        assert_eq!(overlay.tenant_id, "acme");
        assert!(overlay.backend_services.is_empty());
        assert!(overlay.routes.is_empty());
    }
}
