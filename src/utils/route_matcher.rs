//! Path matching for the router/dispatcher.
//!
//! Patterns are either exact (`/api/users`) or trailing wildcards
//! (`/api/users/*`); `*` is only meaningful as the final path segment. Exact
//! matches always win over wildcard matches regardless of wildcard length;
//! among wildcards, the longest matching prefix wins.

use ahash::HashMap as AHashMap;
use thiserror::Error;

/// Errors raised while compiling or matching route patterns.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RouteMatchError {
    /// The pattern uses `*` somewhere other than as a trailing wildcard.
    #[error("invalid route pattern: {pattern}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
    },
    /// No configured pattern matches the requested path.
    #[error("no matching route found for path: {path}")]
    NoMatch {
        /// The path that failed to match.
        path: String,
    },
}

/// A single trailing-wildcard pattern, pre-split into its literal prefix.
#[derive(Debug, Clone)]
struct WildcardRoute<T> {
    /// The pattern's prefix, without the trailing `/*`.
    prefix: String,
    value: T,
}

/// Matches request paths against a set of patterns, each associated with a
/// value of type `T` (typically a route descriptor or backend id).
#[derive(Debug)]
pub struct RouteMatcher<T> {
    exact: AHashMap<String, T>,
    /// Sorted by descending prefix length so the most specific wildcard wins.
    wildcards: Vec<WildcardRoute<T>>,
}

impl<T: Clone> RouteMatcher<T> {
    /// Builds a matcher from `(pattern, value)` pairs. A pattern is a
    /// wildcard iff it ends in `/*`; any other occurrence of `*` is rejected.
    pub fn new(patterns: Vec<(String, T)>) -> Result<Self, RouteMatchError> {
        let mut exact = AHashMap::default();
        let mut wildcards = Vec::new();

        for (pattern, value) in patterns {
            if let Some(prefix) = pattern.strip_suffix("/*") {
                if prefix.contains('*') {
                    return Err(RouteMatchError::InvalidPattern { pattern });
                }
                wildcards.push(WildcardRoute {
                    prefix: prefix.to_string(),
                    value,
                });
            } else if pattern.contains('*') {
                return Err(RouteMatchError::InvalidPattern { pattern });
            } else {
                exact.insert(pattern, value);
            }
        }

        wildcards.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Ok(Self { exact, wildcards })
    }

    /// Finds the value for `request_path`, preferring an exact match over any
    /// wildcard, and the longest-prefix wildcard over shorter ones.
    pub fn find_match(&self, request_path: &str) -> Result<T, RouteMatchError> {
        if let Some(value) = self.exact.get(request_path) {
            return Ok(value.clone());
        }

        for route in &self.wildcards {
            if request_path == route.prefix || request_path.starts_with(&format!("{}/", route.prefix)) {
                return Ok(route.value.clone());
            }
        }

        Err(RouteMatchError::NoMatch {
            path: request_path.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_wins_over_wildcard() {
        let matcher = RouteMatcher::new(vec![
            ("/api/users".to_string(), "exact"),
            ("/api/*".to_string(), "wildcard"),
        ])
        .unwrap();
        assert_eq!(matcher.find_match("/api/users").unwrap(), "exact");
        assert_eq!(matcher.find_match("/api/orders").unwrap(), "wildcard");
    }

    #[test]
    fn longest_wildcard_prefix_wins() {
        let matcher = RouteMatcher::new(vec![
            ("/api/*".to_string(), "short"),
            ("/api/users/*".to_string(), "long"),
        ])
        .unwrap();
        assert_eq!(matcher.find_match("/api/users/123").unwrap(), "long");
        assert_eq!(matcher.find_match("/api/orders/1").unwrap(), "short");
    }

    #[test]
    fn wildcard_matches_its_bare_prefix_too() {
        let matcher = RouteMatcher::new(vec![("/api/*".to_string(), "v")]).unwrap();
        assert_eq!(matcher.find_match("/api").unwrap(), "v");
    }

    #[test]
    fn non_trailing_wildcard_is_rejected() {
        let err = RouteMatcher::new(vec![("/api/*/users".to_string(), "x")]).unwrap_err();
        assert!(matches!(err, RouteMatchError::InvalidPattern { .. }));
    }

    #[test]
    fn unmatched_path_is_nomatch() {
        let matcher: RouteMatcher<&str> = RouteMatcher::new(vec![]).unwrap();
        let err = matcher.find_match("/nope").unwrap_err();
        assert!(matches!(err, RouteMatchError::NoMatch { .. }));
    }
}
