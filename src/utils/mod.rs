//! URL and path-matching helpers shared across the dispatcher, the
//! single-backend proxy, and the composite and dry-run handlers.
//!
//! - [`path`] — URL joining with no doubled separators.
//! - [`route_matcher`] — exact/trailing-wildcard pattern matching with
//!   exact-match precedence.

pub mod path;
pub mod route_matcher;
