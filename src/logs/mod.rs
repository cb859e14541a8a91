//! Optional structured logging initializer.
//!
//! This crate's own code only ever calls the `log` facade macros; nothing
//! here is required to use the rest of the crate. An embedding binary may
//! call [`logger::configure_logger`] once at startup to get colorized,
//! column-aligned output, or wire up any other `log` backend it prefers.

pub mod logger;
