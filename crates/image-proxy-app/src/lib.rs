//! Image Proxy launcher.
//!
//! Command-line parsing, startup validation, and the timing wrapper the
//! binary installs around the response hook.

pub mod config;
pub mod telemetry;
