//! volley operator: runs distributed k6 load tests for one location

#![deny(missing_docs)]

/// Command line and environment configuration
pub mod config;
/// Liveness and readiness probes
pub mod health;
/// Signal handling
pub mod shutdown;

pub use config::{Cli, OperatorConfig, Sources};
