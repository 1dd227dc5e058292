//! Client for the job-tracking API
//!
//! The tracking service is a plain REST API with no push mechanism. This
//! crate wraps it in three layers:
//! - [`Registry`]: which URL serves which entity type
//! - [`RemoteClient`]: typed Get/List/Create/Update with basic auth
//! - [`RemoteClient::watch`]: a polling loop that re-emits every listed item
//!   on each tick, so consumers see a change feed
//!
//! plus a [`Pinger`] that keeps this location marked online.

pub mod client;
pub mod error;
pub mod ping;
pub mod registry;
pub mod watch;

pub use client::{ClientConfig, RemoteClient};
pub use error::ClientError;
pub use ping::Pinger;
pub use registry::{Collection, Registry};
pub use watch::WatchOptions;

use volley_common::api::Job;

/// Collection endpoint for jobs; the item endpoint appends `/{name}`
pub const JOBS_ENDPOINT: &str = "workers/{location}/jobs";

/// Liveness endpoint for this location's workers
pub const PING_ENDPOINT: &str = "workers/{location}/ping";

/// Registry with every entity type the operator consumes
pub fn default_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register::<Job>(JOBS_ENDPOINT);
    registry
}
