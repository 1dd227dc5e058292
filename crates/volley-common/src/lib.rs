//! Common types for volley: the job-tracking domain model, errors, and
//! Kubernetes utilities shared by the client, the reconciler, and the operator

#![deny(missing_docs)]

pub mod api;
pub mod error;
pub mod kube_utils;
pub mod leader_election;
pub mod metrics;
pub mod resource;
pub mod telemetry;

pub use error::Error;
pub use resource::{BatchJob, Convertible, DynObject, Identifiable, RemoteObject, WorkloadRef};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager and `app.kubernetes.io/managed-by` value for everything the operator writes
pub const MANAGED_BY: &str = "volley-operator";

/// Label key for the workload kind (`app.kubernetes.io/name`)
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Label key for the owning job name (`app.kubernetes.io/instance`)
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";

/// Label key for the managing controller (`app.kubernetes.io/managed-by`)
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_NAME`] on worker workloads
pub const WORKLOAD_KIND: &str = "k6";

/// Label selector matching every workload the operator manages
pub const MANAGED_SELECTOR: &str = "app.kubernetes.io/managed-by=volley-operator";

/// Annotation holding the hash of the desired state last applied to an object
pub const SPEC_HASH_ANNOTATION: &str = "volley.dev/spec-hash";
