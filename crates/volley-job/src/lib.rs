//! Load-test job reconciliation
//!
//! Drives each job record from the tracking API through its lifecycle by
//! materialising an indexed batch workload, counting stably-ready workers,
//! and releasing the paused cohort at the scheduled start time.

pub mod bridge;
pub mod compiler;
pub mod controller;
pub mod error;
pub mod igniter;
pub mod queue;
pub mod runner;
pub mod tracker;
pub mod workload;

pub use bridge::{not_draft, not_terminal, ChangeBridge};
pub use controller::{error_policy, reconcile, JobContext, Settings};
pub use error::JobError;
pub use igniter::{Igniter, IgniterIndex};
pub use queue::{Action, WorkQueue};
pub use runner::{run_controller, RunnerConfig};
pub use tracker::JobTracker;
pub use workload::{KubeWorkloadClient, WorkerControl, WorkloadClient};
