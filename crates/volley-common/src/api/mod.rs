//! Job-tracking API domain model
//!
//! Types here mirror the JSON the tracking service serves under
//! `workers/{location}/jobs`. Field names are wire-exact.

pub mod codec;
pub mod job;
pub mod k6;
pub mod status;

pub use codec::NodeSelector;
pub use job::{
    AssignedSegment, Job, NamedValue, NamedValues, OutputCatalog, OutputConfig, OutputRef, TestRunSpec,
};
pub use k6::{StatusAttributes, StatusData, StatusRequest};
pub use status::Status;
