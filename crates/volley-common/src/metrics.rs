//! Metrics registry for volley observability
//!
//! Provides OpenTelemetry metrics for:
//! - Reconciliation (outcomes, latency, status transitions)
//! - Ignition (outcomes, start skew across a cohort)
//! - Work queue (retry backoff)
//! - Tracking API traffic (request outcomes, poll failures)

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::api::Status;

/// Global meter for volley metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("volley"));

/// Name of [`RECONCILE_DURATION`]
pub const RECONCILE_DURATION_NAME: &str = "volley_reconcile_duration_seconds";
/// Name of [`IGNITION_SKEW`]
pub const IGNITION_SKEW_NAME: &str = "volley_ignition_skew_seconds";
/// Name of [`QUEUE_BACKOFF`]
pub const QUEUE_BACKOFF_NAME: &str = "volley_queue_backoff_seconds";

// ============================================================================
// Reconciliation
// ============================================================================

/// Counter of reconciliations
///
/// Labels:
/// - `status`: job status observed at the start of the pass
/// - `result`: success, error
pub static RECONCILE_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("volley_reconcile_total")
        .with_description("Total number of job reconciliations")
        .with_unit("{reconciliations}")
        .build()
});

/// Histogram of reconciliation duration
///
/// Labels:
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram(RECONCILE_DURATION_NAME)
        .with_description("Duration of job reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of job status transitions written back to the tracking API
///
/// Labels:
/// - `from`, `to`: job statuses
pub static STATUS_TRANSITIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("volley_status_transitions_total")
        .with_description("Total number of job status transitions")
        .with_unit("{transitions}")
        .build()
});

// ============================================================================
// Ignition
// ============================================================================

/// Counter of ignitions
///
/// Labels:
/// - `result`: success, error
pub static IGNITIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("volley_ignitions_total")
        .with_description("Total number of worker cohort ignitions")
        .with_unit("{ignitions}")
        .build()
});

/// Histogram of time between the first and last unpause acknowledgement in a cohort
pub static IGNITION_SKEW: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram(IGNITION_SKEW_NAME)
        .with_description("Spread between first and last worker unpause in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Work queue
// ============================================================================

/// Histogram of delays handed to keys re-queued after a failed pass
pub static QUEUE_BACKOFF: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram(QUEUE_BACKOFF_NAME)
        .with_description("Backoff before a failed key is retried in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Tracking API
// ============================================================================

/// Counter of tracking API requests
///
/// Labels:
/// - `method`: GET, POST, PUT
/// - `result`: 2xx, 4xx, 5xx, transport
pub static REMOTE_REQUESTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("volley_remote_requests_total")
        .with_description("Total number of job-tracking API requests")
        .with_unit("{requests}")
        .build()
});

/// Counter of failed poll ticks
///
/// Labels:
/// - `kind`: entity kind being polled
pub static POLL_FAILURES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("volley_poll_failures_total")
        .with_description("Total number of failed list polls")
        .with_unit("{failures}")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// Outcome label shared by several instruments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation succeeded
    Success,
    /// The operation failed
    Error,
}

impl Outcome {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Outcome of a result
    pub fn of<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            Self::Success
        } else {
            Self::Error
        }
    }
}

/// HTTP status class label for tracking API requests
pub fn status_class(code: Option<u16>) -> &'static str {
    match code {
        Some(200..=299) => "2xx",
        Some(300..=399) => "3xx",
        Some(400..=499) => "4xx",
        Some(_) => "5xx",
        None => "transport",
    }
}

/// Record a reconciliation outcome
pub fn record_reconcile(status: Option<Status>, outcome: Outcome, seconds: f64) {
    let status = status.map(|s| s.as_str()).unwrap_or("absent");
    RECONCILE_TOTAL.add(
        1,
        &[
            KeyValue::new("status", status),
            KeyValue::new("result", outcome.as_str()),
        ],
    );
    RECONCILE_DURATION.record(seconds, &[KeyValue::new("result", outcome.as_str())]);
}

/// Record a status transition
pub fn record_transition(from: Status, to: Status) {
    STATUS_TRANSITIONS.add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_class_buckets() {
        assert_eq!(status_class(Some(204)), "2xx");
        assert_eq!(status_class(Some(404)), "4xx");
        assert_eq!(status_class(Some(502)), "5xx");
        assert_eq!(status_class(None), "transport");
    }

    #[test]
    fn outcome_of_result() {
        assert_eq!(Outcome::of::<(), ()>(&Ok(())), Outcome::Success);
        assert_eq!(Outcome::of::<(), ()>(&Err(())).as_str(), "error");
    }

    #[test]
    fn recording_without_a_provider_is_a_no_op() {
        record_reconcile(Some(Status::Queued), Outcome::Success, 0.01);
        record_transition(Status::Queued, Status::Ready);
    }
}
