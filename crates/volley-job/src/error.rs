//! Job controller error types

use volley_client::ClientError;

/// Errors surfaced by a reconcile pass
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("tracking API error: {0}")]
    Client(#[from] ClientError),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{0}")]
    Common(#[from] volley_common::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job '{job}' is not ready to start: {reason}")]
    NotReady { job: String, reason: String },

    #[error("ignition of job '{job}' failed: {message}")]
    Ignition { job: String, message: String },

    #[error("job '{job}' has {actual} assigned segments for {expected} workers")]
    SegmentMismatch {
        job: String,
        expected: u32,
        actual: usize,
    },
}

impl JobError {
    /// Build a [`JobError::NotReady`]
    pub fn not_ready(job: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotReady {
            job: job.into(),
            reason: reason.into(),
        }
    }

    /// Whether another pass could succeed without the job record changing
    ///
    /// Jobs whose pass failed for good were already moved to `failed`, or
    /// will be picked up again by the next poll.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Client(e) => e.is_retryable(),
            Self::Kube(kube::Error::Api(ae)) => {
                !(400..500).contains(&ae.code) || ae.code == 409 || ae.code == 429
            }
            Self::Kube(_) => true,
            Self::Common(e) => e.is_retryable(),
            Self::NotReady { .. } => true,
            Self::Serialization(_) | Self::Ignition { .. } | Self::SegmentMismatch { .. } => false,
        }
    }
}
