//! Error types for volley
//!
//! Errors carry structured fields (job name, field path, offending input)
//! so that failures reported back into a job's `status_description` are
//! actionable without digging through operator logs.

use thiserror::Error;

use crate::api::Status;

/// Main error type for volley operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A job record failed a structural check
    #[error("validation error for {job}: {message}")]
    Validation {
        /// Name of the job with invalid data
        job: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field (e.g., "assigned_segments")
        field: Option<String>,
    },

    /// A wire-encoded value could not be decoded
    #[error("invalid {what} '{input}': {message}")]
    Parse {
        /// What was being parsed (e.g., "duration", "node selector")
        what: &'static str,
        /// The offending input
        input: String,
        /// Description of what's wrong with it
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// A status change that would move a job backwards or out of a terminal state
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: Status,
        /// Requested status
        to: Status,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "igniter")
        context: String,
    },
}

impl Error {
    /// Create a validation error for a named job and field
    pub fn validation_for_field(
        job: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            job: job.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a parse error for a wire-encoded value
    pub fn parse(what: &'static str, input: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Parse {
            what,
            input: input.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Malformed records and illegal transitions won't fix themselves on a
    /// retry; transient Kubernetes failures and internal errors might.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation { .. } => false,
            Error::Parse { .. } => false,
            Error::Serialization { .. } => false,
            Error::InvalidTransition { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}
