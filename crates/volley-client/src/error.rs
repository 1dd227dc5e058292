//! Tracking API client errors

/// Errors returned by [`crate::RemoteClient`]
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The remote answered 404
    #[error("not found: {url}")]
    NotFound {
        /// Requested URL
        url: String,
    },

    /// The remote answered with any other non-success status
    #[error("{method} {url} returned {code}: {body}")]
    Remote {
        /// HTTP method
        method: String,
        /// Requested URL
        url: String,
        /// HTTP status code
        code: u16,
        /// Response body, possibly empty
        body: String,
    },

    /// Connection, TLS, or timeout failure
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The body didn't match the registered type
    #[error("failed to decode {kind}: {source}")]
    Decode {
        /// Entity kind being decoded
        kind: String,
        /// Underlying JSON error
        #[source]
        source: serde_json::Error,
    },

    /// The entity type was never registered
    #[error("type '{0}' is not registered")]
    UnknownType(String),

    /// An endpoint template or base URL couldn't be turned into a URL
    #[error("invalid endpoint '{endpoint}': {message}")]
    InvalidEndpoint {
        /// The template or URL
        endpoint: String,
        /// What went wrong
        message: String,
    },
}

impl ClientError {
    /// True when the remote reported the resource as absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// HTTP status code, when the remote answered at all
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::NotFound { .. } => Some(404),
            Self::Remote { code, .. } => Some(*code),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether retrying the same request could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote { code, .. } => *code >= 500 || *code == 429,
            Self::Transport(_) => true,
            _ => false,
        }
    }
}
