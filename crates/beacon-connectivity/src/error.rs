//! Transport failure taxonomy.

use thiserror::Error;

/// Failure of a single network request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// The request did not complete in time.
    #[error("Request timed out")]
    Timeout,

    /// The connection could not be established or dropped mid-request.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The server answered with an unsuccessful status.
    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },

    /// The request could not be built or encoded.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The caller cancelled the request.
    #[error("Request cancelled")]
    Cancelled,

    /// Anything else.
    #[error("Network error: {0}")]
    Other(String),
}

impl NetworkError {
    /// Whether a later attempt of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::ConnectionLost(_) => true,
            Self::Status { code, .. } => *code >= 500 || *code == 429,
            Self::InvalidRequest(_) | Self::Cancelled | Self::Other(_) => false,
        }
    }

    /// Whether the failure says anything about reachability.
    ///
    /// A status answer proves the server was reached.
    pub fn is_connectivity_failure(&self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectionLost(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
