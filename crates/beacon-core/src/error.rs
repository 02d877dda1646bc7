//! Errors raised while loading settings and resolving paths.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Settings are individually valid but contradict each other.
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A collect endpoint is not an absolute URL.
    #[error("Invalid {field} endpoint: {source}")]
    InvalidEndpoint {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },

    #[error("Malformed settings file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,
}

pub type CoreResult<T> = Result<T, CoreError>;
