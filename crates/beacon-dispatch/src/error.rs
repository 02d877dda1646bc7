//! Errors from wiring and running delivery.
//!
//! Delivery failures themselves are [`beacon_connectivity::NetworkError`]
//! values carried in reports; these errors only reach callers of setup and
//! queue maintenance.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Queue error: {0}")]
    Queue(#[from] beacon_queue::QueueError),

    #[error("Database error: {0}")]
    Database(#[from] beacon_database::DatabaseError),

    #[error("Config error: {0}")]
    Config(#[from] beacon_core::CoreError),

    /// The HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// A batch could not be encoded as a request body.
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type DispatchResult<T> = Result<T, DispatchError>;
