//! Queue error types.

use thiserror::Error;

/// Queue error type.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] beacon_database::DatabaseError),
}

/// Result type alias using QueueError.
pub type QueueResult<T> = Result<T, QueueError>;
