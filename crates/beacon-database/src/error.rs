//! Store errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The executor thread is gone or refused the call.
    #[error("Executor unavailable: {0}")]
    Executor(String),

    /// The file was written by a newer build; nothing is migrated.
    #[error("Schema v{found} is newer than supported v{supported}")]
    SchemaTooNew { found: i32, supported: i32 },

    /// A stored payload is not a JSON object.
    #[error("Corrupt payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;
