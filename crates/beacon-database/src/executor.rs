//! The queue's serialized execution context.
//!
//! Every read and write of the store is a closure shipped to one SQLite
//! thread and run in arrival order. Two drains or a drain and a store can
//! therefore never interleave inside the database.
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let size = db.call(|conn| queries::count_dispatches(conn)).await?;
//! ```

use crate::{migrations, DatabaseError, DatabaseResult};
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

const FILE_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA temp_store = MEMORY;
    PRAGMA busy_timeout = 5000;
";

/// WAL does not apply to in-memory databases.
const MEMORY_PRAGMAS: &str = "PRAGMA foreign_keys = ON;";

fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> DatabaseError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => DatabaseError::Sqlite(e),
        tokio_rusqlite::Error::Close(_) => {
            DatabaseError::Executor("Connection closed".to_string())
        }
        other => DatabaseError::Executor(other.to_string()),
    }
}

/// Handle to the store thread. Clones share the thread.
#[derive(Clone)]
pub struct AsyncDatabase {
    conn: Connection,
    path: String,
}

impl AsyncDatabase {
    /// Open a database at the given path.
    ///
    /// Creates the file and parent directory if needed, enables WAL mode,
    /// and runs pending migrations.
    pub async fn open(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.to_string_lossy().to_string();

        info!(path = %path_str, "Opening queue store");

        let conn = Connection::open(path_str.clone())
            .await
            .map_err(|e| DatabaseError::Executor(e.to_string()))?;

        let db = Self {
            conn,
            path: path_str,
        };

        db.call_sqlite(|conn| conn.execute_batch(FILE_PRAGMAS))
            .await?;

        db.call(|conn| migrations::run_migrations(conn)).await?;

        info!(path = %db.path, "Async database initialized with WAL mode");
        Ok(db)
    }

    /// Open a private in-memory database.
    pub async fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| DatabaseError::Executor(e.to_string()))?;

        let db = Self {
            conn,
            path: ":memory:".to_string(),
        };

        db.call_sqlite(|conn| conn.execute_batch(MEMORY_PRAGMAS))
            .await?;
        db.call(|conn| migrations::run_migrations(conn)).await?;

        Ok(db)
    }

    /// Execute a closure on the database connection.
    ///
    /// The closure runs on the dedicated SQLite thread; the caller's task is
    /// parked until the result is ready. Only SQL and lightweight row mapping
    /// belong inside the closure.
    pub async fn call<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let outer_result = self
            .conn
            .call(move |conn| {
                let inner_result = f(conn);
                Ok(inner_result)
            })
            .await;

        match outer_result {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Like [`call`](Self::call) for closures returning plain rusqlite results.
    pub async fn call_sqlite<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| Ok(f(conn)?))
            .await
            .map_err(from_tokio_rusqlite)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Round-trip a trivial statement through the store thread.
    pub async fn health_check(&self) -> DatabaseResult<()> {
        self.call_sqlite(|conn| conn.execute_batch("SELECT 1"))
            .await?;
        debug!("Store thread responsive");
        Ok(())
    }

    /// Close the database connection after pending operations complete.
    pub async fn close(self) -> DatabaseResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| DatabaseError::Executor(format!("Failed to close database: {:?}", e)))?;
        info!(path = %self.path, "Queue store closed");
        Ok(())
    }
}
