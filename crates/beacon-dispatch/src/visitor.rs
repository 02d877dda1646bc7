//! Persisted visitor identity.

use beacon_database::{queries, AsyncDatabase};
use std::sync::RwLock;
use tracing::{info, warn};

/// Setting key holding the visitor id.
pub const VISITOR_ID_SETTING: &str = "visitor_id";

fn new_visitor_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// The visitor id stamped on every event.
///
/// Persistence failures are logged and never fatal; the in-memory value is
/// always the one in use.
pub struct VisitorIdentity {
    db: AsyncDatabase,
    current: RwLock<String>,
}

impl VisitorIdentity {
    /// Load the stored id, creating one on first run.
    pub async fn load(db: AsyncDatabase) -> Self {
        let stored = db
            .call(|conn| queries::get_setting(conn, VISITOR_ID_SETTING))
            .await;

        let id = match stored {
            Ok(Some(id)) => id,
            Ok(None) => {
                let id = new_visitor_id();
                persist(&db, &id).await;
                info!("Created visitor id");
                id
            }
            Err(e) => {
                warn!(error = %e, "Failed to load visitor id, using a new one");
                new_visitor_id()
            }
        };

        Self {
            db,
            current: RwLock::new(id),
        }
    }

    pub fn current(&self) -> String {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Rotate to a fresh id and return it.
    pub async fn reset(&self) -> String {
        let id = new_visitor_id();
        match self.current.write() {
            Ok(mut guard) => *guard = id.clone(),
            Err(poisoned) => *poisoned.into_inner() = id.clone(),
        }
        persist(&self.db, &id).await;
        info!("Visitor id reset");
        id
    }
}

async fn persist(db: &AsyncDatabase, id: &str) {
    let value = id.to_string();
    if let Err(e) = db
        .call(move |conn| queries::set_setting(conn, VISITOR_ID_SETTING, &value))
        .await
    {
        warn!(error = %e, "Failed to persist visitor id");
    }
}
