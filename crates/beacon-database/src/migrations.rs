//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.

use crate::{DatabaseError, DatabaseResult};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version > CURRENT_VERSION {
        return Err(DatabaseError::SchemaTooNew {
            found: current_version,
            supported: CURRENT_VERSION,
        });
    }

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_queue_schema(conn)?;
    }
    if current_version < 2 {
        migrate_v2_settings(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: dispatches, queue entries, and the processor registry.
fn migrate_v1_queue_schema(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: queue schema");

    // AUTOINCREMENT keeps module ids from ever being reused.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS module (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS dispatch (
            uuid TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            timestamp INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_dispatch_timestamp
            ON dispatch(timestamp);

        CREATE TABLE IF NOT EXISTS queue (
            dispatch_uuid TEXT NOT NULL REFERENCES dispatch(uuid) ON DELETE CASCADE,
            processor_id INTEGER NOT NULL REFERENCES module(id) ON DELETE CASCADE,
            PRIMARY KEY (dispatch_uuid, processor_id)
        );

        CREATE INDEX IF NOT EXISTS idx_queue_processor_id
            ON queue(processor_id);
        ",
    )?;

    record_migration(conn, 1, "queue_schema")?;
    Ok(())
}

/// V2: key/value settings.
fn migrate_v2_settings(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: settings");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS setting (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;

    record_migration(conn, 2, "settings")?;
    Ok(())
}
