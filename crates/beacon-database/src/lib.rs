//! SQLite durable store for the event queue.
//!
//! This crate provides:
//! - Async SQLite executor with a dedicated thread ([`AsyncDatabase`])
//! - Versioned schema migrations
//! - Standalone query functions over `&Connection` ([`queries`])
//!
//! # Schema
//!
//! - `dispatch(uuid, payload, timestamp)`: one row per accepted event
//! - `queue(dispatch_uuid, processor_id)`: processors still owing work
//! - `module(id, name)`: processor registry with stable ids
//! - `setting(key, value)`: small persisted values (visitor identity)
//!
//! A dispatch row exists iff at least one queue row references it. Every
//! query that deletes queue rows removes orphaned dispatch rows in the same
//! transaction.
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let size = db.call(|conn| queries::count_dispatches(conn)).await?;
//! ```
//!
//! Only SQL runs inside `db.call()`. Network calls never happen while a
//! store transaction is open.

mod error;
mod executor;
mod migrations;
pub mod queries;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use queries::{ModuleRecord, Route, StoreOutcome};
