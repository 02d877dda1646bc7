//! Query functions for the durable store.
//!
//! Every function takes a plain `&Connection` so it can run inside
//! [`crate::AsyncDatabase::call`]. Functions that delete queue rows also
//! delete dispatch rows left without any queue row, inside the same
//! transaction.

use crate::DatabaseResult;
use beacon_core::{DataObject, Dispatch, CONSENT_PROCESSOR};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashSet;
use tracing::debug;

/// A registered processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    pub id: i64,
    pub name: String,
}

/// What a call to [`insert_dispatches`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOutcome {
    /// New dispatch rows.
    pub inserted: usize,
    /// Dispatches removed (or refused) to respect the maximum size.
    pub evicted: usize,
    /// Dispatches purged for being older than the expiry cutoff.
    pub expired: usize,
}

// ==========================================
// Modules
// ==========================================

/// Register a processor name, returning its stable id.
pub fn ensure_module(conn: &Connection, name: &str) -> DatabaseResult<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO module (name) VALUES (?1)",
        params![name],
    )?;
    let id = conn.query_row(
        "SELECT id FROM module WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// List registered processors ordered by id.
pub fn list_modules(conn: &Connection) -> DatabaseResult<Vec<ModuleRecord>> {
    let mut stmt = conn.prepare_cached("SELECT id, name FROM module ORDER BY id")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ModuleRecord {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ==========================================
// Counts
// ==========================================

/// Number of distinct dispatches with at least one queue entry.
pub fn count_dispatches(conn: &Connection) -> DatabaseResult<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT dispatch_uuid) FROM queue",
        [],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Number of queue entries owed by one processor.
pub fn count_for_processor(conn: &Connection, processor: &str) -> DatabaseResult<usize> {
    let mut stmt = conn.prepare_cached(
        "SELECT COUNT(*) FROM queue q
         JOIN module m ON m.id = q.processor_id
         WHERE m.name = ?1",
    )?;
    let count: i64 = stmt.query_row(params![processor], |row| row.get(0))?;
    Ok(count as usize)
}

// ==========================================
// Insertion
// ==========================================

/// Persist dispatches for a set of processors in one transaction.
///
/// Expired rows are purged first when `expiry_cutoff` is set. With
/// `max_size` set, the oldest stored dispatches are evicted until the new
/// ones fit; if the batch alone is larger than `max_size`, only its newest
/// `max_size` dispatches are kept. A dispatch whose id is already stored only
/// gains the missing queue entries; its payload is left as it was.
///
/// Each dispatch row is followed immediately by its queue rows.
pub fn insert_dispatches(
    conn: &Connection,
    dispatches: &[Dispatch],
    processors: &[String],
    max_size: Option<usize>,
    expiry_cutoff: Option<i64>,
) -> DatabaseResult<StoreOutcome> {
    let mut outcome = StoreOutcome::default();
    if dispatches.is_empty() || processors.is_empty() {
        return Ok(outcome);
    }

    let tx = conn.unchecked_transaction()?;

    if let Some(cutoff) = expiry_cutoff {
        outcome.expired = expire_rows(&tx, cutoff)?;
    }

    let mut processor_ids = Vec::with_capacity(processors.len());
    for name in processors {
        processor_ids.push(ensure_module(&tx, name)?);
    }

    let incoming = newest_within(dispatches, max_size);
    outcome.evicted += dispatches.len() - incoming.len();

    if let Some(max) = max_size {
        let mut new_count = 0;
        for dispatch in &incoming {
            if !dispatch_exists(&tx, &dispatch.id)? {
                new_count += 1;
            }
        }
        let current = count_dispatches(&tx)?;
        let overflow = (current + new_count).saturating_sub(max);
        if overflow > 0 {
            let protected: Vec<String> = incoming.iter().map(|d| d.id.clone()).collect();
            let victims = oldest_dispatch_ids(&tx, overflow, &protected)?;
            outcome.evicted += remove_dispatch_rows(&tx, &victims)?;
        }
    }

    {
        let mut insert_dispatch = tx.prepare_cached(
            "INSERT OR IGNORE INTO dispatch (uuid, payload, timestamp) VALUES (?1, ?2, ?3)",
        )?;
        let mut insert_entry = tx.prepare_cached(
            "INSERT OR IGNORE INTO queue (dispatch_uuid, processor_id) VALUES (?1, ?2)",
        )?;

        for dispatch in &incoming {
            let payload = serde_json::to_string(&dispatch.payload)?;
            outcome.inserted +=
                insert_dispatch.execute(params![dispatch.id, payload, dispatch.timestamp])?;
            for processor_id in &processor_ids {
                insert_entry.execute(params![dispatch.id, processor_id])?;
            }
        }
    }

    tx.commit()?;

    debug!(
        inserted = outcome.inserted,
        evicted = outcome.evicted,
        expired = outcome.expired,
        processors = processors.len(),
        "Stored dispatches"
    );
    Ok(outcome)
}

/// The newest `max` dispatches of a batch, in their original order.
fn newest_within(dispatches: &[Dispatch], max_size: Option<usize>) -> Vec<&Dispatch> {
    let max = match max_size {
        Some(max) if dispatches.len() > max => max,
        _ => return dispatches.iter().collect(),
    };

    let mut order: Vec<usize> = (0..dispatches.len()).collect();
    order.sort_by_key(|&i| (dispatches[i].timestamp, i));
    let kept: HashSet<usize> = order[order.len() - max..].iter().copied().collect();

    dispatches
        .iter()
        .enumerate()
        .filter(|(i, _)| kept.contains(i))
        .map(|(_, d)| d)
        .collect()
}

fn dispatch_exists(conn: &Connection, id: &str) -> DatabaseResult<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM dispatch WHERE uuid = ?1",
            params![id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Dispatches and the processors they should be linked to.
#[derive(Debug, Clone, Default)]
pub struct Route {
    pub dispatches: Vec<Dispatch>,
    pub processors: Vec<String>,
}

/// Move every dispatch linked to `from` onto `routes`, atomically.
///
/// The links of `from` are removed, each routed dispatch is written with its
/// new payload (replacing a stored one with the same id) and linked to its
/// route's processors. Dispatches left without links are collected and the
/// queue is evicted down to `max_size`. Any failure leaves the store as it
/// was. `inserted` counts routed dispatches.
pub fn reroute_dispatches(
    conn: &Connection,
    from: &str,
    routes: &[Route],
    max_size: Option<usize>,
    expiry_cutoff: Option<i64>,
) -> DatabaseResult<StoreOutcome> {
    let mut outcome = StoreOutcome::default();
    let tx = conn.unchecked_transaction()?;

    if let Some(cutoff) = expiry_cutoff {
        outcome.expired = expire_rows(&tx, cutoff)?;
    }

    tx.execute(
        "DELETE FROM queue
         WHERE processor_id = (SELECT id FROM module WHERE name = ?1)",
        params![from],
    )?;

    for route in routes {
        if route.dispatches.is_empty() || route.processors.is_empty() {
            continue;
        }
        let mut processor_ids = Vec::with_capacity(route.processors.len());
        for name in &route.processors {
            processor_ids.push(ensure_module(&tx, name)?);
        }

        let mut upsert_dispatch = tx.prepare_cached(
            "INSERT INTO dispatch (uuid, payload, timestamp) VALUES (?1, ?2, ?3)
             ON CONFLICT(uuid) DO UPDATE SET payload = excluded.payload",
        )?;
        let mut insert_entry = tx.prepare_cached(
            "INSERT OR IGNORE INTO queue (dispatch_uuid, processor_id) VALUES (?1, ?2)",
        )?;
        for dispatch in &route.dispatches {
            let payload = serde_json::to_string(&dispatch.payload)?;
            upsert_dispatch.execute(params![dispatch.id, payload, dispatch.timestamp])?;
            for processor_id in &processor_ids {
                insert_entry.execute(params![dispatch.id, processor_id])?;
            }
            outcome.inserted += 1;
        }
    }

    delete_orphaned_dispatches(&tx)?;
    if let Some(max) = max_size {
        let overflow = count_dispatches(&tx)?.saturating_sub(max);
        if overflow > 0 {
            let victims = oldest_dispatch_ids(&tx, overflow, &[])?;
            outcome.evicted = remove_dispatch_rows(&tx, &victims)?;
        }
    }

    tx.commit()?;

    debug!(
        from,
        routed = outcome.inserted,
        evicted = outcome.evicted,
        "Rerouted dispatches"
    );
    Ok(outcome)
}

// ==========================================
// Draining
// ==========================================

/// Oldest dispatches still owed by `processor`.
///
/// Dispatches with a timestamp before `cutoff` and ids in `excluding` are
/// skipped. Results are ordered by timestamp, ties by insertion order.
pub fn pending_for_processor(
    conn: &Connection,
    processor: &str,
    cutoff: Option<i64>,
    limit: Option<usize>,
    excluding: &[String],
) -> DatabaseResult<Vec<Dispatch>> {
    let mut sql = String::from(
        "SELECT d.uuid, d.payload, d.timestamp
         FROM dispatch d
         JOIN queue q ON q.dispatch_uuid = d.uuid
         JOIN module m ON m.id = q.processor_id
         WHERE m.name = ? AND d.timestamp >= ?",
    );
    let mut values: Vec<Value> = vec![
        Value::Text(processor.to_string()),
        Value::Integer(cutoff.unwrap_or(i64::MIN)),
    ];

    if !excluding.is_empty() {
        sql.push_str(&format!(
            " AND d.uuid NOT IN ({})",
            placeholders(excluding.len())
        ));
        values.extend(excluding.iter().cloned().map(Value::Text));
    }

    // LIMIT -1 is unbounded in SQLite.
    sql.push_str(" ORDER BY d.timestamp, d.rowid LIMIT ?");
    values.push(Value::Integer(limit.map_or(-1, |l| l as i64)));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), |row| {
            let payload: String = row.get(1)?;
            let payload: DataObject = serde_json::from_str(&payload)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
            Ok(Dispatch::from_parts(
                row.get::<_, String>(0)?,
                payload,
                row.get(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

// ==========================================
// Removal
// ==========================================

/// Delete the queue entries of `ids` for one processor.
///
/// Returns the number of entries removed.
pub fn delete_queue_entries(
    conn: &Connection,
    ids: &[String],
    processor: &str,
) -> DatabaseResult<usize> {
    if ids.is_empty() {
        return Ok(0);
    }

    let tx = conn.unchecked_transaction()?;
    let sql = format!(
        "DELETE FROM queue
         WHERE processor_id = (SELECT id FROM module WHERE name = ?)
           AND dispatch_uuid IN ({})",
        placeholders(ids.len())
    );
    let mut values: Vec<Value> = Vec::with_capacity(ids.len() + 1);
    values.push(Value::Text(processor.to_string()));
    values.extend(ids.iter().cloned().map(Value::Text));

    let removed = tx.execute(&sql, params_from_iter(values))?;
    delete_orphaned_dispatches(&tx)?;
    tx.commit()?;
    Ok(removed)
}

/// Delete every queue entry of one processor.
pub fn delete_processor_entries(conn: &Connection, processor: &str) -> DatabaseResult<usize> {
    let tx = conn.unchecked_transaction()?;
    let removed = tx.execute(
        "DELETE FROM queue
         WHERE processor_id = (SELECT id FROM module WHERE name = ?1)",
        params![processor],
    )?;
    delete_orphaned_dispatches(&tx)?;
    tx.commit()?;
    Ok(removed)
}

/// Delete the queue entries of every processor not named in `keep`.
///
/// Entries of the consent holding partition are always kept.
pub fn delete_entries_not_in(conn: &Connection, keep: &[String]) -> DatabaseResult<usize> {
    let mut values: Vec<Value> = Vec::with_capacity(keep.len() + 1);
    values.push(Value::Text(CONSENT_PROCESSOR.to_string()));
    values.extend(keep.iter().cloned().map(Value::Text));

    let tx = conn.unchecked_transaction()?;
    let sql = format!(
        "DELETE FROM queue
         WHERE processor_id IN (SELECT id FROM module WHERE name NOT IN ({}))",
        placeholders(values.len())
    );
    let removed = tx.execute(&sql, params_from_iter(values))?;
    delete_orphaned_dispatches(&tx)?;
    tx.commit()?;
    Ok(removed)
}

/// Evict the oldest dispatches until at most `max_size` remain.
///
/// Returns the number of dispatches evicted.
pub fn evict_to_capacity(conn: &Connection, max_size: usize) -> DatabaseResult<usize> {
    let tx = conn.unchecked_transaction()?;
    let current = count_dispatches(&tx)?;
    let overflow = current.saturating_sub(max_size);
    let evicted = if overflow > 0 {
        let victims = oldest_dispatch_ids(&tx, overflow, &[])?;
        remove_dispatch_rows(&tx, &victims)?
    } else {
        0
    };
    tx.commit()?;
    Ok(evicted)
}

/// Delete dispatches with a timestamp before `cutoff`.
///
/// Returns the number of dispatches deleted.
pub fn delete_expired(conn: &Connection, cutoff: i64) -> DatabaseResult<usize> {
    let tx = conn.unchecked_transaction()?;
    let expired = expire_rows(&tx, cutoff)?;
    tx.commit()?;
    Ok(expired)
}

fn expire_rows(conn: &Connection, cutoff: i64) -> DatabaseResult<usize> {
    conn.execute(
        "DELETE FROM queue
         WHERE dispatch_uuid IN (SELECT uuid FROM dispatch WHERE timestamp < ?1)",
        params![cutoff],
    )?;
    let expired = conn.execute("DELETE FROM dispatch WHERE timestamp < ?1", params![cutoff])?;
    if expired > 0 {
        debug!(expired, cutoff, "Purged expired dispatches");
    }
    Ok(expired)
}

fn oldest_dispatch_ids(
    conn: &Connection,
    count: usize,
    protected: &[String],
) -> DatabaseResult<Vec<String>> {
    let mut sql = String::from("SELECT uuid FROM dispatch");
    let mut values: Vec<Value> = Vec::with_capacity(protected.len() + 1);
    if !protected.is_empty() {
        sql.push_str(&format!(
            " WHERE uuid NOT IN ({})",
            placeholders(protected.len())
        ));
        values.extend(protected.iter().cloned().map(Value::Text));
    }
    sql.push_str(" ORDER BY timestamp, rowid LIMIT ?");
    values.push(Value::Integer(count as i64));

    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map(params_from_iter(values), |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

fn remove_dispatch_rows(conn: &Connection, ids: &[String]) -> DatabaseResult<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let marks = placeholders(ids.len());
    conn.execute(
        &format!("DELETE FROM queue WHERE dispatch_uuid IN ({})", marks),
        params_from_iter(ids.iter()),
    )?;
    let removed = conn.execute(
        &format!("DELETE FROM dispatch WHERE uuid IN ({})", marks),
        params_from_iter(ids.iter()),
    )?;
    debug!(evicted = removed, "Evicted oldest dispatches");
    Ok(removed)
}

fn delete_orphaned_dispatches(conn: &Connection) -> DatabaseResult<usize> {
    let removed = conn.execute(
        "DELETE FROM dispatch
         WHERE NOT EXISTS (SELECT 1 FROM queue WHERE queue.dispatch_uuid = dispatch.uuid)",
        [],
    )?;
    Ok(removed)
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(", ")
}

// ==========================================
// Settings
// ==========================================

/// Get a setting value.
pub fn get_setting(conn: &Connection, key: &str) -> DatabaseResult<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM setting WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Set a setting value.
pub fn set_setting(conn: &Connection, key: &str, value: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO setting (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
        params![key, value],
    )?;
    Ok(())
}

/// Delete a setting.
pub fn delete_setting(conn: &Connection, key: &str) -> DatabaseResult<bool> {
    let count = conn.execute("DELETE FROM setting WHERE key = ?1", params![key])?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_migrations;
    use serde_json::json;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn dispatch(id: &str, timestamp: i64) -> Dispatch {
        let payload = json!({"event": id}).as_object().cloned().unwrap();
        Dispatch::from_parts(id, payload, timestamp)
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn ids(dispatches: &[Dispatch]) -> Vec<&str> {
        dispatches.iter().map(|d| d.id.as_str()).collect()
    }

    fn dispatch_rows(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM dispatch", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn empty_inputs_store_nothing() {
        let conn = conn();
        let outcome = insert_dispatches(&conn, &[dispatch("a", 1)], &[], None, None).unwrap();
        assert_eq!(outcome, StoreOutcome::default());
        let outcome = insert_dispatches(&conn, &[], &names(&["A"]), None, None).unwrap();
        assert_eq!(outcome, StoreOutcome::default());

        assert_eq!(dispatch_rows(&conn), 0);
        assert!(list_modules(&conn).unwrap().is_empty());
    }

    #[test]
    fn store_beyond_capacity_evicts_oldest() {
        let conn = conn();
        let batch = [dispatch("a", 1), dispatch("b", 2), dispatch("c", 3)];
        let outcome = insert_dispatches(&conn, &batch, &names(&["A"]), Some(2), None).unwrap();

        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.evicted, 1);
        assert_eq!(count_dispatches(&conn).unwrap(), 2);
        let pending = pending_for_processor(&conn, "A", None, None, &[]).unwrap();
        assert_eq!(ids(&pending), vec!["b", "c"]);
    }

    #[test]
    fn eviction_ignores_which_processors_need_the_dispatch() {
        let conn = conn();
        insert_dispatches(&conn, &[dispatch("a", 1)], &names(&["A"]), Some(2), None).unwrap();
        insert_dispatches(&conn, &[dispatch("b", 2)], &names(&["B"]), Some(2), None).unwrap();
        insert_dispatches(&conn, &[dispatch("c", 3)], &names(&["B"]), Some(2), None).unwrap();

        assert!(pending_for_processor(&conn, "A", None, None, &[])
            .unwrap()
            .is_empty());
        assert_eq!(count_dispatches(&conn).unwrap(), 2);
        assert_eq!(dispatch_rows(&conn), 2);
    }

    #[test]
    fn capacity_holds_across_sequences_of_stores() {
        let conn = conn();
        for i in 0..20 {
            let batch: Vec<Dispatch> = (0..(i % 4 + 1))
                .map(|j| dispatch(&format!("d-{}-{}", i, j), i * 10 + j))
                .collect();
            insert_dispatches(&conn, &batch, &names(&["A", "B"]), Some(5), None).unwrap();
            assert!(count_dispatches(&conn).unwrap() <= 5);
        }
        let pending = pending_for_processor(&conn, "B", None, None, &[]).unwrap();
        assert_eq!(ids(&pending), vec!["d-18-2", "d-19-0", "d-19-1", "d-19-2", "d-19-3"]);
    }

    #[test]
    fn negative_size_disables_eviction() {
        let conn = conn();
        let batch: Vec<Dispatch> = (0..10).map(|i| dispatch(&format!("d{}", i), i)).collect();
        insert_dispatches(&conn, &batch, &names(&["A"]), None, None).unwrap();
        assert_eq!(count_dispatches(&conn).unwrap(), 10);
    }

    #[test]
    fn existing_id_only_gains_links() {
        let conn = conn();
        insert_dispatches(&conn, &[dispatch("a", 1)], &names(&["A"]), None, None).unwrap();

        let mut changed = dispatch("a", 1);
        changed.payload.insert("extra".to_string(), json!(1));
        let outcome =
            insert_dispatches(&conn, &[changed], &names(&["A", "B"]), Some(1), None).unwrap();

        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.evicted, 0);
        let pending = pending_for_processor(&conn, "B", None, None, &[]).unwrap();
        assert_eq!(ids(&pending), vec!["a"]);
        assert!(pending[0].payload.get("extra").is_none());
        assert_eq!(count_for_processor(&conn, "A").unwrap(), 1);
    }

    #[test]
    fn drain_orders_limits_and_excludes() {
        let conn = conn();
        let batch = [
            dispatch("late", 30),
            dispatch("early", 10),
            dispatch("tie-1", 20),
            dispatch("tie-2", 20),
        ];
        insert_dispatches(&conn, &batch, &names(&["A"]), None, None).unwrap();

        let all = pending_for_processor(&conn, "A", None, None, &[]).unwrap();
        assert_eq!(ids(&all), vec!["early", "tie-1", "tie-2", "late"]);

        let limited = pending_for_processor(&conn, "A", None, Some(2), &[]).unwrap();
        assert_eq!(ids(&limited), vec!["early", "tie-1"]);

        let excluded =
            pending_for_processor(&conn, "A", None, Some(2), &names(&["early"])).unwrap();
        assert_eq!(ids(&excluded), vec!["tie-1", "tie-2"]);

        let fresh = pending_for_processor(&conn, "A", Some(20), None, &[]).unwrap();
        assert_eq!(ids(&fresh), vec!["tie-1", "tie-2", "late"]);

        assert!(pending_for_processor(&conn, "unknown", None, None, &[])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn payload_keeps_value_types() {
        let conn = conn();
        let payload = json!({
            "s": "x", "i": 3, "f": 2.5, "b": true, "n": null,
            "a": [1, "2"], "m": {"k": [false]}
        })
        .as_object()
        .cloned()
        .unwrap();
        let original = Dispatch::from_parts("typed", payload, 7);
        insert_dispatches(&conn, &[original.clone()], &names(&["A"]), None, None).unwrap();

        let pending = pending_for_processor(&conn, "A", None, None, &[]).unwrap();
        assert_eq!(pending, vec![original]);
    }

    #[test]
    fn acknowledging_last_entry_removes_dispatch() {
        let conn = conn();
        insert_dispatches(
            &conn,
            &[dispatch("a", 1), dispatch("b", 2)],
            &names(&["A", "B"]),
            None,
            None,
        )
        .unwrap();

        let removed = delete_queue_entries(&conn, &names(&["a"]), "A").unwrap();
        assert_eq!(removed, 1);
        assert_eq!(dispatch_rows(&conn), 2);
        assert_eq!(count_for_processor(&conn, "A").unwrap(), 1);

        delete_queue_entries(&conn, &names(&["a"]), "B").unwrap();
        assert_eq!(dispatch_rows(&conn), 1);
        assert_eq!(count_dispatches(&conn).unwrap(), 1);
    }

    #[test]
    fn deleting_processor_entries_leaves_no_orphans() {
        let conn = conn();
        insert_dispatches(&conn, &[dispatch("a", 1)], &names(&["consent"]), None, None).unwrap();
        insert_dispatches(&conn, &[dispatch("b", 2)], &names(&["consent", "A"]), None, None)
            .unwrap();

        assert_eq!(delete_processor_entries(&conn, "consent").unwrap(), 2);
        assert_eq!(dispatch_rows(&conn), 1);
        assert_eq!(
            ids(&pending_for_processor(&conn, "A", None, None, &[]).unwrap()),
            vec!["b"]
        );
    }

    #[test]
    fn retaining_processors_always_keeps_consent() {
        let conn = conn();
        insert_dispatches(&conn, &[dispatch("a", 1)], &names(&["consent"]), None, None).unwrap();
        insert_dispatches(&conn, &[dispatch("b", 2)], &names(&["A"]), None, None).unwrap();
        insert_dispatches(&conn, &[dispatch("c", 3)], &names(&["B"]), None, None).unwrap();

        let removed = delete_entries_not_in(&conn, &names(&["B"])).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(count_for_processor(&conn, "consent").unwrap(), 1);
        assert_eq!(count_for_processor(&conn, "A").unwrap(), 0);
        assert_eq!(dispatch_rows(&conn), 2);
    }

    #[test]
    fn evict_to_capacity_drops_oldest() {
        let conn = conn();
        let batch: Vec<Dispatch> = (0..5).map(|i| dispatch(&format!("d{}", i), i)).collect();
        insert_dispatches(&conn, &batch, &names(&["A"]), None, None).unwrap();

        assert_eq!(evict_to_capacity(&conn, 2).unwrap(), 3);
        assert_eq!(
            ids(&pending_for_processor(&conn, "A", None, None, &[]).unwrap()),
            vec!["d3", "d4"]
        );
        assert_eq!(evict_to_capacity(&conn, 2).unwrap(), 0);
    }

    #[test]
    fn expired_dispatches_are_purged() {
        let conn = conn();
        let batch = [dispatch("old", 5), dispatch("new", 50)];
        insert_dispatches(&conn, &batch, &names(&["A", "B"]), None, None).unwrap();

        assert_eq!(delete_expired(&conn, 10).unwrap(), 1);
        assert_eq!(dispatch_rows(&conn), 1);
        assert_eq!(count_for_processor(&conn, "A").unwrap(), 1);

        let outcome =
            insert_dispatches(&conn, &[dispatch("newer", 80)], &names(&["A"]), None, Some(60))
                .unwrap();
        assert_eq!(outcome.expired, 1);
        assert_eq!(
            ids(&pending_for_processor(&conn, "A", None, None, &[]).unwrap()),
            vec!["newer"]
        );
    }

    #[test]
    fn module_ids_are_stable_and_never_reused() {
        let conn = conn();
        let a = ensure_module(&conn, "A").unwrap();
        let b = ensure_module(&conn, "B").unwrap();
        assert_eq!(ensure_module(&conn, "A").unwrap(), a);
        assert_ne!(a, b);

        conn.execute("DELETE FROM module WHERE name = 'B'", []).unwrap();
        let c = ensure_module(&conn, "C").unwrap();
        assert!(c > b);

        let modules = list_modules(&conn).unwrap();
        assert_eq!(
            modules,
            vec![
                ModuleRecord { id: a, name: "A".to_string() },
                ModuleRecord { id: c, name: "C".to_string() },
            ]
        );
    }

    #[test]
    fn settings_round_trip() {
        let conn = conn();
        assert!(get_setting(&conn, "visitor_id").unwrap().is_none());

        set_setting(&conn, "visitor_id", "v1").unwrap();
        set_setting(&conn, "visitor_id", "v2").unwrap();
        assert_eq!(get_setting(&conn, "visitor_id").unwrap().as_deref(), Some("v2"));

        assert!(delete_setting(&conn, "visitor_id").unwrap());
        assert!(!delete_setting(&conn, "visitor_id").unwrap());
    }

    #[test]
    fn reroute_replaces_payloads_and_links() {
        let conn = conn();
        insert_dispatches(&conn, &[dispatch("a", 1), dispatch("b", 2)], &names(&["consent"]), None, None)
            .unwrap();

        let mut enriched = dispatch("a", 1);
        enriched
            .payload
            .insert("consent_type".to_string(), json!("explicit"));
        let routes = vec![Route {
            dispatches: vec![enriched],
            processors: names(&["Collect"]),
        }];
        let outcome = reroute_dispatches(&conn, "consent", &routes, None, None).unwrap();

        assert_eq!(outcome.inserted, 1);
        assert_eq!(count_for_processor(&conn, "consent").unwrap(), 0);
        let pending = pending_for_processor(&conn, "Collect", None, None, &[]).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["consent_type"], json!("explicit"));
        assert_eq!(dispatch_rows(&conn), 1);
    }

    #[test]
    fn failed_reroute_keeps_source_links() {
        let conn = conn();
        insert_dispatches(&conn, &[dispatch("a", 1), dispatch("b", 2)], &names(&["consent"]), None, None)
            .unwrap();
        ensure_module(&conn, "Collect").unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_collect BEFORE INSERT ON queue
             WHEN NEW.processor_id = (SELECT id FROM module WHERE name = 'Collect')
             BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .unwrap();

        let routes = vec![Route {
            dispatches: vec![dispatch("a", 1), dispatch("b", 2)],
            processors: names(&["Collect"]),
        }];
        assert!(reroute_dispatches(&conn, "consent", &routes, None, None).is_err());

        assert_eq!(count_for_processor(&conn, "consent").unwrap(), 2);
        assert_eq!(dispatch_rows(&conn), 2);
    }
}
