//! Event queue over the durable store.

use crate::QueueResult;
use beacon_core::{Clock, Dispatch, ProcessorName, QueueConfig};
use beacon_database::{queries, AsyncDatabase, Route, StoreOutcome};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

/// Capacity of the store notification channel.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Shared handle to the event queue.
pub type QueueHandle = Arc<EventQueue>;

#[derive(Debug, Clone, Copy)]
struct Limits {
    /// `None` disables eviction.
    max_size: Option<usize>,
    expiration: Duration,
}

impl Limits {
    fn cutoff(&self, now_millis: i64) -> i64 {
        cutoff_for(now_millis, self.expiration)
    }
}

fn cutoff_for(now_millis: i64, window: Duration) -> i64 {
    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    now_millis.saturating_sub(window_ms)
}

fn max_size_from(raw: i64) -> Option<usize> {
    usize::try_from(raw).ok()
}

/// Persistent multi-processor event queue.
///
/// Mutations hold the limits lock for their whole database call, so stores
/// never interleave with a resize or an expiration change.
pub struct EventQueue {
    db: AsyncDatabase,
    clock: Arc<dyn Clock>,
    limits: Mutex<Limits>,
    changes: broadcast::Sender<BTreeSet<ProcessorName>>,
}

impl EventQueue {
    /// Create a queue over an opened database.
    pub fn new(db: AsyncDatabase, clock: Arc<dyn Clock>, config: &QueueConfig) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            db,
            clock,
            limits: Mutex::new(Limits {
                max_size: max_size_from(config.max_size),
                expiration: config.expiration(),
            }),
            changes,
        }
    }

    /// Persist `dispatches` for every processor in `processors`.
    ///
    /// Does nothing when either side is empty.
    pub async fn store(
        &self,
        dispatches: Vec<Dispatch>,
        processors: &BTreeSet<ProcessorName>,
    ) -> QueueResult<StoreOutcome> {
        if dispatches.is_empty() || processors.is_empty() {
            return Ok(StoreOutcome::default());
        }

        let limits = self.limits.lock().await;
        let cutoff = limits.cutoff(self.clock.now_millis());
        let max_size = limits.max_size;
        let names: Vec<String> = processors.iter().cloned().collect();

        let outcome = self
            .db
            .call(move |conn| {
                queries::insert_dispatches(conn, &dispatches, &names, max_size, Some(cutoff))
            })
            .await?;
        drop(limits);

        if outcome.evicted > 0 {
            info!(evicted = outcome.evicted, "Queue full, evicted oldest dispatches");
        }
        let _ = self.changes.send(processors.clone());
        Ok(outcome)
    }

    /// Atomically move everything owed by `from` onto new routes.
    ///
    /// Each route pairs dispatches with the processors that now owe them;
    /// stored payloads are replaced by the routed ones. On error nothing
    /// changes.
    pub async fn reroute(
        &self,
        from: &str,
        routes: Vec<(Vec<Dispatch>, BTreeSet<ProcessorName>)>,
    ) -> QueueResult<StoreOutcome> {
        let notified: BTreeSet<ProcessorName> = routes
            .iter()
            .filter(|(dispatches, _)| !dispatches.is_empty())
            .flat_map(|(_, processors)| processors.iter().cloned())
            .collect();
        let routes: Vec<Route> = routes
            .into_iter()
            .map(|(dispatches, processors)| Route {
                dispatches,
                processors: processors.into_iter().collect(),
            })
            .collect();

        let limits = self.limits.lock().await;
        let cutoff = limits.cutoff(self.clock.now_millis());
        let max_size = limits.max_size;
        let source = from.to_string();

        let outcome = self
            .db
            .call(move |conn| {
                queries::reroute_dispatches(conn, &source, &routes, max_size, Some(cutoff))
            })
            .await?;
        drop(limits);

        if outcome.evicted > 0 {
            info!(evicted = outcome.evicted, "Queue full, evicted oldest dispatches");
        }
        if !notified.is_empty() {
            let _ = self.changes.send(notified);
        }
        Ok(outcome)
    }

    /// Oldest non-expired dispatches still owed by `processor`.
    ///
    /// Read-only; entries stay queued until acknowledged.
    pub async fn drain(
        &self,
        processor: &str,
        limit: Option<usize>,
        excluding: &BTreeSet<String>,
    ) -> QueueResult<Vec<Dispatch>> {
        let cutoff = self.limits.lock().await.cutoff(self.clock.now_millis());
        let processor = processor.to_string();
        let excluding: Vec<String> = excluding.iter().cloned().collect();

        let dispatches = self
            .db
            .call(move |conn| {
                queries::pending_for_processor(conn, &processor, Some(cutoff), limit, &excluding)
            })
            .await?;
        Ok(dispatches)
    }

    /// Remove the entries of `ids` for one processor.
    pub async fn acknowledge(&self, ids: &[String], processor: &str) -> QueueResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids = ids.to_vec();
        let processor_name = processor.to_string();
        let removed = self
            .db
            .call(move |conn| queries::delete_queue_entries(conn, &ids, &processor_name))
            .await?;
        debug!(processor, removed, "Acknowledged dispatches");
        Ok(removed)
    }

    /// Remove every entry of one processor.
    pub async fn discard_all(&self, processor: &str) -> QueueResult<usize> {
        let processor_name = processor.to_string();
        let removed = self
            .db
            .call(move |conn| queries::delete_processor_entries(conn, &processor_name))
            .await?;
        if removed > 0 {
            info!(processor, removed, "Discarded queued dispatches");
        }
        Ok(removed)
    }

    /// Drop entries of processors that are no longer registered.
    ///
    /// The consent holding partition is never affected.
    pub async fn retain_processors(&self, processors: &BTreeSet<ProcessorName>) -> QueueResult<usize> {
        let keep: Vec<String> = processors.iter().cloned().collect();
        let removed = self
            .db
            .call(move |conn| queries::delete_entries_not_in(conn, &keep))
            .await?;
        if removed > 0 {
            info!(removed, "Removed entries of unregistered processors");
        }
        Ok(removed)
    }

    /// Change the maximum size and evict immediately if over it.
    ///
    /// A negative size disables eviction.
    pub async fn resize(&self, new_max: i64) -> QueueResult<usize> {
        let mut limits = self.limits.lock().await;
        limits.max_size = max_size_from(new_max);

        let evicted = match limits.max_size {
            Some(max) => {
                self.db
                    .call(move |conn| queries::evict_to_capacity(conn, max))
                    .await?
            }
            None => 0,
        };
        info!(max_size = new_max, evicted, "Queue resized");
        Ok(evicted)
    }

    /// Change the expiration window.
    ///
    /// Purges with the stricter of the old and new windows before switching.
    pub async fn set_expiration(&self, window: Duration) -> QueueResult<usize> {
        let mut limits = self.limits.lock().await;
        let stricter = limits.expiration.min(window);
        let cutoff = cutoff_for(self.clock.now_millis(), stricter);

        let purged = self
            .db
            .call(move |conn| queries::delete_expired(conn, cutoff))
            .await?;
        limits.expiration = window;
        info!(window_secs = window.as_secs(), purged, "Expiration window changed");
        Ok(purged)
    }

    /// Delete every expired dispatch.
    pub async fn purge_expired(&self) -> QueueResult<usize> {
        let limits = self.limits.lock().await;
        let cutoff = limits.cutoff(self.clock.now_millis());
        let purged = self
            .db
            .call(move |conn| queries::delete_expired(conn, cutoff))
            .await?;
        Ok(purged)
    }

    /// Number of distinct dispatches still owed by any processor.
    pub async fn size(&self) -> QueueResult<usize> {
        Ok(self.db.call(|conn| queries::count_dispatches(conn)).await?)
    }

    /// Number of entries owed by one processor.
    pub async fn size_for(&self, processor: &str) -> QueueResult<usize> {
        let processor = processor.to_string();
        Ok(self
            .db
            .call(move |conn| queries::count_for_processor(conn, &processor))
            .await?)
    }

    /// Current maximum size, `None` when eviction is disabled.
    pub async fn max_size(&self) -> Option<usize> {
        self.limits.lock().await.max_size
    }

    /// Current expiration window.
    pub async fn expiration(&self) -> Duration {
        self.limits.lock().await.expiration
    }

    /// Notified with the processor set after every successful store.
    pub fn subscribe(&self) -> broadcast::Receiver<BTreeSet<ProcessorName>> {
        self.changes.subscribe()
    }

    /// The underlying database.
    pub fn database(&self) -> &AsyncDatabase {
        &self.db
    }
}
