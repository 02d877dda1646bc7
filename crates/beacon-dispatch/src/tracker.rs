//! The tracking facade.

use crate::{
    CollectDispatcher, CycleReport, DispatchManager, DispatchResult, Dispatcher,
    ReqwestTransport, VisitorIdentity,
};
use beacon_connectivity::{ConnectivityAssessor, ConnectivityHandle, MonitoredStatus, RetryPolicy};
use beacon_consent::{ConsentGate, ConsentState, ConsentTransition};
use beacon_core::{
    keys, Clock, Config, ConsentDecision, DataObject, Dispatch, DropReason, Paths,
    ProcessorName, SystemClock, TrackResult, CONSENT_PROCESSOR,
};
use beacon_database::AsyncDatabase;
use beacon_queue::{EventQueue, QueueHandle};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One SDK instance: queue, consent gate, connectivity, and delivery loops.
pub struct Tracker {
    config: Config,
    clock: Arc<dyn Clock>,
    queue: QueueHandle,
    connectivity: ConnectivityHandle,
    gate: Arc<ConsentGate>,
    manager: DispatchManager,
    visitor: VisitorIdentity,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Tracker {
    /// Open the database under `paths` and deliver to the collect endpoints.
    pub async fn open(config: Config, paths: &Paths) -> DispatchResult<Self> {
        config.validate()?;
        let db = AsyncDatabase::open(&config.database_file(paths)).await?;
        let connectivity: ConnectivityHandle =
            Arc::new(ConnectivityAssessor::new(&config.connectivity));

        let mut dispatchers: Vec<Arc<dyn Dispatcher>> = Vec::new();
        if config.collect.enabled {
            let transport = ReqwestTransport::new(Duration::from_secs(config.collect.timeout_secs))?;
            dispatchers.push(Arc::new(CollectDispatcher::new(
                &config.collect,
                Arc::new(transport),
                connectivity.clone(),
            )?));
        }

        Self::start(config, db, dispatchers, connectivity, Arc::new(SystemClock)).await
    }

    /// Wire the components together and start delivery.
    pub async fn start(
        config: Config,
        db: AsyncDatabase,
        dispatchers: Vec<Arc<dyn Dispatcher>>,
        connectivity: ConnectivityHandle,
        clock: Arc<dyn Clock>,
    ) -> DispatchResult<Self> {
        let queue: QueueHandle = Arc::new(EventQueue::new(db.clone(), clock.clone(), &config.queue));
        let registered: BTreeSet<ProcessorName> = dispatchers
            .iter()
            .map(|dispatcher| dispatcher.name().to_string())
            .collect();

        queue.retain_processors(&registered).await?;
        queue.purge_expired().await?;

        let gate = Arc::new(ConsentGate::new(queue.clone(), &config.consent, registered.clone()));
        gate.release_if_disabled().await?;

        let visitor = VisitorIdentity::load(db).await;

        let manager = DispatchManager::new(
            queue.clone(),
            connectivity.clone(),
            RetryPolicy::new(&config.retry),
            config.dispatch.drain_interval(),
            dispatchers,
        );
        manager.start();

        info!(
            processors = ?registered,
            consent_enabled = gate.is_enabled(),
            "Tracker started"
        );

        Ok(Self {
            config,
            clock,
            queue,
            connectivity,
            gate,
            manager,
            visitor,
            listeners: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Accept an event.
    ///
    /// Never fails: drops are reported in the result.
    pub async fn track(&self, event: &str, data: DataObject) -> TrackResult {
        let dispatch = Dispatch::new(event, self.identify(data), self.clock.now_millis());
        if self.shut_down.load(Ordering::SeqCst) {
            return TrackResult::dropped(&dispatch, DropReason::ShuttingDown);
        }

        let result = self.gate.process(dispatch).await;
        match &result {
            TrackResult::Accepted(dispatch) => {
                debug!(dispatch_id = %dispatch.id, event, "Event accepted")
            }
            TrackResult::Dropped {
                dispatch_id,
                reason,
            } => debug!(dispatch_id = %dispatch_id, event, reason = %reason, "Event dropped"),
        }
        result
    }

    fn identify(&self, mut data: DataObject) -> DataObject {
        if !self.config.account.is_empty() {
            data.entry(keys::ACCOUNT.to_string())
                .or_insert_with(|| Value::String(self.config.account.clone()));
        }
        if !self.config.profile.is_empty() {
            data.entry(keys::PROFILE.to_string())
                .or_insert_with(|| Value::String(self.config.profile.clone()));
        }
        data.entry(keys::VISITOR_ID.to_string())
            .or_insert_with(|| Value::String(self.visitor.current()));
        data
    }

    /// Drain every processor now.
    pub async fn flush(&self) -> BTreeMap<ProcessorName, CycleReport> {
        self.manager.flush().await
    }

    /// Queue depth per processor, including the consent holding partition.
    pub async fn queue_depths(&self) -> DispatchResult<BTreeMap<ProcessorName, usize>> {
        let mut names = self.manager.processors();
        names.insert(CONSENT_PROCESSOR.to_string());

        let mut depths = BTreeMap::new();
        for name in names {
            let depth = self.queue.size_for(&name).await?;
            depths.insert(name, depth);
        }
        Ok(depths)
    }

    /// Distinct undelivered dispatches.
    pub async fn queue_size(&self) -> DispatchResult<usize> {
        Ok(self.queue.size().await?)
    }

    /// Apply a consent decision now.
    pub async fn set_consent_decision(
        &self,
        decision: ConsentDecision,
    ) -> DispatchResult<Option<ConsentTransition>> {
        Ok(self.gate.apply_decision(decision).await?)
    }

    /// Apply every decision published by an external source.
    pub fn attach_consent_source(&self, decisions: watch::Receiver<Option<ConsentDecision>>) {
        let handle = self.gate.clone().listen(decisions);
        match self.listeners.lock() {
            Ok(mut listeners) => listeners.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    pub async fn consent_state(&self) -> ConsentState {
        self.gate.state().await
    }

    /// Forward an OS reachability change.
    pub fn set_monitored_connectivity(&self, status: MonitoredStatus) {
        self.connectivity.set_monitored(status);
    }

    pub fn connectivity(&self) -> &ConnectivityHandle {
        &self.connectivity
    }

    pub fn visitor_id(&self) -> String {
        self.visitor.current()
    }

    pub async fn reset_visitor_id(&self) -> String {
        self.visitor.reset().await
    }

    /// Change the queue's maximum size, evicting immediately if needed.
    pub async fn resize_queue(&self, max_size: i64) -> DispatchResult<usize> {
        Ok(self.queue.resize(max_size).await?)
    }

    /// Change the queue's expiration window.
    pub async fn set_queue_expiration(&self, window: Duration) -> DispatchResult<usize> {
        Ok(self.queue.set_expiration(window).await?)
    }

    /// Stop accepting events and cancel in-flight deliveries.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.manager.shutdown().await;

        let listeners: Vec<JoinHandle<()>> = match self.listeners.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for listener in listeners {
            listener.abort();
        }

        if let Err(e) = self.queue.database().health_check().await {
            warn!(error = %e, "Database unhealthy at shutdown");
        }
        info!("Tracker shut down");
    }
}
