//! Per-processor scheduling loops.
//!
//! Each dispatcher gets one loop that drains its queue partition on a fixed
//! interval and whenever the queue reports new entries for it. A drain cycle
//! keeps pulling batches until the partition is empty or delivery fails, and
//! applies the retry decision for a failure before the cycle ends. Drain
//! passes of one processor never overlap. The retry wait runs outside the
//! pass lock, and at most one wait is outstanding per processor; a second
//! failing cycle ends as failed instead of queueing another wait.
//!
//! After a failed cycle the loop ignores store wakeups until its next tick.

use crate::{Cancellation, Dispatcher};
use beacon_connectivity::{ConnectivityHandle, RetryDecision, RetryPolicy};
use beacon_core::ProcessorName;
use beacon_queue::QueueHandle;
use futures_util::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Totals of one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Entries acknowledged, delivered or dropped.
    pub consumed: usize,
    /// Entries dropped after a permanent rejection.
    pub dropped: usize,
    /// The cycle ended in a transient failure.
    pub failed: bool,
    /// The cycle was cut short by shutdown.
    pub cancelled: bool,
}

struct Worker {
    dispatcher: Arc<dyn Dispatcher>,
    pass: tokio::sync::Mutex<()>,
    waiting: AtomicBool,
}

impl Worker {
    fn claim_retry_wait(&self) -> Option<RetryWait<'_>> {
        self.waiting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RetryWait(&self.waiting))
    }
}

/// Releases the processor's retry wait slot on drop.
struct RetryWait<'a>(&'a AtomicBool);

impl Drop for RetryWait<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Shared {
    queue: QueueHandle,
    connectivity: ConnectivityHandle,
    policy: RetryPolicy,
    drain_interval: Duration,
    workers: Vec<Arc<Worker>>,
    cancel: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

/// Drives every dispatcher from the queue.
#[derive(Clone)]
pub struct DispatchManager {
    shared: Arc<Shared>,
}

impl DispatchManager {
    pub fn new(
        queue: QueueHandle,
        connectivity: ConnectivityHandle,
        policy: RetryPolicy,
        drain_interval: Duration,
        dispatchers: Vec<Arc<dyn Dispatcher>>,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        let workers = dispatchers
            .into_iter()
            .map(|dispatcher| {
                Arc::new(Worker {
                    dispatcher,
                    pass: tokio::sync::Mutex::new(()),
                    waiting: AtomicBool::new(false),
                })
            })
            .collect();

        Self {
            shared: Arc::new(Shared {
                queue,
                connectivity,
                policy,
                drain_interval,
                workers,
                cancel,
                loops: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Names of the managed processors.
    pub fn processors(&self) -> BTreeSet<ProcessorName> {
        self.shared
            .workers
            .iter()
            .map(|worker| worker.dispatcher.name().to_string())
            .collect()
    }

    /// Spawn one scheduling loop per processor.
    pub fn start(&self) {
        let mut loops = match self.shared.loops.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !loops.is_empty() {
            return;
        }
        for worker in &self.shared.workers {
            let shared = self.shared.clone();
            let worker = worker.clone();
            loops.push(tokio::spawn(run_loop(shared, worker)));
        }
        info!(processors = loops.len(), "Dispatch loops started");
    }

    /// Drain every processor now and wait for the cycles to finish.
    pub async fn flush(&self) -> BTreeMap<ProcessorName, CycleReport> {
        let cycles = self.shared.workers.iter().map(|worker| {
            let shared = self.shared.clone();
            let worker = worker.clone();
            async move {
                let report = drain_cycle(&shared, &worker).await;
                (worker.dispatcher.name().to_string(), report)
            }
        });
        join_all(cycles).await.into_iter().collect()
    }

    /// Cancel in-flight deliveries and stop the loops.
    ///
    /// Cancelled deliveries leave their entries queued.
    pub async fn shutdown(&self) {
        self.shared.cancel.send_replace(true);
        let loops: Vec<JoinHandle<()>> = match self.shared.loops.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in join_all(loops).await {
            if let Err(e) = handle {
                warn!(error = %e, "Dispatch loop ended abnormally");
            }
        }
        info!("Dispatch loops stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shared.cancel.borrow()
    }
}

async fn run_loop(shared: Arc<Shared>, worker: Arc<Worker>) {
    let name = worker.dispatcher.name().to_string();
    let mut cancel = Cancellation::new(shared.cancel.subscribe());
    let mut changes = shared.queue.subscribe();
    let mut ticker = tokio::time::interval(shared.drain_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut backing_off = false;

    debug!(processor = %name, "Dispatch loop running");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => backing_off = false,
            change = changes.recv() => match change {
                Err(RecvError::Closed) => break,
                Ok(processors) if !processors.contains(&name) => continue,
                Ok(_) | Err(RecvError::Lagged(_)) if backing_off => continue,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            },
        }

        let report = drain_cycle(&shared, &worker).await;
        if report.cancelled {
            break;
        }
        if report.failed && !backing_off {
            debug!(processor = %name, "Delivery failed, waiting for the next tick");
        }
        backing_off = report.failed;
    }
    debug!(processor = %name, "Dispatch loop exited");
}

/// How a drain pass ended.
enum PassEnd {
    /// The partition is empty.
    Drained,
    /// Failed or cancelled; the report says which.
    Stopped,
    /// Failed with a retry allowed after the wait.
    Retry(RetryDecision),
}

/// Drain one processor until empty, failed, or cancelled.
async fn drain_cycle(shared: &Shared, worker: &Worker) -> CycleReport {
    let name = worker.dispatcher.name();
    let mut cancel = Cancellation::new(shared.cancel.subscribe());
    let mut report = CycleReport::default();

    if cancel.is_cancelled() {
        report.cancelled = true;
        return report;
    }

    let decision = match drain_pass(shared, worker, &cancel, &mut report, true).await {
        PassEnd::Drained => return finish(name, report),
        PassEnd::Stopped => return report,
        PassEnd::Retry(decision) => decision,
    };

    let Some(_wait) = worker.claim_retry_wait() else {
        debug!(processor = %name, "Retry wait already outstanding");
        report.failed = true;
        return report;
    };
    let proceed = match decision {
        RetryDecision::AfterDelay(delay) => tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        },
        RetryDecision::AfterEvent => tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = shared.connectivity.wait_until_available() => true,
        },
        RetryDecision::DoNotRetry => false,
    };
    if !proceed {
        report.cancelled = true;
        return report;
    }

    debug!(processor = %name, "Retrying failed delivery");
    match drain_pass(shared, worker, &cancel, &mut report, false).await {
        PassEnd::Drained => finish(name, report),
        PassEnd::Stopped | PassEnd::Retry(_) => report,
    }
}

fn finish(name: &str, report: CycleReport) -> CycleReport {
    if report.consumed > 0 {
        info!(processor = %name, consumed = report.consumed, dropped = report.dropped, "Drain cycle complete");
    }
    report
}

/// Deliver batches under the pass lock until the partition is empty or a
/// delivery fails.
async fn drain_pass(
    shared: &Shared,
    worker: &Worker,
    cancel: &Cancellation,
    report: &mut CycleReport,
    may_retry: bool,
) -> PassEnd {
    let _pass = worker.pass.lock().await;
    let dispatcher = &worker.dispatcher;
    let name = dispatcher.name();
    let mut attempted: BTreeSet<String> = BTreeSet::new();

    loop {
        if cancel.is_cancelled() {
            report.cancelled = true;
            return PassEnd::Stopped;
        }
        let batch = match shared
            .queue
            .drain(name, dispatcher.batch_limit(), &attempted)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                warn!(processor = %name, error = %e, "Failed to read queue");
                report.failed = true;
                return PassEnd::Stopped;
            }
        };
        if batch.is_empty() {
            return PassEnd::Drained;
        }
        attempted.extend(batch.iter().map(|d| d.id.clone()));

        let delivery = dispatcher.dispatch(batch, cancel.clone()).await;

        // Delivered entries are acknowledged even when the attempt was cut short.
        if !delivery.consumed.is_empty() {
            match shared.queue.acknowledge(&delivery.consumed, name).await {
                Ok(_) => {
                    report.consumed += delivery.consumed.len();
                    report.dropped += delivery.dropped.len();
                }
                Err(e) => {
                    warn!(processor = %name, error = %e, "Failed to acknowledge delivered events");
                }
            }
        }

        if delivery.is_cancelled() {
            info!(processor = %name, consumed = report.consumed, "Delivery cancelled");
            report.cancelled = true;
            return PassEnd::Stopped;
        }
        let Some(failure) = delivery.failure else {
            continue;
        };

        let available = shared.connectivity.is_available();
        let decision = shared.policy.decide(&failure, available);
        debug!(processor = %name, ?decision, available, "Retry decision");

        if !may_retry || decision == RetryDecision::DoNotRetry {
            report.failed = true;
            return PassEnd::Stopped;
        }
        return PassEnd::Retry(decision);
    }
}
