//! Dispatchers: the processors that deliver queued dispatches.

use crate::{DispatchResult, Transport};
use async_trait::async_trait;
use beacon_batcher::{compress, group_by_partition_key};
use beacon_connectivity::{ConnectivityHandle, NetworkError};
use beacon_core::{keys, CollectConfig, Dispatch};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, warn};
use url::Url;

/// Processor name of the collect endpoint.
pub const COLLECT_PROCESSOR: &str = "Collect";

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Ids that no longer need this processor, delivered or dropped.
    pub consumed: Vec<String>,
    /// Ids rejected permanently; a subset of `consumed`.
    pub dropped: Vec<String>,
    /// Deliveries answered with "not modified".
    pub not_modified: usize,
    /// Transient failure that stopped the attempt; unconsumed ids stay queued.
    pub failure: Option<NetworkError>,
}

impl DispatchReport {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.failure, Some(NetworkError::Cancelled))
    }
}

/// Shutdown signal observed by a delivery attempt.
#[derive(Debug, Clone)]
pub struct Cancellation {
    receiver: Option<watch::Receiver<bool>>,
}

impl Cancellation {
    /// Fires once `true` is sent or the sender is dropped.
    pub fn new(receiver: watch::Receiver<bool>) -> Self {
        Self {
            receiver: Some(receiver),
        }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self { receiver: None }
    }

    pub fn is_cancelled(&self) -> bool {
        match &self.receiver {
            Some(receiver) => *receiver.borrow() || receiver.has_changed().is_err(),
            None => false,
        }
    }

    /// Resolve once cancelled.
    pub async fn cancelled(&mut self) {
        match &mut self.receiver {
            Some(receiver) => {
                let _ = receiver.wait_for(|cancelled| *cancelled).await;
            }
            None => std::future::pending().await,
        }
    }
}

/// A named consumer of queued dispatches.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Queue partition this dispatcher drains.
    fn name(&self) -> &str;

    /// Maximum dispatches handed over per attempt, `None` for all.
    fn batch_limit(&self) -> Option<usize>;

    /// Deliver `dispatches`, oldest first.
    ///
    /// On cancellation the report keeps what was consumed so far and carries
    /// [`NetworkError::Cancelled`].
    async fn dispatch(&self, dispatches: Vec<Dispatch>, cancel: Cancellation) -> DispatchReport;
}

/// Delivers to the collect endpoints.
///
/// Visitor groups of one go to the single-event endpoint, larger groups go
/// to the bulk endpoint as an envelope.
pub struct CollectDispatcher {
    transport: Arc<dyn Transport>,
    connectivity: ConnectivityHandle,
    url: Url,
    batch_url: Url,
    batch_size: usize,
    profile_override: Option<String>,
}

impl CollectDispatcher {
    pub fn new(
        config: &CollectConfig,
        transport: Arc<dyn Transport>,
        connectivity: ConnectivityHandle,
    ) -> DispatchResult<Self> {
        let (url, batch_url) = config.endpoints()?;
        Ok(Self {
            transport,
            connectivity,
            url,
            batch_url,
            batch_size: config.effective_batch_size(),
            profile_override: config.profile_override.clone(),
        })
    }

    fn request_for(&self, chunk: &[Dispatch]) -> DispatchResult<(&Url, Value)> {
        if let [single] = chunk {
            let mut payload = single.payload.clone();
            if let Some(profile) = &self.profile_override {
                payload.insert(keys::PROFILE.to_string(), Value::String(profile.clone()));
            }
            return Ok((&self.url, Value::Object(payload)));
        }

        let envelope = compress(chunk, self.profile_override.as_deref());
        Ok((&self.batch_url, serde_json::to_value(envelope)?))
    }

    fn observe(&self, error: &NetworkError) {
        if error.is_connectivity_failure() {
            self.connectivity.record_failure();
        } else if !error.is_cancelled() {
            // Any status answer proves the network works.
            self.connectivity.record_success();
        }
    }
}

#[async_trait]
impl Dispatcher for CollectDispatcher {
    fn name(&self) -> &str {
        COLLECT_PROCESSOR
    }

    fn batch_limit(&self) -> Option<usize> {
        Some(self.batch_size)
    }

    async fn dispatch(&self, dispatches: Vec<Dispatch>, mut cancel: Cancellation) -> DispatchReport {
        let mut report = DispatchReport::default();

        for group in group_by_partition_key(dispatches) {
            for chunk in group.chunks(self.batch_size) {
                if cancel.is_cancelled() {
                    report.failure = Some(NetworkError::Cancelled);
                    return report;
                }
                let ids: Vec<String> = chunk.iter().map(|d| d.id.clone()).collect();

                let (url, body) = match self.request_for(chunk) {
                    Ok(request) => request,
                    Err(e) => {
                        error!(count = ids.len(), error = %e, "Dropping events that cannot be encoded");
                        report.dropped.extend(ids.iter().cloned());
                        report.consumed.extend(ids);
                        continue;
                    }
                };

                let posted = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    posted = self.transport.post(url, &body) => Some(posted),
                };
                let Some(posted) = posted else {
                    debug!(count = ids.len(), "Delivery cancelled, events stay queued");
                    report.failure = Some(NetworkError::Cancelled);
                    return report;
                };

                match posted {
                    Ok(response) => {
                        self.connectivity.record_success();
                        if response.not_modified {
                            report.not_modified += 1;
                        }
                        debug!(count = ids.len(), status = response.status, "Delivered events");
                        report.consumed.extend(ids);
                    }
                    Err(e) if e.is_retryable() || e.is_cancelled() => {
                        self.observe(&e);
                        if !e.is_cancelled() {
                            warn!(count = ids.len(), error = %e, "Delivery failed, events stay queued");
                        }
                        report.failure = Some(e);
                        return report;
                    }
                    Err(e) => {
                        self.observe(&e);
                        error!(count = ids.len(), error = %e, "Endpoint rejected events, dropping");
                        report.dropped.extend(ids.iter().cloned());
                        report.consumed.extend(ids);
                    }
                }
            }
        }

        report
    }
}
