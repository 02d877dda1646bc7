//! The consent gate.

use crate::{enrich, has_consent_history, ConsentState};
use beacon_core::{
    ConsentConfiguration, ConsentDecision, ConsentSettings, Dispatch, DropReason, ProcessorName,
    TrackResult, CONSENT_PROCESSOR,
};
use beacon_queue::{QueueHandle, QueueResult};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Effect of applying a consent decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsentTransition {
    pub state: ConsentState,
    /// Held dispatches routed to delivery processors for the first time.
    pub delivered: usize,
    /// Replays of already enriched dispatches.
    pub refired: usize,
    /// Held dispatches dropped because tracking is blocked.
    pub discarded: usize,
}

impl ConsentTransition {
    fn new(state: ConsentState) -> Self {
        Self {
            state,
            delivered: 0,
            refired: 0,
            discarded: 0,
        }
    }
}

/// Decides where each accepted event goes under the current decision.
///
/// `process` and `apply_decision` are serialized by the decision lock, so a
/// decision never lands halfway through routing an event.
pub struct ConsentGate {
    queue: QueueHandle,
    enabled: bool,
    configuration: ConsentConfiguration,
    registered: BTreeSet<ProcessorName>,
    decision: Mutex<Option<ConsentDecision>>,
}

impl ConsentGate {
    /// Create a gate for the delivery processors in `registered`.
    ///
    /// Without a configuration the gate is disabled.
    pub fn new(
        queue: QueueHandle,
        settings: &ConsentSettings,
        registered: BTreeSet<ProcessorName>,
    ) -> Self {
        let configuration = settings.configuration.clone();
        Self {
            queue,
            enabled: settings.enabled && configuration.is_some(),
            configuration: configuration.unwrap_or_default(),
            registered,
            decision: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn state(&self) -> ConsentState {
        if !self.enabled {
            return ConsentState::Open;
        }
        let decision = self.decision.lock().await;
        ConsentState::evaluate(decision.as_ref(), &self.configuration)
    }

    pub async fn decision(&self) -> Option<ConsentDecision> {
        self.decision.lock().await.clone()
    }

    /// Route one accepted event.
    ///
    /// Never fails; storage errors come back as a dropped result.
    pub async fn process(&self, dispatch: Dispatch) -> TrackResult {
        if !self.enabled {
            return self.persist(dispatch, &self.registered).await;
        }

        let decision = self.decision.lock().await;
        let state = ConsentState::evaluate(decision.as_ref(), &self.configuration);

        match (state, decision.as_ref()) {
            (ConsentState::Blocked, _) => {
                debug!(dispatch_id = %dispatch.id, "Dropping event, consent blocked");
                TrackResult::dropped(&dispatch, DropReason::ConsentBlocked)
            }
            (ConsentState::Gated | ConsentState::Open, Some(decision)) => {
                let Some(enriched) = enrich(&dispatch, decision) else {
                    debug!(dispatch_id = %dispatch.id, "Dropping event, nothing new to report");
                    return TrackResult::dropped(&dispatch, DropReason::NothingNewToReport);
                };
                let targets = self.targets_for(decision, state);
                self.persist(enriched, &targets).await
            }
            _ => {
                let hold = BTreeSet::from([CONSENT_PROCESSOR.to_string()]);
                self.persist(dispatch, &hold).await
            }
        }
    }

    async fn persist(&self, dispatch: Dispatch, processors: &BTreeSet<ProcessorName>) -> TrackResult {
        if processors.is_empty() {
            return TrackResult::dropped(&dispatch, DropReason::NoEligibleProcessors);
        }
        match self.queue.store(vec![dispatch.clone()], processors).await {
            Ok(_) => TrackResult::Accepted(dispatch),
            Err(e) => {
                warn!(dispatch_id = %dispatch.id, error = %e, "Failed to store event");
                TrackResult::dropped(&dispatch, DropReason::Storage(e.to_string()))
            }
        }
    }

    /// Processors that must see an event enriched under `decision`.
    fn targets_for(&self, decision: &ConsentDecision, state: ConsentState) -> BTreeSet<ProcessorName> {
        let mut targets = self
            .configuration
            .allowed_processors(decision, &self.registered);
        if state == ConsentState::Gated && self.configuration.refire_enabled() {
            targets.insert(CONSENT_PROCESSOR.to_string());
        }
        targets
    }

    /// Apply a new decision to everything held under `"consent"`.
    ///
    /// Returns `None` when the decision equals the last one applied. The
    /// decision is only recorded once the queue has been updated, so a
    /// storage failure leaves it to be applied again.
    pub async fn apply_decision(
        &self,
        new_decision: ConsentDecision,
    ) -> QueueResult<Option<ConsentTransition>> {
        let mut current = self.decision.lock().await;
        if current.as_ref() == Some(&new_decision) {
            debug!("Ignoring repeated consent decision");
            return Ok(None);
        }

        if !self.enabled {
            *current = Some(new_decision);
            return Ok(Some(ConsentTransition::new(ConsentState::Open)));
        }

        let state = ConsentState::evaluate(Some(&new_decision), &self.configuration);
        let mut transition = ConsentTransition::new(state);

        match state {
            ConsentState::Unknown => {
                debug!("Consent still unknown, keeping held events");
            }
            ConsentState::Blocked => {
                transition.discarded = self.queue.discard_all(CONSENT_PROCESSOR).await?;
            }
            ConsentState::Gated | ConsentState::Open => {
                self.release_held(&new_decision, state, &mut transition).await?;
            }
        }

        info!(
            state = ?transition.state,
            decision_type = new_decision.decision_type.as_str(),
            delivered = transition.delivered,
            refired = transition.refired,
            discarded = transition.discarded,
            "Consent decision applied"
        );
        *current = Some(new_decision);
        Ok(Some(transition))
    }

    async fn release_held(
        &self,
        decision: &ConsentDecision,
        state: ConsentState,
        transition: &mut ConsentTransition,
    ) -> QueueResult<()> {
        let held = self
            .queue
            .drain(CONSENT_PROCESSOR, None, &BTreeSet::new())
            .await?;
        if held.is_empty() {
            return Ok(());
        }

        let keep_holding = state == ConsentState::Gated && self.configuration.refire_enabled();
        let mut fresh = Vec::new();
        let mut refire = Vec::new();
        let mut unchanged = Vec::new();
        for dispatch in held {
            match enrich(&dispatch, decision) {
                Some(enriched) if has_consent_history(&dispatch) => refire.push(enriched),
                Some(enriched) => fresh.push(enriched),
                None => unchanged.push(dispatch),
            }
        }

        let delivery_targets = self.targets_for(decision, state);
        let mut refire_targets: BTreeSet<ProcessorName> = self
            .configuration
            .allowed_processors(decision, &self.registered)
            .intersection(&self.configuration.refire_processors)
            .cloned()
            .collect();
        if keep_holding {
            refire_targets.insert(CONSENT_PROCESSOR.to_string());
        }
        let hold_targets = if keep_holding {
            BTreeSet::from([CONSENT_PROCESSOR.to_string()])
        } else {
            BTreeSet::new()
        };

        let delivered = fresh.len();
        let refired = refire.len();
        self.queue
            .reroute(
                CONSENT_PROCESSOR,
                vec![
                    (fresh, delivery_targets),
                    (refire, refire_targets),
                    (unchanged, hold_targets),
                ],
            )
            .await?;
        transition.delivered = delivered;
        transition.refired = refired;
        Ok(())
    }

    /// Deliver events held by an earlier session once gating is off.
    pub async fn release_if_disabled(&self) -> QueueResult<usize> {
        if self.enabled {
            return Ok(0);
        }
        let held = self
            .queue
            .drain(CONSENT_PROCESSOR, None, &BTreeSet::new())
            .await?;
        if held.is_empty() {
            return Ok(0);
        }
        let count = held.len();
        self.queue
            .reroute(CONSENT_PROCESSOR, vec![(held, self.registered.clone())])
            .await?;
        info!(count, "Released events held while consent was enabled");
        Ok(count)
    }

    /// Apply every decision published on `decisions` until the sender is dropped.
    pub fn listen(
        self: Arc<Self>,
        mut decisions: watch::Receiver<Option<ConsentDecision>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let latest = decisions.borrow_and_update().clone();
                if let Some(decision) = latest {
                    if let Err(e) = self.apply_decision(decision).await {
                        warn!(error = %e, "Failed to apply consent decision");
                    }
                }
                if decisions.changed().await.is_err() {
                    debug!("Consent decision source closed");
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{keys, DataObject, ManualClock, QueueConfig};
    use beacon_database::{queries, AsyncDatabase};
    use beacon_queue::EventQueue;
    use std::collections::BTreeMap;

    const NOW: i64 = 1_700_000_000_000;

    async fn queue() -> QueueHandle {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        Arc::new(EventQueue::new(db, clock, &QueueConfig::default()))
    }

    fn configuration(refire: &[&str]) -> ConsentConfiguration {
        ConsentConfiguration {
            sdk_purpose: "tracking".to_string(),
            purposes: BTreeMap::from([
                (
                    "tracking".to_string(),
                    BTreeSet::from(["Collect".to_string(), "Ads".to_string()]),
                ),
                ("ads".to_string(), BTreeSet::from(["Ads".to_string()])),
            ]),
            refire_processors: refire.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn registered() -> BTreeSet<ProcessorName> {
        BTreeSet::from(["Collect".to_string(), "Ads".to_string()])
    }

    fn gate(queue: &QueueHandle, refire: &[&str]) -> ConsentGate {
        let settings = ConsentSettings {
            enabled: true,
            configuration: Some(configuration(refire)),
        };
        ConsentGate::new(queue.clone(), &settings, registered())
    }

    fn event(name: &str, offset: i64) -> Dispatch {
        Dispatch::new(name, DataObject::new(), NOW + offset)
    }

    async fn pending(queue: &QueueHandle, processor: &str) -> Vec<Dispatch> {
        queue.drain(processor, None, &BTreeSet::new()).await.unwrap()
    }

    #[tokio::test]
    async fn test_unknown_holds_under_consent() {
        let queue = queue().await;
        let gate = gate(&queue, &[]);

        let result = gate.process(event("a", 0)).await;
        assert!(result.is_accepted());
        assert_eq!(pending(&queue, CONSENT_PROCESSOR).await.len(), 1);
        assert!(pending(&queue, "Collect").await.is_empty());
    }

    #[tokio::test]
    async fn test_blocked_decision_discards_held_and_future() {
        let queue = queue().await;
        let gate = gate(&queue, &[]);
        gate.process(event("a", 0)).await;
        gate.process(event("b", 1)).await;

        let transition = gate
            .apply_decision(ConsentDecision::explicit(["ads"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transition.state, ConsentState::Blocked);
        assert_eq!(transition.discarded, 2);
        assert!(pending(&queue, CONSENT_PROCESSOR).await.is_empty());
        assert_eq!(queue.size().await.unwrap(), 0);

        let result = gate.process(event("c", 2)).await;
        assert!(matches!(
            result,
            TrackResult::Dropped {
                reason: DropReason::ConsentBlocked,
                ..
            }
        ));
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_later_consent_lifts_block() {
        let queue = queue().await;
        let gate = gate(&queue, &[]);
        gate.apply_decision(ConsentDecision::explicit(["ads"]))
            .await
            .unwrap();
        assert!(!gate.process(event("blocked", 0)).await.is_accepted());

        let transition = gate
            .apply_decision(ConsentDecision::explicit(["tracking"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transition.state, ConsentState::Gated);

        let result = gate.process(event("resumed", 1)).await;
        assert!(result.is_accepted());
        let delivered = pending(&queue, "Collect").await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].event_name(), Some("resumed"));
        assert!(pending(&queue, "Ads").await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_release_keeps_held_events() {
        let queue = queue().await;
        let gate = gate(&queue, &[]);
        gate.process(event("a", 0)).await;
        gate.process(event("b", 1)).await;

        queue
            .database()
            .call(|conn| {
                queries::ensure_module(conn, "Collect")?;
                conn.execute_batch(
                    "CREATE TRIGGER reject_collect BEFORE INSERT ON queue
                     WHEN NEW.processor_id = (SELECT id FROM module WHERE name = 'Collect')
                     BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let decision = ConsentDecision::explicit(["tracking"]);
        assert!(gate.apply_decision(decision.clone()).await.is_err());
        assert_eq!(pending(&queue, CONSENT_PROCESSOR).await.len(), 2);
        assert_eq!(queue.size().await.unwrap(), 2);
        assert_eq!(gate.state().await, ConsentState::Unknown);

        queue
            .database()
            .call_sqlite(|conn| conn.execute_batch("DROP TRIGGER reject_collect"))
            .await
            .unwrap();

        let transition = gate.apply_decision(decision).await.unwrap().unwrap();
        assert_eq!(transition.delivered, 2);
        assert_eq!(pending(&queue, "Collect").await.len(), 2);
        assert!(pending(&queue, CONSENT_PROCESSOR).await.is_empty());
    }

    #[tokio::test]
    async fn test_implicit_without_sdk_purpose_keeps_holding() {
        let queue = queue().await;
        let gate = gate(&queue, &[]);
        gate.process(event("a", 0)).await;

        let transition = gate
            .apply_decision(ConsentDecision::implicit(["ads"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transition.state, ConsentState::Unknown);
        assert_eq!(pending(&queue, CONSENT_PROCESSOR).await.len(), 1);

        assert!(gate.process(event("b", 1)).await.is_accepted());
        assert_eq!(pending(&queue, CONSENT_PROCESSOR).await.len(), 2);
    }

    #[tokio::test]
    async fn test_decision_releases_held_events_enriched() {
        let queue = queue().await;
        let gate = gate(&queue, &[]);
        let held = event("a", 0);
        gate.process(held.clone()).await;

        let transition = gate
            .apply_decision(ConsentDecision::explicit(["tracking"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transition.state, ConsentState::Gated);
        assert_eq!(transition.delivered, 1);

        let delivered = pending(&queue, "Collect").await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].id, held.id);
        assert_eq!(delivered[0].payload[keys::CONSENT_TYPE], "explicit");
        assert!(pending(&queue, "Ads").await.is_empty());
        assert!(pending(&queue, CONSENT_PROCESSOR).await.is_empty());
    }

    #[tokio::test]
    async fn test_same_decision_twice_delivers_once() {
        let queue = queue().await;
        let gate = gate(&queue, &[]);
        gate.process(event("a", 0)).await;

        let decision = ConsentDecision::explicit(["tracking"]);
        assert!(gate.apply_decision(decision.clone()).await.unwrap().is_some());
        assert!(gate.apply_decision(decision).await.unwrap().is_none());

        assert_eq!(pending(&queue, "Collect").await.len(), 1);
        assert_eq!(queue.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_open_routes_straight_to_allowed_processors() {
        let queue = queue().await;
        let gate = gate(&queue, &["Ads"]);
        gate.apply_decision(ConsentDecision::explicit(["tracking", "ads"]))
            .await
            .unwrap();
        assert_eq!(gate.state().await, ConsentState::Open);

        let result = gate.process(event("a", 0)).await;
        let TrackResult::Accepted(accepted) = result else {
            panic!("event should be accepted");
        };
        assert_eq!(
            accepted.payload[keys::PURPOSES_ALL],
            serde_json::json!(["ads", "tracking"])
        );
        assert_eq!(pending(&queue, "Collect").await.len(), 1);
        assert_eq!(pending(&queue, "Ads").await.len(), 1);
        assert!(pending(&queue, CONSENT_PROCESSOR).await.is_empty());
    }

    #[tokio::test]
    async fn test_already_enriched_event_is_dropped() {
        let queue = queue().await;
        let gate = gate(&queue, &[]);
        let decision = ConsentDecision::explicit(["tracking"]);
        gate.apply_decision(decision.clone()).await.unwrap();

        let already = enrich(&event("a", 0), &decision).unwrap();
        let result = gate.process(already).await;
        assert!(matches!(
            result,
            TrackResult::Dropped {
                reason: DropReason::NothingNewToReport,
                ..
            }
        ));
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_gated_events_refire_when_consent_widens() {
        let queue = queue().await;
        let gate = gate(&queue, &["Ads"]);
        gate.apply_decision(ConsentDecision::explicit(["tracking"]))
            .await
            .unwrap();

        let original = event("a", 0);
        gate.process(original.clone()).await;
        assert_eq!(pending(&queue, "Collect").await.len(), 1);
        assert_eq!(pending(&queue, CONSENT_PROCESSOR).await.len(), 1);

        let transition = gate
            .apply_decision(ConsentDecision::explicit(["tracking", "ads"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transition.state, ConsentState::Open);
        assert_eq!(transition.refired, 1);

        let refired = pending(&queue, "Ads").await;
        assert_eq!(refired.len(), 1);
        assert_eq!(refired[0].id, format!("{}-refire-2", original.id));
        assert_eq!(
            refired[0].payload[keys::PURPOSES_UNPROCESSED],
            serde_json::json!(["ads"])
        );
        // Collect already has its copy and gets no replay.
        assert_eq!(pending(&queue, "Collect").await.len(), 1);
        assert!(pending(&queue, CONSENT_PROCESSOR).await.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_gate_routes_to_all_registered() {
        let queue = queue().await;
        let gate = ConsentGate::new(queue.clone(), &ConsentSettings::default(), registered());
        assert!(!gate.is_enabled());

        assert!(gate.process(event("a", 0)).await.is_accepted());
        assert_eq!(pending(&queue, "Collect").await.len(), 1);
        assert_eq!(pending(&queue, "Ads").await.len(), 1);
    }

    #[tokio::test]
    async fn test_release_if_disabled_moves_held_events() {
        let queue = queue().await;
        let hold = BTreeSet::from([CONSENT_PROCESSOR.to_string()]);
        queue.store(vec![event("a", 0)], &hold).await.unwrap();

        let gate = ConsentGate::new(queue.clone(), &ConsentSettings::default(), registered());
        assert_eq!(gate.release_if_disabled().await.unwrap(), 1);
        assert!(pending(&queue, CONSENT_PROCESSOR).await.is_empty());
        assert_eq!(pending(&queue, "Collect").await.len(), 1);
    }

    #[tokio::test]
    async fn test_listener_applies_published_decisions() {
        let queue = queue().await;
        let gate = Arc::new(gate(&queue, &[]));
        gate.process(event("a", 0)).await;

        let (sender, receiver) = watch::channel(None);
        let listener = gate.clone().listen(receiver);
        sender
            .send(Some(ConsentDecision::explicit(["tracking"])))
            .unwrap();
        drop(sender);
        listener.await.unwrap();

        assert_eq!(gate.state().await, ConsentState::Gated);
        assert_eq!(pending(&queue, "Collect").await.len(), 1);
    }
}
