//! Connectivity assessor.
//!
//! The assumed value is `monitored == Connected || empirical`. The OS
//! reporting "connected" is trusted outright; "not connected" or "unknown"
//! defers to what real requests have shown.
//!
//! A failure flips `empirical` off and starts a single-shot timer. When the
//! timer fires without being superseded the attempt counter increments and
//! `empirical` flips back on so the next delivery can try the network again.

use crate::{compute_backoff, Debouncer};
use beacon_core::ConnectivityConfig;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Shared handle to the connectivity assessor.
pub type ConnectivityHandle = Arc<ConnectivityAssessor>;

/// OS reachability as reported by the platform monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitoredStatus {
    Connected,
    NotConnected,
    #[default]
    Unknown,
}

#[derive(Debug)]
struct State {
    monitored: MonitoredStatus,
    empirical: bool,
    /// Consecutive failure timeouts that have elapsed.
    attempts: u32,
    /// Bumped whenever the pending timer is superseded.
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl State {
    fn assumed(&self) -> bool {
        self.monitored == MonitoredStatus::Connected || self.empirical
    }

    fn cancel_timer(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn publish(assumed: &watch::Sender<bool>, value: bool) {
    let changed = assumed.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    });
    if changed {
        info!(available = value, "Assumed connectivity changed");
    }
}

/// Merges OS reachability with request outcomes.
///
/// Recording methods spawn timers and must be called within a Tokio runtime.
#[derive(Debug)]
pub struct ConnectivityAssessor {
    state: Arc<Mutex<State>>,
    assumed: Arc<watch::Sender<bool>>,
    backoff_base: Duration,
    backoff_max: Duration,
    monitor_debounce: Debouncer,
}

impl ConnectivityAssessor {
    /// Start optimistic: nothing has failed yet.
    pub fn new(config: &ConnectivityConfig) -> Self {
        let (assumed, _) = watch::channel(true);
        Self {
            state: Arc::new(Mutex::new(State {
                monitored: MonitoredStatus::Unknown,
                empirical: true,
                attempts: 0,
                generation: 0,
                timer: None,
            })),
            assumed: Arc::new(assumed),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            monitor_debounce: Debouncer::new(Duration::from_millis(config.monitor_debounce_ms)),
        }
    }

    /// A request failed for connectivity reasons.
    pub fn record_failure(&self) {
        let mut state = lock(&self.state);
        state.cancel_timer();
        state.empirical = false;

        let delay = compute_backoff(state.attempts, self.backoff_base, self.backoff_max);
        let generation = state.generation;
        let shared = self.state.clone();
        let assumed = self.assumed.clone();

        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = lock(&shared);
            if state.generation != generation {
                return;
            }
            state.timer = None;
            state.attempts = state.attempts.saturating_add(1);
            state.empirical = true;
            debug!(attempts = state.attempts, "Empirical connectivity restored after backoff");
            publish(&assumed, state.assumed());
        }));

        debug!(
            attempts = state.attempts,
            backoff_ms = delay.as_millis() as u64,
            "Empirical connectivity lost"
        );
        publish(&self.assumed, state.assumed());
    }

    /// The transport reported it is stalled waiting for a network.
    pub fn record_waiting_for_connectivity(&self) {
        self.record_failure();
    }

    /// A request reached the server.
    pub fn record_success(&self) {
        let mut state = lock(&self.state);
        state.cancel_timer();
        state.attempts = 0;
        state.empirical = true;
        publish(&self.assumed, state.assumed());
    }

    /// Report a change from the OS reachability monitor.
    ///
    /// Bursts are debounced; only the last status of a burst is applied.
    pub fn set_monitored(&self, status: MonitoredStatus) {
        let shared = self.state.clone();
        let assumed = self.assumed.clone();
        self.monitor_debounce.schedule(move || {
            let mut state = lock(&shared);
            if state.monitored != status {
                debug!(?status, "Monitored connectivity settled");
                state.monitored = status;
            }
            publish(&assumed, state.assumed());
        });
    }

    /// Last assumed value.
    pub fn is_available(&self) -> bool {
        *self.assumed.borrow()
    }

    /// Observe the assumed value; the current value is seen immediately.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.assumed.subscribe()
    }

    /// Resolve once connectivity is assumed available.
    pub async fn wait_until_available(&self) {
        let mut receiver = self.assumed.subscribe();
        // The sender lives as long as `self`, so this cannot fail while awaited.
        let _ = receiver.wait_for(|available| *available).await;
    }

    /// Consecutive failure timeouts since the last success.
    pub fn attempts(&self) -> u32 {
        lock(&self.state).attempts
    }

    /// Backoff the next failure would wait.
    pub fn next_backoff(&self) -> Duration {
        compute_backoff(self.attempts(), self.backoff_base, self.backoff_max)
    }

    pub fn monitored(&self) -> MonitoredStatus {
        lock(&self.state).monitored
    }

    pub fn empirical(&self) -> bool {
        lock(&self.state).empirical
    }
}

impl Drop for ConnectivityAssessor {
    fn drop(&mut self) {
        lock(&self.state).cancel_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(debounce_ms: u64) -> ConnectivityConfig {
        ConnectivityConfig {
            backoff_base_ms: 1_000,
            backoff_max_ms: 10_000,
            monitor_debounce_ms: debounce_ms,
        }
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_available() {
        let assessor = ConnectivityAssessor::new(&config(0));
        assert!(assessor.is_available());
        assert_eq!(assessor.monitored(), MonitoredStatus::Unknown);
        assert_eq!(assessor.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_restores_after_backoff() {
        let assessor = ConnectivityAssessor::new(&config(0));
        assessor.record_failure();
        assert!(!assessor.is_available());

        sleep_ms(900).await;
        assert!(!assessor.is_available());

        sleep_ms(200).await;
        assert!(assessor.is_available());
        assert_eq!(assessor.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_count_three_attempts() {
        let assessor = ConnectivityAssessor::new(&config(0));
        let mut previous = Duration::ZERO;

        for expected in 1..=3 {
            let backoff = assessor.next_backoff();
            assert!(backoff >= previous);
            previous = backoff;

            assessor.record_failure();
            sleep_ms(backoff.as_millis() as u64 + 10).await;
            assert_eq!(assessor.attempts(), expected);
        }

        assert_eq!(assessor.attempts(), 3);
        assert!(assessor.next_backoff() >= previous);
        assert_eq!(assessor.next_backoff(), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_cancels_pending_timer() {
        let assessor = ConnectivityAssessor::new(&config(0));
        assessor.record_failure();
        assessor.record_success();
        assert!(assessor.is_available());

        sleep_ms(2_000).await;
        assert_eq!(assessor.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_failure_restarts_timer() {
        let assessor = ConnectivityAssessor::new(&config(0));
        assessor.record_failure();
        sleep_ms(600).await;
        assessor.record_waiting_for_connectivity();

        // The first timer would have fired here.
        sleep_ms(600).await;
        assert!(!assessor.is_available());
        assert_eq!(assessor.attempts(), 0);

        sleep_ms(500).await;
        assert!(assessor.is_available());
        assert_eq!(assessor.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitored_connected_overrides_empirical() {
        let assessor = ConnectivityAssessor::new(&config(0));
        assessor.record_failure();
        assert!(!assessor.is_available());

        assessor.set_monitored(MonitoredStatus::Connected);
        assert!(assessor.is_available());
        assert!(!assessor.empirical());

        assessor.set_monitored(MonitoredStatus::NotConnected);
        assert!(!assessor.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empirical_success_overrides_not_connected() {
        let assessor = ConnectivityAssessor::new(&config(0));
        assessor.set_monitored(MonitoredStatus::NotConnected);
        assessor.record_failure();
        assert!(!assessor.is_available());

        assessor.record_success();
        assert!(assessor.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_flaps_are_debounced() {
        let assessor = ConnectivityAssessor::new(&config(500));
        assessor.record_failure();
        let mut receiver = assessor.subscribe();
        receiver.borrow_and_update();

        assessor.set_monitored(MonitoredStatus::Connected);
        sleep_ms(100).await;
        assessor.set_monitored(MonitoredStatus::NotConnected);
        sleep_ms(100).await;
        assessor.set_monitored(MonitoredStatus::Connected);

        sleep_ms(300).await;
        assert_eq!(assessor.monitored(), MonitoredStatus::Unknown);
        assert!(!receiver.has_changed().unwrap());

        sleep_ms(300).await;
        assert_eq!(assessor.monitored(), MonitoredStatus::Connected);
        assert!(receiver.has_changed().unwrap());
        assert!(*receiver.borrow_and_update());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_available() {
        let assessor = Arc::new(ConnectivityAssessor::new(&config(0)));
        assessor.wait_until_available().await;

        assessor.record_failure();
        let waiter = {
            let assessor = assessor.clone();
            tokio::spawn(async move { assessor.wait_until_available().await })
        };
        sleep_ms(100).await;
        assert!(!waiter.is_finished());

        assessor.record_success();
        waiter.await.unwrap();
    }
}
