//! Retry decisions for failed deliveries.

use crate::NetworkError;
use beacon_core::RetryConfig;
use std::time::Duration;

/// What to do after a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Leave it to the next scheduled drain.
    DoNotRetry,
    /// Retry once after the delay.
    AfterDelay(Duration),
    /// Retry once when connectivity is next assumed available.
    AfterEvent,
}

/// Pure retry decision.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    fixed_delay: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            fixed_delay: config.fixed_delay(),
        }
    }

    pub fn with_fixed_delay(delay: Duration) -> Self {
        Self {
            fixed_delay: Some(delay),
        }
    }

    pub fn decide(&self, error: &NetworkError, assumed_available: bool) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::DoNotRetry;
        }
        if !assumed_available {
            return RetryDecision::AfterEvent;
        }
        match self.fixed_delay {
            Some(delay) => RetryDecision::AfterDelay(delay),
            None => RetryDecision::DoNotRetry,
        }
    }
}
