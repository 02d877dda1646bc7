//! Connectivity assessment and retry decisions.
//!
//! [`ConnectivityAssessor`] merges the OS reachability signal with evidence
//! from real request outcomes. [`RetryPolicy`] turns a failed delivery into a
//! [`RetryDecision`] using the assessor's current value.

mod assessor;
mod backoff;
mod debounce;
mod error;
mod retry;

pub use assessor::{ConnectivityAssessor, ConnectivityHandle, MonitoredStatus};
pub use backoff::compute_backoff;
pub use debounce::Debouncer;
pub use error::NetworkError;
pub use retry::{RetryDecision, RetryPolicy};
