//! Core types, configuration, and utilities for the beacon event-delivery SDK.

mod clock;
mod config;
mod consent;
mod dispatch;
mod error;
mod logging;
mod paths;

pub use clock::{Clock, SystemClock};
#[cfg(any(test, feature = "test-util"))]
pub use clock::ManualClock;
pub use config::{
    CollectConfig, Config, ConnectivityConfig, ConsentSettings, DispatchConfig, QueueConfig,
    RetryConfig, DEFAULT_COLLECT_BATCH_URL, DEFAULT_COLLECT_URL, DEFAULT_LOG_LEVEL,
    MAX_COLLECT_BATCH_SIZE,
};
pub use consent::{ConsentConfiguration, ConsentDecision, ConsentDecisionType};
pub use dispatch::{
    keys, DataObject, Dispatch, DropReason, ProcessorName, TrackResult, CONSENT_PROCESSOR,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, init_logging_with, LogConfig, LogFormat};
pub use paths::Paths;
