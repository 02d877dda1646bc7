//! Dispatch: the persisted unit of an accepted analytics event.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event payload: an ordered map of keys to typed JSON values.
pub type DataObject = Map<String, Value>;

/// Stable identifier of a processor (a queue partition).
pub type ProcessorName = String;

/// Reserved processor name for the consent gate's holding partition.
pub const CONSENT_PROCESSOR: &str = "consent";

/// Well-known payload keys.
pub mod keys {
    /// Name of the tracked event.
    pub const EVENT: &str = "event";
    /// Visitor identity, used as the batching partition key.
    pub const VISITOR_ID: &str = "visitor_id";
    /// Account the event is reported under.
    pub const ACCOUNT: &str = "account";
    /// Profile the event is reported under.
    pub const PROFILE: &str = "profile";
    /// Millisecond timestamp of the event.
    pub const TIMESTAMP_MS: &str = "timestamp_unix_milliseconds";

    /// `implicit` or `explicit`.
    pub const CONSENT_TYPE: &str = "consent_type";
    /// Purposes newly applied by the latest enrichment.
    pub const PURPOSES_UNPROCESSED: &str = "purposes_with_consent_unprocessed";
    /// Purposes that had already been applied before the latest enrichment.
    pub const PURPOSES_PROCESSED: &str = "purposes_with_consent_processed";
    /// Union of processed and unprocessed purposes.
    pub const PURPOSES_ALL: &str = "purposes_with_consent_all";
}

/// An immutable accepted event.
///
/// Never mutated after creation; enrichment derives a new value with
/// [`Dispatch::derive`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    /// Opaque unique id.
    pub id: String,
    /// The data object.
    pub payload: DataObject,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Dispatch {
    /// Create a dispatch for a named event with a fresh id.
    pub fn new(event: &str, mut payload: DataObject, timestamp: i64) -> Self {
        payload.insert(keys::EVENT.to_string(), Value::String(event.to_string()));
        payload.insert(keys::TIMESTAMP_MS.to_string(), Value::from(timestamp));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            timestamp,
        }
    }

    /// Rebuild a dispatch from stored parts.
    pub fn from_parts(id: impl Into<String>, payload: DataObject, timestamp: i64) -> Self {
        Self {
            id: id.into(),
            payload,
            timestamp,
        }
    }

    /// Event name, if present.
    pub fn event_name(&self) -> Option<&str> {
        self.get_str(keys::EVENT)
    }

    /// String value of a payload key.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Derive a new dispatch with `additions` merged over the payload.
    ///
    /// The original timestamp is kept so queue ordering is unaffected.
    pub fn derive(&self, id: impl Into<String>, additions: DataObject) -> Self {
        let mut payload = self.payload.clone();
        payload.extend(additions);
        Self {
            id: id.into(),
            payload,
            timestamp: self.timestamp,
        }
    }
}

/// Why an event was not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Explicit decision without the SDK's own purpose.
    ConsentBlocked,
    /// Consent enrichment found no purpose that was not already recorded.
    NothingNewToReport,
    /// No processor is allowed to receive the event.
    NoEligibleProcessors,
    /// The queue could not persist the event.
    Storage(String),
    /// The tracker is shutting down.
    ShuttingDown,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConsentBlocked => write!(f, "consent blocked"),
            Self::NothingNewToReport => write!(f, "nothing new to report"),
            Self::NoEligibleProcessors => write!(f, "no eligible processors"),
            Self::Storage(e) => write!(f, "storage failure: {}", e),
            Self::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

/// Completion status of a `track` call.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackResult {
    /// Persisted for delivery (or held pending consent).
    Accepted(Dispatch),
    /// Not persisted.
    Dropped {
        dispatch_id: String,
        reason: DropReason,
    },
}

impl TrackResult {
    pub fn dropped(dispatch: &Dispatch, reason: DropReason) -> Self {
        Self::Dropped {
            dispatch_id: dispatch.id.clone(),
            reason,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    pub fn dispatch_id(&self) -> &str {
        match self {
            Self::Accepted(dispatch) => &dispatch.id,
            Self::Dropped { dispatch_id, .. } => dispatch_id,
        }
    }
}
