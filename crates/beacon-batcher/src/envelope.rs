use beacon_core::{keys, DataObject, Dispatch};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fields lifted from the first dispatch of a group into `shared`.
pub const SHARED_KEYS: [&str; 3] = [keys::ACCOUNT, keys::PROFILE, keys::VISITOR_ID];

/// Bulk payload for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub shared: DataObject,
    pub events: Vec<DataObject>,
}

/// Compress a group into an envelope.
///
/// Shared fields come from the first dispatch; `profile_override` replaces
/// the shared profile. Returns `None` for an empty group.
pub fn compress(group: &[Dispatch], profile_override: Option<&str>) -> Option<Envelope> {
    let first = group.first()?;

    let mut shared = DataObject::new();
    for key in SHARED_KEYS {
        if let Some(value) = first.payload.get(key) {
            shared.insert(key.to_string(), value.clone());
        }
    }
    if let Some(profile) = profile_override {
        shared.insert(keys::PROFILE.to_string(), Value::String(profile.to_string()));
    }

    let events = group
        .iter()
        .map(|dispatch| {
            let mut payload = dispatch.payload.clone();
            for key in SHARED_KEYS {
                payload.remove(key);
            }
            payload
        })
        .collect();

    Some(Envelope { shared, events })
}

/// Rebuild the per-event payloads of an envelope.
pub fn expand(envelope: &Envelope) -> Vec<DataObject> {
    envelope
        .events
        .iter()
        .map(|event| {
            let mut payload = envelope.shared.clone();
            payload.extend(event.clone());
            payload
        })
        .collect()
}
