//! Consent enrichment of dispatches.

use beacon_core::{keys, ConsentDecision, DataObject, Dispatch};
use serde_json::Value;
use std::collections::BTreeSet;

/// Separates the original id from the refire counter.
pub const REFIRE_SEPARATOR: &str = "-refire-";

fn purposes_at(dispatch: &Dispatch, key: &str) -> BTreeSet<String> {
    dispatch
        .payload
        .get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn to_array(purposes: &BTreeSet<String>) -> Value {
    Value::Array(purposes.iter().cloned().map(Value::String).collect())
}

/// Whether a dispatch was already enriched by an earlier decision.
pub fn has_consent_history(dispatch: &Dispatch) -> bool {
    !purposes_at(dispatch, keys::PURPOSES_ALL).is_empty()
}

/// Id for a replay of `id` covering `purpose_count` purposes.
pub fn refire_id(id: &str, purpose_count: usize) -> String {
    let base = id.split(REFIRE_SEPARATOR).next().unwrap_or(id);
    format!("{}{}{}", base, REFIRE_SEPARATOR, purpose_count)
}

/// Record the purposes of `decision` not yet recorded on `dispatch`.
///
/// Returns `None` when there is nothing new. A dispatch without history
/// keeps its id; one with history gets a refire id.
pub fn enrich(dispatch: &Dispatch, decision: &ConsentDecision) -> Option<Dispatch> {
    let processed = purposes_at(dispatch, keys::PURPOSES_ALL);
    let unprocessed: BTreeSet<String> = decision
        .purposes
        .difference(&processed)
        .cloned()
        .collect();
    if unprocessed.is_empty() {
        return None;
    }

    let all: BTreeSet<String> = processed.union(&unprocessed).cloned().collect();
    let id = if processed.is_empty() {
        dispatch.id.clone()
    } else {
        refire_id(&dispatch.id, all.len())
    };

    let mut additions = DataObject::new();
    additions.insert(
        keys::CONSENT_TYPE.to_string(),
        Value::String(decision.decision_type.as_str().to_string()),
    );
    additions.insert(keys::PURPOSES_UNPROCESSED.to_string(), to_array(&unprocessed));
    additions.insert(keys::PURPOSES_PROCESSED.to_string(), to_array(&processed));
    additions.insert(keys::PURPOSES_ALL.to_string(), to_array(&all));

    Some(dispatch.derive(id, additions))
}
