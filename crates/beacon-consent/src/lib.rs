//! Consent gating.
//!
//! Until a decision is known, accepted events are parked in the queue under
//! the reserved `"consent"` processor. Each new decision replays, refires,
//! or discards what is parked there.

mod enrich;
mod gate;
mod state;

pub use enrich::{enrich, has_consent_history, refire_id, REFIRE_SEPARATOR};
pub use gate::{ConsentGate, ConsentTransition};
pub use state::ConsentState;
