//! Persistent event queue.
//!
//! Dispatches are stored once and linked to every processor that still owes
//! work for them. A dispatch disappears when its last link is acknowledged,
//! discarded, evicted, or expired.

mod error;
mod queue;

pub use error::{QueueError, QueueResult};
pub use queue::{EventQueue, QueueHandle};
