//! Batching of dispatches bound for one endpoint.
//!
//! Dispatches are grouped by visitor, then each group is compressed into an
//! [`Envelope`]: the fields every event in the group shares are sent once in
//! `shared`, the rest of each payload goes into `events`.

mod envelope;
mod partition;

pub use envelope::{compress, expand, Envelope, SHARED_KEYS};
pub use partition::group_by_partition_key;
