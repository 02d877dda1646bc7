//! Delivery tests over an in-memory queue and a scripted transport.
//!
//! - collect: grouping, chunking, and response handling of the collect dispatcher
//! - scheduling: drain cycles, retries, cancellation, and loop wakeups
//! - tracker: the facade end to end, including consent and restarts
