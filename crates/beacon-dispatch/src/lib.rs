//! Delivery of queued dispatches and the tracking facade.
//!
//! - [`Transport`]: posts JSON bodies, with a reqwest implementation
//! - [`Dispatcher`]: a named processor; [`CollectDispatcher`] batches by
//!   visitor and posts to the collect endpoints
//! - [`DispatchManager`]: one scheduling loop per processor, applying the
//!   retry policy after failures
//! - [`Tracker`]: `track`, `flush`, queue depths, consent, and shutdown

mod dispatcher;
mod error;
mod manager;
mod tracker;
mod transport;
mod visitor;

#[cfg(test)]
mod tests;

pub use dispatcher::{Cancellation, CollectDispatcher, DispatchReport, Dispatcher, COLLECT_PROCESSOR};
pub use error::{DispatchError, DispatchResult};
pub use manager::{CycleReport, DispatchManager};
pub use tracker::Tracker;
pub use transport::{map_reqwest_error, ReqwestTransport, Transport, TransportResponse};
pub use visitor::{VisitorIdentity, VISITOR_ID_SETTING};
