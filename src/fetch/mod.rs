//! Progressive fetching of image regions.
//!
//! - [`ProgressiveFetchRequest`]: per-region state machine walking through
//!   quality thresholds
//! - [`Requester`]: issues fetches; [`ScheduledRequester`] runs them on the
//!   priority scheduler with channels as the pooled resource
//! - [`QualityLayerTracker`]: databin listener turning writes into
//!   [`FetchEvent::QualityLayerReached`]

mod events;
mod request;
mod requester;
mod scheduled;
mod tracker;

pub use events::{
    event_channel, ChannelHandle, FetchEvent, FetchEventReceiver, FetchEventSender, RequestHandle,
};
pub use request::{ContinueOutcome, FetchStatus, ProgressiveFetchRequest, RequestCallbacks};
pub use requester::Requester;
pub use scheduled::{
    FetchJob, OutgoingRequest, ScheduledRequester, Transport, DEFAULT_FETCH_PRIORITY,
};
pub use tracker::{LayerProgress, QualityLayerTracker};
