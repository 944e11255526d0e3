//! Messages delivered to a progressive request.
//!
//! Requesters and databin listeners never call into a request directly. They
//! post [`FetchEvent`]s to the request's queue, and the request handles them
//! when its owner calls
//! [`process_events`](super::ProgressiveFetchRequest::process_events).

use std::fmt;

use tokio::sync::mpsc;

use crate::error::FetchError;

/// Identifies one fetch issued by a requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestHandle(pub u64);

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Identifies a network channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelHandle(pub u64);

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// The request's precincts changed their quality: `layers` complete
    /// layers over every precinct, `fully_loaded` once all databins are whole.
    QualityLayerReached { layers: u32, fully_loaded: bool },

    /// The server finished answering a fetch.
    RequestDone(RequestHandle),

    /// A fetch failed. The request stops until resumed.
    RequestFailed(RequestHandle, FetchError),
}

pub type FetchEventSender = mpsc::UnboundedSender<FetchEvent>;
pub type FetchEventReceiver = mpsc::UnboundedReceiver<FetchEvent>;

/// Create a request's event queue.
pub fn event_channel() -> (FetchEventSender, FetchEventReceiver) {
    mpsc::unbounded_channel()
}
