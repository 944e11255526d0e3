use crate::codestream::{QualityLayers, RegionParams};

use super::events::{ChannelHandle, FetchEventSender, RequestHandle};

/// Issues fetches to the server on behalf of progressive requests.
///
/// Progress and completion are reported through `events`: data arrival is
/// observed through the databin registry, and the requester posts
/// [`FetchEvent::RequestDone`](super::FetchEvent::RequestDone) or
/// [`FetchEvent::RequestFailed`](super::FetchEvent::RequestFailed) when the
/// fetch ends. Implementations must not post events synchronously in a way
/// that requires the request to be borrowed; posting to the queue is always
/// safe.
pub trait Requester {
    /// Ask the server for the region up to `min_quality_layers`.
    ///
    /// With `dedicated_channel`, the fetch is sent on that channel instead
    /// of a pooled one.
    fn request_data(
        &self,
        params: &RegionParams,
        min_quality_layers: QualityLayers,
        dedicated_channel: Option<ChannelHandle>,
        events: FetchEventSender,
    ) -> RequestHandle;

    /// Stop a fetch. Events already posted for it may still arrive.
    fn stop_request_async(&self, handle: RequestHandle);

    /// Reserve a channel for a movable request and all requests moved from
    /// it.
    fn dedicate_channel_for_movable_request(&self) -> ChannelHandle;
}
