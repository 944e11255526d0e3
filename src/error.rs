use thiserror::Error;

/// Errors raised by databin stores when a message header does not fit the
/// data already held, or when a copy destination cannot hold the result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatabinError {
    /// Message body extends past the end of the buffer it was parsed from
    #[error("Message body out of source bounds: body at {body_start} with {length} bytes, source has {source_len}")]
    BodyOutOfSource {
        body_start: usize,
        length: usize,
        source_len: usize,
    },

    /// Message carries bytes beyond the already known databin length
    #[error("Data beyond databin end: message ends at {end}, databin length is {length}")]
    DataBeyondEnd { end: usize, length: usize },

    /// Terminal message disagrees with the databin length learned earlier
    #[error("Inconsistent databin length: previously {known}, now {claimed}")]
    InconsistentLength { known: usize, claimed: usize },

    /// Terminal message claims an end before bytes that are already stored
    #[error("Terminal message ends at {claimed} but data is held up to {held}")]
    TerminalBeforeHeldData { claimed: usize, held: usize },

    /// Copy destination cannot receive the requested bytes
    #[error("Destination too small: need {required} bytes at offset {offset}, buffer has {available}")]
    DestinationTooSmall {
        offset: usize,
        required: usize,
        available: usize,
    },

    /// Value does not fit the width of a codestream marker field
    #[error("Codestream field {field} cannot hold {value}")]
    FieldOverflow { field: &'static str, value: u64 },
}

/// Errors reported by the priority scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The pending job counter no longer matches the queued jobs
    #[error("Unexpected count of jobs: counted {counted}, queued {queued}")]
    InconsistentJobCount { counted: usize, queued: usize },
}

/// Network or protocol failure of a fetch.
///
/// Delivered asynchronously through the request's event queue, never returned
/// from the request API directly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The channel or session to the server was lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server answered with something the client cannot use
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A received message could not be stored
    #[error("Databin error: {0}")]
    Databin(#[from] DatabinError),
}

/// Errors returned by [`ProgressiveFetchRequest`](crate::fetch::ProgressiveFetchRequest).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// Invalid caller input (region, quality layers, progressiveness)
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// Operation not permitted in the request's current state
    #[error("Illegal operation: {0}")]
    IllegalOperation(String),

    /// A failure was latched and not yet acknowledged with
    /// `ignore_previous_failure`
    #[error("Previous failure not acknowledged: {0}")]
    PreviousFailure(FetchError),

    /// Databin read-back failed
    #[error("Databin error: {0}")]
    Databin(#[from] DatabinError),
}

/// Errors from byte-range transports.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Underlying read failed
    #[error("Read error: {0}")]
    Read(String),
}

/// Errors from replaying a resource through the scheduler into a store.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// Reading a chunk from the source failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A chunk was rejected by the store
    #[error("Databin error: {0}")]
    Databin(#[from] DatabinError),

    /// The scheduler reported an inconsistency
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Jobs are waiting but no channel will be handed to them
    #[error("Scheduler stalled with {pending} chunks waiting")]
    Stalled { pending: usize },
}
