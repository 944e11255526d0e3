//! # JPIP Streamer
//!
//! Client-side building blocks for progressive, cache-aware fetching of
//! tiled, quality-layered JPEG 2000 images delivered piecemeal as JPIP
//! databins.
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`databin`] - Sparse byte stores rebuilding databins from out-of-order,
//!   overlapping messages, and the registry notifying listeners of writes
//! - [`scheduler`] - Priority job scheduler over a bounded resource pool
//! - [`fetch`] - Progressive fetch requests and the scheduled requester
//! - [`codestream`] - Region parameters, the codestream structure seam and
//!   codestream assembly from databins
//! - [`io`] - Byte-range sources
//! - [`replay`] - Replay of a resource through the scheduler into a store
//! - [`config`] - CLI configuration of the replay tool
//!
//! Everything runs on a single thread: scheduler, requests and stores are
//! handles over `Rc`/`RefCell` state and are driven by completion calls.
//!
//! ## Example
//!
//! ```rust
//! use jpip_streamer::databin::{ByteRange, ByteRangeStore, CopyOptions, MessageHeader};
//!
//! let mut store = ByteRangeStore::new();
//! store.add_data(&MessageHeader::new(3, 4), b"defg").unwrap();
//! store.add_data(&MessageHeader::new(0, 3), b"abc").unwrap();
//! assert_eq!(store.existing_ranges(), &[ByteRange::new(0, 7)]);
//!
//! let mut buf = [0u8; 7];
//! let copied = store.copy_bytes(&mut buf, 0, CopyOptions::new()).unwrap();
//! assert_eq!(copied, Some(7));
//! assert_eq!(&buf, b"abcdefg");
//! ```

pub mod codestream;
pub mod config;
pub mod databin;
pub mod error;
pub mod fetch;
pub mod io;
pub mod replay;
pub mod scheduler;

// Re-export commonly used types
pub use codestream::{
    CodeblocksData, CodestreamStructure, PrecinctInfo, ProgressivenessStage, QualityLayers,
    RegionParams,
};
pub use config::Config;
pub use databin::{
    ByteRange, ByteRangeStore, CopyOptions, DatabinClass, DatabinId, DatabinListener,
    DatabinRegistry, MessageHeader,
};
pub use error::{DatabinError, FetchError, ReplayError, RequestError, SchedulerError, TransportError};
pub use fetch::{
    ContinueOutcome, FetchEvent, FetchStatus, ProgressiveFetchRequest, RequestCallbacks,
    Requester, ScheduledRequester, Transport,
};
pub use io::{FileRangeSource, MemoryRangeSource, RangeSource};
pub use scheduler::{PriorityScheduler, Prioritizer, ResourceFactory, SchedulerOptions};
