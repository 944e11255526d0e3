//! Databin storage.
//!
//! - [`ByteRangeStore`]: sparse accumulator for one databin
//! - [`DatabinRegistry`]: all databins of an image, with update listeners

mod registry;
mod store;

pub use registry::{
    DatabinClass, DatabinId, DatabinListener, DatabinRegistry, Databins, ListenerId,
};
pub use store::{ByteRange, ByteRangeStore, CopyOptions, MessageHeader};
