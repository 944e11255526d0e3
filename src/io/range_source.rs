use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

/// Byte-range access to a remote or local resource.
///
/// This is the transport seam below databins: a server, a file, or a test
/// buffer answering range requests.
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// Returns an error if the range is out of bounds or if the read fails.
    async fn read_range(&self, offset: u64, len: usize) -> Result<Bytes, TransportError>;

    /// Total size of the resource in bytes.
    fn size(&self) -> u64;

    /// Identifier of the resource, for logging.
    fn identifier(&self) -> &str;
}

pub(crate) fn check_bounds(offset: u64, len: usize, size: u64) -> Result<(), TransportError> {
    let end = offset.checked_add(len as u64);
    if end.map_or(true, |end| end > size) {
        return Err(TransportError::RangeOutOfBounds {
            offset,
            requested: len as u64,
            size,
        });
    }
    Ok(())
}

/// In-memory [`RangeSource`], counting the reads it serves.
pub struct MemoryRangeSource {
    data: Bytes,
    identifier: String,
    read_count: AtomicUsize,
}

impl MemoryRangeSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            identifier: "memory://".to_string(),
            read_count: AtomicUsize::new(0),
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    pub fn read_count(&self) -> usize {
        self.read_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RangeSource for MemoryRangeSource {
    async fn read_range(&self, offset: u64, len: usize) -> Result<Bytes, TransportError> {
        self.read_count.fetch_add(1, Ordering::SeqCst);
        check_bounds(offset, len, self.size())?;

        let start = offset as usize;
        Ok(self.data.slice(start..start + len))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}
