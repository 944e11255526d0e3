//! Sparse byte store for a single databin.
//!
//! A databin is a logical, byte-addressable resource (a precinct's packet
//! data, a tile header, the main header) that the server delivers in
//! messages. Messages arrive out of order, may overlap each other, and the
//! total length of the databin is unknown until a message flagged as carrying
//! the last byte arrives.
//!
//! [`ByteRangeStore`] keeps a sorted list of the byte ranges received so far,
//! merged so that no two ranges overlap or touch, plus a backing buffer that
//! grows to the highest offset written.
//!
//! ```text
//!   offset   0        7     10   14
//!   ranges   [=======)      [===)          length unknown
//!   add      [3 ........ 12)
//!   ranges   [==================)          one merged range [0, 14)
//! ```

use bytes::BytesMut;
use tracing::trace;

use crate::error::DatabinError;

// =============================================================================
// Byte Range
// =============================================================================

/// A run of bytes `[start, start + length)` held by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    /// Offset of the first byte from the databin start
    pub start: usize,

    /// Number of bytes in the run
    pub length: usize,
}

impl ByteRange {
    /// Create a new range.
    pub fn new(start: usize, length: usize) -> Self {
        Self { start, length }
    }

    /// Offset one past the last byte of the range.
    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.length
    }
}

// =============================================================================
// Message Header
// =============================================================================

/// Placement of one message body inside its databin.
///
/// Produced by the external message parser: the body occupies
/// `message_body_length` bytes of the parsed buffer starting at `body_start`,
/// and belongs at `message_offset_from_databin_start` within the databin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub body_start: usize,
    pub message_offset_from_databin_start: usize,
    pub message_body_length: usize,
    pub is_last_byte_in_databin: bool,
}

impl MessageHeader {
    /// Header for a body that starts at the beginning of its buffer.
    pub fn new(offset: usize, length: usize) -> Self {
        Self {
            body_start: 0,
            message_offset_from_databin_start: offset,
            message_body_length: length,
            is_last_byte_in_databin: false,
        }
    }

    /// Set where the body starts in the source buffer.
    pub fn with_body_start(mut self, body_start: usize) -> Self {
        self.body_start = body_start;
        self
    }

    /// Flag this message as carrying the last byte of the databin.
    pub fn last(mut self) -> Self {
        self.is_last_byte_in_databin = true;
        self
    }

    /// Databin offset one past the last byte of the body.
    pub fn end(&self) -> usize {
        self.message_offset_from_databin_start
            .saturating_add(self.message_body_length)
    }
}

// =============================================================================
// Copy Options
// =============================================================================

/// Options for [`ByteRangeStore::copy_bytes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyOptions {
    /// Databin offset to start copying from
    pub databin_start_offset: usize,

    /// Upper bound on the number of bytes copied
    pub max_length_to_copy: Option<usize>,

    /// Copy the whole requested span or nothing
    pub force_copy_all_range: bool,
}

impl CopyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(mut self, offset: usize) -> Self {
        self.databin_start_offset = offset;
        self
    }

    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length_to_copy = Some(max_length);
        self
    }

    pub fn force_all(mut self) -> Self {
        self.force_copy_all_range = true;
        self
    }
}

// =============================================================================
// Byte Range Store
// =============================================================================

/// Accumulates the out-of-order, possibly overlapping messages of one databin.
///
/// Invariants held between calls:
/// - `ranges` is sorted, and no two ranges overlap or are adjacent
/// - `loaded_bytes` equals the sum of all range lengths
/// - no range extends past a known total length
#[derive(Debug, Clone, Default)]
pub struct ByteRangeStore {
    ranges: Vec<ByteRange>,
    buffer: BytesMut,
    total_length: Option<usize>,
    loaded_bytes: usize,
}

impl ByteRangeStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one message body.
    ///
    /// Returns the number of bytes that were not held before. Overlapping
    /// bytes are overwritten but credited only once.
    ///
    /// # Errors
    ///
    /// A header that contradicts the source buffer or the data already held
    /// is rejected without modifying the store. Re-requesting the data is up
    /// to the caller.
    pub fn add_data(
        &mut self,
        header: &MessageHeader,
        source: &[u8],
    ) -> Result<usize, DatabinError> {
        let start = header.message_offset_from_databin_start;
        let length = header.message_body_length;
        let end = header.end();

        let body_end = header
            .body_start
            .checked_add(length)
            .filter(|&body_end| body_end <= source.len())
            .ok_or(DatabinError::BodyOutOfSource {
                body_start: header.body_start,
                length,
                source_len: source.len(),
            })?;

        match self.total_length {
            Some(known) if end > known => {
                return Err(DatabinError::DataBeyondEnd { end, length: known });
            }
            Some(known) if header.is_last_byte_in_databin && end != known => {
                return Err(DatabinError::InconsistentLength {
                    known,
                    claimed: end,
                });
            }
            None if header.is_last_byte_in_databin => {
                let held = self.ranges.last().map_or(0, ByteRange::end);
                if held > end {
                    return Err(DatabinError::TerminalBeforeHeldData { claimed: end, held });
                }
            }
            _ => {}
        }

        if header.is_last_byte_in_databin {
            self.total_length = Some(end);
        }

        if length == 0 {
            return Ok(0);
        }

        if self.buffer.len() < end {
            self.buffer.resize(end, 0);
        }
        self.buffer[start..end].copy_from_slice(&source[header.body_start..body_end]);

        let added = self.insert_range(ByteRange::new(start, length));
        self.loaded_bytes += added;

        trace!(
            offset = start,
            length,
            added,
            ranges = self.ranges.len(),
            last = header.is_last_byte_in_databin,
            "databin message stored"
        );

        Ok(added)
    }

    /// Splice `new` into the range list, merging every range it overlaps or
    /// touches. Returns how many of its bytes were not already covered.
    fn insert_range(&mut self, new: ByteRange) -> usize {
        let first = self.ranges.partition_point(|r| r.end() < new.start);
        let last = self.ranges.partition_point(|r| r.start <= new.end());

        let mut merged_start = new.start;
        let mut merged_end = new.end();
        let mut already_held = 0;
        for range in &self.ranges[first..last] {
            merged_start = merged_start.min(range.start);
            merged_end = merged_end.max(range.end());
            already_held += range.length;
        }

        let merged = ByteRange::new(merged_start, merged_end - merged_start);
        self.ranges.splice(first..last, std::iter::once(merged));

        merged.length - already_held
    }

    /// The range covering `offset`, if any.
    fn range_containing(&self, offset: usize) -> Option<&ByteRange> {
        let idx = self.ranges.partition_point(|r| r.end() <= offset);
        self.ranges.get(idx).filter(|r| r.start <= offset)
    }

    /// Merged ranges held, in ascending order.
    pub fn existing_ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    /// Total number of distinct bytes held.
    pub fn loaded_bytes(&self) -> usize {
        self.loaded_bytes
    }

    /// The databin length, once a terminal message has been received.
    pub fn databin_length_if_known(&self) -> Option<usize> {
        self.total_length
    }

    /// Length of the run starting at offset 0 (0 if the first byte is missing).
    pub fn contiguous_length_from_start(&self) -> usize {
        self.ranges
            .first()
            .filter(|r| r.start == 0)
            .map_or(0, |r| r.length)
    }

    /// Whether every byte of the databin is held.
    pub fn is_all_databin_loaded(&self) -> bool {
        match self.total_length {
            None => false,
            Some(0) => self.ranges.is_empty(),
            Some(length) => self.contiguous_length_from_start() == length,
        }
    }

    /// Copy held bytes into `dest[dest_offset..]`.
    ///
    /// Without `force_copy_all_range`, copies the contiguous run starting at
    /// `databin_start_offset`, bounded by `max_length_to_copy` and by the room
    /// left in `dest`, and returns `Some(count)` (zero when the first byte is
    /// missing).
    ///
    /// With `force_copy_all_range`, the whole span must be held: either
    /// `max_length_to_copy` bytes (clamped to a known end) or everything up
    /// to the known end. If any byte is missing, or the end is needed but not
    /// known yet, nothing is written and `Ok(None)` is returned.
    ///
    /// Bytes of `dest` outside `[dest_offset, dest_offset + count)` are never
    /// written.
    pub fn copy_bytes(
        &self,
        dest: &mut [u8],
        dest_offset: usize,
        options: CopyOptions,
    ) -> Result<Option<usize>, DatabinError> {
        let available =
            dest.len()
                .checked_sub(dest_offset)
                .ok_or(DatabinError::DestinationTooSmall {
                    offset: dest_offset,
                    required: 0,
                    available: dest.len(),
                })?;

        if options.force_copy_all_range {
            return self.copy_whole_span(dest, dest_offset, available, options);
        }

        let start = options.databin_start_offset;
        let Some(range) = self.range_containing(start) else {
            return Ok(Some(0));
        };

        let mut count = range.end() - start;
        if let Some(max) = options.max_length_to_copy {
            count = count.min(max);
        }
        count = count.min(available);

        dest[dest_offset..dest_offset + count].copy_from_slice(&self.buffer[start..start + count]);
        Ok(Some(count))
    }

    fn copy_whole_span(
        &self,
        dest: &mut [u8],
        dest_offset: usize,
        available: usize,
        options: CopyOptions,
    ) -> Result<Option<usize>, DatabinError> {
        let start = options.databin_start_offset;
        let end = match (options.max_length_to_copy, self.total_length) {
            (Some(max), Some(total)) => start.saturating_add(max).min(total),
            (Some(max), None) => start.saturating_add(max),
            (None, Some(total)) => total,
            (None, None) => return Ok(None),
        };

        if end <= start {
            return Ok(Some(0));
        }

        match self.range_containing(start) {
            Some(range) if range.end() >= end => {}
            _ => return Ok(None),
        }

        let count = end - start;
        if count > available {
            return Err(DatabinError::DestinationTooSmall {
                offset: dest_offset,
                required: count,
                available,
            });
        }

        dest[dest_offset..dest_offset + count].copy_from_slice(&self.buffer[start..end]);
        Ok(Some(count))
    }
}
