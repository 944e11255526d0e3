//! Replay of a resource as out-of-order, overlapping chunk deliveries.
//!
//! The resource is cut into chunks, each chunk becomes a job on a
//! [`PriorityScheduler`] whose resources are channels, and every scheduled
//! chunk is read from the [`RangeSource`] and written into a
//! [`ByteRangeStore`]. At the end the store must give back the resource
//! byte for byte.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::databin::{ByteRange, ByteRangeStore, CopyOptions, MessageHeader};
use crate::error::ReplayError;
use crate::io::RangeSource;
use crate::scheduler::{PriorityScheduler, SchedulerOptions};

/// Order in which chunks are submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkOrder {
    /// Front to back
    Sequential,
    /// Back to front
    Reverse,
    /// Even chunks front to back, then odd chunks
    Interleaved,
}

/// Cut `size` bytes into chunks of `chunk_size`, each re-sending the
/// `overlap` bytes before its start, and order them.
///
/// An empty resource yields one empty chunk, so that its length still gets
/// delivered.
pub fn plan_chunks(
    size: usize,
    chunk_size: usize,
    overlap: usize,
    order: ChunkOrder,
) -> Vec<ByteRange> {
    if size == 0 {
        return vec![ByteRange::new(0, 0)];
    }

    let chunk_size = chunk_size.max(1);
    let chunks: Vec<ByteRange> = (0..size)
        .step_by(chunk_size)
        .map(|start| {
            let end = (start + chunk_size).min(size);
            let start = start.saturating_sub(overlap);
            ByteRange::new(start, end - start)
        })
        .collect();

    match order {
        ChunkOrder::Sequential => chunks,
        ChunkOrder::Reverse => chunks.into_iter().rev().collect(),
        ChunkOrder::Interleaved => {
            let (even, odd): (Vec<_>, Vec<_>) =
                chunks.into_iter().enumerate().partition(|(idx, _)| idx % 2 == 0);
            even.into_iter().chain(odd).map(|(_, range)| range).collect()
        }
    }
}

/// Parameters of a replay run.
#[derive(Debug, Clone)]
pub struct ReplaySettings {
    pub chunk_size: usize,
    pub overlap: usize,
    pub order: ChunkOrder,
    pub channels: usize,
    pub scheduler: SchedulerOptions,

    /// Simulated round trip per chunk
    pub latency: Duration,
}

/// Outcome of a replay run.
#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    pub identifier: String,
    pub size: u64,
    pub chunks: usize,
    pub channels: usize,
    pub order: ChunkOrder,
    pub bytes_delivered: usize,
    pub bytes_stored: usize,
    pub redundant_bytes: usize,
    pub ranges: usize,
    pub verified: bool,
    pub elapsed_ms: u64,
}

/// Scheduling context of one chunk.
#[derive(Debug, Clone)]
struct Delivery {
    position: usize,
    range: ByteRange,
    priority: i32,
}

/// Replay `source` through the scheduler into a fresh store.
pub async fn replay(
    source: &dyn RangeSource,
    settings: &ReplaySettings,
) -> Result<ReplaySummary, ReplayError> {
    let started = Instant::now();
    let size = source.size() as usize;
    let plan = plan_chunks(size, settings.chunk_size, settings.overlap, settings.order);

    debug!(
        source = source.identifier(),
        size,
        chunks = plan.len(),
        channels = settings.channels,
        "replay started"
    );

    let ready: Rc<RefCell<VecDeque<(Delivery, u32)>>> = Rc::default();
    let mut next_channel = 0u32;
    let scheduler = PriorityScheduler::new(
        move || {
            next_channel += 1;
            next_channel - 1
        },
        settings.channels,
        |delivery: &Delivery| delivery.priority,
        settings.scheduler.clone(),
    );

    // Earlier positions in the plan go first.
    for (position, range) in plan.iter().enumerate() {
        let delivery = Delivery {
            position,
            range: *range,
            priority: i32::try_from(plan.len() - position).unwrap_or(i32::MAX),
        };
        let queue = ready.clone();
        scheduler.enqueue_job(
            move |channel, delivery| queue.borrow_mut().push_back((delivery, channel)),
            delivery,
            |delivery| warn!(position = delivery.position, "chunk dropped"),
        )?;
    }

    let mut store = ByteRangeStore::new();
    let mut bytes_delivered = 0;
    let mut bytes_stored = 0;

    loop {
        let next = ready.borrow_mut().pop_front();
        let Some((delivery, channel)) = next else {
            let pending = scheduler.pending_jobs_count();
            if pending > 0 {
                return Err(ReplayError::Stalled { pending });
            }
            break;
        };

        if !settings.latency.is_zero() {
            tokio::time::sleep(settings.latency).await;
        }

        let range = delivery.range;
        let data = source.read_range(range.start as u64, range.length).await?;
        let mut header = MessageHeader::new(range.start, range.length);
        if range.end() == size {
            header = header.last();
        }

        let added = store.add_data(&header, &data)?;
        trace!(
            position = delivery.position,
            channel,
            start = range.start,
            length = range.length,
            added,
            "chunk stored"
        );
        bytes_delivered += range.length;
        bytes_stored += added;

        scheduler.job_done(channel)?;
    }

    let verified = verify(source, &store, size).await?;
    let summary = ReplaySummary {
        identifier: source.identifier().to_string(),
        size: size as u64,
        chunks: plan.len(),
        channels: settings.channels,
        order: settings.order,
        bytes_delivered,
        bytes_stored,
        redundant_bytes: bytes_delivered - bytes_stored,
        ranges: store.existing_ranges().len(),
        verified,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };

    debug!(verified, ranges = summary.ranges, "replay finished");
    Ok(summary)
}

/// Whether the store holds the whole resource and copies it back unchanged.
async fn verify(
    source: &dyn RangeSource,
    store: &ByteRangeStore,
    size: usize,
) -> Result<bool, ReplayError> {
    if !store.is_all_databin_loaded() {
        return Ok(false);
    }

    let expected = source.read_range(0, size).await?;
    let mut copy = vec![0u8; size];
    let copied = store.copy_bytes(&mut copy, 0, CopyOptions::new().force_all())?;

    Ok(copied == Some(size) && copy[..] == expected[..])
}
