//! Configuration of the replay tool.
//!
//! Options come from the command line via clap, or from environment
//! variables with the `JPIP_` prefix:
//!
//! - `JPIP_INPUT` - File to replay
//! - `JPIP_CHUNK_SIZE` - Bytes per delivered chunk (default: 4096)
//! - `JPIP_OVERLAP` - Bytes re-sent before each chunk (default: 0)
//! - `JPIP_ORDER` - sequential, reverse or interleaved (default: interleaved)
//! - `JPIP_CHANNELS` - Concurrent channels (default: 4)
//! - `JPIP_NEW_JOBS` - Size of the scheduler's recent-job list (default: 20)
//! - `JPIP_RERANK_INTERVAL` - Schedules between re-ranks (default: 20)
//! - `JPIP_GUARANTEED_CHANNELS` - Channels kept for high priority (default: 0)
//! - `JPIP_GUARANTEED_PRIORITY` - Priority allowed to use them (default: 0)
//! - `JPIP_LATENCY_MS` - Simulated round trip per chunk (default: 0)

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::replay::{ChunkOrder, ReplaySettings};
use crate::scheduler::{SchedulerOptions, DEFAULT_NUM_JOBS_BEFORE_RERANK, DEFAULT_NUM_NEW_JOBS};

// =============================================================================
// Default Values
// =============================================================================

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Default number of channels.
pub const DEFAULT_CHANNELS: usize = 4;

/// Largest accepted chunk size (16MB).
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

// =============================================================================
// CLI Arguments
// =============================================================================

/// JPIP Streamer - replay a file as out-of-order chunk deliveries.
///
/// Cuts the file into overlapping chunks, schedules their delivery over a
/// bounded set of channels and checks that the databin store rebuilds the
/// file exactly.
#[derive(Parser, Debug, Clone)]
#[command(name = "jpip-streamer")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// File to replay.
    #[arg(env = "JPIP_INPUT")]
    pub input: PathBuf,

    // =========================================================================
    // Delivery
    // =========================================================================
    /// Bytes per delivered chunk.
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, env = "JPIP_CHUNK_SIZE")]
    pub chunk_size: usize,

    /// Bytes re-sent before each chunk boundary.
    #[arg(long, default_value_t = 0, env = "JPIP_OVERLAP")]
    pub overlap: usize,

    /// Order in which chunks are submitted.
    #[arg(long, value_enum, default_value_t = ChunkOrder::Interleaved, env = "JPIP_ORDER")]
    pub order: ChunkOrder,

    /// Simulated round trip per chunk, in milliseconds.
    #[arg(long, default_value_t = 0, env = "JPIP_LATENCY_MS")]
    pub latency_ms: u64,

    // =========================================================================
    // Scheduler
    // =========================================================================
    /// Number of concurrent channels.
    #[arg(short, long, default_value_t = DEFAULT_CHANNELS, env = "JPIP_CHANNELS")]
    pub channels: usize,

    /// Jobs kept in the scheduler's recent list before aging out.
    #[arg(long, default_value_t = DEFAULT_NUM_NEW_JOBS, env = "JPIP_NEW_JOBS")]
    pub new_jobs: usize,

    /// Schedules between two re-ranks of waiting jobs.
    #[arg(long, default_value_t = DEFAULT_NUM_JOBS_BEFORE_RERANK, env = "JPIP_RERANK_INTERVAL")]
    pub rerank_interval: usize,

    /// Channels reserved for high-priority chunks.
    #[arg(long, default_value_t = 0, env = "JPIP_GUARANTEED_CHANNELS")]
    pub guaranteed_channels: usize,

    /// Minimum priority allowed to use reserved channels.
    #[arg(long, default_value_t = 0, env = "JPIP_GUARANTEED_PRIORITY")]
    pub guaranteed_priority: i32,

    // =========================================================================
    // Output
    // =========================================================================
    /// Print the summary as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl Config {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(format!(
                "chunk_size must be between 1 and {} bytes",
                MAX_CHUNK_SIZE
            ));
        }

        if self.overlap >= self.chunk_size {
            return Err("overlap must be smaller than chunk_size".to_string());
        }

        if self.channels == 0 {
            return Err("channels must be greater than 0".to_string());
        }

        // With every channel reserved, low-priority chunks would never run.
        if self.guaranteed_channels >= self.channels {
            return Err(format!(
                "guaranteed_channels ({}) must be smaller than channels ({})",
                self.guaranteed_channels, self.channels
            ));
        }

        if self.rerank_interval == 0 {
            return Err("rerank_interval must be greater than 0".to_string());
        }

        Ok(())
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions::named("replay")
            .with_num_new_jobs(self.new_jobs)
            .with_rerank_interval(self.rerank_interval)
            .with_guaranteed_resources(self.guaranteed_channels, self.guaranteed_priority)
    }

    pub fn replay_settings(&self) -> ReplaySettings {
        ReplaySettings {
            chunk_size: self.chunk_size,
            overlap: self.overlap,
            order: self.order,
            channels: self.channels,
            scheduler: self.scheduler_options(),
            latency: Duration::from_millis(self.latency_ms),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
