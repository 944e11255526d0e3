//! JPIP Streamer - replay a file through the databin store.
//!
//! This binary replays a local file as scheduled, out-of-order chunk
//! deliveries and verifies the reconstruction.

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jpip_streamer::{
    config::Config,
    io::{FileRangeSource, RangeSource},
    replay::{replay, ReplaySummary},
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let config = Config::parse();

    // Initialize logging
    init_logging(config.verbose);

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let source = match FileRangeSource::open(&config.input).await {
        Ok(source) => source,
        Err(e) => {
            error!("Cannot open {}: {}", config.input.display(), e);
            return ExitCode::FAILURE;
        }
    };

    info!("Replaying {} ({} bytes)", source.identifier(), source.size());
    info!(
        "  {} byte chunks, {} byte overlap, {:?} order, {} channel(s)",
        config.chunk_size, config.overlap, config.order, config.channels
    );

    let summary = match replay(&source, &config.replay_settings()).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("Replay failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if config.json {
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Cannot serialize summary: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        print_summary(&summary);
    }

    if summary.verified {
        ExitCode::SUCCESS
    } else {
        error!("Reconstructed data does not match {}", summary.identifier);
        ExitCode::FAILURE
    }
}

fn print_summary(summary: &ReplaySummary) {
    println!();
    println!("  Source:      {}", summary.identifier);
    println!("  Size:        {} bytes", summary.size);
    println!("  Chunks:      {} over {} channel(s)", summary.chunks, summary.channels);
    println!(
        "  Delivered:   {} bytes ({} redundant)",
        summary.bytes_delivered, summary.redundant_bytes
    );
    println!("  Stored:      {} bytes in {} range(s)", summary.bytes_stored, summary.ranges);
    println!("  Elapsed:     {} ms", summary.elapsed_ms);
    println!(
        "  Result:      {}",
        if summary.verified { "OK" } else { "MISMATCH" }
    );
    println!();
}

fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "jpip_streamer=debug"
    } else {
        "jpip_streamer=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
