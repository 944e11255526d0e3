//! File replay through the scheduler.

use std::path::PathBuf;
use std::time::Duration;

use jpip_streamer::io::{FileRangeSource, MemoryRangeSource, RangeSource};
use jpip_streamer::replay::{replay, ChunkOrder, ReplaySettings};
use jpip_streamer::scheduler::SchedulerOptions;

use super::test_utils::content;

fn temp_file(name: &str, data: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "jpip-streamer-it-{}-{}",
        std::process::id(),
        name
    ));
    std::fs::write(&path, data).unwrap();
    path
}

fn settings(chunk_size: usize, overlap: usize, order: ChunkOrder, channels: usize) -> ReplaySettings {
    ReplaySettings {
        chunk_size,
        overlap,
        order,
        channels,
        scheduler: SchedulerOptions::named("replay")
            .with_num_new_jobs(3)
            .with_rerank_interval(4),
        latency: Duration::ZERO,
    }
}

#[tokio::test]
async fn test_replay_file() {
    let data = content(10_000, 42);
    let path = temp_file("replay", &data);
    let source = FileRangeSource::open(&path).await.unwrap();

    let summary = replay(&source, &settings(333, 17, ChunkOrder::Interleaved, 4))
        .await
        .unwrap();

    assert!(summary.verified);
    assert_eq!(summary.size, 10_000);
    assert_eq!(summary.chunks, 31);
    assert_eq!(summary.bytes_stored, 10_000);
    assert_eq!(summary.redundant_bytes, 30 * 17);
    assert_eq!(summary.ranges, 1);

    std::fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn test_replay_with_guaranteed_channels() {
    let source = MemoryRangeSource::new(content(2048, 1));
    let mut settings = settings(64, 8, ChunkOrder::Reverse, 3);
    settings.scheduler = settings.scheduler.with_guaranteed_resources(1, 30);

    let summary = replay(&source, &settings).await.unwrap();
    assert!(summary.verified);
    assert_eq!(summary.chunks, 32);
}

#[tokio::test]
async fn test_replay_summary_serializes() {
    let source = MemoryRangeSource::new(content(100, 0)).with_identifier("memory://small");
    let summary = replay(&source, &settings(40, 0, ChunkOrder::Sequential, 1))
        .await
        .unwrap();
    assert_eq!(source.read_count(), 3 + 1);

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["identifier"], "memory://small");
    assert_eq!(json["order"], "sequential");
    assert_eq!(json["verified"], true);
    assert_eq!(json["chunks"], 3);
    assert_eq!(source.size(), 100);
}
