//! Byte-level progress tracking for create and restore.
//!
//! Worker tasks bump shared atomic counters; a reporter task logs throughput
//! and an ETA at a fixed interval until the operation finishes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Counters shared by all file tasks of one operation.
#[derive(Debug, Default)]
pub struct TransferStats {
    /// Files finished (stored, referenced or restored)
    pub files: AtomicU64,

    /// Raw bytes processed
    pub bytes: AtomicU64,

    /// Stored bytes written to or read from the backend
    pub transferred_bytes: AtomicU64,

    /// Raw bytes satisfied by content already in storage
    pub deduplicated_bytes: AtomicU64,
}

impl TransferStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_transfer(&self, raw: u64, stored: u64) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(raw, Ordering::Relaxed);
        self.transferred_bytes.fetch_add(stored, Ordering::Relaxed);
    }

    pub fn record_dedup(&self, raw: u64) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(raw, Ordering::Relaxed);
        self.deduplicated_bytes.fetch_add(raw, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            files: self.files.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            transferred_bytes: self.transferred_bytes.load(Ordering::Relaxed),
            deduplicated_bytes: self.deduplicated_bytes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub files: u64,
    pub bytes: u64,
    pub transferred_bytes: u64,
    pub deduplicated_bytes: u64,
}

/// Percentage of `total` done, 100 when there is nothing to do.
pub fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        ((done as f64 / total as f64) * 100.0).min(100.0)
    }
}

/// Log progress every `interval` until `stop` is cancelled.
pub fn spawn_reporter(
    operation: &'static str,
    backup_id: String,
    stats: Arc<TransferStats>,
    total_bytes: u64,
    total_files: u64,
    interval: Duration,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let start = Instant::now();
        let mut last_bytes = 0u64;
        let mut last_time = start;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.cancelled() => break,
            }

            let snap = stats.snapshot();
            let now = Instant::now();
            let window = now.duration_since(last_time).as_secs_f64();
            let bytes_per_second = if window > 0.1 {
                (snap.bytes.saturating_sub(last_bytes) as f64 / window) as u64
            } else {
                0
            };
            last_bytes = snap.bytes;
            last_time = now;

            let eta = if bytes_per_second > 0 {
                format_duration(total_bytes.saturating_sub(snap.bytes) / bytes_per_second)
            } else {
                "-".to_string()
            };

            info!(
                backup_id = %backup_id,
                "{operation}: {:.1}% ({}/{} files, {} of {}), {}, eta {}",
                percent(snap.bytes, total_bytes),
                snap.files,
                total_files,
                format_bytes(snap.bytes),
                format_bytes(total_bytes),
                format_speed(bytes_per_second),
                eta,
            );
        }
    })
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
