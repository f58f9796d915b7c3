//! Throughput Sampling
//!
//! Per-direction byte and chunk counters with interval reporting. Owned and
//! mutated by a single forwarding loop, so nothing here is synchronized.

use std::time::{Duration, Instant};

use tracing::info;

use super::histogram::ChunkHistogram;

const MIB: f64 = 1024.0 * 1024.0;

/// Bytes to MiB
pub fn mib(bytes: u64) -> f64 {
    bytes as f64 / MIB
}

/// Throughput in MiB/s, zero for an empty interval
pub fn mib_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        mib(bytes) / secs
    } else {
        0.0
    }
}

/// Snapshot emitted once per report interval
#[derive(Debug, Clone, PartialEq)]
pub struct ThroughputReport {
    pub elapsed: Duration,
    pub total_bytes: u64,
    pub chunk_count: u64,
    pub interval_mbps: f64,
    pub average_mbps: f64,
}

impl ThroughputReport {
    pub fn log(&self, direction: &str) {
        info!(
            direction = %direction,
            "Time: {:>6.1}s | Forwarded: {:>9.1} MB | Chunks: {:>8} | Interval: {:>7.2} MBps | Avg: {:>7.2} MBps",
            self.elapsed.as_secs_f64(),
            mib(self.total_bytes),
            self.chunk_count,
            self.interval_mbps,
            self.average_mbps
        );
    }
}

/// Counters for one forwarding direction
#[derive(Debug)]
pub struct ThroughputSample {
    start_time: Instant,
    interval: Duration,
    total_bytes: u64,
    chunk_count: u64,
    last_report_time: Instant,
    last_report_bytes: u64,
    histogram: Option<ChunkHistogram>,
}

impl ThroughputSample {
    /// Start sampling now; `track_chunks` enables the size histogram
    pub fn new(interval: Duration, track_chunks: bool) -> Self {
        Self::starting_at(Instant::now(), interval, track_chunks)
    }

    pub fn starting_at(start: Instant, interval: Duration, track_chunks: bool) -> Self {
        Self {
            start_time: start,
            interval,
            total_bytes: 0,
            chunk_count: 0,
            last_report_time: start,
            last_report_bytes: 0,
            histogram: track_chunks.then(ChunkHistogram::new),
        }
    }

    /// Count one forwarded chunk; returns a report when an interval has elapsed
    pub fn record(&mut self, len: usize, now: Instant) -> Option<ThroughputReport> {
        self.total_bytes += len as u64;
        self.chunk_count += 1;
        if let Some(histogram) = self.histogram.as_mut() {
            histogram.record(len);
        }

        let since_last = now.saturating_duration_since(self.last_report_time);
        if since_last < self.interval {
            return None;
        }

        let report = ThroughputReport {
            elapsed: now.saturating_duration_since(self.start_time),
            total_bytes: self.total_bytes,
            chunk_count: self.chunk_count,
            interval_mbps: mib_per_sec(self.total_bytes - self.last_report_bytes, since_last),
            average_mbps: mib_per_sec(
                self.total_bytes,
                now.saturating_duration_since(self.start_time),
            ),
        };
        self.last_report_time = now;
        self.last_report_bytes = self.total_bytes;
        Some(report)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    pub fn histogram(&self) -> Option<&ChunkHistogram> {
        self.histogram.as_ref()
    }
}
