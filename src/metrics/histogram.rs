//! Chunk Size Histogram
//!
//! Frequency of read sizes seen by one forwarding direction. Small, irregular
//! chunks point at a slow or fragmenting peer; a healthy bulk transfer is
//! dominated by full-buffer reads.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

/// One row of the histogram report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramEntry {
    pub size: usize,
    pub count: u64,
    pub percentage: f64,
}

/// Chunk sizes and how often each was read
#[derive(Debug, Default, Clone)]
pub struct ChunkHistogram {
    counts: BTreeMap<usize, u64>,
    total: u64,
}

impl ChunkHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, size: usize) {
        *self.counts.entry(size).or_insert(0) += 1;
        self.total += 1;
    }

    pub fn total_chunks(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Entries sorted by chunk size, ascending
    pub fn entries(&self) -> Vec<HistogramEntry> {
        self.counts
            .iter()
            .map(|(&size, &count)| HistogramEntry {
                size,
                count,
                percentage: if self.total == 0 {
                    0.0
                } else {
                    count as f64 * 100.0 / self.total as f64
                },
            })
            .collect()
    }

    /// Log the histogram, one line per distinct chunk size
    pub fn log_report(&self, direction: &str) {
        if self.is_empty() {
            info!(direction = %direction, "Chunk size histogram: no chunks");
            return;
        }

        info!(
            direction = %direction,
            total_chunks = self.total,
            distinct_sizes = self.counts.len(),
            "Chunk size histogram"
        );
        for entry in self.entries() {
            info!(
                "  {:>6} bytes: {:>8} chunks ({:>6.2}%)",
                entry.size, entry.count, entry.percentage
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_sorted_with_percentages() {
        let mut histogram = ChunkHistogram::new();
        for size in [8192, 4096, 8192, 8192] {
            histogram.record(size);
        }

        let entries = histogram.entries();
        assert_eq!(histogram.total_chunks(), 4);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].size, 4096);
        assert_eq!(entries[0].count, 1);
        assert!((entries[0].percentage - 25.0).abs() < f64::EPSILON);
        assert_eq!(entries[1].size, 8192);
        assert!((entries[1].percentage - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_histogram() {
        let histogram = ChunkHistogram::new();
        assert!(histogram.is_empty());
        assert!(histogram.entries().is_empty());
        histogram.log_report("ingress->egress");
    }
}
