//! Metrics Collector

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::{debug, error};

use crate::relay::Direction;

/// Prometheus metrics for relay sessions
pub struct Metrics {
    registry: Registry,
    sessions_total: IntCounter,
    sessions_active: IntGauge,
    sessions_failed_total: IntCounter,
    bytes_forwarded_total: IntCounterVec,
    chunk_size_bytes: Histogram,
    session_duration: Histogram,
}

impl Metrics {
    /// Create and register every collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let sessions_total = IntCounter::new(
            "migrelay_sessions_total",
            "Total number of relay sessions started",
        )?;

        let sessions_active = IntGauge::new(
            "migrelay_sessions_active",
            "Number of relay sessions currently tracked",
        )?;

        let sessions_failed_total = IntCounter::new(
            "migrelay_sessions_failed_total",
            "Relay sessions aborted before going active",
        )?;

        let bytes_forwarded_total = IntCounterVec::new(
            Opts::new(
                "migrelay_bytes_forwarded_total",
                "Total bytes forwarded, by direction",
            ),
            &["direction"],
        )?;

        let chunk_size_bytes = Histogram::with_opts(
            HistogramOpts::new("migrelay_chunk_size_bytes", "Size of forwarded chunks").buckets(
                vec![
                    64.0, 256.0, 512.0, 1024.0, 2048.0, 4096.0, 6144.0, 8192.0, 16384.0, 65536.0,
                ],
            ),
        )?;

        let session_duration = Histogram::with_opts(
            HistogramOpts::new(
                "migrelay_session_duration_seconds",
                "Duration of relay sessions in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0]),
        )?;

        registry.register(Box::new(sessions_total.clone()))?;
        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(sessions_failed_total.clone()))?;
        registry.register(Box::new(bytes_forwarded_total.clone()))?;
        registry.register(Box::new(chunk_size_bytes.clone()))?;
        registry.register(Box::new(session_duration.clone()))?;

        Ok(Self {
            registry,
            sessions_total,
            sessions_active,
            sessions_failed_total,
            bytes_forwarded_total,
            chunk_size_bytes,
            session_duration,
        })
    }

    pub fn session_started(&self) {
        self.sessions_total.inc();
        self.sessions_active.inc();
    }

    /// Record a finished session; `failed` marks one that never went active
    pub fn session_ended(&self, duration_secs: f64, failed: bool) {
        self.sessions_active.dec();
        self.session_duration.observe(duration_secs);
        if failed {
            self.sessions_failed_total.inc();
        }
    }

    pub fn record_chunk(&self, direction: Direction, len: usize) {
        self.bytes_forwarded_total
            .with_label_values(&[direction.metric_label()])
            .inc_by(len as u64);
        self.chunk_size_bytes.observe(len as f64);
    }

    pub fn active_sessions(&self) -> i64 {
        self.sessions_active.get()
    }

    pub fn bytes_forwarded(&self, direction: Direction) -> u64 {
        self.bytes_forwarded_total
            .with_label_values(&[direction.metric_label()])
            .get()
    }

    /// Render every metric in the Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        match encoder.encode_to_string(&families) {
            Ok(text) => {
                debug!(families = families.len(), "Encoded Prometheus metrics");
                text
            }
            Err(e) => {
                error!("Failed to encode Prometheus metrics: {}", e);
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifecycle_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.session_started();
        metrics.session_started();
        assert_eq!(metrics.active_sessions(), 2);

        metrics.session_ended(1.5, false);
        metrics.session_ended(0.1, true);
        assert_eq!(metrics.active_sessions(), 0);

        let text = metrics.export_prometheus();
        assert!(text.contains("migrelay_sessions_total 2"));
        assert!(text.contains("migrelay_sessions_failed_total 1"));
    }

    #[test]
    fn test_bytes_by_direction() {
        let metrics = Metrics::new().unwrap();
        metrics.record_chunk(Direction::Upstream, 8192);
        metrics.record_chunk(Direction::Upstream, 4096);
        metrics.record_chunk(Direction::Downstream, 10);

        assert_eq!(metrics.bytes_forwarded(Direction::Upstream), 12288);
        assert_eq!(metrics.bytes_forwarded(Direction::Downstream), 10);

        let text = metrics.export_prometheus();
        assert!(text.contains("migrelay_bytes_forwarded_total{direction=\"upstream\"} 12288"));
        assert!(text.contains("migrelay_chunk_size_bytes_count 3"));
    }
}
