//! Metrics Module
//!
//! Throughput sampling and chunk histograms for the forwarding loops, plus the
//! Prometheus collector and its HTTP endpoint.

pub mod collector;
pub mod histogram;
pub mod server;
pub mod throughput;

pub use collector::Metrics;
pub use histogram::{ChunkHistogram, HistogramEntry};
pub use server::MetricsServer;
pub use throughput::{ThroughputReport, ThroughputSample};
