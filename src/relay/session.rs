//! Relay Session

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics::throughput::{mib, mib_per_sec};

/// Process-unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "relay_{}", self.0)
    }
}

/// Lifecycle of a relay session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Ingress accepted, egress not yet established
    Connecting,
    /// Both endpoints open, forwarding in both directions
    Active,
    /// One direction finished, endpoints being torn down
    Closing,
    /// Both endpoints closed
    Closed,
}

/// Forwarding direction within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Ingress to egress
    Upstream,
    /// Egress to ingress
    Downstream,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Upstream => "ingress->egress",
            Direction::Downstream => "egress->ingress",
        }
    }

    pub fn metric_label(self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared view of one live ingress/egress pairing
#[derive(Debug)]
pub struct RelaySession {
    pub id: SessionId,
    pub ingress_peer: String,
    pub start_time: Instant,
    state: Mutex<SessionState>,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    chunks_up: AtomicU64,
    chunks_down: AtomicU64,
    cancel: CancellationToken,
}

/// Final statistics for a finished session
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub session_id: String,
    pub ingress_peer: String,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub chunks_up: u64,
    pub chunks_down: u64,
    pub total_bytes: u64,
    pub average_mbps: f64,
}

impl RelaySession {
    /// Create a session in the `Connecting` state
    pub fn new(id: SessionId, ingress_peer: impl Into<String>, cancel: CancellationToken) -> Self {
        let ingress_peer = ingress_peer.into();
        debug!("Creating relay session {} for {}", id, ingress_peer);

        Self {
            id,
            ingress_peer,
            start_time: Instant::now(),
            state: Mutex::new(SessionState::Connecting),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            chunks_up: AtomicU64::new(0),
            chunks_down: AtomicU64::new(0),
            cancel,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next`, returning the previous state
    pub fn set_state(&self, next: SessionState) -> SessionState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let prev = std::mem::replace(&mut *state, next);
        if prev != next {
            debug!(session_id = %self.id, from = ?prev, to = ?next, "Session state changed");
        }
        prev
    }

    /// Token cancelled when this session must stop
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Count one forwarded chunk
    pub fn add_chunk(&self, direction: Direction, len: usize) {
        let (bytes, chunks) = match direction {
            Direction::Upstream => (&self.bytes_up, &self.chunks_up),
            Direction::Downstream => (&self.bytes_down, &self.chunks_down),
        };
        bytes.fetch_add(len as u64, Ordering::Relaxed);
        chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Upstream => self.bytes_up.load(Ordering::Relaxed),
            Direction::Downstream => self.bytes_down.load(Ordering::Relaxed),
        }
    }

    pub fn chunks(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Upstream => self.chunks_up.load(Ordering::Relaxed),
            Direction::Downstream => self.chunks_down.load(Ordering::Relaxed),
        }
    }

    /// Bytes forwarded in both directions
    pub fn total_bytes(&self) -> u64 {
        self.bytes(Direction::Upstream) + self.bytes(Direction::Downstream)
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Generate connection statistics
    pub fn to_stats(&self) -> ConnectionStats {
        let duration = self.duration();

        ConnectionStats {
            session_id: self.id.to_string(),
            ingress_peer: self.ingress_peer.clone(),
            duration_ms: duration.as_millis() as u64,
            bytes_up: self.bytes(Direction::Upstream),
            bytes_down: self.bytes(Direction::Downstream),
            chunks_up: self.chunks(Direction::Upstream),
            chunks_down: self.chunks(Direction::Downstream),
            total_bytes: self.total_bytes(),
            average_mbps: mib_per_sec(self.total_bytes(), duration),
        }
    }

    /// Log the final results block for this session
    pub fn log_stats(&self) {
        let stats = self.to_stats();

        info!(
            session_id = %stats.session_id,
            ingress_peer = %stats.ingress_peer,
            duration_ms = stats.duration_ms,
            bytes_up = stats.bytes_up,
            bytes_down = stats.bytes_down,
            chunks_up = stats.chunks_up,
            chunks_down = stats.chunks_down,
            total_bytes = stats.total_bytes,
            "Relay session completed"
        );

        info!("{}", "=".repeat(60));
        info!("FINAL RESULTS ({})", stats.session_id);
        info!("Duration:        {:.2} seconds", stats.duration_ms as f64 / 1000.0);
        info!(
            "ingress->egress: {:.2} MB in {} chunks",
            mib(stats.bytes_up),
            stats.chunks_up
        );
        info!(
            "egress->ingress: {:.2} MB in {} chunks",
            mib(stats.bytes_down),
            stats.chunks_down
        );
        info!("Average:         {:.2} MBps", stats.average_mbps);
        info!("{}", "=".repeat(60));
    }
}
