//! Resource Management
//!
//! Caps the number of concurrently relayed sessions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::Result;

/// Enforces `server.max_sessions`
pub struct ResourceManager {
    max_sessions: usize,
    session_semaphore: Arc<Semaphore>,
    stats: ResourceStats,
}

/// Session slot statistics
#[derive(Debug, Default)]
pub struct ResourceStats {
    pub peak_sessions: AtomicUsize,
    pub total_sessions_admitted: AtomicUsize,
    pub total_sessions_rejected: AtomicUsize,
}

/// Snapshot of session slot usage
#[derive(Debug, Clone)]
pub struct ResourceUsageStats {
    pub active_sessions: usize,
    pub peak_sessions: usize,
    pub total_sessions_admitted: usize,
    pub total_sessions_rejected: usize,
    pub max_sessions: usize,
}

impl ResourceManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            session_semaphore: Arc::new(Semaphore::new(max_sessions)),
            stats: ResourceStats::default(),
        }
    }

    /// Try to acquire a session slot without waiting
    pub fn acquire_session_slot(&self) -> Result<SessionSlot> {
        match Arc::clone(&self.session_semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.stats
                    .total_sessions_admitted
                    .fetch_add(1, Ordering::Relaxed);

                let active = self.active_sessions();
                self.stats.peak_sessions.fetch_max(active, Ordering::Relaxed);

                debug!("Acquired session slot, active sessions: {}", active);
                Ok(SessionSlot { _permit: permit })
            }
            Err(_) => {
                self.stats
                    .total_sessions_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Session limit reached ({}), rejecting connection",
                    self.max_sessions
                );
                Err(anyhow::anyhow!("Session limit reached"))
            }
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.max_sessions - self.session_semaphore.available_permits()
    }

    pub fn get_stats(&self) -> ResourceUsageStats {
        ResourceUsageStats {
            active_sessions: self.active_sessions(),
            peak_sessions: self.stats.peak_sessions.load(Ordering::Relaxed),
            total_sessions_admitted: self.stats.total_sessions_admitted.load(Ordering::Relaxed),
            total_sessions_rejected: self.stats.total_sessions_rejected.load(Ordering::Relaxed),
            max_sessions: self.max_sessions,
        }
    }
}

/// Session slot that releases its permit when dropped
pub struct SessionSlot {
    _permit: OwnedSemaphorePermit,
}
