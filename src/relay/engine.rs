//! Relay Engine
//!
//! Drives one relay session through `connecting -> active -> closing -> closed`.
//! Both forwarding directions run as separate tasks; whichever finishes first
//! (end-of-stream, error or cancellation) cancels its sibling, and both
//! endpoints are closed before the session leaves the registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::forward::{forward, ForwardContext, ForwardOutcome, ForwardReport};
use super::registry::SessionRegistry;
use super::session::{ConnectionStats, Direction, RelaySession, SessionState};
use crate::config::RelayConfig;
use crate::connector::EgressConnector;
use crate::error::RelayError;
use crate::metrics::Metrics;
use crate::transport::{Endpoint, EndpointWriter, PendingIngress};

/// Upper bound on a close handshake (TLS close_notify, WebSocket Close frame)
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Unregisters the session and marks it closed however the driver exits
struct SessionGuard {
    registry: Arc<SessionRegistry>,
    session: Arc<RelaySession>,
    metrics: Option<Arc<Metrics>>,
    activated: bool,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.session.id);
        self.session.set_state(SessionState::Closed);
        if let Some(metrics) = &self.metrics {
            metrics.session_ended(self.session.duration().as_secs_f64(), !self.activated);
        }
    }
}

/// Runs relay sessions against a shared registry
#[derive(Clone)]
pub struct RelayEngine {
    registry: Arc<SessionRegistry>,
    buffer_size: usize,
    report_interval: Duration,
    chunk_histogram: bool,
    metrics: Option<Arc<Metrics>>,
}

impl RelayEngine {
    /// Create a relay engine from configuration
    pub fn new(registry: Arc<SessionRegistry>, config: &RelayConfig) -> Self {
        Self {
            registry,
            buffer_size: config.buffer_size,
            report_interval: config.report_interval,
            chunk_histogram: config.chunk_histogram,
            metrics: None,
        }
    }

    /// Record session and chunk metrics into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Registry every session of this engine is tracked in
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Register a session for an accepted connection, finish its handshake and relay it
    pub async fn relay_pending(
        &self,
        pending: PendingIngress,
        connector: &EgressConnector,
    ) -> Result<ConnectionStats, RelayError> {
        let session = self.registry.register(pending.peer());
        let guard = self.guard(&session);

        let ingress = tokio::select! {
            biased;
            _ = session.cancel_token().cancelled() => {
                info!(session_id = %session.id, "Session cancelled during ingress handshake");
                return Ok(session.to_stats());
            }
            ingress = pending.establish() => ingress,
        };

        match ingress {
            Ok(ingress) => self.drive(session, guard, ingress, connector).await,
            Err(e) => {
                warn!(session_id = %session.id, "Ingress handshake failed: {}", e);
                Err(e)
            }
        }
    }

    /// Relay an already-established ingress endpoint
    pub async fn run_session(
        &self,
        ingress_peer: &str,
        ingress: Endpoint,
        connector: &EgressConnector,
    ) -> Result<ConnectionStats, RelayError> {
        let session = self.registry.register(ingress_peer);
        let guard = self.guard(&session);
        self.drive(session, guard, ingress, connector).await
    }

    fn guard(&self, session: &Arc<RelaySession>) -> SessionGuard {
        if let Some(metrics) = &self.metrics {
            metrics.session_started();
        }
        SessionGuard {
            registry: Arc::clone(&self.registry),
            session: Arc::clone(session),
            metrics: self.metrics.clone(),
            activated: false,
        }
    }

    #[instrument(
        name = "session",
        skip_all,
        fields(session_id = %session.id, peer = %session.ingress_peer, ingress = ingress.kind())
    )]
    async fn drive(
        &self,
        session: Arc<RelaySession>,
        mut guard: SessionGuard,
        ingress: Endpoint,
        connector: &EgressConnector,
    ) -> Result<ConnectionStats, RelayError> {
        info!(
            identity = ?ingress.peer_identity(),
            "Ingress connected, acquiring egress"
        );

        let egress = tokio::select! {
            biased;
            _ = session.cancel_token().cancelled() => {
                info!("Session cancelled before egress was established");
                drop(ingress);
                return Ok(session.to_stats());
            }
            egress = connector.connect() => egress,
        };

        let egress = match egress {
            Ok(egress) => egress,
            Err(e) => {
                error!("Egress acquisition failed: {}", e);
                close_quietly(ingress, session.cancel_token(), "ingress").await;
                return Err(e);
            }
        };

        info!(egress = egress.kind(), "Relay active");
        session.set_state(SessionState::Active);
        guard.activated = true;

        let (ingress_reader, ingress_writer) = ingress.split(self.buffer_size);
        let (egress_reader, egress_writer) = egress.split(self.buffer_size);

        let pair = session.cancel_token().child_token();
        let _pair_guard = pair.clone().drop_guard();
        let ctx = ForwardContext {
            session: Arc::clone(&session),
            cancel: pair.clone(),
            report_interval: self.report_interval,
            track_chunks: self.chunk_histogram,
            metrics: self.metrics.clone(),
        };

        let mut upstream = tokio::spawn(forward(
            Direction::Upstream,
            ingress_reader,
            egress_writer,
            ctx.clone(),
        ));
        let mut downstream = tokio::spawn(forward(
            Direction::Downstream,
            egress_reader,
            ingress_writer,
            ctx,
        ));

        let (first, remaining) = tokio::select! {
            result = &mut upstream => (result, downstream),
            result = &mut downstream => (result, upstream),
        };

        session.set_state(SessionState::Closing);
        pair.cancel();
        let second = remaining.await;

        let cancel = session.cancel_token();
        tokio::join!(
            finish_direction(first, cancel),
            finish_direction(second, cancel)
        );

        session.log_stats();
        Ok(session.to_stats())
    }
}

/// Log how a direction ended, close its writer and report its histogram
///
/// The report's halves are dropped on return, so the transport is released
/// once both directions are finished even if the close handshake was skipped
/// or timed out.
async fn finish_direction(result: Result<ForwardReport, JoinError>, cancel: &CancellationToken) {
    let mut report = match result {
        Ok(report) => report,
        Err(e) => {
            error!("Forwarding task failed: {}", e);
            return;
        }
    };

    let direction = report.direction;
    match &report.outcome {
        ForwardOutcome::Eof => info!(direction = %direction, "End of stream"),
        ForwardOutcome::Cancelled => debug!(direction = %direction, "Cancelled"),
        ForwardOutcome::Failed(e) if e.is_disconnect() => {
            info!(direction = %direction, "Peer disconnected: {}", e)
        }
        ForwardOutcome::Failed(e) => warn!(direction = %direction, "Transport error: {}", e),
    }

    close_writer(&mut report.writer, cancel, direction.as_str()).await;

    if let Some(histogram) = report.sample.histogram() {
        histogram.log_report(direction.as_str());
    }
}

/// Close `writer` unless the session is cancelled, giving up after `CLOSE_TIMEOUT`
async fn close_writer(writer: &mut EndpointWriter, cancel: &CancellationToken, label: &str) {
    let closed = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("Session cancelled, dropping {} without close handshake", label);
            return;
        }
        closed = timeout(CLOSE_TIMEOUT, writer.close()) => closed,
    };

    match closed {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Error closing {}: {}", label, e),
        Err(_) => warn!("Closing {} timed out after {:?}", label, CLOSE_TIMEOUT),
    }
}

/// Close an endpoint that never went active
async fn close_quietly(endpoint: Endpoint, cancel: &CancellationToken, label: &str) {
    let (_reader, mut writer) = endpoint.split(1);
    close_writer(&mut writer, cancel, label).await;
}
