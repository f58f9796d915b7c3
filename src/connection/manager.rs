//! Connection Manager Implementation

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connector::EgressConnector;
use crate::metrics::Metrics;
use crate::relay::{ConnectionStats, RelayEngine, SessionRegistry};
use crate::resource::ResourceManager;
use crate::transport::{Acceptor, PendingIngress, TlsAcceptor};
use crate::Result;

/// Accepts ingress connections and runs a relay session for each
pub struct ConnectionManager {
    config: Arc<Config>,
    acceptor: Acceptor,
    connector: EgressConnector,
    engine: RelayEngine,
    resource_manager: Arc<ResourceManager>,
    shutdown_flag: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl ConnectionManager {
    /// Load certificates, bind the listener and prepare the egress connector
    ///
    /// Any configuration problem surfaces here, before the first accept.
    pub fn bind(config: Arc<Config>, metrics: Option<Arc<Metrics>>) -> Result<Self> {
        let tls = if config.listener.kind.needs_tls() {
            let tls_config = config
                .tls
                .as_ref()
                .context("TLS listener requires a [tls] section")?;
            Some(TlsAcceptor::new(tls_config).context("Failed to load server certificates")?)
        } else {
            None
        };

        let acceptor =
            Acceptor::bind(&config.listener, tls).context("Failed to bind listener")?;
        let connector =
            EgressConnector::from_config(&config).context("Failed to prepare egress connector")?;

        let registry = Arc::new(SessionRegistry::new());
        let mut engine = RelayEngine::new(registry, &config.relay);
        if let Some(metrics) = metrics {
            engine = engine.with_metrics(metrics);
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            resource_manager: Arc::new(ResourceManager::new(config.server.max_sessions)),
            config,
            acceptor,
            connector,
            engine,
            shutdown_flag: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    /// Bound TCP address, if listening on TCP
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.local_addr()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.engine.registry()
    }

    pub fn resource_manager(&self) -> &Arc<ResourceManager> {
        &self.resource_manager
    }

    /// Accept connections until shutdown, one relay session per connection
    pub async fn run(&self) -> Result<()> {
        info!("Starting connection acceptance loop");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if self.is_shutting_down() {
                break;
            }

            tokio::select! {
                accept_result = self.acceptor.accept() => {
                    match accept_result {
                        Ok(pending) => self.spawn_session(pending),
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break;
                }
            }
        }

        info!("Connection acceptance loop stopped");
        Ok(())
    }

    fn spawn_session(&self, pending: PendingIngress) {
        if self.is_shutting_down() {
            debug!("Rejecting connection from {} due to shutdown", pending.peer());
            return;
        }

        let slot = match self.resource_manager.acquire_session_slot() {
            Ok(slot) => slot,
            Err(_) => {
                warn!(
                    "Session limit reached, rejecting connection from {}",
                    pending.peer()
                );
                return;
            }
        };

        info!("Accepted connection from {}", pending.peer());

        let engine = self.engine.clone();
        let connector = self.connector.clone();
        tokio::spawn(async move {
            let _slot = slot;
            let peer = pending.peer().to_string();

            match engine.relay_pending(pending, &connector).await {
                Ok(stats) => debug!(
                    "Session {} from {} finished with {} bytes",
                    stats.session_id, peer, stats.total_bytes
                ),
                Err(e) => error!("Session from {} aborted: {}", peer, e),
            }
        });
    }

    /// Accept exactly one connection and relay it to completion
    pub async fn run_once(&self) -> Result<Option<ConnectionStats>> {
        info!("Waiting for a single connection");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let pending = tokio::select! {
            accept_result = self.acceptor.accept() => {
                accept_result.context("Failed to accept connection")?
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown before any connection arrived");
                return Ok(None);
            }
        };

        info!("Accepted connection from {}", pending.peer());
        let stats = self
            .engine
            .relay_pending(pending, &self.connector)
            .await
            .context("Relay session failed")?;
        Ok(Some(stats))
    }

    /// Stop accepting and signal every session to stop
    pub fn initiate_shutdown(&self) {
        info!("Initiating graceful shutdown of connection manager");
        self.shutdown_flag.store(true, Ordering::Relaxed);

        if let Err(e) = self.shutdown_tx.send(()) {
            debug!("No accept loop listening for shutdown: {}", e);
        }
    }

    /// Get a shutdown receiver for external components
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Stop accepting, then drain the registry within `server.shutdown_timeout`
    ///
    /// Returns whether every session closed before the timeout.
    pub async fn shutdown(&self) -> bool {
        self.initiate_shutdown();

        let shutdown_timeout = self.config.server.shutdown_timeout;
        info!(
            "Waiting for {} active sessions to close (timeout: {:?})",
            self.registry().len(),
            shutdown_timeout
        );

        match tokio::time::timeout(shutdown_timeout, self.registry().drain()).await {
            Ok(()) => {
                info!("All sessions closed gracefully");
                true
            }
            Err(_) => {
                warn!(
                    "Shutdown timeout reached after {:?} with {} sessions still active",
                    shutdown_timeout,
                    self.registry().len()
                );
                false
            }
        }
    }
}
