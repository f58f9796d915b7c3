//! Egress Connector
//!
//! Obtains the endpoint that ingress traffic is relayed to, either by dialing
//! a configured target or by waiting for a cooperating process to create a
//! Unix socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, info, warn};

use crate::config::{Config, EgressKind, EgressMode};
use crate::error::RelayError;
use crate::transport::{Endpoint, SocketStream, TlsConnector};

/// Where a dialed egress connection goes
#[derive(Debug, Clone)]
pub enum EgressTarget {
    Tcp(String),
    Tls { addr: String, server_name: String },
    Unix(PathBuf),
    WebSocket(String),
}

/// Single retry policy covering both acquisition modes
#[derive(Debug, Clone)]
pub enum EgressPolicy {
    /// Connect once; refusal is immediately terminal
    Dial(EgressTarget),
    /// Poll `path` until it accepts a connection or attempts run out
    AwaitPeer {
        path: PathBuf,
        max_attempts: u32,
        retry_delay: Duration,
    },
}

/// Establishes egress endpoints for relay sessions
#[derive(Clone)]
pub struct EgressConnector {
    policy: EgressPolicy,
    connect_timeout: Duration,
    tls: Option<TlsConnector>,
}

impl EgressConnector {
    pub fn new(policy: EgressPolicy, connect_timeout: Duration, tls: Option<TlsConnector>) -> Self {
        Self {
            policy,
            connect_timeout,
            tls,
        }
    }

    /// Build the connector described by the `[egress]` and `[tls]` sections
    pub fn from_config(config: &Config) -> Result<Self, RelayError> {
        let egress = &config.egress;

        let policy = match egress.mode {
            EgressMode::AwaitPeer => EgressPolicy::AwaitPeer {
                path: egress
                    .path
                    .clone()
                    .ok_or_else(|| RelayError::config("await_peer requires egress.path"))?,
                max_attempts: egress.max_attempts,
                retry_delay: egress.retry_delay,
            },
            EgressMode::Dial => {
                let addr = || {
                    egress
                        .addr
                        .clone()
                        .ok_or_else(|| RelayError::config("dial requires egress.addr"))
                };
                let target = match egress.kind {
                    EgressKind::Tcp => EgressTarget::Tcp(addr()?),
                    EgressKind::Tls => {
                        let addr = addr()?;
                        let server_name = egress
                            .server_name
                            .clone()
                            .unwrap_or_else(|| host_of(&addr).to_string());
                        EgressTarget::Tls { addr, server_name }
                    }
                    EgressKind::Unix => EgressTarget::Unix(
                        egress
                            .path
                            .clone()
                            .ok_or_else(|| RelayError::config("dial unix requires egress.path"))?,
                    ),
                    EgressKind::Websocket => EgressTarget::WebSocket(
                        egress
                            .url
                            .clone()
                            .ok_or_else(|| RelayError::config("dial websocket requires egress.url"))?,
                    ),
                };
                EgressPolicy::Dial(target)
            }
        };

        let tls = if config.egress_needs_tls() {
            let tls_config = config
                .tls
                .as_ref()
                .ok_or_else(|| RelayError::config("TLS egress requires a [tls] section"))?;
            Some(TlsConnector::new(tls_config)?)
        } else {
            None
        };

        Ok(Self::new(policy, egress.connect_timeout, tls))
    }

    pub fn policy(&self) -> &EgressPolicy {
        &self.policy
    }

    /// Obtain the egress endpoint according to the policy
    pub async fn connect(&self) -> Result<Endpoint, RelayError> {
        match &self.policy {
            EgressPolicy::Dial(target) => self.dial(target).await,
            EgressPolicy::AwaitPeer {
                path,
                max_attempts,
                retry_delay,
            } => await_peer(path, *max_attempts, *retry_delay).await,
        }
    }

    async fn dial(&self, target: &EgressTarget) -> Result<Endpoint, RelayError> {
        match target {
            EgressTarget::Tcp(addr) => {
                let stream = self.connect_tcp(addr).await?;
                info!("Connected to target {}", addr);
                Ok(Endpoint::Tcp(stream))
            }
            EgressTarget::Tls { addr, server_name } => {
                let stream = self.connect_tcp(addr).await?;
                let tls = self.tls_connector()?.connect(stream, server_name).await?;
                info!("Connected to target {} over TLS", addr);
                Ok(Endpoint::Tls(Box::new(tls)))
            }
            EgressTarget::Unix(path) => {
                let stream = self
                    .with_timeout(&path.display().to_string(), UnixStream::connect(path))
                    .await?;
                info!("Connected to unix socket {}", path.display());
                Ok(Endpoint::Unix(stream))
            }
            EgressTarget::WebSocket(url) => self.dial_websocket(url).await,
        }
    }

    async fn dial_websocket(&self, url: &str) -> Result<Endpoint, RelayError> {
        let request = url.into_client_request()?;
        let uri = request.uri();
        let secure = uri.scheme_str() == Some("wss");
        let host = uri
            .host()
            .ok_or_else(|| RelayError::connection(url, "URL has no host"))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

        let stream = self.connect_tcp(&format!("{}:{}", host, port)).await?;
        let socket = if secure {
            let tls = self.tls_connector()?.connect(stream, &host).await?;
            SocketStream::Tls(Box::new(tls))
        } else {
            SocketStream::Plain(stream)
        };

        let (ws, response) = tokio_tungstenite::client_async(request, socket).await?;
        debug!("WebSocket handshake with {} returned {}", url, response.status());
        info!("Connected to WebSocket target {}", url);
        Ok(Endpoint::WebSocket(Box::new(ws)))
    }

    async fn connect_tcp(&self, addr: &str) -> Result<TcpStream, RelayError> {
        let stream = self.with_timeout(addr, TcpStream::connect(addr)).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }
        Ok(stream)
    }

    async fn with_timeout<T>(
        &self,
        target: &str,
        fut: impl std::future::Future<Output = std::io::Result<T>>,
    ) -> Result<T, RelayError> {
        match timeout(self.connect_timeout, fut).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(RelayError::connection(target, e)),
            Err(_) => Err(RelayError::connection(target, "connection timed out")),
        }
    }

    fn tls_connector(&self) -> Result<&TlsConnector, RelayError> {
        self.tls
            .as_ref()
            .ok_or_else(|| RelayError::config("TLS target without client certificates"))
    }
}

/// Poll for a Unix socket created by a cooperating process
///
/// Makes exactly `max_attempts` connect attempts and sleeps `retry_delay`
/// between them, never after the last one.
pub async fn await_peer(
    path: &Path,
    max_attempts: u32,
    retry_delay: Duration,
) -> Result<Endpoint, RelayError> {
    info!("Waiting for peer socket {}", path.display());

    for attempt in 1..=max_attempts {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            match UnixStream::connect(path).await {
                Ok(stream) => {
                    info!(
                        "Connected to peer socket {} on attempt {}",
                        path.display(),
                        attempt
                    );
                    return Ok(Endpoint::Unix(stream));
                }
                Err(e) => {
                    warn!(
                        "Peer socket {} exists but refused connection: {}",
                        path.display(),
                        e
                    );
                }
            }
        }

        info!(
            "Waiting for {} (attempt {}/{})",
            path.display(),
            attempt,
            max_attempts
        );

        if attempt < max_attempts {
            tokio::time::sleep(retry_delay).await;
        }
    }

    Err(RelayError::EndpointUnavailable {
        path: path.to_path_buf(),
        attempts: max_attempts,
    })
}

fn host_of(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}
