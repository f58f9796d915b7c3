//! Acceptor
//!
//! Binds the configured listener and yields pending ingress connections. The
//! transport handshake (TLS, WebSocket upgrade) is deferred to
//! [`PendingIngress::establish`] so that a slow or hostile client can never
//! stall the accept loop.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixStream};
use tracing::{debug, info, warn};

use super::endpoint::Endpoint;
use super::stream::SocketStream;
use super::tls::TlsAcceptor;
use crate::config::{ListenerConfig, ListenerKind};
use crate::error::RelayError;

/// Bind a TCP listener, optionally with `SO_REUSEADDR`
pub fn bind_tcp(addr: SocketAddr, reuse_addr: bool, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(reuse_addr)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

fn bind_unix(path: &Path) -> io::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed stale socket file {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

/// Listening socket for one ingress transport
pub struct Acceptor {
    listener: Listener,
    kind: ListenerKind,
    tls: Option<TlsAcceptor>,
}

impl Acceptor {
    /// Bind according to the listener configuration
    ///
    /// TLS kinds need `tls`; the caller builds it from the `[tls]` section.
    pub fn bind(config: &ListenerConfig, tls: Option<TlsAcceptor>) -> Result<Self, RelayError> {
        if config.kind.needs_tls() && tls.is_none() {
            return Err(RelayError::config(format!(
                "{:?} listener requires TLS certificates",
                config.kind
            )));
        }

        let listener = match config.kind {
            ListenerKind::Unix => {
                let path = config
                    .path
                    .clone()
                    .ok_or_else(|| RelayError::config("unix listener requires a path"))?;
                let listener = bind_unix(&path)?;
                info!("Listening on unix socket {}", path.display());
                Listener::Unix { listener, path }
            }
            kind => {
                let addr = config
                    .addr
                    .ok_or_else(|| RelayError::config(format!("{:?} listener requires an address", kind)))?;
                let listener = bind_tcp(addr, config.reuse_addr, config.backlog)?;
                info!(
                    "Listening on {} ({:?}, reuse_addr={})",
                    listener.local_addr()?,
                    kind,
                    config.reuse_addr
                );
                Listener::Tcp(listener)
            }
        };

        Ok(Self {
            listener,
            kind: config.kind,
            tls,
        })
    }

    /// Bound TCP address, `None` for Unix listeners
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix { .. } => None,
        }
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    /// Wait for the next ingress connection
    pub async fn accept(&self) -> io::Result<PendingIngress> {
        match &self.listener {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                }
                Ok(PendingIngress {
                    peer: peer.to_string(),
                    raw: RawStream::Tcp(stream),
                    kind: self.kind,
                    tls: self.tls.clone(),
                })
            }
            Listener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok(PendingIngress {
                    peer: format!("unix:{}", path.display()),
                    raw: RawStream::Unix(stream),
                    kind: self.kind,
                    tls: None,
                })
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = &self.listener {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove socket file {}: {}", path.display(), e);
                }
            }
        }
    }
}

enum RawStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// Accepted connection whose transport handshake has not run yet
pub struct PendingIngress {
    peer: String,
    raw: RawStream,
    kind: ListenerKind,
    tls: Option<TlsAcceptor>,
}

impl PendingIngress {
    /// Remote address, or the socket path for Unix listeners
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Run the TLS and WebSocket handshakes this listener kind requires
    pub async fn establish(self) -> Result<Endpoint, RelayError> {
        let tcp = match self.raw {
            RawStream::Unix(stream) => return Ok(Endpoint::Unix(stream)),
            RawStream::Tcp(stream) => stream,
        };

        let tls = match (self.kind.needs_tls(), self.tls) {
            (true, Some(tls)) => Some(tls),
            (true, None) => return Err(RelayError::config("TLS listener without certificates")),
            (false, _) => None,
        };

        match self.kind {
            ListenerKind::Tcp => Ok(Endpoint::Tcp(tcp)),
            ListenerKind::Tls => {
                let acceptor = tls.ok_or_else(|| RelayError::config("missing TLS acceptor"))?;
                let stream = acceptor.accept(tcp).await?;
                Ok(Endpoint::Tls(Box::new(stream)))
            }
            ListenerKind::Websocket | ListenerKind::WebsocketTls => {
                let socket = match tls {
                    Some(acceptor) => SocketStream::Tls(Box::new(acceptor.accept(tcp).await?)),
                    None => SocketStream::Plain(tcp),
                };
                let ws = tokio_tungstenite::accept_async(socket).await?;
                debug!("WebSocket upgrade completed for {}", self.peer);
                Ok(Endpoint::WebSocket(Box::new(ws)))
            }
            ListenerKind::Unix => Err(RelayError::config("TCP stream on a unix listener")),
        }
    }
}
