//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Read size used by every forwarding loop unless overridden
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub listener: ListenerConfig,
    pub egress: EgressConfig,
    pub tls: Option<TlsConfig>,
    pub relay: RelayConfig,
    pub monitoring: MonitoringConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub max_sessions: usize,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Transport the acceptor listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerKind {
    Tcp,
    Tls,
    Unix,
    Websocket,
    WebsocketTls,
}

/// Listener (ingress) configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub kind: ListenerKind,
    pub addr: Option<SocketAddr>,
    pub path: Option<PathBuf>,
    pub reuse_addr: bool,
    pub backlog: u32,
}

/// How the egress endpoint is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EgressMode {
    /// Open a new outbound connection immediately
    Dial,
    /// Poll for a Unix socket created by a cooperating process
    AwaitPeer,
}

/// Transport used when dialing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EgressKind {
    Tcp,
    Tls,
    Unix,
    Websocket,
}

/// Egress configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EgressConfig {
    pub mode: EgressMode,
    pub kind: EgressKind,
    /// `host:port` for TCP and TLS targets
    pub addr: Option<String>,
    /// Socket path for Unix targets and the await-peer policy
    pub path: Option<PathBuf>,
    /// `ws://` or `wss://` URL for WebSocket targets
    pub url: Option<String>,
    /// Name checked against the server certificate; defaults to the host
    pub server_name: Option<String>,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

/// Certificate material, resolved relative to `cert_dir`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_dir: PathBuf,
    pub ca_file: String,
    pub server_cert: String,
    pub server_key: String,
    pub client_cert: String,
    pub client_key: String,
    pub require_client_cert: bool,
}

/// Forwarding loop configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub buffer_size: usize,
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,
    pub chunk_histogram: bool,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub prometheus_enabled: bool,
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            kind: ListenerKind::Tcp,
            addr: Some(SocketAddr::from(([0, 0, 0, 0], 9999))),
            path: None,
            reuse_addr: true,
            backlog: 128,
        }
    }
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            mode: EgressMode::AwaitPeer,
            kind: EgressKind::Unix,
            addr: None,
            path: Some(PathBuf::from("/tmp/qemu_migration_dest.sock")),
            url: None,
            server_name: None,
            connect_timeout: Duration::from_secs(10),
            max_attempts: 30,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_dir: PathBuf::from("certs"),
            ca_file: "ca.pem".to_string(),
            server_cert: "server-cert.pem".to_string(),
            server_key: "server-key.pem".to_string(),
            client_cert: "client-cert.pem".to_string(),
            client_key: "client-key.pem".to_string(),
            require_client_cert: true,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            report_interval: Duration::from_secs(1),
            chunk_histogram: true,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            prometheus_enabled: false,
            metrics_addr: Some(SocketAddr::from(([127, 0, 0, 1], 9090))),
        }
    }
}

impl TlsConfig {
    pub fn ca_path(&self) -> PathBuf {
        self.cert_dir.join(&self.ca_file)
    }

    pub fn server_cert_path(&self) -> PathBuf {
        self.cert_dir.join(&self.server_cert)
    }

    pub fn server_key_path(&self) -> PathBuf {
        self.cert_dir.join(&self.server_key)
    }

    pub fn client_cert_path(&self) -> PathBuf {
        self.cert_dir.join(&self.client_cert)
    }

    pub fn client_key_path(&self) -> PathBuf {
        self.cert_dir.join(&self.client_key)
    }
}

impl ListenerKind {
    /// Whether accepting on this listener needs server-side certificates
    pub fn needs_tls(self) -> bool {
        matches!(self, ListenerKind::Tls | ListenerKind::WebsocketTls)
    }
}
