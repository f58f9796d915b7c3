//! Relay Error Types
//!
//! Typed errors for the transport, connector and session layers. Top-level
//! plumbing (config loading, the binary) keeps using `anyhow`.

use std::path::PathBuf;
use thiserror::Error;

use crate::transport::TlsError;

/// Errors raised while establishing or driving relay endpoints
#[derive(Error, Debug)]
pub enum RelayError {
    /// Invalid or incomplete configuration, fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Outbound connection could not be established
    #[error("Connection to {target} failed: {reason}")]
    Connection {
        /// Address, path or URL that was dialed
        target: String,
        /// Underlying failure
        reason: String,
    },

    /// Awaited peer endpoint never became connectable
    #[error("Endpoint {} unavailable after {attempts} attempts", path.display())]
    EndpointUnavailable {
        /// Socket path that was polled
        path: PathBuf,
        /// Number of connect attempts made
        attempts: u32,
    },

    /// TLS setup or handshake failure
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// WebSocket handshake or framing failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Transport I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Create a connection error
    pub fn connection(target: impl Into<String>, reason: impl ToString) -> Self {
        RelayError::Connection {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        RelayError::Config(reason.into())
    }

    /// Whether the error means the peer went away rather than something broke
    pub fn is_disconnect(&self) -> bool {
        use std::io::ErrorKind;
        use tokio_tungstenite::tungstenite::Error as WsError;

        match self {
            RelayError::Io(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ),
            RelayError::WebSocket(WsError::ConnectionClosed)
            | RelayError::WebSocket(WsError::AlreadyClosed) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_unavailable_message() {
        let err = RelayError::EndpointUnavailable {
            path: PathBuf::from("/tmp/peer.sock"),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "Endpoint /tmp/peer.sock unavailable after 3 attempts"
        );
    }

    #[test]
    fn test_disconnect_classification() {
        let reset = RelayError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(reset.is_disconnect());

        let refused = RelayError::connection("127.0.0.1:1", "connection refused");
        assert!(!refused.is_disconnect());
    }
}
