//! Transport Module
//!
//! Uniform read/write/close contract over TCP, TLS, Unix sockets and WebSocket,
//! plus the listener that produces ingress endpoints.

pub mod acceptor;
pub mod endpoint;
pub mod stream;
pub mod tls;

pub use acceptor::{bind_tcp, Acceptor, PendingIngress};
pub use endpoint::{Endpoint, EndpointReader, EndpointWriter, WsStream};
pub use stream::SocketStream;
pub use tls::{peer_common_name, TlsAcceptor, TlsConnector, TlsError};
