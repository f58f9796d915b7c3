//! migrelay Library
//!
//! Bidirectional stream relay for live-migration transports. An accepted
//! ingress connection (TCP, TLS, Unix socket or WebSocket) is paired with an
//! egress endpoint that is either dialed or awaited, and bytes are copied in
//! both directions until one side closes.

pub mod config;
pub mod connection;
pub mod connector;
pub mod control;
pub mod error;
pub mod metrics;
pub mod relay;
pub mod resource;
pub mod shutdown;
pub mod transport;

pub use config::Config;
pub use connection::ConnectionManager;
pub use connector::{EgressConnector, EgressPolicy, EgressTarget};
pub use error::RelayError;
pub use relay::{RelayEngine, SessionRegistry};
pub use resource::ResourceManager;
pub use shutdown::ShutdownCoordinator;
pub use transport::{Acceptor, Endpoint};

/// Common error type for top-level plumbing
pub type Result<T> = anyhow::Result<T>;
