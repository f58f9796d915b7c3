//! Data Relay Module
//!
//! Bidirectional forwarding between an ingress and an egress endpoint, and the
//! registry that tracks live sessions.

pub mod engine;
pub mod forward;
pub mod registry;
pub mod session;

pub use engine::RelayEngine;
pub use forward::{ForwardOutcome, ForwardReport};
pub use registry::SessionRegistry;
pub use session::{ConnectionStats, Direction, RelaySession, SessionId, SessionState};
