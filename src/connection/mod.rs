//! Connection Management Module
//!
//! Accept loop, session admission and graceful shutdown.

pub mod manager;

pub use manager::ConnectionManager;
