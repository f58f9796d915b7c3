//! Migration Control
//!
//! The hypervisor's control protocol is reached through an opaque
//! [`ControlClient`]. The relay only needs the migration status string and,
//! while a migration is running, the transferred/total byte counts.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Control protocol failures
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Control connection failed: {0}")]
    Connection(String),

    #[error("Command '{command}' failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Unexpected control response: {0}")]
    Protocol(String),
}

/// Opaque RPC client for the virtual machine control socket
#[async_trait]
pub trait ControlClient: Send {
    async fn connect(&mut self, path: &Path) -> Result<(), ControlError>;

    /// Run `command` with optional JSON arguments and return its result object
    async fn execute(&mut self, command: &str, args: Option<Value>) -> Result<Value, ControlError>;

    async fn disconnect(&mut self) -> Result<(), ControlError>;
}

/// Status reported by `query-migrate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatus {
    None,
    Setup,
    Active,
    Completed,
    Failed,
    Cancelled,
    Other(String),
}

impl MigrationStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "none" => MigrationStatus::None,
            "setup" => MigrationStatus::Setup,
            "active" => MigrationStatus::Active,
            "completed" => MigrationStatus::Completed,
            "failed" => MigrationStatus::Failed,
            "cancelled" => MigrationStatus::Cancelled,
            other => MigrationStatus::Other(other.to_string()),
        }
    }

    /// Whether polling should stop
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Completed | MigrationStatus::Failed | MigrationStatus::Cancelled
        )
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationStatus::None => f.write_str("none"),
            MigrationStatus::Setup => f.write_str("setup"),
            MigrationStatus::Active => f.write_str("active"),
            MigrationStatus::Completed => f.write_str("completed"),
            MigrationStatus::Failed => f.write_str("failed"),
            MigrationStatus::Cancelled => f.write_str("cancelled"),
            MigrationStatus::Other(s) => f.write_str(s),
        }
    }
}

/// One `query-migrate` observation
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationProgress {
    pub status: MigrationStatus,
    pub transferred: Option<u64>,
    pub total: Option<u64>,
}

impl MigrationProgress {
    /// Parse a `query-migrate` result; a missing status reads as "unknown"
    pub fn from_response(response: &Value) -> Result<Self, ControlError> {
        let object = response
            .as_object()
            .ok_or_else(|| ControlError::Protocol(format!("expected an object, got {}", response)))?;

        let status = object
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let ram = object.get("ram");

        Ok(Self {
            status: MigrationStatus::parse(status),
            transferred: ram.and_then(|r| r.get("transferred")).and_then(Value::as_u64),
            total: ram.and_then(|r| r.get("total")).and_then(Value::as_u64),
        })
    }

    /// Percentage of RAM transferred, when the total is known and non-zero
    pub fn percent(&self) -> Option<f64> {
        match (self.transferred, self.total) {
            (Some(transferred), Some(total)) if total > 0 => {
                Some(transferred as f64 * 100.0 / total as f64)
            }
            _ => None,
        }
    }
}

/// Ask the source VM to migrate to `uri`
pub async fn start_migration<C: ControlClient + ?Sized>(
    client: &mut C,
    uri: &str,
) -> Result<Value, ControlError> {
    info!("Starting migration to {}", uri);
    client.execute("migrate", Some(json!({ "uri": uri }))).await
}

/// Ask the destination VM to listen for an incoming migration on `uri`
pub async fn start_incoming<C: ControlClient + ?Sized>(
    client: &mut C,
    uri: &str,
) -> Result<Value, ControlError> {
    info!("Expecting incoming migration on {}", uri);
    client
        .execute("migrate-incoming", Some(json!({ "uri": uri })))
        .await
}

/// Polls migration status until it reaches a terminal state
pub struct MigrationWatcher {
    interval: Duration,
}

impl Default for MigrationWatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl MigrationWatcher {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Poll `query-migrate` once per interval; returns the terminal observation
    pub async fn watch<C: ControlClient + ?Sized>(
        &self,
        client: &mut C,
    ) -> Result<MigrationProgress, ControlError> {
        loop {
            let response = client.execute("query-migrate", None).await?;
            let progress = MigrationProgress::from_response(&response)?;
            debug!(status = %progress.status, "Migration status");

            match &progress.status {
                MigrationStatus::Completed => {
                    info!("Migration completed successfully");
                    return Ok(progress);
                }
                MigrationStatus::Failed => {
                    warn!("Migration failed");
                    return Ok(progress);
                }
                MigrationStatus::Cancelled => {
                    warn!("Migration was cancelled");
                    return Ok(progress);
                }
                MigrationStatus::Active => {
                    if let Some(percent) = progress.percent() {
                        info!(
                            transferred = progress.transferred,
                            total = progress.total,
                            "Migration progress: {:.2}%",
                            percent
                        );
                    }
                }
                other => info!("Migration status: {}", other),
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}
