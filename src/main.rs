//! migrelay - Bidirectional stream relay for live-migration transports

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use migrelay::config::{CliOverrides, ConfigManager, EgressMode};
use migrelay::metrics::{Metrics, MetricsServer};
use migrelay::{ConnectionManager, ShutdownCoordinator};

/// CLI arguments for migrelay
#[derive(Parser, Debug)]
#[command(name = "migrelay")]
#[command(about = "Bidirectional stream relay for live-migration transports")]
#[command(version)]
#[command(long_about = "
Relays a migration stream between an ingress listener (TCP, TLS, Unix socket,
WebSocket) and an egress endpoint that is either dialed or awaited.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  MIGRELAY_LISTEN_ADDR   - Listen address (e.g., 0.0.0.0:9999)
  MIGRELAY_TARGET_ADDR   - Dial target (host:port)
  MIGRELAY_AWAIT_PATH    - Unix socket to wait for
  MIGRELAY_MAX_ATTEMPTS  - Await-peer attempts
  MIGRELAY_RETRY_DELAY   - Delay between attempts (e.g., 1s, 250ms)
  MIGRELAY_BUFFER_SIZE   - Read buffer size in bytes
  MIGRELAY_LOG_LEVEL     - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "migrelay.toml")]
    pub config: PathBuf,

    /// Listen address (overrides config file)
    #[arg(short, long)]
    pub listen: Option<std::net::SocketAddr>,

    /// Listen on a Unix socket instead of TCP
    #[arg(long)]
    pub listen_path: Option<PathBuf>,

    /// Dial this host:port for every session
    #[arg(short, long, conflicts_with = "await_path")]
    pub target: Option<String>,

    /// Wait for this Unix socket to appear for every session
    #[arg(long)]
    pub await_path: Option<PathBuf>,

    /// Directory holding ca.pem and the server/client cert+key pairs
    #[arg(long)]
    pub tls_dir: Option<PathBuf>,

    /// Await-peer attempts before giving up
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Delay between await-peer attempts (e.g., 1s, 500ms)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub retry_delay: Option<Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long)]
    pub verbose: bool,

    /// Relay a single connection, then exit
    #[arg(long)]
    pub once: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            listen: self.listen,
            listen_path: self.listen_path.clone(),
            target: self.target.clone(),
            await_path: self.await_path.clone(),
            tls_dir: self.tls_dir.clone(),
            max_attempts: self.max_attempts,
            retry_delay: self.retry_delay,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };
    config.merge_with_cli_args(&args.overrides());

    init_tracing(&args, &config.monitoring.log_level);

    info!("Starting migrelay v{}", env!("CARGO_PKG_VERSION"));

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        log_summary(&config);
        return Ok(());
    }

    log_summary(&config);

    let shutdown_coordinator = ShutdownCoordinator::new();

    let metrics = if config.monitoring.prometheus_enabled {
        Some(Arc::new(Metrics::new().context("Failed to create metrics")?))
    } else {
        None
    };

    let manager = Arc::new(ConnectionManager::bind(
        Arc::new(config.clone()),
        metrics.clone(),
    )?);

    let metrics_handle = match (&metrics, config.monitoring.metrics_addr) {
        (Some(metrics), Some(addr)) => {
            let server = MetricsServer::bind(Arc::clone(metrics), addr)
                .await
                .context("Failed to start metrics server")?;
            let mut shutdown_rx = shutdown_coordinator.subscribe();
            Some(tokio::spawn(async move {
                tokio::select! {
                    _ = server.run() => {}
                    _ = shutdown_rx.recv() => info!("Metrics server shutdown"),
                }
            }))
        }
        _ => None,
    };

    let once = args.once;
    let mut server_handle = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if once {
                manager.run_once().await.map(|_| ())
            } else {
                manager.run().await
            }
        })
    };

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    let server_result = tokio::select! {
        result = &mut server_handle => Some(result),
        signal_result = shutdown_coordinator.listen_for_signals() => {
            if let Err(e) = signal_result {
                error!("Error setting up signal handlers: {}", e);
                shutdown_coordinator.trigger();
            }
            None
        }
    };

    info!("Initiating graceful shutdown...");
    if !manager.shutdown().await {
        warn!("Exiting with relay sessions still open");
    }

    let server_result = match server_result {
        Some(result) => result,
        None => server_handle.await,
    };

    shutdown_coordinator.trigger();
    if let Some(handle) = metrics_handle {
        if let Err(e) = handle.await {
            warn!("Metrics server task failed: {}", e);
        }
    }

    info!("Server shutdown complete");

    match server_result {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(anyhow::anyhow!("Server task failed: {}", e)),
    }
}

fn log_summary(config: &migrelay::Config) {
    match (&config.listener.addr, &config.listener.path) {
        (_, Some(path)) if config.listener.kind == migrelay::config::ListenerKind::Unix => {
            info!("  Listen: unix:{}", path.display())
        }
        (Some(addr), _) => info!("  Listen: {} ({:?})", addr, config.listener.kind),
        _ => {}
    }
    match config.egress.mode {
        EgressMode::Dial => info!(
            "  Egress: dial {:?} {}",
            config.egress.kind,
            config
                .egress
                .addr
                .as_deref()
                .or(config.egress.url.as_deref())
                .map(str::to_string)
                .or_else(|| config.egress.path.as_ref().map(|p| p.display().to_string()))
                .unwrap_or_default()
        ),
        EgressMode::AwaitPeer => info!(
            "  Egress: await {} ({} attempts, {:?} apart)",
            config
                .egress
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            config.egress.max_attempts,
            config.egress.retry_delay
        ),
    }
    info!("  Max sessions: {}", config.server.max_sessions);
    info!("  Buffer size: {} bytes", config.relay.buffer_size);
    info!("  Report interval: {:?}", config.relay.report_interval);
    info!(
        "  TLS: {}",
        config
            .tls
            .as_ref()
            .map(|tls| tls.cert_dir.display().to_string())
            .unwrap_or_else(|| "disabled".to_string())
    );
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, configured_level: &str) {
    let log_level = if args.verbose {
        "debug"
    } else {
        args.log_level.as_deref().unwrap_or(configured_level)
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();
}
