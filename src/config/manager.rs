//! Configuration Manager

use super::{Config, EgressKind, EgressMode, ListenerKind};
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Manages configuration loading and validation
pub struct ConfigManager;

/// Command-line overrides applied on top of the file/environment config
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub listen: Option<SocketAddr>,
    pub listen_path: Option<PathBuf>,
    pub target: Option<String>,
    pub await_path: Option<PathBuf>,
    pub tls_dir: Option<PathBuf>,
    pub max_attempts: Option<u32>,
    pub retry_delay: Option<std::time::Duration>,
}

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        Self::load_from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration from `MIGRELAY_*` variables resolved through `lookup`
    pub fn load_from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
        let mut config = Config::default();

        if let Some(listen) = lookup("MIGRELAY_LISTEN_ADDR") {
            config.listener.addr = Some(
                listen
                    .parse::<SocketAddr>()
                    .with_context(|| format!("Invalid MIGRELAY_LISTEN_ADDR: {}", listen))?,
            );
        }

        if let Some(target) = lookup("MIGRELAY_TARGET_ADDR") {
            config.egress.mode = EgressMode::Dial;
            if config.egress.kind == EgressKind::Unix {
                config.egress.kind = EgressKind::Tcp;
            }
            config.egress.addr = Some(target);
        }

        if let Some(path) = lookup("MIGRELAY_AWAIT_PATH") {
            config.egress.mode = EgressMode::AwaitPeer;
            config.egress.kind = EgressKind::Unix;
            config.egress.path = Some(PathBuf::from(path));
        }

        if let Some(attempts) = lookup("MIGRELAY_MAX_ATTEMPTS") {
            config.egress.max_attempts = attempts
                .parse::<u32>()
                .with_context(|| format!("Invalid MIGRELAY_MAX_ATTEMPTS: {}", attempts))?;
        }

        if let Some(delay) = lookup("MIGRELAY_RETRY_DELAY") {
            config.egress.retry_delay = humantime::parse_duration(&delay)
                .with_context(|| format!("Invalid MIGRELAY_RETRY_DELAY: {}", delay))?;
        }

        if let Some(buffer_size) = lookup("MIGRELAY_BUFFER_SIZE") {
            config.relay.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid MIGRELAY_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Some(log_level) = lookup("MIGRELAY_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_listener_config()
            .with_context(|| "Listener configuration validation failed")?;

        self.validate_egress_config()
            .with_context(|| "Egress configuration validation failed")?;

        self.validate_relay_config()
            .with_context(|| "Relay configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.max_sessions == 0 {
            bail!("max_sessions must be greater than 0");
        }

        if self.server.max_sessions > 100000 {
            bail!("max_sessions cannot exceed 100,000 for safety");
        }

        Ok(())
    }

    fn validate_listener_config(&self) -> Result<()> {
        match self.listener.kind {
            ListenerKind::Unix => {
                if self.listener.path.is_none() {
                    bail!("unix listener requires listener.path");
                }
            }
            kind => {
                if self.listener.addr.is_none() {
                    bail!("{:?} listener requires listener.addr", kind);
                }
            }
        }

        if self.listener.kind.needs_tls() && self.tls.is_none() {
            bail!("TLS listener requires a [tls] section");
        }

        if self.listener.backlog == 0 {
            bail!("listener.backlog must be greater than 0");
        }

        Ok(())
    }

    fn validate_egress_config(&self) -> Result<()> {
        let egress = &self.egress;

        match egress.mode {
            EgressMode::AwaitPeer => {
                if egress.path.is_none() {
                    bail!("await_peer mode requires egress.path");
                }
                if egress.max_attempts == 0 {
                    bail!("egress.max_attempts must be at least 1");
                }
            }
            EgressMode::Dial => match egress.kind {
                EgressKind::Tcp | EgressKind::Tls => {
                    let addr = match &egress.addr {
                        Some(addr) => addr,
                        None => bail!("dialing {:?} requires egress.addr", egress.kind),
                    };
                    if !addr.contains(':') {
                        bail!("egress.addr must be host:port, got '{}'", addr);
                    }
                }
                EgressKind::Unix => {
                    if egress.path.is_none() {
                        bail!("dialing unix requires egress.path");
                    }
                }
                EgressKind::Websocket => {
                    let url = match &egress.url {
                        Some(url) => url,
                        None => bail!("dialing websocket requires egress.url"),
                    };
                    if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                        bail!("egress.url must use ws:// or wss://, got '{}'", url);
                    }
                }
            },
        }

        if self.egress_needs_tls() && self.tls.is_none() {
            bail!("TLS egress requires a [tls] section");
        }

        if egress.connect_timeout.is_zero() {
            bail!("egress.connect_timeout must be greater than 0");
        }

        Ok(())
    }

    fn validate_relay_config(&self) -> Result<()> {
        if self.relay.buffer_size == 0 {
            bail!("buffer_size must be greater than 0");
        }

        if self.relay.buffer_size > 1048576 {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.relay.report_interval.is_zero() {
            bail!("report_interval must be greater than 0");
        }

        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!(
                "monitoring.log_level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        if self.monitoring.prometheus_enabled && self.monitoring.metrics_addr.is_none() {
            bail!("prometheus_enabled requires monitoring.metrics_addr");
        }

        Ok(())
    }

    /// Whether the egress side dials through TLS
    pub fn egress_needs_tls(&self) -> bool {
        if self.egress.mode != EgressMode::Dial {
            return false;
        }
        match self.egress.kind {
            EgressKind::Tls => true,
            EgressKind::Websocket => self
                .egress
                .url
                .as_deref()
                .is_some_and(|url| url.starts_with("wss://")),
            _ => false,
        }
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, overrides: &CliOverrides) {
        if let Some(addr) = overrides.listen {
            self.listener.addr = Some(addr);
            tracing::info!("CLI override: listen address set to {}", addr);
        }

        if let Some(path) = &overrides.listen_path {
            self.listener.kind = ListenerKind::Unix;
            self.listener.path = Some(path.clone());
            tracing::info!("CLI override: listening on unix socket {}", path.display());
        }

        if let Some(target) = &overrides.target {
            self.egress.mode = EgressMode::Dial;
            if self.egress.kind == EgressKind::Unix {
                self.egress.kind = EgressKind::Tcp;
            }
            self.egress.addr = Some(target.clone());
            tracing::info!("CLI override: dialing {}", target);
        }

        if let Some(path) = &overrides.await_path {
            self.egress.mode = EgressMode::AwaitPeer;
            self.egress.kind = EgressKind::Unix;
            self.egress.path = Some(path.clone());
            tracing::info!("CLI override: awaiting peer socket {}", path.display());
        }

        if let Some(dir) = &overrides.tls_dir {
            let tls = self.tls.get_or_insert_with(Default::default);
            tls.cert_dir = dir.clone();
            tracing::info!("CLI override: TLS directory set to {}", dir.display());
        }

        if let Some(attempts) = overrides.max_attempts {
            self.egress.max_attempts = attempts;
            tracing::info!("CLI override: max attempts set to {}", attempts);
        }

        if let Some(delay) = overrides.retry_delay {
            self.egress.retry_delay = delay;
            tracing::info!("CLI override: retry delay set to {:?}", delay);
        }
    }
}
