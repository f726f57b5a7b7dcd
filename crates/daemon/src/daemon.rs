//! Daemon startup and wiring for Stream Super Daemon
//!
//! Loads configuration and channel definitions, runs preflight checks,
//! and ties the supervisor, resource monitor, and status server together.

use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use stream_super_daemon_config::{load_channels, ConfigError, DaemonConfig, JobSpec};

use crate::monitor::{ResourceMonitor, ResourceWatch};
use crate::server::{run_status_server, ServerError, ServerState};
use crate::startup::{run_startup_checks, StartupError};
use crate::supervisor::Supervisor;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: DaemonConfig,
    supervisor: Arc<Supervisor>,
    resources: ResourceWatch,
    monitor_task: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Initialize the daemon from configuration files.
    ///
    /// Startup sequence: load config with environment overrides, load and
    /// validate channel definitions, verify the engine is available, then
    /// build the supervisor and resource monitor.
    pub async fn new(
        config_path: impl AsRef<Path>,
        channels_path: impl AsRef<Path>,
    ) -> Result<Self, DaemonError> {
        let config = DaemonConfig::load(config_path)?;
        let channels = load_channels(channels_path)?;
        run_startup_checks(&config)?;
        Ok(Self::build(config, channels).await)
    }

    /// Initialize from configuration files without preflight checks.
    ///
    /// Useful for testing and development when the engine binary is absent.
    pub async fn new_without_checks(
        config_path: impl AsRef<Path>,
        channels_path: impl AsRef<Path>,
    ) -> Result<Self, DaemonError> {
        let config = DaemonConfig::load(config_path)?;
        let channels = load_channels(channels_path)?;
        Ok(Self::build(config, channels).await)
    }

    /// Initialize with an already-loaded configuration; no preflight checks.
    pub async fn with_config(config: DaemonConfig, channels: Vec<JobSpec>) -> Self {
        Self::build(config, channels).await
    }

    async fn build(config: DaemonConfig, channels: Vec<JobSpec>) -> Self {
        let supervisor = Arc::new(Supervisor::new(&config));
        supervisor.register_channels(channels).await;

        let (resources, monitor_task) = ResourceMonitor::new(&config.monitor).spawn();

        Self {
            config,
            supervisor,
            resources,
            monitor_task,
        }
    }

    /// The fleet supervisor.
    pub fn supervisor(&self) -> Arc<Supervisor> {
        self.supervisor.clone()
    }

    /// Latest resource snapshot watch.
    pub fn resources(&self) -> ResourceWatch {
        self.resources.clone()
    }

    /// Start every channel flagged autostart; returns how many were dispatched.
    pub async fn autostart(&self) -> usize {
        let started = self.supervisor.start_autostart_channels().await;
        info!(started, "autostart channels dispatched");
        started
    }

    /// Run the status server until shutdown.
    pub async fn run_with_server(&self) -> Result<(), DaemonError> {
        let state = ServerState {
            supervisor: self.supervisor.clone(),
            resources: self.resources.clone(),
        };
        run_status_server(state, &self.config.server.bind_addr).await?;
        Ok(())
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.monitor_task.abort();
    }
}
