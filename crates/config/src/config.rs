//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

use crate::spec::SpecError;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A channel specification failed validation
    Invalid(SpecError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid channel specification: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<SpecError> for ConfigError {
    fn from(e: SpecError) -> Self {
        ConfigError::Invalid(e)
    }
}

/// Transcoding engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Engine binary to invoke (default "ffmpeg")
    #[serde(default = "default_engine_binary")]
    pub binary: String,
    /// Log level passed to the engine via -loglevel (default "info")
    #[serde(default = "default_engine_loglevel")]
    pub loglevel: String,
}

fn default_engine_binary() -> String {
    "ffmpeg".to_string()
}

fn default_engine_loglevel() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: default_engine_binary(),
            loglevel: default_engine_loglevel(),
        }
    }
}

/// Supervision tuning knobs shared by all jobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisionConfig {
    /// Window a freshly started process must survive before it is
    /// considered Running, and a Running process must survive before the
    /// restart attempt counter resets (seconds, default 5)
    #[serde(default = "default_stability_window_secs")]
    pub stability_window_secs: u64,
    /// Rolling window for warning-rate accounting (seconds, default 10)
    #[serde(default = "default_warning_window_secs")]
    pub warning_window_secs: u64,
    /// Warning count within the rolling window that degrades a job (default 20)
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u32,
    /// How long to wait for graceful termination before force-killing (seconds, default 5)
    #[serde(default = "default_graceful_stop_timeout_secs")]
    pub graceful_stop_timeout_secs: u64,
    /// Per-job health event ring buffer capacity (default 100)
    #[serde(default = "default_event_ring_capacity")]
    pub event_ring_capacity: usize,
    /// Window in which duplicate consecutive warnings are coalesced (milliseconds, default 2000)
    #[serde(default = "default_warning_coalesce_ms")]
    pub warning_coalesce_ms: u64,
}

fn default_stability_window_secs() -> u64 {
    5
}

fn default_warning_window_secs() -> u64 {
    10
}

fn default_warning_threshold() -> u32 {
    20
}

fn default_graceful_stop_timeout_secs() -> u64 {
    5
}

fn default_event_ring_capacity() -> usize {
    100
}

fn default_warning_coalesce_ms() -> u64 {
    2000
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            stability_window_secs: default_stability_window_secs(),
            warning_window_secs: default_warning_window_secs(),
            warning_threshold: default_warning_threshold(),
            graceful_stop_timeout_secs: default_graceful_stop_timeout_secs(),
            event_ring_capacity: default_event_ring_capacity(),
            warning_coalesce_ms: default_warning_coalesce_ms(),
        }
    }
}

/// Resource monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    /// Sampling interval in seconds (default 2)
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    /// Bandwidth used as 100% for network utilization (Mbps, default 100)
    #[serde(default = "default_network_max_bandwidth_mbps")]
    pub network_max_bandwidth_mbps: f32,
    /// Number of samples kept for the CPU trend window (default 30)
    #[serde(default = "default_trend_window")]
    pub trend_window: usize,
}

fn default_sample_interval_secs() -> u64 {
    2
}

fn default_network_max_bandwidth_mbps() -> f32 {
    100.0
}

fn default_trend_window() -> usize {
    30
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: default_sample_interval_secs(),
            network_max_bandwidth_mbps: default_network_max_bandwidth_mbps(),
            trend_window: default_trend_window(),
        }
    }
}

/// Status/command HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Address the status server binds to (default "127.0.0.1:7879")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Main daemon configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DaemonConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub supervision: SupervisionConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: DaemonConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - ENGINE_BINARY -> engine.binary
    /// - ENGINE_LOGLEVEL -> engine.loglevel
    /// - SUPERVISION_STABILITY_WINDOW_SECS -> supervision.stability_window_secs
    /// - SUPERVISION_GRACEFUL_STOP_TIMEOUT_SECS -> supervision.graceful_stop_timeout_secs
    /// - MONITOR_SAMPLE_INTERVAL_SECS -> monitor.sample_interval_secs
    /// - SERVER_BIND_ADDR -> server.bind_addr
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("ENGINE_BINARY") {
            if !val.is_empty() {
                self.engine.binary = val;
            }
        }

        if let Ok(val) = env::var("ENGINE_LOGLEVEL") {
            if !val.is_empty() {
                self.engine.loglevel = val;
            }
        }

        if let Ok(val) = env::var("SUPERVISION_STABILITY_WINDOW_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.supervision.stability_window_secs = secs;
            }
        }

        if let Ok(val) = env::var("SUPERVISION_GRACEFUL_STOP_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.supervision.graceful_stop_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("MONITOR_SAMPLE_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.monitor.sample_interval_secs = secs;
            }
        }

        if let Ok(val) = env::var("SERVER_BIND_ADDR") {
            if !val.is_empty() {
                self.server.bind_addr = val;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("ENGINE_BINARY");
        env::remove_var("ENGINE_LOGLEVEL");
        env::remove_var("SUPERVISION_STABILITY_WINDOW_SECS");
        env::remove_var("SUPERVISION_GRACEFUL_STOP_TIMEOUT_SECS");
        env::remove_var("MONITOR_SAMPLE_INTERVAL_SECS");
        env::remove_var("SERVER_BIND_ADDR");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // For any valid TOML configuration string, loading SHALL populate
        // every section with the declared value.
        #[test]
        fn prop_config_parses_all_sections(
            loglevel in "[a-z]{3,8}",
            stability in 1u64..600,
            warning_window in 1u64..600,
            warning_threshold in 1u32..1000,
            graceful in 1u64..60,
            ring in 1usize..10_000,
            interval in 1u64..60,
            max_bw in 1.0f32..10_000.0,
        ) {
            let toml_str = format!(
                r#"
[engine]
loglevel = "{}"

[supervision]
stability_window_secs = {}
warning_window_secs = {}
warning_threshold = {}
graceful_stop_timeout_secs = {}
event_ring_capacity = {}

[monitor]
sample_interval_secs = {}
network_max_bandwidth_mbps = {}
"#,
                loglevel, stability, warning_window, warning_threshold, graceful, ring, interval, max_bw
            );

            let config = DaemonConfig::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.engine.loglevel, loglevel);
            prop_assert_eq!(config.engine.binary, "ffmpeg");
            prop_assert_eq!(config.supervision.stability_window_secs, stability);
            prop_assert_eq!(config.supervision.warning_window_secs, warning_window);
            prop_assert_eq!(config.supervision.warning_threshold, warning_threshold);
            prop_assert_eq!(config.supervision.graceful_stop_timeout_secs, graceful);
            prop_assert_eq!(config.supervision.event_ring_capacity, ring);
            prop_assert_eq!(config.monitor.sample_interval_secs, interval);
            prop_assert!((config.monitor.network_max_bandwidth_mbps - max_bw).abs() < 0.001);
        }

        #[test]
        fn prop_env_overrides_graceful_timeout(
            initial in 1u64..60,
            override_secs in 1u64..120,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[supervision]
graceful_stop_timeout_secs = {}
"#,
                initial
            );

            let mut config = DaemonConfig::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var(
                "SUPERVISION_GRACEFUL_STOP_TIMEOUT_SECS",
                override_secs.to_string(),
            );
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.supervision.graceful_stop_timeout_secs, override_secs);
        }

        #[test]
        fn prop_env_overrides_sample_interval(
            initial in 1u64..60,
            override_secs in 1u64..120,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[monitor]
sample_interval_secs = {}
"#,
                initial
            );

            let mut config = DaemonConfig::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("MONITOR_SAMPLE_INTERVAL_SECS", override_secs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.monitor.sample_interval_secs, override_secs);
        }
    }

    // Test that missing sections use defaults
    #[test]
    fn test_empty_config_uses_defaults() {
        let config = DaemonConfig::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.engine.binary, "ffmpeg");
        assert_eq!(config.engine.loglevel, "info");
        assert_eq!(config.supervision.stability_window_secs, 5);
        assert_eq!(config.supervision.warning_window_secs, 10);
        assert_eq!(config.supervision.warning_threshold, 20);
        assert_eq!(config.supervision.graceful_stop_timeout_secs, 5);
        assert_eq!(config.supervision.event_ring_capacity, 100);
        assert_eq!(config.monitor.sample_interval_secs, 2);
        assert_eq!(config.server.bind_addr, "127.0.0.1:7879");
    }

    // Test partial config with some sections missing
    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[engine]
loglevel = "warning"
"#;
        let config = DaemonConfig::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.engine.loglevel, "warning");
        assert_eq!(config.engine.binary, "ffmpeg"); // default
        assert_eq!(config.supervision.warning_threshold, 20); // default
        assert_eq!(config.server.bind_addr, "127.0.0.1:7879"); // default
    }

    #[test]
    fn test_env_override_bind_addr() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = DaemonConfig::parse_toml("").unwrap();
        env::set_var("SERVER_BIND_ADDR", "0.0.0.0:9000");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.server.bind_addr, "0.0.0.0:9000");
    }

    #[test]
    fn test_env_override_engine_binary() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = DaemonConfig::parse_toml("").unwrap();
        env::set_var("ENGINE_BINARY", "/opt/ffmpeg/bin/ffmpeg");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.engine.binary, "/opt/ffmpeg/bin/ffmpeg");
    }

    #[test]
    fn test_empty_env_override_is_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = DaemonConfig::parse_toml("").unwrap();
        env::set_var("ENGINE_BINARY", "");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.engine.binary, "ffmpeg");
    }
}
