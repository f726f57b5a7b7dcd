//! Channel job specifications.
//!
//! A [`JobSpec`] describes one managed stream channel: where its input comes
//! from, where the transcoded output goes, the engine parameters, and the
//! restart policy applied when the backing process fails. Specs are loaded
//! from a channels.toml file and validated before the supervisor ever sees
//! them; a spec that passes validation is immutable for its lifetime.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::ConfigError;

/// Error type for job specification validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    /// Channel id is empty
    EmptyId,
    /// Two channels share the same id
    DuplicateId(String),
    /// An endpoint host is empty
    EmptyHost(String),
    /// An endpoint port is zero
    PortZero(String),
    /// An endpoint URL or path is empty
    EmptyAddress(String),
    /// Restart backoff base is zero
    ZeroBackoffBase(String),
    /// Video bitrate is zero
    ZeroBitrate(String),
}

impl std::fmt::Display for SpecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpecError::EmptyId => write!(f, "channel id must not be empty"),
            SpecError::DuplicateId(id) => write!(f, "duplicate channel id '{}'", id),
            SpecError::EmptyHost(id) => write!(f, "channel '{}': endpoint host must not be empty", id),
            SpecError::PortZero(id) => write!(f, "channel '{}': endpoint port must not be zero", id),
            SpecError::EmptyAddress(id) => {
                write!(f, "channel '{}': endpoint URL or path must not be empty", id)
            }
            SpecError::ZeroBackoffBase(id) => {
                write!(f, "channel '{}': restart backoff base must not be zero", id)
            }
            SpecError::ZeroBitrate(id) => {
                write!(f, "channel '{}': video bitrate must not be zero", id)
            }
        }
    }
}

impl std::error::Error for SpecError {}

/// SRT connection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SrtMode {
    Caller,
    Listener,
    Rendezvous,
}

impl Default for SrtMode {
    fn default() -> Self {
        Self::Caller
    }
}

impl std::fmt::Display for SrtMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SrtMode::Caller => write!(f, "caller"),
            SrtMode::Listener => write!(f, "listener"),
            SrtMode::Rendezvous => write!(f, "rendezvous"),
        }
    }
}

/// Input endpoint of a channel, tagged by transport kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputEndpoint {
    /// Local media file, streamed at realtime pace.
    File { path: String },
    /// UDP multicast or unicast MPEG-TS input.
    Udp {
        host: String,
        port: u16,
        /// Select a single program from a multi-program transport stream.
        #[serde(default)]
        program_id: Option<u32>,
        /// Local interface to bind for reception.
        #[serde(default)]
        bind_interface: Option<String>,
    },
    /// SRT input.
    Srt {
        host: String,
        port: u16,
        #[serde(default)]
        mode: SrtMode,
    },
    /// HLS (M3U8) playlist input.
    Hls { url: String },
    /// YouTube live or VOD input, resolved to a direct URL before launch.
    Youtube { url: String },
    /// Synthetic test-pattern input, for exercising a pipeline without a feed.
    Dummy {
        #[serde(default = "default_dummy_pattern")]
        pattern: String,
        #[serde(default = "default_dummy_size")]
        size: String,
        #[serde(default = "default_dummy_rate")]
        rate: u32,
    },
}

fn default_dummy_pattern() -> String {
    "testsrc".to_string()
}

fn default_dummy_size() -> String {
    "1280x720".to_string()
}

fn default_dummy_rate() -> u32 {
    25
}

impl InputEndpoint {
    /// Render the engine input URL for this endpoint.
    ///
    /// Dummy inputs render a lavfi filter graph spec instead of a URL; the
    /// command builder pairs it with the lavfi input format.
    pub fn input_url(&self) -> String {
        match self {
            InputEndpoint::File { path } => path.clone(),
            InputEndpoint::Udp { host, port, .. } => format!("udp://@{}:{}", host, port),
            InputEndpoint::Srt { host, port, mode } => {
                format!("srt://{}:{}?mode={}", host, port, mode)
            }
            InputEndpoint::Hls { url } | InputEndpoint::Youtube { url } => url.clone(),
            InputEndpoint::Dummy { pattern, size, rate } => {
                format!("{}=size={}:rate={}", pattern, size, rate)
            }
        }
    }

    /// Short transport name for logging and snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            InputEndpoint::File { .. } => "file",
            InputEndpoint::Udp { .. } => "udp",
            InputEndpoint::Srt { .. } => "srt",
            InputEndpoint::Hls { .. } => "hls",
            InputEndpoint::Youtube { .. } => "youtube",
            InputEndpoint::Dummy { .. } => "dummy",
        }
    }

    fn validate(&self, id: &str) -> Result<(), SpecError> {
        match self {
            InputEndpoint::File { path } => {
                if path.is_empty() {
                    return Err(SpecError::EmptyAddress(id.to_string()));
                }
            }
            InputEndpoint::Udp { host, port, .. } | InputEndpoint::Srt { host, port, .. } => {
                if host.is_empty() {
                    return Err(SpecError::EmptyHost(id.to_string()));
                }
                if *port == 0 {
                    return Err(SpecError::PortZero(id.to_string()));
                }
            }
            InputEndpoint::Hls { url } | InputEndpoint::Youtube { url } => {
                if url.is_empty() {
                    return Err(SpecError::EmptyAddress(id.to_string()));
                }
            }
            InputEndpoint::Dummy { pattern, size, .. } => {
                if pattern.is_empty() || size.is_empty() {
                    return Err(SpecError::EmptyAddress(id.to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Output endpoint of a channel, tagged by transport kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputEndpoint {
    /// UDP MPEG-TS output.
    Udp {
        host: String,
        port: u16,
        /// Packet size; 1316 fits MPEG-TS within a typical MTU.
        #[serde(default)]
        pkt_size: Option<u32>,
    },
    /// SRT output.
    Srt {
        host: String,
        port: u16,
        #[serde(default)]
        mode: SrtMode,
        #[serde(default)]
        latency_ms: Option<u32>,
        #[serde(default)]
        maxbw: Option<u32>,
    },
    /// RTMP output (FLV container).
    Rtmp { url: String },
    /// RTP output.
    Rtp {
        host: String,
        port: u16,
        #[serde(default)]
        payload_type: Option<u8>,
    },
}

impl OutputEndpoint {
    /// Render the engine output URL for this endpoint.
    pub fn output_url(&self) -> String {
        match self {
            OutputEndpoint::Udp { host, port, .. } => format!("udp://@{}:{}", host, port),
            OutputEndpoint::Srt {
                host,
                port,
                mode,
                latency_ms,
                maxbw,
            } => {
                // A listener with no host binds all interfaces.
                let host = if *mode == SrtMode::Listener && host.is_empty() {
                    "0.0.0.0"
                } else {
                    host.as_str()
                };
                let mut params = format!("mode={}", mode);
                if let Some(latency) = latency_ms {
                    params.push_str(&format!("&latency={}", latency));
                }
                if let Some(maxbw) = maxbw {
                    params.push_str(&format!("&maxbw={}", maxbw));
                }
                format!("srt://{}:{}?{}", host, port, params)
            }
            OutputEndpoint::Rtmp { url } => url.clone(),
            OutputEndpoint::Rtp { host, port, .. } => format!("rtp://{}:{}", host, port),
        }
    }

    /// Container format the engine must produce for this sink.
    pub fn container_format(&self) -> &'static str {
        match self {
            OutputEndpoint::Udp { .. } | OutputEndpoint::Srt { .. } => "mpegts",
            OutputEndpoint::Rtmp { .. } => "flv",
            OutputEndpoint::Rtp { .. } => "rtp",
        }
    }

    /// Short transport name for logging and snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            OutputEndpoint::Udp { .. } => "udp",
            OutputEndpoint::Srt { .. } => "srt",
            OutputEndpoint::Rtmp { .. } => "rtmp",
            OutputEndpoint::Rtp { .. } => "rtp",
        }
    }

    fn validate(&self, id: &str) -> Result<(), SpecError> {
        match self {
            OutputEndpoint::Udp { host, port, .. } | OutputEndpoint::Rtp { host, port, .. } => {
                if host.is_empty() {
                    return Err(SpecError::EmptyHost(id.to_string()));
                }
                if *port == 0 {
                    return Err(SpecError::PortZero(id.to_string()));
                }
            }
            OutputEndpoint::Srt {
                host, port, mode, ..
            } => {
                // Listener mode may leave the host empty (binds 0.0.0.0).
                if host.is_empty() && *mode != SrtMode::Listener {
                    return Err(SpecError::EmptyHost(id.to_string()));
                }
                if *port == 0 {
                    return Err(SpecError::PortZero(id.to_string()));
                }
            }
            OutputEndpoint::Rtmp { url } => {
                if url.is_empty() {
                    return Err(SpecError::EmptyAddress(id.to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Restart policy applied when a channel's backing process fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Maximum automatic restart attempts before giving up (default 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for exponential backoff in seconds (default 1)
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    /// Cap on the backoff delay in seconds (default 60)
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_secs() -> u64 {
    1
}

fn default_backoff_cap_secs() -> u64 {
    60
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

/// Validated description of one managed stream channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique channel identifier.
    pub id: String,
    /// Human-readable name for dashboards; falls back to the id.
    #[serde(default)]
    pub display_name: Option<String>,
    pub input: InputEndpoint,
    pub output: OutputEndpoint,
    /// Video bitrate in kbps (default 2500)
    #[serde(default = "default_video_bitrate_kbps")]
    pub video_bitrate_kbps: u32,
    /// Engine -analyzeduration value in microseconds.
    #[serde(default)]
    pub analyzeduration: Option<u64>,
    /// Engine -probesize value in bytes.
    #[serde(default)]
    pub probesize: Option<u64>,
    /// Engine -max_delay value in microseconds.
    #[serde(default)]
    pub max_delay_us: Option<u64>,
    /// Additional engine arguments appended verbatim before the output.
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub restart: RestartPolicy,
    /// Start this channel automatically when the daemon boots.
    #[serde(default)]
    pub autostart: bool,
}

fn default_video_bitrate_kbps() -> u32 {
    2500
}

impl JobSpec {
    /// Display name for dashboards, defaulting to the channel id.
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    /// Validate this spec in isolation (id, endpoints, policy, bitrate).
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.id.trim().is_empty() {
            return Err(SpecError::EmptyId);
        }
        self.input.validate(&self.id)?;
        self.output.validate(&self.id)?;
        if self.restart.backoff_base_secs == 0 {
            return Err(SpecError::ZeroBackoffBase(self.id.clone()));
        }
        if self.video_bitrate_kbps == 0 {
            return Err(SpecError::ZeroBitrate(self.id.clone()));
        }
        Ok(())
    }
}

/// On-disk shape of the channels file: a list of `[[channel]]` tables.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsFile {
    #[serde(default, rename = "channel")]
    pub channels: Vec<JobSpec>,
}

/// Parse and validate a channels TOML string.
///
/// Every spec is validated individually and ids are checked for
/// uniqueness across the file; the first failure aborts the load.
pub fn parse_channels(content: &str) -> Result<Vec<JobSpec>, ConfigError> {
    let file: ChannelsFile = toml::from_str(content)?;
    let mut seen = std::collections::HashSet::new();
    for spec in &file.channels {
        spec.validate()?;
        if !seen.insert(spec.id.clone()) {
            return Err(SpecError::DuplicateId(spec.id.clone()).into());
        }
    }
    Ok(file.channels)
}

/// Load and validate channel specs from a channels.toml file.
pub fn load_channels<P: AsRef<Path>>(path: P) -> Result<Vec<JobSpec>, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_channels(&content)
}


#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn udp_in(host: &str, port: u16) -> InputEndpoint {
        InputEndpoint::Udp {
            host: host.to_string(),
            port,
            program_id: None,
            bind_interface: None,
        }
    }

    fn udp_out(host: &str, port: u16) -> OutputEndpoint {
        OutputEndpoint::Udp {
            host: host.to_string(),
            port,
            pkt_size: None,
        }
    }

    fn make_spec(id: &str) -> JobSpec {
        JobSpec {
            id: id.to_string(),
            display_name: None,
            input: udp_in("239.2.2.6", 5678),
            output: udp_out("239.2.2.7", 5679),
            video_bitrate_kbps: 2500,
            analyzeduration: None,
            probesize: None,
            max_delay_us: None,
            extra_args: Vec::new(),
            restart: RestartPolicy::default(),
            autostart: false,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // For any host/port pair, the rendered UDP URL SHALL carry both and
        // use the udp://@ form the engine expects for reception.
        #[test]
        fn prop_udp_input_url_contains_host_and_port(
            host in "[a-z0-9.]{1,20}",
            port in 1u16..=u16::MAX,
        ) {
            let url = udp_in(&host, port).input_url();
            prop_assert!(url.starts_with("udp://@"));
            prop_assert!(url.contains(&host));
            let port_suffix = format!(":{}", port);
            prop_assert!(url.ends_with(&port_suffix));
        }

        // A spec with non-empty id, valid endpoints, and a non-zero backoff
        // base SHALL always validate.
        #[test]
        fn prop_valid_spec_passes_validation(
            id in "[a-z0-9-]{1,16}",
            in_port in 1u16..=u16::MAX,
            out_port in 1u16..=u16::MAX,
            bitrate in 1u32..50_000,
            max_attempts in 0u32..20,
            base in 1u64..30,
        ) {
            let mut spec = make_spec(&id);
            spec.input = udp_in("10.0.0.1", in_port);
            spec.output = udp_out("10.0.0.2", out_port);
            spec.video_bitrate_kbps = bitrate;
            spec.restart = RestartPolicy {
                max_attempts,
                backoff_base_secs: base,
                backoff_cap_secs: 60,
            };
            prop_assert!(spec.validate().is_ok());
        }
    }

    #[test]
    fn test_srt_input_url_includes_mode() {
        let input = InputEndpoint::Srt {
            host: "10.1.2.3".to_string(),
            port: 9000,
            mode: SrtMode::Listener,
        };
        assert_eq!(input.input_url(), "srt://10.1.2.3:9000?mode=listener");
    }

    #[test]
    fn test_srt_output_url_with_params() {
        let output = OutputEndpoint::Srt {
            host: "stream.example.net".to_string(),
            port: 7001,
            mode: SrtMode::Caller,
            latency_ms: Some(200),
            maxbw: Some(12500),
        };
        assert_eq!(
            output.output_url(),
            "srt://stream.example.net:7001?mode=caller&latency=200&maxbw=12500"
        );
    }

    #[test]
    fn test_srt_listener_output_defaults_to_wildcard_host() {
        let output = OutputEndpoint::Srt {
            host: String::new(),
            port: 7001,
            mode: SrtMode::Listener,
            latency_ms: None,
            maxbw: None,
        };
        assert_eq!(output.output_url(), "srt://0.0.0.0:7001?mode=listener");
        assert!(output.validate("ch").is_ok());
    }

    #[test]
    fn test_dummy_input_renders_lavfi_graph() {
        let input = InputEndpoint::Dummy {
            pattern: "testsrc".to_string(),
            size: "640x360".to_string(),
            rate: 30,
        };
        assert_eq!(input.input_url(), "testsrc=size=640x360:rate=30");
    }

    #[test]
    fn test_container_format_by_sink() {
        assert_eq!(udp_out("h", 1).container_format(), "mpegts");
        assert_eq!(
            OutputEndpoint::Rtmp {
                url: "rtmp://x/live".to_string()
            }
            .container_format(),
            "flv"
        );
        assert_eq!(
            OutputEndpoint::Rtp {
                host: "h".to_string(),
                port: 1,
                payload_type: None
            }
            .container_format(),
            "rtp"
        );
    }

    #[test]
    fn test_validate_rejects_empty_id() {
        let mut spec = make_spec("ch");
        spec.id = "  ".to_string();
        assert_eq!(spec.validate(), Err(SpecError::EmptyId));
    }

    #[test]
    fn test_validate_rejects_port_zero() {
        let mut spec = make_spec("cam1");
        spec.input = udp_in("239.1.1.1", 0);
        assert_eq!(spec.validate(), Err(SpecError::PortZero("cam1".to_string())));
    }

    #[test]
    fn test_validate_rejects_empty_host() {
        let mut spec = make_spec("cam1");
        spec.output = udp_out("", 5000);
        assert_eq!(spec.validate(), Err(SpecError::EmptyHost("cam1".to_string())));
    }

    #[test]
    fn test_validate_rejects_empty_rtmp_url() {
        let mut spec = make_spec("cam1");
        spec.output = OutputEndpoint::Rtmp { url: String::new() };
        assert_eq!(
            spec.validate(),
            Err(SpecError::EmptyAddress("cam1".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_zero_backoff_base() {
        let mut spec = make_spec("cam1");
        spec.restart.backoff_base_secs = 0;
        assert_eq!(
            spec.validate(),
            Err(SpecError::ZeroBackoffBase("cam1".to_string()))
        );
    }

    #[test]
    fn test_parse_channels_from_toml() {
        let toml_str = r#"
[[channel]]
id = "cam1"
display_name = "Lobby Camera"
video_bitrate_kbps = 3000
autostart = true

[channel.input]
kind = "udp"
host = "239.2.2.6"
port = 5678
program_id = 1

[channel.output]
kind = "srt"
host = "cdn.example.net"
port = 7001
mode = "caller"
latency_ms = 200

[channel.restart]
max_attempts = 3
backoff_base_secs = 1

[[channel]]
id = "cam2"

[channel.input]
kind = "dummy"

[channel.output]
kind = "udp"
host = "127.0.0.1"
port = 5680
"#;
        let channels = parse_channels(toml_str).expect("channels should parse");
        assert_eq!(channels.len(), 2);

        let cam1 = &channels[0];
        assert_eq!(cam1.id, "cam1");
        assert_eq!(cam1.display_name(), "Lobby Camera");
        assert_eq!(cam1.video_bitrate_kbps, 3000);
        assert!(cam1.autostart);
        assert_eq!(cam1.input.kind(), "udp");
        assert_eq!(cam1.output.kind(), "srt");
        assert_eq!(cam1.restart.max_attempts, 3);

        let cam2 = &channels[1];
        assert_eq!(cam2.display_name(), "cam2");
        assert_eq!(cam2.input.kind(), "dummy");
        assert!(!cam2.autostart);
        // Defaults apply where omitted
        assert_eq!(cam2.video_bitrate_kbps, 2500);
        assert_eq!(cam2.restart.max_attempts, 5);
    }

    #[test]
    fn test_parse_channels_rejects_duplicate_ids() {
        let toml_str = r#"
[[channel]]
id = "cam1"

[channel.input]
kind = "dummy"

[channel.output]
kind = "udp"
host = "127.0.0.1"
port = 5680

[[channel]]
id = "cam1"

[channel.input]
kind = "dummy"

[channel.output]
kind = "udp"
host = "127.0.0.1"
port = 5681
"#;
        let err = parse_channels(toml_str).unwrap_err();
        assert!(err.to_string().contains("duplicate channel id"));
    }

    #[test]
    fn test_parse_channels_rejects_unknown_kind() {
        let toml_str = r#"
[[channel]]
id = "cam1"

[channel.input]
kind = "carrier-pigeon"

[channel.output]
kind = "udp"
host = "127.0.0.1"
port = 5680
"#;
        assert!(parse_channels(toml_str).is_err());
    }

    #[test]
    fn test_parse_channels_empty_file() {
        let channels = parse_channels("").expect("empty file should parse");
        assert!(channels.is_empty());
    }

    #[test]
    fn test_spec_toml_round_trip() {
        let spec = make_spec("cam1");
        let rendered = toml::to_string(&spec).expect("spec should serialize");
        let back: JobSpec = toml::from_str(&rendered).expect("spec should deserialize");
        assert_eq!(spec, back);
    }
}
