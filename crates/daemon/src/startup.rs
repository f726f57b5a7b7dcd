//! Startup checks for Stream Super Daemon
//!
//! Preflight verification that the transcoding engine is present before any
//! job is supervised. A missing engine aborts startup with a typed error;
//! an unparsable version banner is only logged.

use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

use stream_super_daemon_config::DaemonConfig;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Engine not available: {0}")]
    EngineUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Check that the engine binary runs by invoking `<binary> -version`.
///
/// Returns the first line of the version banner on success.
pub fn check_engine_available(binary: &str) -> Result<String, StartupError> {
    let output = Command::new(binary).arg("-version").output().map_err(|e| {
        StartupError::EngineUnavailable(format!(
            "{} -version failed; is FFmpeg installed and in PATH? Error: {}",
            binary, e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::EngineUnavailable(format!(
            "{} -version exited unsuccessfully",
            binary
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().to_string())
}

/// Parse an FFmpeg version banner and extract the major version number.
///
/// Handles the standard form ("ffmpeg version 7.0 ...") and n-prefixed
/// builds ("ffmpeg version n7.0-..." style).
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .trim()
        .split_whitespace()
        .next()?
        .to_string();

    // Tolerate the `n` prefix used by some distribution builds.
    let version_part = version_part.strip_prefix('n').unwrap_or(&version_part);

    let major_part = version_part
        .split(|c: char| c == '.' || c == '-')
        .next()?;

    major_part.parse::<u32>().ok()
}

/// Run all preflight checks for the daemon.
pub fn run_startup_checks(cfg: &DaemonConfig) -> Result<(), StartupError> {
    let banner = check_engine_available(&cfg.engine.binary)?;
    match parse_ffmpeg_version(&banner) {
        Some(major) => info!(engine = %cfg.engine.binary, major, "engine available"),
        None => warn!(
            engine = %cfg.engine.binary,
            banner = %banner,
            "engine available but version banner was not recognized"
        ),
    }
    Ok(())
}
