//! FFmpeg command builder.
//!
//! Derives the engine argument list from a validated [`JobSpec`]. The
//! supervisor treats the engine as a black box with a command-line contract;
//! everything codec-specific is confined to this module.

use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

use stream_super_daemon_config::{EngineConfig, InputEndpoint, JobSpec, OutputEndpoint};

/// External tool used to resolve YouTube page URLs to direct stream URLs.
const YT_DLP_BIN: &str = "yt-dlp";

/// Keyframe interval passed to the encoder.
const KEYFRAME_INTERVAL: &str = "50";

/// Error type for input URL resolution
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The resolver tool could not be spawned
    #[error("failed to run yt-dlp: {0}")]
    Spawn(#[from] std::io::Error),

    /// The resolver did not finish within the allotted time
    #[error("yt-dlp timed out resolving the stream URL")]
    Timeout,

    /// The resolver exited unsuccessfully
    #[error("yt-dlp failed: {0}")]
    Failed(String),

    /// The resolver produced no URL
    #[error("yt-dlp returned an empty URL")]
    EmptyUrl,
}

/// Resolve a YouTube page URL to a direct media URL via yt-dlp.
///
/// Bounded by `timeout`; the engine is never launched with an unresolved
/// page URL.
pub async fn resolve_youtube_url(url: &str, timeout: Duration) -> Result<String, ResolveError> {
    let output = tokio::time::timeout(
        timeout,
        Command::new(YT_DLP_BIN)
            .arg("-g")
            .arg("-f")
            .arg("best")
            .arg(url)
            .output(),
    )
    .await
    .map_err(|_| ResolveError::Timeout)??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(ResolveError::Failed(stderr));
    }

    let resolved = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if resolved.is_empty() {
        return Err(ResolveError::EmptyUrl);
    }
    Ok(resolved)
}

/// Build the full FFmpeg argument list for a job.
///
/// `input_url` is the rendered (and, for YouTube, resolved) input; callers
/// normally pass `spec.input.input_url()`.
pub fn build_ffmpeg_args(spec: &JobSpec, engine: &EngineConfig, input_url: &str) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    args.push("-loglevel".into());
    args.push(engine.loglevel.clone());

    // Input analysis knobs help lock onto fragmented or jittery inputs.
    if let Some(analyzeduration) = spec.analyzeduration {
        args.push("-analyzeduration".into());
        args.push(analyzeduration.to_string());
    }
    if let Some(probesize) = spec.probesize {
        args.push("-probesize".into());
        args.push(probesize.to_string());
    }

    match &spec.input {
        InputEndpoint::Udp { bind_interface, .. } => {
            if let Some(iface) = bind_interface {
                args.push("-bind_address".into());
                args.push(iface.clone());
            }
        }
        InputEndpoint::File { .. } => {
            // Pace file reads at realtime so the output behaves like a feed.
            args.push("-re".into());
        }
        InputEndpoint::Dummy { .. } => {
            args.push("-re".into());
            args.push("-f".into());
            args.push("lavfi".into());
        }
        _ => {}
    }

    args.push("-i".into());
    args.push(input_url.to_string());

    // Select a single program from multi-program transport streams when
    // requested; otherwise map the first video/audio streams if present.
    match &spec.input {
        InputEndpoint::Udp {
            program_id: Some(program),
            ..
        } => {
            args.push("-map".into());
            args.push(format!("0:p:{}", program));
        }
        _ => {
            args.push("-map".into());
            args.push("0:v:0?".into());
            args.push("-map".into());
            args.push("0:a:0?".into());
        }
    }

    args.push("-c:v".into());
    args.push("libx264".into());
    args.push("-pix_fmt".into());
    args.push("yuv420p".into());
    args.push("-b:v".into());
    args.push(format!("{}k", spec.video_bitrate_kbps));
    args.push("-c:a".into());
    args.push("copy".into());
    args.push("-flags".into());
    args.push("+global_header".into());
    args.push("-g".into());
    args.push(KEYFRAME_INTERVAL.into());
    args.push("-bsf:v".into());
    args.push("h264_mp4toannexb".into());

    if let OutputEndpoint::Rtp { payload_type, .. } = &spec.output {
        args.push("-payload_type".into());
        args.push(payload_type.unwrap_or(96).to_string());
    }

    if let Some(max_delay) = spec.max_delay_us {
        args.push("-max_delay".into());
        args.push(max_delay.to_string());
    }

    if let OutputEndpoint::Udp {
        pkt_size: Some(pkt_size),
        ..
    } = &spec.output
    {
        args.push("-pkt_size".into());
        args.push(pkt_size.to_string());
    }

    args.extend(spec.extra_args.iter().cloned());

    args.push("-f".into());
    args.push(spec.output.container_format().into());
    args.push(spec.output.output_url());

    args
}

/// Build a ready-to-spawn engine Command for a job.
pub fn build_ffmpeg_command(spec: &JobSpec, engine: &EngineConfig, input_url: &str) -> Command {
    let mut cmd = Command::new(&engine.binary);
    cmd.args(build_ffmpeg_args(spec, engine, input_url));
    cmd
}
