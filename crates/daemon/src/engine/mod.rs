//! Engine command construction for stream jobs.

pub mod ffmpeg;

pub use ffmpeg::{
    build_ffmpeg_args, build_ffmpeg_command, resolve_youtube_url, ResolveError,
};
