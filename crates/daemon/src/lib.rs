//! Stream Super Daemon
//!
//! Background service that supervises a fleet of FFmpeg-backed stream
//! relay jobs: it launches engine processes, classifies their output into
//! health events, drives a per-job lifecycle state machine with
//! bounded-retry recovery, and exposes status and commands over HTTP.

pub mod daemon;
pub mod engine;
pub mod health;
pub mod job;
pub mod monitor;
pub mod runner;
pub mod server;
pub mod startup;
pub mod state;
pub mod status;
pub mod supervisor;

pub use stream_super_daemon_config as config;
pub use stream_super_daemon_config::{DaemonConfig, JobSpec};

pub use daemon::{Daemon, DaemonError};
pub use engine::{build_ffmpeg_args, build_ffmpeg_command};
pub use health::{Category, EventRing, HealthEvent, HealthParser, Severity};
pub use job::{JobEvent, JobRecord, JobSnapshot, SharedJobRecord, SupervisionTuning};
pub use monitor::{ResourceMonitor, ResourceSnapshot, ResourceWatch};
pub use runner::{ExitNotice, LaunchError, OutputLines, ProcessHandle, ProcessRunner};
pub use server::{
    create_status_router, run_status_server, CommandResponse, ServerError, ServerState,
    StatusResponse,
};
pub use startup::{
    check_engine_available, parse_ffmpeg_version, run_startup_checks, StartupError,
};
pub use state::{JobState, StopCause};
pub use status::{fleet_color, job_color, StatusColor};
pub use supervisor::{Supervisor, SupervisorError};
