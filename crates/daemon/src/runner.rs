//! Engine process lifecycle: spawn, output draining, termination.
//!
//! Each launch owns exactly one child process. Stderr is drained
//! continuously by a dedicated task into a bounded in-memory queue so the
//! child can never stall on a full pipe; under extreme backpressure the
//! oldest unread lines are discarded and counted. Exit is published exactly
//! once per launch through a watch channel.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use stream_super_daemon_config::{EngineConfig, InputEndpoint, JobSpec};

use crate::engine::{self, build_ffmpeg_command};
use crate::health::current_timestamp_ms;

/// Maximum unread stderr lines buffered per launch before the oldest are dropped.
const LINE_QUEUE_CAPACITY: usize = 1024;

/// Bound on YouTube URL resolution before the launch fails.
const YOUTUBE_RESOLVE_TIMEOUT: Duration = Duration::from_secs(20);

/// Error type for process launch failures. Launch failures are fatal: the
/// supervisor never auto-retries them.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The engine binary is not installed or not on PATH
    #[error("engine binary '{binary}' not found")]
    BinaryMissing { binary: String },

    /// The OS refused to create the process
    #[error("failed to spawn engine process: {0}")]
    Spawn(std::io::Error),

    /// The input URL could not be resolved before launch
    #[error("failed to resolve input URL: {0}")]
    InputResolution(#[from] engine::ResolveError),

    /// The spawned process exposed no stderr pipe
    #[error("engine stderr pipe unavailable")]
    MissingStderr,
}

/// How a launched process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitNotice {
    /// Process exited on its own with a code.
    Exited { code: i32 },
    /// Process was terminated by a signal.
    Killed,
}

impl ExitNotice {
    pub fn success(&self) -> bool {
        matches!(self, ExitNotice::Exited { code: 0 })
    }
}

impl std::fmt::Display for ExitNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitNotice::Exited { code } => write!(f, "exited with code {}", code),
            ExitNotice::Killed => write!(f, "killed"),
        }
    }
}

#[derive(Debug, Default)]
struct LineBuffer {
    lines: VecDeque<String>,
    dropped: u64,
    eof: bool,
}

/// Consumer handle for a launch's drained stderr lines.
///
/// The sequence ends (`None`) when the process closes its stderr.
#[derive(Clone)]
pub struct OutputLines {
    buf: Arc<Mutex<LineBuffer>>,
    notify: Arc<Notify>,
}

impl OutputLines {
    /// Next unread line, or `None` after end of stream.
    pub async fn next_line(&self) -> Option<String> {
        loop {
            {
                let mut buf = self.buf.lock().expect("line buffer lock");
                if let Some(line) = buf.lines.pop_front() {
                    return Some(line);
                }
                if buf.eof {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Number of lines discarded under backpressure so far.
    pub fn dropped(&self) -> u64 {
        self.buf.lock().expect("line buffer lock").dropped
    }
}

/// Handle to one live engine process.
///
/// Owned exclusively by the job that launched it; dropping the handle does
/// not kill the process (the waiter task reaps it), but [`ProcessHandle::stop`]
/// always confirms termination before returning.
pub struct ProcessHandle {
    launch_id: String,
    pid: Option<u32>,
    started_at_ms: i64,
    lines: OutputLines,
    exit_rx: watch::Receiver<Option<ExitNotice>>,
    kill_token: CancellationToken,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("launch_id", &self.launch_id)
            .field("pid", &self.pid)
            .field("started_at_ms", &self.started_at_ms)
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    pub fn launch_id(&self) -> &str {
        &self.launch_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at_ms(&self) -> i64 {
        self.started_at_ms
    }

    /// Drained stderr lines for this launch.
    pub fn lines(&self) -> OutputLines {
        self.lines.clone()
    }

    /// Lines discarded under backpressure so far.
    pub fn dropped_lines(&self) -> u64 {
        self.lines.dropped()
    }

    /// Watch that fires exactly once with the exit notice.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitNotice>> {
        self.exit_rx.clone()
    }

    /// Exit notice if the process has already been reaped.
    pub fn last_exit(&self) -> Option<ExitNotice> {
        *self.exit_rx.borrow()
    }

    /// Wait until the process has exited.
    pub async fn wait_exit(&mut self) -> ExitNotice {
        match self.exit_rx.wait_for(|v| v.is_some()).await {
            Ok(notice) => (*notice).unwrap_or(ExitNotice::Killed),
            Err(_) => ExitNotice::Killed,
        }
    }

    /// Stop the process: graceful signal first, forced kill after
    /// `graceful_timeout`. Returns once the process is confirmed gone.
    pub async fn stop(&mut self, graceful_timeout: Duration) -> ExitNotice {
        if let Some(notice) = self.last_exit() {
            return notice;
        }

        self.send_graceful_signal();

        {
            let graceful = tokio::time::timeout(
                graceful_timeout,
                self.exit_rx.wait_for(|v| v.is_some()),
            )
            .await;
            if let Ok(Ok(notice)) = graceful {
                return (*notice).unwrap_or(ExitNotice::Killed);
            }
        }

        debug!(pid = ?self.pid, "graceful stop timed out, forcing kill");
        self.kill_token.cancel();
        match self.exit_rx.wait_for(|v| v.is_some()).await {
            Ok(notice) => (*notice).unwrap_or(ExitNotice::Killed),
            Err(_) => ExitNotice::Killed,
        }
    }

    #[cfg(unix)]
    fn send_graceful_signal(&self) {
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        } else {
            self.kill_token.cancel();
        }
    }

    #[cfg(not(unix))]
    fn send_graceful_signal(&self) {
        // No graceful signal on this platform; go straight to forced kill.
        self.kill_token.cancel();
    }
}

/// Spawns and wires up engine processes for job specs.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    engine: EngineConfig,
}

impl ProcessRunner {
    pub fn new(engine: EngineConfig) -> Self {
        Self { engine }
    }

    /// Launch the engine for a job spec.
    ///
    /// YouTube inputs are resolved to direct URLs first, bounded by a
    /// resolution timeout; all other inputs render their URL directly.
    pub async fn launch(&self, spec: &JobSpec) -> Result<ProcessHandle, LaunchError> {
        let input_url = match &spec.input {
            InputEndpoint::Youtube { url } => {
                engine::resolve_youtube_url(url, YOUTUBE_RESOLVE_TIMEOUT).await?
            }
            other => other.input_url(),
        };

        let cmd = build_ffmpeg_command(spec, &self.engine, &input_url);
        self.launch_command(cmd)
    }

    /// Spawn a prepared command and wire up draining and exit plumbing.
    fn launch_command(
        &self,
        mut cmd: tokio::process::Command,
    ) -> Result<ProcessHandle, LaunchError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LaunchError::BinaryMissing {
                    binary: self.engine.binary.clone(),
                }
            } else {
                LaunchError::Spawn(e)
            }
        })?;

        let stderr = child.stderr.take().ok_or(LaunchError::MissingStderr)?;
        let pid = child.id();

        let buf = Arc::new(Mutex::new(LineBuffer::default()));
        let notify = Arc::new(Notify::new());
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill_token = CancellationToken::new();

        // Drain stderr continuously so the child never blocks on a full pipe.
        let drain_buf = buf.clone();
        let drain_notify = notify.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                {
                    let mut buf = drain_buf.lock().expect("line buffer lock");
                    buf.lines.push_back(line);
                    while buf.lines.len() > LINE_QUEUE_CAPACITY {
                        buf.lines.pop_front();
                        buf.dropped += 1;
                    }
                }
                drain_notify.notify_one();
            }
            drain_buf.lock().expect("line buffer lock").eof = true;
            drain_notify.notify_one();
        });

        // Reap the child and publish its exit exactly once. A forced kill is
        // requested through the kill token.
        let waiter_token = kill_token.clone();
        tokio::spawn(async move {
            let notice = tokio::select! {
                status = child.wait() => notice_from(status),
                _ = waiter_token.cancelled() => {
                    let _ = child.start_kill();
                    notice_from(child.wait().await)
                }
            };
            let _ = exit_tx.send(Some(notice));
        });

        Ok(ProcessHandle {
            launch_id: Uuid::new_v4().to_string(),
            pid,
            started_at_ms: current_timestamp_ms(),
            lines: OutputLines { buf, notify },
            exit_rx,
            kill_token,
        })
    }
}

fn notice_from(status: std::io::Result<std::process::ExitStatus>) -> ExitNotice {
    match status {
        Ok(s) => match s.code() {
            Some(code) => ExitNotice::Exited { code },
            None => ExitNotice::Killed,
        },
        Err(_) => ExitNotice::Killed,
    }
}
