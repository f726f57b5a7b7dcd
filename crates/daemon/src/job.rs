//! Per-job supervision: the record, snapshots, and the actor task.
//!
//! Each started job gets one actor task owning the full pipeline for that
//! job: it launches the engine process, feeds drained stderr through the
//! health parser, drives the lifecycle state machine, and schedules
//! bounded-retry relaunches with exponential backoff. The actor is the sole
//! writer of its [`JobRecord`]; every other component reads cloned
//! snapshots. Stop requests arrive through a cancellation token and are
//! honored in every phase, including mid-backoff and during Starting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stream_super_daemon_config::{JobSpec, SupervisionConfig};

use crate::health::{
    current_timestamp_ms, Category, EventRing, HealthEvent, HealthParser, Severity,
};
use crate::runner::{ExitNotice, OutputLines, ProcessHandle, ProcessRunner};
use crate::state::{on_error, ErrorDisposition, JobState, StopCause, WarningWindow};
use crate::status::{job_color, StatusColor};

/// Events included in a snapshot.
const SNAPSHOT_EVENT_COUNT: usize = 10;

/// How long to keep draining buffered stderr after the process exits; the
/// cause of death is usually in the tail.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Housekeeping cadence inside the supervision loop.
const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Supervision tuning shared by all jobs, derived from daemon configuration.
#[derive(Debug, Clone)]
pub struct SupervisionTuning {
    pub stability_window: Duration,
    pub warning_window: Duration,
    pub warning_threshold: u32,
    pub graceful_stop_timeout: Duration,
    pub event_ring_capacity: usize,
    pub warning_coalesce: Duration,
}

impl SupervisionTuning {
    pub fn from_config(cfg: &SupervisionConfig) -> Self {
        Self {
            stability_window: Duration::from_secs(cfg.stability_window_secs),
            warning_window: Duration::from_secs(cfg.warning_window_secs),
            warning_threshold: cfg.warning_threshold,
            graceful_stop_timeout: Duration::from_secs(cfg.graceful_stop_timeout_secs),
            event_ring_capacity: cfg.event_ring_capacity,
            warning_coalesce: Duration::from_millis(cfg.warning_coalesce_ms),
        }
    }
}

impl Default for SupervisionTuning {
    fn default() -> Self {
        Self::from_config(&SupervisionConfig::default())
    }
}

/// Authoritative per-job state.
///
/// Written only by the job's actor task; all other components read
/// copy-on-read snapshots.
#[derive(Debug)]
pub struct JobRecord {
    pub spec: JobSpec,
    pub state: JobState,
    pub stop_cause: Option<StopCause>,
    /// Launch id of the live process, absent when no process is alive.
    pub launch_id: Option<String>,
    pub pid: Option<u32>,
    /// Restart attempts consumed in the current error-recovery streak.
    pub attempts: u32,
    pub events: EventRing,
    /// Stderr lines discarded under backpressure, summed across launches.
    pub dropped_lines: u64,
    pub last_exit: Option<ExitNotice>,
    pub color: StatusColor,
    pub updated_at_ms: i64,
}

impl JobRecord {
    pub fn new(spec: JobSpec, ring_capacity: usize) -> Self {
        Self {
            spec,
            state: JobState::Idle,
            stop_cause: None,
            launch_id: None,
            pid: None,
            attempts: 0,
            events: EventRing::new(ring_capacity),
            dropped_lines: 0,
            last_exit: None,
            color: job_color(JobState::Idle, None),
            updated_at_ms: current_timestamp_ms(),
        }
    }

    /// Consistent copy for external readers.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.spec.id.clone(),
            display_name: self.spec.display_name().to_string(),
            input_kind: self.spec.input.kind().to_string(),
            output_kind: self.spec.output.kind().to_string(),
            state: self.state,
            color: self.color,
            stop_cause: self.stop_cause,
            attempts: self.attempts,
            pid: self.pid,
            dropped_lines: self.dropped_lines,
            last_exit: self.last_exit.map(|n| n.to_string()),
            updated_at_ms: self.updated_at_ms,
            recent_events: self.events.recent(SNAPSHOT_EVENT_COUNT),
        }
    }
}

/// Shared handle to one job's record.
pub type SharedJobRecord = Arc<RwLock<JobRecord>>;

/// Serializable point-in-time view of one job for queries and dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub display_name: String,
    pub input_kind: String,
    pub output_kind: String,
    pub state: JobState,
    pub color: StatusColor,
    pub stop_cause: Option<StopCause>,
    pub attempts: u32,
    pub pid: Option<u32>,
    pub dropped_lines: u64,
    pub last_exit: Option<String>,
    pub updated_at_ms: i64,
    pub recent_events: Vec<HealthEvent>,
}

/// Notification published on the supervisor bus.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A state transition was committed for a job.
    Transition {
        job_id: String,
        from: JobState,
        to: JobState,
        color: StatusColor,
        at_ms: i64,
    },
    /// A health event was recorded for a job.
    Health { job_id: String, event: HealthEvent },
}

/// Outcome of supervising one launch to completion.
enum LaunchOutcome {
    /// A terminal state was reached and recorded; the actor is done.
    Terminal,
    /// The process is gone; a retry decision is pending.
    Failed { retryable: bool },
}

/// The actor driving one job's lifecycle.
pub(crate) struct JobActor {
    record: SharedJobRecord,
    runner: ProcessRunner,
    tuning: SupervisionTuning,
    bus: broadcast::Sender<JobEvent>,
    stop_token: CancellationToken,
}

/// Spawn the actor task for a freshly created job record.
pub(crate) fn spawn_actor(
    record: SharedJobRecord,
    runner: ProcessRunner,
    tuning: SupervisionTuning,
    bus: broadcast::Sender<JobEvent>,
    stop_token: CancellationToken,
) -> JoinHandle<()> {
    let actor = JobActor {
        record,
        runner,
        tuning,
        bus,
        stop_token,
    };
    tokio::spawn(actor.run())
}

impl JobActor {
    async fn run(self) {
        let spec = self.record.read().await.spec.clone();
        let job_id = spec.id.clone();

        loop {
            self.transition(JobState::Starting).await;

            if self.stop_token.is_cancelled() {
                self.transition(JobState::Stopping).await;
                self.stop_with(StopCause::Clean).await;
                return;
            }

            let handle = match self.runner.launch(&spec).await {
                Ok(handle) => handle,
                Err(err) => {
                    // Launch failures are fatal: surface and stop, no retry.
                    warn!(job = %job_id, error = %err, "engine launch failed");
                    self.push_event(HealthEvent {
                        timestamp_ms: current_timestamp_ms(),
                        severity: Severity::Error,
                        category: Category::Unknown,
                        fatal: true,
                        detail: err.to_string(),
                    })
                    .await;
                    self.stop_with(StopCause::Fatal).await;
                    return;
                }
            };

            match self.supervise_launch(&job_id, handle).await {
                LaunchOutcome::Terminal => return,
                LaunchOutcome::Failed { retryable } => {
                    let attempt = self.record.read().await.attempts;
                    match on_error(&spec.restart, attempt, retryable) {
                        ErrorDisposition::Retry { delay } => {
                            self.transition(JobState::Restarting).await;
                            {
                                self.record.write().await.attempts = attempt + 1;
                            }
                            info!(
                                job = %job_id,
                                attempt = attempt + 1,
                                delay_ms = delay.as_millis() as u64,
                                "scheduling engine relaunch"
                            );
                            // The backoff sleep is abandoned the moment a stop
                            // command arrives.
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = self.stop_token.cancelled() => {
                                    self.transition(JobState::Stopping).await;
                                    self.stop_with(StopCause::Clean).await;
                                    return;
                                }
                            }
                        }
                        ErrorDisposition::GiveUp { cause } => {
                            warn!(job = %job_id, cause = %cause, "giving up on job");
                            self.stop_with(cause).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Supervise one live process until it stops, fails, or is stopped.
    async fn supervise_launch(&self, job_id: &str, mut handle: ProcessHandle) -> LaunchOutcome {
        {
            let mut record = self.record.write().await;
            record.launch_id = Some(handle.launch_id().to_string());
            record.pid = handle.pid();
            record.last_exit = None;
        }
        debug!(job = %job_id, pid = ?handle.pid(), "engine process launched");

        let lines = handle.lines();
        let mut parser = HealthParser::new(self.tuning.warning_coalesce);
        let mut warnings =
            WarningWindow::new(self.tuning.warning_window, self.tuning.warning_threshold);
        let mut exit_rx = handle.exit_watch();

        let stability_deadline = tokio::time::Instant::now() + self.tuning.stability_window;
        let mut reset_deadline: Option<Instant> = None;
        let mut lines_done = false;
        let mut dropped_warned = false;
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let state = self.record.read().await.state;

            tokio::select! {
                _ = self.stop_token.cancelled() => {
                    self.transition(JobState::Stopping).await;
                    let notice = handle.stop(self.tuning.graceful_stop_timeout).await;
                    debug!(job = %job_id, %notice, "engine process stopped on request");
                    self.record_exit(&handle, notice).await;
                    self.stop_with(StopCause::Clean).await;
                    return LaunchOutcome::Terminal;
                }

                maybe_line = lines.next_line(), if !lines_done => {
                    match maybe_line {
                        Some(line) => {
                            if let Some(event) = parser.parse(&line) {
                                let fatal = event.fatal;
                                let severity = event.severity;
                                self.push_event(event).await;

                                if fatal {
                                    // Fatal conditions are never retried; take the
                                    // process down and surface the cause.
                                    self.transition(JobState::Error).await;
                                    let notice =
                                        handle.stop(self.tuning.graceful_stop_timeout).await;
                                    self.record_exit(&handle, notice).await;
                                    self.stop_with(StopCause::Fatal).await;
                                    return LaunchOutcome::Terminal;
                                }

                                if severity != Severity::Error && state == JobState::Starting {
                                    // First healthy output confirms the pipeline.
                                    self.transition(JobState::Running).await;
                                    reset_deadline =
                                        Some(Instant::now() + self.tuning.stability_window);
                                }

                                if severity == Severity::Warning {
                                    let now = Instant::now();
                                    warnings.record(now);
                                    let state = self.state().await;
                                    if state == JobState::Running && warnings.is_over(now) {
                                        self.transition(JobState::Degraded).await;
                                    }
                                }
                            }
                        }
                        None => {
                            // Stderr closed; the exit notice arrives separately.
                            lines_done = true;
                        }
                    }
                }

                _ = async { let _ = exit_rx.wait_for(|v| v.is_some()).await; } => {
                    let notice = handle.last_exit().unwrap_or(ExitNotice::Killed);
                    let retryable = self.drain_exit_tail(&lines, &mut parser).await;
                    self.record_exit(&handle, notice).await;

                    if self.stop_token.is_cancelled() {
                        self.transition(JobState::Stopping).await;
                        self.stop_with(StopCause::Clean).await;
                        return LaunchOutcome::Terminal;
                    }

                    warn!(job = %job_id, %notice, "engine process exited unexpectedly");
                    self.transition(JobState::Error).await;
                    if !retryable {
                        self.stop_with(StopCause::Fatal).await;
                        return LaunchOutcome::Terminal;
                    }
                    return LaunchOutcome::Failed { retryable: true };
                }

                _ = tokio::time::sleep_until(stability_deadline), if state == JobState::Starting => {
                    // The engine survived the stability window without errors.
                    self.transition(JobState::Running).await;
                    reset_deadline = Some(Instant::now() + self.tuning.stability_window);
                }

                _ = tick.tick() => {
                    let now = Instant::now();

                    if state == JobState::Degraded && !warnings.is_over(now) {
                        self.transition(JobState::Running).await;
                    }

                    if let Some(deadline) = reset_deadline {
                        if now >= deadline {
                            reset_deadline = None;
                            let mut record = self.record.write().await;
                            if matches!(record.state, JobState::Running | JobState::Degraded)
                                && record.attempts > 0
                            {
                                debug!(job = %job_id, "job stable, resetting restart attempts");
                                record.attempts = 0;
                            }
                        }
                    }

                    if !dropped_warned && handle.dropped_lines() > 0 {
                        dropped_warned = true;
                        let dropped = handle.dropped_lines();
                        self.push_event(HealthEvent {
                            timestamp_ms: current_timestamp_ms(),
                            severity: Severity::Warning,
                            category: Category::Resource,
                            fatal: false,
                            detail: format!(
                                "output pipeline backpressure: {} stderr lines dropped",
                                dropped
                            ),
                        })
                        .await;
                    }
                }
            }
        }
    }

    /// Drain buffered stderr after an exit so the cause of death is
    /// classified before the retry decision. Returns whether the failure is
    /// retryable (no fatal marker seen).
    async fn drain_exit_tail(&self, lines: &OutputLines, parser: &mut HealthParser) -> bool {
        let mut retryable = true;
        let deadline = tokio::time::Instant::now() + EXIT_DRAIN_TIMEOUT;
        loop {
            let next = tokio::time::timeout_at(deadline, lines.next_line()).await;
            match next {
                Ok(Some(line)) => {
                    if let Some(event) = parser.parse(&line) {
                        if event.fatal {
                            retryable = false;
                        }
                        self.push_event(event).await;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        retryable
    }

    /// Record the reaped process: exit notice, dropped-line total, handle gone.
    async fn record_exit(&self, handle: &ProcessHandle, notice: ExitNotice) {
        let mut record = self.record.write().await;
        record.last_exit = Some(notice);
        record.dropped_lines += handle.dropped_lines();
        record.launch_id = None;
        record.pid = None;
        record.updated_at_ms = current_timestamp_ms();
    }

    async fn state(&self) -> JobState {
        self.record.read().await.state
    }

    async fn transition(&self, to: JobState) {
        self.transition_with(to, None).await
    }

    async fn stop_with(&self, cause: StopCause) {
        self.transition_with(JobState::Stopped, Some(cause)).await
    }

    /// Commit a state transition and publish it. The record's color is
    /// recomputed on every committed transition.
    async fn transition_with(&self, to: JobState, cause: Option<StopCause>) {
        let (job_id, from, color, at_ms) = {
            let mut record = self.record.write().await;
            let from = record.state;
            if from == to {
                return;
            }
            record.state = to;
            match (to, cause) {
                (JobState::Starting, _) => record.stop_cause = None,
                (_, Some(c)) => record.stop_cause = Some(c),
                _ => {}
            }
            if to == JobState::Stopped {
                record.launch_id = None;
                record.pid = None;
            }
            record.color = job_color(to, record.stop_cause);
            record.updated_at_ms = current_timestamp_ms();
            (
                record.spec.id.clone(),
                from,
                record.color,
                record.updated_at_ms,
            )
        };

        debug!(job = %job_id, %from, %to, %color, "state transition");
        let _ = self.bus.send(JobEvent::Transition {
            job_id,
            from,
            to,
            color,
            at_ms,
        });
    }

    async fn push_event(&self, event: HealthEvent) {
        let job_id = {
            let mut record = self.record.write().await;
            record.events.push(event.clone());
            record.updated_at_ms = current_timestamp_ms();
            record.spec.id.clone()
        };
        let _ = self.bus.send(JobEvent::Health { job_id, event });
    }
}
