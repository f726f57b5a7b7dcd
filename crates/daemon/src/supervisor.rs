//! Fleet supervisor: owns the job collection and dispatches commands.
//!
//! Jobs live in a concurrent keyed map; each started job is driven by its
//! own actor task and no global lock serializes unrelated jobs. Commands on
//! unknown ids fail with NotFound; commands that are no-ops in the current
//! state succeed idempotently. Transitions and health events fan out on a
//! broadcast bus, and an aggregator task recomputes the fleet color on
//! every published transition.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stream_super_daemon_config::{DaemonConfig, JobSpec};

use crate::job::{
    spawn_actor, JobEvent, JobRecord, JobSnapshot, SharedJobRecord, SupervisionTuning,
};
use crate::runner::ProcessRunner;
use crate::status::{fleet_color, StatusColor};

/// Capacity of the supervisor event bus.
const BUS_CAPACITY: usize = 256;

/// Error type for supervisor commands
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// No channel with this id is known to the supervisor
    #[error("unknown job: {0}")]
    NotFound(String),
}

/// One slot in the job collection.
struct JobEntry {
    record: SharedJobRecord,
    stop_token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

type JobMap = Arc<RwLock<HashMap<String, Arc<JobEntry>>>>;

/// Orchestrator for the whole fleet of stream jobs.
pub struct Supervisor {
    runner: ProcessRunner,
    tuning: SupervisionTuning,
    specs: RwLock<HashMap<String, JobSpec>>,
    jobs: JobMap,
    bus: broadcast::Sender<JobEvent>,
    fleet: watch::Receiver<StatusColor>,
    aggregator: JoinHandle<()>,
}

impl Supervisor {
    pub fn new(config: &DaemonConfig) -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        let jobs: JobMap = Arc::new(RwLock::new(HashMap::new()));
        let (fleet_tx, fleet_rx) = watch::channel(StatusColor::Green);
        let aggregator = spawn_aggregator(jobs.clone(), bus.subscribe(), fleet_tx);

        Self {
            runner: ProcessRunner::new(config.engine.clone()),
            tuning: SupervisionTuning::from_config(&config.supervision),
            specs: RwLock::new(HashMap::new()),
            jobs,
            bus,
            fleet: fleet_rx,
            aggregator,
        }
    }

    /// Register validated channel specs without starting them.
    pub async fn register_channels(&self, specs: Vec<JobSpec>) {
        let mut registry = self.specs.write().await;
        for spec in specs {
            registry.insert(spec.id.clone(), spec);
        }
    }

    /// Start a registered channel. Idempotent while the job is active.
    pub async fn start(&self, job_id: &str) -> Result<(), SupervisorError> {
        let spec = self
            .specs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound(job_id.to_string()))?;
        self.start_with_spec(spec).await
    }

    /// Register a spec and start its job.
    ///
    /// The job map write lock spans the active-check and the insert, so no
    /// command interleaving can produce two live processes for one id.
    pub async fn start_with_spec(&self, spec: JobSpec) -> Result<(), SupervisorError> {
        self.specs
            .write()
            .await
            .insert(spec.id.clone(), spec.clone());

        let mut jobs = self.jobs.write().await;
        if let Some(entry) = jobs.get(&spec.id) {
            let state = entry.record.read().await.state;
            if !state.is_terminal() {
                debug!(job = %spec.id, %state, "start ignored, job already active");
                return Ok(());
            }
        }

        // A fresh record per run: the attempt counter and history start clean.
        let record: SharedJobRecord = Arc::new(RwLock::new(JobRecord::new(
            spec.clone(),
            self.tuning.event_ring_capacity,
        )));
        let stop_token = CancellationToken::new();
        let task = spawn_actor(
            record.clone(),
            self.runner.clone(),
            self.tuning.clone(),
            self.bus.clone(),
            stop_token.clone(),
        );
        jobs.insert(
            spec.id.clone(),
            Arc::new(JobEntry {
                record,
                stop_token,
                task: Mutex::new(Some(task)),
            }),
        );
        info!(job = %spec.id, "job start dispatched");
        Ok(())
    }

    /// Stop a job and wait until it is confirmed Stopped.
    ///
    /// Stopping an already-stopped or never-started known job succeeds
    /// idempotently.
    pub async fn stop(&self, job_id: &str) -> Result<(), SupervisorError> {
        let entry = self.jobs.read().await.get(job_id).cloned();
        let entry = match entry {
            Some(entry) => entry,
            None => {
                if self.specs.read().await.contains_key(job_id) {
                    return Ok(());
                }
                return Err(SupervisorError::NotFound(job_id.to_string()));
            }
        };

        entry.stop_token.cancel();
        let task = entry.task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(job = %job_id, error = ?err, "job actor task failed");
            }
        }
        Ok(())
    }

    /// Stop (if needed) and start a job fresh, resetting its attempt counter.
    pub async fn restart(&self, job_id: &str) -> Result<(), SupervisorError> {
        self.stop(job_id).await?;
        self.start(job_id).await
    }

    /// Snapshot of one job; never-started registered channels report Idle.
    pub async fn job_status(&self, job_id: &str) -> Result<JobSnapshot, SupervisorError> {
        if let Some(entry) = self.jobs.read().await.get(job_id) {
            return Ok(entry.record.read().await.snapshot());
        }
        if let Some(spec) = self.specs.read().await.get(job_id) {
            return Ok(JobRecord::new(spec.clone(), self.tuning.event_ring_capacity).snapshot());
        }
        Err(SupervisorError::NotFound(job_id.to_string()))
    }

    /// Snapshot of every registered channel, sorted by id.
    pub async fn list_status(&self) -> Vec<JobSnapshot> {
        let specs = self.specs.read().await.clone();
        let jobs = self.jobs.read().await;

        let mut out = Vec::with_capacity(specs.len());
        for (id, spec) in &specs {
            if let Some(entry) = jobs.get(id) {
                out.push(entry.record.read().await.snapshot());
            } else {
                out.push(JobRecord::new(spec.clone(), self.tuning.event_ring_capacity).snapshot());
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Subscribe to state transitions and health events (push model).
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.bus.subscribe()
    }

    /// Current fleet color, maintained by the aggregator on every transition.
    pub fn fleet_color(&self) -> StatusColor {
        *self.fleet.borrow()
    }

    /// Start every registered channel flagged autostart. Returns how many
    /// starts were dispatched.
    pub async fn start_autostart_channels(&self) -> usize {
        let autostart: Vec<String> = self
            .specs
            .read()
            .await
            .values()
            .filter(|s| s.autostart)
            .map(|s| s.id.clone())
            .collect();

        let mut started = 0;
        for id in autostart {
            match self.start(&id).await {
                Ok(()) => started += 1,
                Err(err) => warn!(job = %id, error = %err, "autostart failed"),
            }
        }
        started
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.aggregator.abort();
    }
}

/// Recompute the fleet color on every published transition.
///
/// The color is derived from current records, never from stale snapshots;
/// the result is published through a watch channel for cheap reads.
fn spawn_aggregator(
    jobs: JobMap,
    mut rx: broadcast::Receiver<JobEvent>,
    tx: watch::Sender<StatusColor>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(JobEvent::Transition { .. }) => {
                    let colors = {
                        let jobs = jobs.read().await;
                        let mut colors = Vec::with_capacity(jobs.len());
                        for entry in jobs.values() {
                            colors.push(entry.record.read().await.color);
                        }
                        colors
                    };
                    let _ = tx.send(fleet_color(colors));
                }
                Ok(JobEvent::Health { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "status aggregator lagged behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{JobState, StopCause};
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use stream_super_daemon_config::{
        EngineConfig, InputEndpoint, OutputEndpoint, RestartPolicy, SupervisionConfig,
    };
    use tempfile::TempDir;

    fn fake_engine(dir: &TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().to_string()
    }

    fn test_config(binary: &str) -> DaemonConfig {
        DaemonConfig {
            engine: EngineConfig {
                binary: binary.to_string(),
                loglevel: "info".to_string(),
            },
            supervision: SupervisionConfig {
                stability_window_secs: 1,
                warning_window_secs: 2,
                warning_threshold: 3,
                graceful_stop_timeout_secs: 1,
                event_ring_capacity: 50,
                warning_coalesce_ms: 0,
            },
            ..DaemonConfig::default()
        }
    }

    fn make_spec(id: &str) -> JobSpec {
        JobSpec {
            id: id.to_string(),
            display_name: None,
            input: InputEndpoint::Dummy {
                pattern: "testsrc".to_string(),
                size: "320x240".to_string(),
                rate: 25,
            },
            output: OutputEndpoint::Udp {
                host: "127.0.0.1".to_string(),
                port: 5997,
                pkt_size: None,
            },
            video_bitrate_kbps: 500,
            analyzeduration: None,
            probesize: None,
            max_delay_us: None,
            extra_args: Vec::new(),
            restart: RestartPolicy {
                max_attempts: 2,
                backoff_base_secs: 1,
                backoff_cap_secs: 4,
            },
            autostart: false,
        }
    }

    async fn wait_for_job_state(sup: &Supervisor, id: &str, want: JobState, within: Duration) {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let snapshot = sup.job_status(id).await.expect("job known");
            if snapshot.state == want {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "timed out waiting for {} to reach {:?}, currently {:?}",
                    id, want, snapshot.state
                );
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn wait_for_fleet_color(sup: &Supervisor, want: StatusColor, within: Duration) {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if sup.fleet_color() == want {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "timed out waiting for fleet color {:?}, currently {:?}",
                    want,
                    sup.fleet_color()
                );
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn test_commands_on_unknown_job_fail_with_not_found() {
        let sup = Supervisor::new(&test_config("/bin/true"));

        assert!(matches!(
            sup.start("ghost").await,
            Err(SupervisorError::NotFound(_))
        ));
        assert!(matches!(
            sup.stop("ghost").await,
            Err(SupervisorError::NotFound(_))
        ));
        assert!(matches!(
            sup.restart("ghost").await,
            Err(SupervisorError::NotFound(_))
        ));
        assert!(matches!(
            sup.job_status("ghost").await,
            Err(SupervisorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_on_never_started_job_is_idempotent() {
        let sup = Supervisor::new(&test_config("/bin/true"));
        sup.register_channels(vec![make_spec("cam1")]).await;

        assert!(sup.stop("cam1").await.is_ok());
        assert!(sup.stop("cam1").await.is_ok());

        let snapshot = sup.job_status("cam1").await.unwrap();
        assert_eq!(snapshot.state, JobState::Idle);
    }

    #[tokio::test]
    async fn test_start_run_stop_lifecycle() {
        let dir = TempDir::new().unwrap();
        let engine = fake_engine(&dir, "engine.sh", "echo 'Stream mapping:' 1>&2; sleep 30");
        let sup = Supervisor::new(&test_config(&engine));
        sup.register_channels(vec![make_spec("cam1")]).await;

        sup.start("cam1").await.unwrap();
        wait_for_job_state(&sup, "cam1", JobState::Running, Duration::from_secs(5)).await;
        wait_for_fleet_color(&sup, StatusColor::Green, Duration::from_secs(2)).await;

        sup.stop("cam1").await.unwrap();
        let snapshot = sup.job_status("cam1").await.unwrap();
        assert_eq!(snapshot.state, JobState::Stopped);
        assert_eq!(snapshot.stop_cause, Some(StopCause::Clean));
        assert_eq!(snapshot.color, StatusColor::Blue);
        wait_for_fleet_color(&sup, StatusColor::Blue, Duration::from_secs(2)).await;

        // Stop again: idempotent.
        assert!(sup.stop("cam1").await.is_ok());
    }

    #[tokio::test]
    async fn test_start_while_active_never_spawns_second_process() {
        let dir = TempDir::new().unwrap();
        let engine = fake_engine(&dir, "engine.sh", "echo 'Stream mapping:' 1>&2; sleep 30");
        let sup = Supervisor::new(&test_config(&engine));
        sup.register_channels(vec![make_spec("cam1")]).await;

        sup.start("cam1").await.unwrap();
        wait_for_job_state(&sup, "cam1", JobState::Running, Duration::from_secs(5)).await;
        let pid_before = sup.job_status("cam1").await.unwrap().pid;
        assert!(pid_before.is_some());

        // Second start is a no-op while the job is active.
        sup.start("cam1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let pid_after = sup.job_status("cam1").await.unwrap().pid;
        assert_eq!(pid_before, pid_after);

        sup.stop("cam1").await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_replaces_process_and_resets_attempts() {
        let dir = TempDir::new().unwrap();
        let engine = fake_engine(&dir, "engine.sh", "echo 'Stream mapping:' 1>&2; sleep 30");
        let sup = Supervisor::new(&test_config(&engine));
        sup.register_channels(vec![make_spec("cam1")]).await;

        sup.start("cam1").await.unwrap();
        wait_for_job_state(&sup, "cam1", JobState::Running, Duration::from_secs(5)).await;
        let pid_before = sup.job_status("cam1").await.unwrap().pid;

        sup.restart("cam1").await.unwrap();
        wait_for_job_state(&sup, "cam1", JobState::Running, Duration::from_secs(5)).await;
        let snapshot = sup.job_status("cam1").await.unwrap();
        assert_ne!(snapshot.pid, pid_before);
        assert_eq!(snapshot.attempts, 0);

        sup.stop("cam1").await.unwrap();
    }

    #[tokio::test]
    async fn test_fleet_color_is_worst_across_jobs() {
        let dir = TempDir::new().unwrap();
        // The fake engine inspects its arguments: jobs whose rendered input
        // mentions failsrc die fatally, everything else streams happily.
        let engine = fake_engine(
            &dir,
            "engine.sh",
            "case \"$*\" in\n\
             *failsrc*) echo 'bind failed: Address already in use' 1>&2; sleep 30;;\n\
             *) echo 'Stream mapping:' 1>&2; sleep 30;;\n\
             esac",
        );
        let sup = Supervisor::new(&test_config(&engine));

        let mut bad = make_spec("cam-bad");
        bad.input = InputEndpoint::Dummy {
            pattern: "failsrc".to_string(),
            size: "320x240".to_string(),
            rate: 25,
        };
        sup.register_channels(vec![make_spec("cam-good"), bad]).await;

        sup.start("cam-good").await.unwrap();
        wait_for_job_state(&sup, "cam-good", JobState::Running, Duration::from_secs(5)).await;
        wait_for_fleet_color(&sup, StatusColor::Green, Duration::from_secs(2)).await;

        // The fatally-dying job drags the fleet to red even while the other
        // job stays green.
        sup.start("cam-bad").await.unwrap();
        wait_for_job_state(&sup, "cam-bad", JobState::Stopped, Duration::from_secs(10)).await;
        let snapshot = sup.job_status("cam-bad").await.unwrap();
        assert_eq!(snapshot.stop_cause, Some(StopCause::Fatal));
        wait_for_fleet_color(&sup, StatusColor::Red, Duration::from_secs(2)).await;

        sup.stop("cam-good").await.unwrap();
        // Red outranks the clean stop's blue.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sup.fleet_color(), StatusColor::Red);
    }

    #[tokio::test]
    async fn test_list_status_covers_registered_channels() {
        let dir = TempDir::new().unwrap();
        let engine = fake_engine(&dir, "engine.sh", "echo 'Stream mapping:' 1>&2; sleep 30");
        let sup = Supervisor::new(&test_config(&engine));
        sup.register_channels(vec![make_spec("cam1"), make_spec("cam2")])
            .await;

        sup.start("cam1").await.unwrap();
        wait_for_job_state(&sup, "cam1", JobState::Running, Duration::from_secs(5)).await;

        let statuses = sup.list_status().await;
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].id, "cam1");
        assert_eq!(statuses[0].state, JobState::Running);
        assert_eq!(statuses[1].id, "cam2");
        assert_eq!(statuses[1].state, JobState::Idle);

        sup.stop("cam1").await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_receives_transitions() {
        let dir = TempDir::new().unwrap();
        let engine = fake_engine(&dir, "engine.sh", "echo 'Stream mapping:' 1>&2; sleep 30");
        let sup = Supervisor::new(&test_config(&engine));
        sup.register_channels(vec![make_spec("cam1")]).await;

        let mut events = sup.subscribe();
        sup.start("cam1").await.unwrap();
        wait_for_job_state(&sup, "cam1", JobState::Running, Duration::from_secs(5)).await;

        let mut saw_starting = false;
        let mut saw_running = false;
        while let Ok(event) = events.try_recv() {
            if let JobEvent::Transition { to, .. } = event {
                saw_starting |= to == JobState::Starting;
                saw_running |= to == JobState::Running;
            }
        }
        assert!(saw_starting);
        assert!(saw_running);

        sup.stop("cam1").await.unwrap();
    }

    #[tokio::test]
    async fn test_start_with_spec_registers_dynamic_channel() {
        let dir = TempDir::new().unwrap();
        let engine = fake_engine(&dir, "engine.sh", "echo 'Stream mapping:' 1>&2; sleep 30");
        let sup = Supervisor::new(&test_config(&engine));

        sup.start_with_spec(make_spec("adhoc")).await.unwrap();
        wait_for_job_state(&sup, "adhoc", JobState::Running, Duration::from_secs(5)).await;

        sup.stop("adhoc").await.unwrap();
        // The spec stays registered after stop.
        assert!(sup.start("adhoc").await.is_ok());
        sup.stop("adhoc").await.unwrap();
    }

    #[tokio::test]
    async fn test_autostart_starts_flagged_channels_only() {
        let dir = TempDir::new().unwrap();
        let engine = fake_engine(&dir, "engine.sh", "echo 'Stream mapping:' 1>&2; sleep 30");
        let sup = Supervisor::new(&test_config(&engine));

        let mut auto = make_spec("cam-auto");
        auto.autostart = true;
        sup.register_channels(vec![auto, make_spec("cam-manual")])
            .await;

        assert_eq!(sup.start_autostart_channels().await, 1);
        wait_for_job_state(&sup, "cam-auto", JobState::Running, Duration::from_secs(5)).await;
        assert_eq!(
            sup.job_status("cam-manual").await.unwrap().state,
            JobState::Idle
        );

        sup.stop("cam-auto").await.unwrap();
    }
}
