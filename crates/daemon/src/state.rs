//! Per-job lifecycle states and transition policy.
//!
//! The state machine itself is driven by each job's actor task; this module
//! holds the state vocabulary and the pure decision logic (warning-rate
//! windowing, restart disposition, backoff computation) so transitions can
//! be tested without processes or timers.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use stream_super_daemon_config::RestartPolicy;

/// Lifecycle state of a managed stream job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// No process; nothing requested yet.
    Idle,
    /// Process launched, awaiting first healthy output or the stability window.
    Starting,
    /// Healthy.
    Running,
    /// Running, but recent warnings exceed the configured rate.
    Degraded,
    /// Process exited abnormally or a fatal condition occurred.
    Error,
    /// Recovery in progress; relaunch scheduled after backoff.
    Restarting,
    /// Graceful shutdown requested.
    Stopping,
    /// Terminal for this run; process confirmed gone.
    Stopped,
}

impl JobState {
    /// Terminal means no actor is driving this job any more.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Stopped)
    }

    /// Whether a backing process may currently be alive.
    pub fn has_process(&self) -> bool {
        matches!(
            self,
            JobState::Starting | JobState::Running | JobState::Degraded | JobState::Stopping
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Idle => write!(f, "idle"),
            JobState::Starting => write!(f, "starting"),
            JobState::Running => write!(f, "running"),
            JobState::Degraded => write!(f, "degraded"),
            JobState::Error => write!(f, "error"),
            JobState::Restarting => write!(f, "restarting"),
            JobState::Stopping => write!(f, "stopping"),
            JobState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Why a job ended up Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCause {
    /// Operator-requested stop, or clean shutdown.
    Clean,
    /// A fatal condition that automatic restarts cannot fix.
    Fatal,
    /// The restart budget was exhausted.
    RetriesExhausted,
}

impl std::fmt::Display for StopCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopCause::Clean => write!(f, "clean"),
            StopCause::Fatal => write!(f, "fatal"),
            StopCause::RetriesExhausted => write!(f, "retries_exhausted"),
        }
    }
}

/// Rolling warning-rate window driving Running <-> Degraded.
///
/// Timestamps older than the window are pruned on every operation, so the
/// count never reflects stale warnings.
#[derive(Debug)]
pub struct WarningWindow {
    window: Duration,
    threshold: u32,
    stamps: VecDeque<Instant>,
}

impl WarningWindow {
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self {
            window,
            threshold: threshold.max(1),
            stamps: VecDeque::new(),
        }
    }

    /// Record a warning at `now` and return the in-window count.
    pub fn record(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.stamps.push_back(now);
        self.stamps.len()
    }

    /// Whether the in-window warning count meets the degradation threshold.
    pub fn is_over(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.stamps.len() >= self.threshold as usize
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.stamps.front() {
            if now.duration_since(*front) > self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Delay before restart attempt `attempt` (0-indexed): `base * 2^attempt`,
/// capped.
pub fn restart_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = attempt.min(63);
    let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
    let delay = base.checked_mul(factor.min(u32::MAX as u64) as u32);
    delay.unwrap_or(cap).min(cap)
}

/// What the state machine should do after entering Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Schedule a relaunch after the given delay.
    Retry { delay: Duration },
    /// Stop for good with the given cause.
    GiveUp { cause: StopCause },
}

/// Decide retry vs. give-up for a failure at the given attempt count.
///
/// Fatal conditions are never retried; retryable conditions are retried
/// until the policy's attempt budget is spent.
pub fn on_error(policy: &RestartPolicy, attempt: u32, retryable: bool) -> ErrorDisposition {
    if !retryable {
        return ErrorDisposition::GiveUp {
            cause: StopCause::Fatal,
        };
    }
    if attempt >= policy.max_attempts {
        return ErrorDisposition::GiveUp {
            cause: StopCause::RetriesExhausted,
        };
    }
    ErrorDisposition::Retry {
        delay: restart_delay(
            Duration::from_secs(policy.backoff_base_secs),
            Duration::from_secs(policy.backoff_cap_secs),
            attempt,
        ),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(max_attempts: u32, base: u64, cap: u64) -> RestartPolicy {
        RestartPolicy {
            max_attempts,
            backoff_base_secs: base,
            backoff_cap_secs: cap,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Restart delays SHALL never exceed the cap and SHALL be
        // non-decreasing in the attempt number.
        #[test]
        fn prop_restart_delay_capped_and_monotone(
            base in 1u64..30,
            cap in 1u64..600,
            attempt in 0u32..100,
        ) {
            let base_d = Duration::from_secs(base);
            let cap_d = Duration::from_secs(cap);

            let delay = restart_delay(base_d, cap_d, attempt);
            prop_assert!(delay <= cap_d);

            let next = restart_delay(base_d, cap_d, attempt + 1);
            prop_assert!(next >= delay);
        }

        // A fatal failure SHALL never yield a retry, regardless of budget.
        #[test]
        fn prop_fatal_never_retries(max in 0u32..100, attempt in 0u32..100) {
            let d = on_error(&policy(max, 1, 60), attempt, false);
            prop_assert_eq!(d, ErrorDisposition::GiveUp { cause: StopCause::Fatal });
        }

        // Attempts at or past the budget SHALL give up with
        // RetriesExhausted; attempts under it SHALL retry.
        #[test]
        fn prop_attempt_budget_respected(max in 0u32..20, attempt in 0u32..40) {
            let d = on_error(&policy(max, 1, 60), attempt, true);
            if attempt >= max {
                prop_assert_eq!(
                    d,
                    ErrorDisposition::GiveUp { cause: StopCause::RetriesExhausted }
                );
            } else {
                let is_retry = matches!(d, ErrorDisposition::Retry { .. });
                prop_assert!(is_retry);
            }
        }
    }

    #[test]
    fn test_restart_delay_doubles_from_base() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        assert_eq!(restart_delay(base, cap, 0), Duration::from_secs(1));
        assert_eq!(restart_delay(base, cap, 1), Duration::from_secs(2));
        assert_eq!(restart_delay(base, cap, 2), Duration::from_secs(4));
        assert_eq!(restart_delay(base, cap, 5), Duration::from_secs(32));
        assert_eq!(restart_delay(base, cap, 6), Duration::from_secs(60));
        assert_eq!(restart_delay(base, cap, 63), Duration::from_secs(60));
    }

    #[test]
    fn test_restart_delay_huge_attempt_clamps_to_cap() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(30);
        assert_eq!(restart_delay(base, cap, u32::MAX), cap);
    }

    #[test]
    fn test_first_retry_uses_base_delay() {
        let d = on_error(&policy(3, 1, 60), 0, true);
        assert_eq!(
            d,
            ErrorDisposition::Retry {
                delay: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn test_warning_window_crosses_threshold() {
        let mut w = WarningWindow::new(Duration::from_secs(10), 3);
        let t0 = Instant::now();

        assert_eq!(w.record(t0), 1);
        assert!(!w.is_over(t0));
        w.record(t0 + Duration::from_secs(1));
        w.record(t0 + Duration::from_secs(2));
        assert!(w.is_over(t0 + Duration::from_secs(2)));
    }

    #[test]
    fn test_warning_window_rate_subsides() {
        let mut w = WarningWindow::new(Duration::from_secs(10), 3);
        let t0 = Instant::now();

        w.record(t0);
        w.record(t0 + Duration::from_secs(1));
        w.record(t0 + Duration::from_secs(2));
        assert!(w.is_over(t0 + Duration::from_secs(2)));

        // All three warnings age out of the window.
        assert!(!w.is_over(t0 + Duration::from_secs(13)));
    }

    #[test]
    fn test_state_predicates() {
        assert!(JobState::Stopped.is_terminal());
        assert!(!JobState::Error.is_terminal());
        assert!(JobState::Running.has_process());
        assert!(JobState::Stopping.has_process());
        assert!(!JobState::Restarting.has_process());
        assert!(!JobState::Stopped.has_process());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(format!("{}", JobState::Idle), "idle");
        assert_eq!(format!("{}", JobState::Starting), "starting");
        assert_eq!(format!("{}", JobState::Running), "running");
        assert_eq!(format!("{}", JobState::Degraded), "degraded");
        assert_eq!(format!("{}", JobState::Error), "error");
        assert_eq!(format!("{}", JobState::Restarting), "restarting");
        assert_eq!(format!("{}", JobState::Stopping), "stopping");
        assert_eq!(format!("{}", JobState::Stopped), "stopped");
    }
}
