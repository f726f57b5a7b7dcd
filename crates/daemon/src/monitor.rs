//! System resource sampling, decoupled from job supervision.
//!
//! A single sampler task publishes [`ResourceSnapshot`]s through a watch
//! channel on its own cadence. Each metric degrades to `None` independently
//! when it cannot be read; a failed metric never affects the others and the
//! sampler never waits on any job pipeline.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use sysinfo::{Networks, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use stream_super_daemon_config::MonitorConfig;

use crate::health::current_timestamp_ms;

/// Point-in-time system resource reading.
///
/// Replaced wholesale on every sampling interval; consumers see only the
/// latest value plus the rolling CPU average maintained by the sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub timestamp_ms: i64,
    /// System-wide CPU usage percent.
    pub cpu_percent: Option<f32>,
    /// Rolling average CPU percent over the trend window.
    pub cpu_avg_percent: Option<f32>,
    pub mem_used_bytes: Option<u64>,
    pub mem_total_bytes: Option<u64>,
    pub mem_percent: Option<f32>,
    /// Higher of inbound/outbound throughput across all interfaces.
    pub network_mbps: Option<f32>,
    /// Throughput relative to the configured maximum bandwidth.
    pub network_utilization_percent: Option<f32>,
}

impl Default for ResourceSnapshot {
    fn default() -> Self {
        Self {
            timestamp_ms: 0,
            cpu_percent: None,
            cpu_avg_percent: None,
            mem_used_bytes: None,
            mem_total_bytes: None,
            mem_percent: None,
            network_mbps: None,
            network_utilization_percent: None,
        }
    }
}

/// Shared read handle for the latest resource snapshot.
pub type ResourceWatch = watch::Receiver<ResourceSnapshot>;

/// Periodic system sampler publishing through a watch channel.
pub struct ResourceMonitor {
    interval: Duration,
    max_bandwidth_mbps: f32,
    trend_window: usize,
}

impl ResourceMonitor {
    pub fn new(cfg: &MonitorConfig) -> Self {
        Self {
            interval: Duration::from_secs(cfg.sample_interval_secs.max(1)),
            max_bandwidth_mbps: cfg.network_max_bandwidth_mbps,
            trend_window: cfg.trend_window.max(1),
        }
    }

    /// Start the sampler task. Returns the snapshot watch and the task handle.
    pub fn spawn(self) -> (ResourceWatch, JoinHandle<()>) {
        let (tx, rx) = watch::channel(ResourceSnapshot::default());

        let handle = tokio::spawn(async move {
            let mut sys = System::new();
            let mut networks = Networks::new_with_refreshed_list();
            let mut cpu_window: VecDeque<f32> = VecDeque::new();

            // Prime the CPU baseline; the first delta needs two refreshes.
            sys.refresh_cpu_usage();

            loop {
                tokio::time::sleep(self.interval).await;

                let snapshot = sample(
                    &mut sys,
                    &mut networks,
                    &mut cpu_window,
                    self.interval.as_secs_f64(),
                    self.max_bandwidth_mbps,
                    self.trend_window,
                );

                if tx.send(snapshot).is_err() {
                    debug!("all resource snapshot readers gone, sampler exiting");
                    break;
                }
            }
        });

        (rx, handle)
    }
}

/// Take one sample. Each metric is read independently so one unavailable
/// counter degrades only itself.
fn sample(
    sys: &mut System,
    networks: &mut Networks,
    cpu_window: &mut VecDeque<f32>,
    elapsed_secs: f64,
    max_bandwidth_mbps: f32,
    trend_window: usize,
) -> ResourceSnapshot {
    sys.refresh_cpu_usage();
    sys.refresh_memory();
    networks.refresh();

    let cpu_percent = if sys.cpus().is_empty() {
        None
    } else {
        Some(sys.global_cpu_usage())
    };

    if let Some(cpu) = cpu_percent {
        cpu_window.push_back(cpu);
        while cpu_window.len() > trend_window {
            cpu_window.pop_front();
        }
    }
    let cpu_avg_percent = if cpu_window.is_empty() {
        None
    } else {
        Some(cpu_window.iter().sum::<f32>() / cpu_window.len() as f32)
    };

    let mem_total = sys.total_memory();
    let (mem_used_bytes, mem_total_bytes, mem_percent) = if mem_total == 0 {
        (None, None, None)
    } else {
        let used = sys.used_memory();
        (Some(used), Some(mem_total), mem_percent_of(used, mem_total))
    };

    let mut rx_bytes = 0u64;
    let mut tx_bytes = 0u64;
    for (_name, data) in &*networks {
        rx_bytes = rx_bytes.saturating_add(data.received());
        tx_bytes = tx_bytes.saturating_add(data.transmitted());
    }
    // Mirror the operator-facing convention: report whichever direction is
    // busier.
    let network_mbps = if elapsed_secs > 0.0 {
        Some(mbps_of(rx_bytes.max(tx_bytes), elapsed_secs))
    } else {
        None
    };
    let network_utilization_percent =
        network_mbps.and_then(|mbps| utilization_percent(mbps, max_bandwidth_mbps));

    ResourceSnapshot {
        timestamp_ms: current_timestamp_ms(),
        cpu_percent,
        cpu_avg_percent,
        mem_used_bytes,
        mem_total_bytes,
        mem_percent,
        network_mbps,
        network_utilization_percent,
    }
}

/// Bytes over a duration to megabits per second.
fn mbps_of(bytes: u64, elapsed_secs: f64) -> f32 {
    ((bytes as f64 / elapsed_secs) * 8.0 / (1024.0 * 1024.0)) as f32
}

/// Throughput as a percent of the configured maximum, capped at 100.
/// `None` when no meaningful maximum is configured.
fn utilization_percent(mbps: f32, max_bandwidth_mbps: f32) -> Option<f32> {
    if max_bandwidth_mbps <= 0.0 {
        return None;
    }
    Some((mbps / max_bandwidth_mbps * 100.0).min(100.0))
}

/// Used memory as a percent of total; `None` when the total is unknown.
fn mem_percent_of(used: u64, total: u64) -> Option<f32> {
    if total == 0 {
        return None;
    }
    Some((used as f64 / total as f64 * 100.0) as f32)
}
