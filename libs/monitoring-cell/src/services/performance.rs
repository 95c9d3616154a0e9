// =====================================================================================
// PERFORMANCE COLLECTOR
// =====================================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sysinfo::{CpuExt, DiskExt, System, SystemExt};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::models::PerformanceMetrics;

const CYCLE_WINDOW: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq)]
struct HostUsage {
    cpu: f64,
    memory: f64,
    disk: f64,
}

/// Host resource usage plus a rolling window of health-cycle durations.
pub struct PerformanceCollector {
    system: Arc<Mutex<System>>,
    cycle_count: AtomicU64,
    total_cycle_time_ms: AtomicU64,
    cycle_times: RwLock<Vec<u64>>,
}

impl Default for PerformanceCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceCollector {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            cycle_count: AtomicU64::new(0),
            total_cycle_time_ms: AtomicU64::new(0),
            cycle_times: RwLock::new(Vec::new()),
        }
    }

    pub async fn record_cycle(&self, duration_ms: u64) {
        self.cycle_count.fetch_add(1, Ordering::Relaxed);
        self.total_cycle_time_ms.fetch_add(duration_ms, Ordering::Relaxed);

        let mut times = self.cycle_times.write().await;
        times.push(duration_ms);
        if times.len() > CYCLE_WINDOW {
            times.drain(0..CYCLE_WINDOW / 2);
        }
    }

    /// (average, p95) cycle time in milliseconds.
    pub async fn cycle_stats(&self) -> (f64, f64) {
        let count = self.cycle_count.load(Ordering::Relaxed);
        let total = self.total_cycle_time_ms.load(Ordering::Relaxed);
        let average = if count > 0 { total as f64 / count as f64 } else { 0.0 };

        let times = self.cycle_times.read().await;
        let p95 = if times.is_empty() {
            0.0
        } else {
            let mut sorted = times.clone();
            sorted.sort_unstable();
            let idx = ((sorted.len() as f64 * 0.95) as usize).min(sorted.len() - 1);
            sorted[idx] as f64
        };
        (average, p95)
    }

    #[instrument(skip(self))]
    pub async fn sample(&self) -> Result<PerformanceMetrics> {
        let usage = self.sample_host().await?;
        let (average_cycle_time_ms, p95_cycle_time_ms) = self.cycle_stats().await;
        debug!(cpu = usage.cpu, memory = usage.memory, disk = usage.disk, "host usage sampled");

        Ok(PerformanceMetrics {
            cpu_usage_percentage: usage.cpu,
            memory_usage_percentage: usage.memory,
            disk_usage_percentage: usage.disk,
            average_cycle_time_ms,
            p95_cycle_time_ms,
            timestamp: Utc::now(),
        })
    }

    async fn sample_host(&self) -> Result<HostUsage> {
        let system = self.system.clone();
        tokio::task::spawn_blocking(move || {
            let mut sys = system.lock().map_err(|_| anyhow!("system info lock poisoned"))?;
            sys.refresh_cpu();
            sys.refresh_memory();
            sys.refresh_disks_list();
            sys.refresh_disks();

            let cpu = sys.global_cpu_info().cpu_usage() as f64;
            let memory = percentage(sys.used_memory(), sys.total_memory());
            let (used, total) = sys.disks().iter().fold((0u64, 0u64), |(used, total), disk| {
                (
                    used + disk.total_space().saturating_sub(disk.available_space()),
                    total + disk.total_space(),
                )
            });

            Ok(HostUsage {
                cpu,
                memory,
                disk: percentage(used, total),
            })
        })
        .await
        .context("host sampling task failed")?
    }
}

fn percentage(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cycle_stats_track_average_and_p95() {
        let collector = PerformanceCollector::new();
        assert_eq!(collector.cycle_stats().await, (0.0, 0.0));

        for ms in 1..=100 {
            collector.record_cycle(ms).await;
        }
        let (average, p95) = collector.cycle_stats().await;
        assert_eq!(average, 50.5);
        assert_eq!(p95, 96.0);
    }

    #[test]
    fn percentage_handles_empty_totals() {
        assert_eq!(percentage(5, 0), 0.0);
        assert_eq!(percentage(50, 200), 25.0);
    }
}
