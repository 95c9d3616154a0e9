// =====================================================================================
// HEALTH CHECKER
// =====================================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::adapters::DataSourceAdapter;
use crate::models::{HealthRecord, HealthStatus, MonitoringError};
use shared_config::MonitorConfig;

pub struct HealthChecker {
    warning_threshold: Duration,
    critical_threshold: Duration,
    max_concurrency: Option<usize>,
    shutdown_grace: Duration,
}

impl HealthChecker {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            warning_threshold: config.response_warning,
            critical_threshold: config.response_critical,
            max_concurrency: config.max_concurrent_checks,
            shutdown_grace: config.shutdown_grace,
        }
    }

    pub fn with_thresholds(warning_threshold: Duration, critical_threshold: Duration) -> Self {
        Self {
            warning_threshold,
            critical_threshold,
            max_concurrency: None,
            shutdown_grace: Duration::from_secs(2),
        }
    }

    pub fn with_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency.max(1));
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn derive_status(&self, response_time: Duration, failed: bool) -> HealthStatus {
        if failed || response_time >= self.critical_threshold {
            HealthStatus::Critical
        } else if response_time >= self.warning_threshold {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }

    /// Checks every adapter concurrently; one record per adapter, in adapter order.
    pub async fn run_all(&self, adapters: &[Arc<dyn DataSourceAdapter>], timeout: Duration) -> Vec<HealthRecord> {
        let (_tx, rx) = watch::channel(false);
        self.run_all_until(adapters, timeout, rx).await
    }

    /// Like `run_all`, but once `shutdown` flips to true, checks still running after the
    /// grace period are recorded as `Unknown`.
    #[instrument(skip(self, adapters, shutdown), fields(adapters = adapters.len()))]
    pub async fn run_all_until(
        &self,
        adapters: &[Arc<dyn DataSourceAdapter>],
        timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<HealthRecord> {
        let timestamp = Utc::now();
        let concurrency = self.max_concurrency.unwrap_or(adapters.len()).max(1);

        let checks: Vec<_> = adapters
            .iter()
            .cloned()
            .map(|adapter| self.check_one(adapter, timeout, timestamp, shutdown.clone()))
            .collect();

        stream::iter(checks).buffered(concurrency).collect().await
    }

    async fn check_one(
        &self,
        adapter: Arc<dyn DataSourceAdapter>,
        timeout: Duration,
        timestamp: DateTime<Utc>,
        shutdown: watch::Receiver<bool>,
    ) -> HealthRecord {
        let component = adapter.name().to_string();
        let start = Instant::now();

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, adapter.check_health(timeout)) => Some(result),
            _ = grace_expired(shutdown, self.shutdown_grace) => None,
        };
        let elapsed = start.elapsed();

        let (status, response_time, details, error_message) = match outcome {
            Some(Ok(Ok(health))) => (self.derive_status(elapsed, false), elapsed, health.details, None),
            Some(Ok(Err(MonitoringError::AdapterUnreachable(reason)))) => {
                warn!(component = %component, "adapter unreachable: {}", reason);
                (HealthStatus::Unknown, elapsed, HashMap::new(), Some(reason))
            }
            Some(Ok(Err(error))) => {
                warn!(component = %component, "health check failed: {}", error);
                (HealthStatus::Critical, elapsed, HashMap::new(), Some(error.to_string()))
            }
            Some(Err(_)) => {
                let error = MonitoringError::AdapterTimeout {
                    component: component.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                warn!(component = %component, "{}", error);
                (HealthStatus::Critical, timeout, HashMap::new(), Some(error.to_string()))
            }
            None => {
                warn!(component = %component, "health check abandoned at shutdown");
                (
                    HealthStatus::Unknown,
                    elapsed,
                    HashMap::new(),
                    Some("check did not complete before shutdown".to_string()),
                )
            }
        };

        debug!(component = %component, status = ?status, response_time_ms = response_time.as_millis() as u64, "health check done");

        HealthRecord {
            component,
            status,
            timestamp,
            response_time_ms: response_time.as_millis() as u64,
            details,
            error_message,
        }
    }
}

/// Resolves `grace` after the shutdown flag is raised; never resolves otherwise.
async fn grace_expired(mut shutdown: watch::Receiver<bool>, grace: Duration) {
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
    tokio::time::sleep(grace).await;
}
