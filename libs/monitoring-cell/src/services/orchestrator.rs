// =====================================================================================
// ORCHESTRATOR
// =====================================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{DataSourceAdapter, Notifier};
use crate::models::{
    AlertTransition, AlertTransitionKind, BackupKind, BackupRecord, Cadence, ConsistencyReport, CycleCounters,
    EvaluationBatch, HealthRecord, MonitoringError, Snapshot, StatusResponse,
};
use crate::services::alerts::AlertEngine;
use crate::services::backup::{BackupManager, RestoreReport};
use crate::services::consistency::ConsistencyValidator;
use crate::services::health::HealthChecker;
use crate::services::performance::PerformanceCollector;
use crate::services::store::MetricsStore;
use shared_config::{ConfigError, MonitorConfig};

const CADENCES: [Cadence; 3] = [Cadence::Health, Cadence::Consistency, Cadence::Backup];

/// Drives the health, consistency and backup cadences and owns every component
/// they touch.
pub struct Orchestrator {
    config: MonitorConfig,
    adapters: Vec<Arc<dyn DataSourceAdapter>>,
    health: HealthChecker,
    consistency: ConsistencyValidator,
    backups: BackupManager,
    alerts: AlertEngine,
    store: MetricsStore,
    notifier: Arc<dyn Notifier>,
    performance: PerformanceCollector,
    counters: RwLock<HashMap<Cadence, CycleCounters>>,
}

impl Orchestrator {
    pub fn new(
        config: MonitorConfig,
        adapters: Vec<Arc<dyn DataSourceAdapter>>,
        store: MetricsStore,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, MonitoringError> {
        config.validate()?;

        let mut names = HashSet::new();
        for adapter in &adapters {
            if !names.insert(adapter.name().to_string()) {
                return Err(ConfigError::Inconsistent(format!("duplicate adapter name '{}'", adapter.name())).into());
            }
        }

        let health = HealthChecker::new(&config).with_concurrency(config.check_concurrency(adapters.len()));
        let consistency = ConsistencyValidator::new(&config);
        let backups = BackupManager::new(&config, store.clone());
        let alerts = AlertEngine::new(config.thresholds.clone(), store.clone());
        let counters = CADENCES.iter().map(|c| (*c, CycleCounters::default())).collect();

        Ok(Self {
            config,
            adapters,
            health,
            consistency,
            backups,
            alerts,
            store,
            notifier,
            performance: PerformanceCollector::new(),
            counters: RwLock::new(counters),
        })
    }

    /// Reloads open alerts and historical cycle totals from the store.
    pub async fn restore(&self) -> Result<(), MonitoringError> {
        let open_alerts = self.alerts.restore().await?;
        let totals = self.store.cycle_totals().await?;

        let mut counters = self.counters.write().await;
        for cadence in CADENCES {
            if let Some((runs, failures)) = totals.get(cadence.as_str()) {
                let entry = counters.entry(cadence).or_default();
                entry.runs = *runs;
                entry.failures = *failures;
            }
        }
        info!(open_alerts, "orchestrator state restored");
        Ok(())
    }

    pub fn store(&self) -> &MetricsStore {
        &self.store
    }

    pub fn alerts(&self) -> &AlertEngine {
        &self.alerts
    }

    fn interval_for(&self, cadence: Cadence) -> Duration {
        match cadence {
            Cadence::Health => self.config.health_interval,
            Cadence::Consistency => self.config.consistency_interval,
            Cadence::Backup => self.config.backup_interval,
        }
    }

    fn adapter(&self, system: &str) -> Result<&Arc<dyn DataSourceAdapter>, MonitoringError> {
        self.adapters
            .iter()
            .find(|a| a.name() == system)
            .ok_or_else(|| MonitoringError::NotFound(format!("no monitored system named '{}'", system)))
    }

    // =====================================================================================
    // CYCLES
    // =====================================================================================

    #[instrument(skip(self, shutdown))]
    pub async fn run_health_cycle(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<AlertTransition>, MonitoringError> {
        let start = Instant::now();
        let records = self
            .health
            .run_all_until(&self.adapters, self.config.check_timeout, shutdown)
            .await;
        self.performance.record_cycle(start.elapsed().as_millis() as u64).await;

        let cycle_id = self.store.append_health_batch(records.clone()).await?;
        debug!(cycle_id = %cycle_id, records = records.len(), "health batch persisted");

        let performance = match self.performance.sample().await {
            Ok(metrics) => {
                self.store.append_performance(metrics.clone()).await?;
                Some(metrics)
            }
            Err(e) => {
                warn!("performance sampling failed: {:#}", e);
                None
            }
        };

        let batch = EvaluationBatch {
            health: records,
            performance,
            ..Default::default()
        };
        self.evaluate_and_notify(&batch).await
    }

    /// Compares the first adapter against every other one for each configured collection.
    #[instrument(skip(self))]
    pub async fn run_consistency_cycle(&self) -> Result<Vec<AlertTransition>, MonitoringError> {
        let Some((primary, replicas)) = self.adapters.split_first() else {
            warn!("no adapters registered, skipping consistency cycle");
            return Ok(Vec::new());
        };
        if replicas.is_empty() {
            warn!("consistency needs at least two adapters, skipping cycle");
            return Ok(Vec::new());
        }

        let mut reports: Vec<ConsistencyReport> = Vec::new();
        let mut failures = Vec::new();
        let mut first_error = None;
        for collection in &self.config.collections {
            for replica in replicas {
                let label = if replicas.len() == 1 {
                    collection.name.clone()
                } else {
                    format!("{}:{}", collection.name, replica.name())
                };
                match self
                    .consistency
                    .validate_as(&label, collection, primary.as_ref(), replica.as_ref())
                    .await
                {
                    Ok(report) => {
                        if let Some(mismatch) = report.mismatch() {
                            warn!(collection = %label, quality_score = report.quality_score, "{}", mismatch);
                        }
                        reports.push(report);
                    }
                    Err(e) => {
                        error!(collection = %label, "consistency validation failed: {}", e);
                        failures.push(label);
                        first_error = first_error.or(Some(e));
                    }
                }
            }
        }

        if !reports.is_empty() {
            self.store.append_consistency_reports(reports.clone()).await?;
        }
        let batch = EvaluationBatch {
            consistency: reports,
            consistency_failures: failures,
            ..Default::default()
        };
        let transitions = self.evaluate_and_notify(&batch).await?;

        match first_error {
            Some(e) => Err(e),
            None => Ok(transitions),
        }
    }

    /// Backs up every system in parallel, then applies the retention policy per system.
    #[instrument(skip(self))]
    pub async fn run_backup_cycle(&self) -> Result<Vec<BackupRecord>, MonitoringError> {
        let outcomes = join_all(self.adapters.iter().map(|adapter| async move {
            let record = self.backups.create_backup(adapter.as_ref(), BackupKind::Full).await?;
            if let Err(e) = self.backups.prune(adapter.name(), &self.config.retention).await {
                warn!(system = %adapter.name(), "retention pruning failed: {}", e);
            }
            Ok::<_, MonitoringError>(record)
        }))
        .await;

        let mut records = Vec::with_capacity(outcomes.len());
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(record) => records.push(record),
                Err(e) => {
                    error!("backup could not be recorded: {}", e);
                    first_error = first_error.or(Some(e));
                }
            }
        }

        let batch = EvaluationBatch {
            backups: records.clone(),
            ..Default::default()
        };
        self.evaluate_and_notify(&batch).await?;

        match first_error {
            Some(e) => Err(e),
            None => Ok(records),
        }
    }

    /// On-demand backup. A failed backup is still returned as a `Failed` record.
    #[instrument(skip(self))]
    pub async fn trigger_backup(&self, system: &str, kind: BackupKind) -> Result<BackupRecord, MonitoringError> {
        let adapter = self.adapter(system)?;
        let record = self.backups.create_backup(adapter.as_ref(), kind).await?;

        let batch = EvaluationBatch {
            backups: vec![record.clone()],
            ..Default::default()
        };
        self.evaluate_and_notify(&batch).await?;
        Ok(record)
    }

    pub async fn prune_backups(&self, system: &str) -> Result<Vec<String>, MonitoringError> {
        if system.trim().is_empty() {
            return Err(MonitoringError::BadRequest("system must not be empty".to_string()));
        }
        self.backups.prune(system, &self.config.retention).await
    }

    pub async fn restore_backup(&self, backup_id: &str) -> Result<RestoreReport, MonitoringError> {
        self.backups.restore(backup_id).await
    }

    async fn evaluate_and_notify(&self, batch: &EvaluationBatch) -> Result<Vec<AlertTransition>, MonitoringError> {
        let transitions = self.alerts.evaluate(batch).await?;
        self.notify(&transitions);
        Ok(transitions)
    }

    /// Hands alert changes to the notifier without waiting on delivery.
    fn notify(&self, transitions: &[AlertTransition]) {
        for transition in transitions {
            if transition.kind == AlertTransitionKind::Acknowledged {
                continue;
            }
            let notifier = Arc::clone(&self.notifier);
            let alert = transition.alert.clone();
            tokio::spawn(async move {
                if let Err(e) = notifier.send(&alert).await {
                    warn!(alert_id = %alert.id, condition_key = %alert.condition_key, "alert delivery failed: {}", e);
                }
            });
        }
    }

    // =====================================================================================
    // SCHEDULING
    // =====================================================================================

    /// Runs one cycle of `cadence` in its own task and records the outcome. A failing or
    /// panicking cycle only bumps the failure counter.
    pub async fn run_cycle(self: &Arc<Self>, cadence: Cadence, shutdown: watch::Receiver<bool>) -> CycleCounters {
        let started_at = Utc::now();
        self.counters.write().await.entry(cadence).or_default().last_started = Some(started_at);

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            match cadence {
                Cadence::Health => this.run_health_cycle(shutdown).await.map(|_| ()),
                Cadence::Consistency => this.run_consistency_cycle().await.map(|_| ()),
                Cadence::Backup => this.run_backup_cycle().await.map(|_| ()),
            }
        });
        let failure = match task.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(join_error) => Some(format!("cycle task aborted: {}", join_error)),
        };
        let finished_at = Utc::now();

        if let Some(reason) = &failure {
            error!(cadence = %cadence, "cycle failed: {}", reason);
        }
        if let Err(e) = self.store.record_cycle(cadence, started_at, finished_at, failure.clone()).await {
            warn!(cadence = %cadence, "failed to record cycle run: {}", e);
        }

        let mut counters = self.counters.write().await;
        let entry = counters.entry(cadence).or_default();
        entry.runs += 1;
        match failure {
            Some(_) => entry.failures += 1,
            None => entry.last_completed = Some(finished_at),
        }
        entry.clone()
    }

    /// Spawns one loop per cadence. Loops exit once `shutdown` flips to true.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(adapters = self.adapters.len(), "starting monitoring cadences");
        CADENCES
            .iter()
            .map(|cadence| {
                let this = Arc::clone(self);
                let shutdown = shutdown.clone();
                let cadence = *cadence;
                tokio::spawn(async move { this.cadence_loop(cadence, shutdown).await })
            })
            .collect()
    }

    async fn cadence_loop(self: Arc<Self>, cadence: Cadence, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval_for(cadence));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            let counters = self.run_cycle(cadence, shutdown.clone()).await;
            debug!(cadence = %cadence, runs = counters.runs, failures = counters.failures, "cycle finished");
        }

        info!(cadence = %cadence, "cadence stopped");
    }

    // =====================================================================================
    // READ SIDE
    // =====================================================================================

    pub async fn counters(&self) -> HashMap<Cadence, CycleCounters> {
        self.counters.read().await.clone()
    }

    /// Stale once the cadence's last completion is older than twice its interval, or
    /// when it never completed.
    pub async fn staleness(&self, cadence: Cadence) -> (bool, Option<DateTime<Utc>>) {
        let last_completed = self
            .counters
            .read()
            .await
            .get(&cadence)
            .and_then(|c| c.last_completed);
        let stale = match last_completed {
            None => true,
            Some(at) => {
                let limit = chrono::Duration::from_std(self.interval_for(cadence) * 2)
                    .unwrap_or_else(|_| chrono::Duration::days(365));
                Utc::now().signed_duration_since(at) > limit
            }
        };
        (stale, last_completed)
    }

    pub async fn snapshot<T>(&self, cadence: Cadence, data: T) -> Snapshot<T> {
        let (stale, last_updated) = self.staleness(cadence).await;
        Snapshot {
            data,
            stale,
            last_updated,
        }
    }

    pub async fn latest_health(&self) -> Result<Snapshot<Vec<HealthRecord>>, MonitoringError> {
        let records = self.store.latest_health().await?;
        Ok(self.snapshot(Cadence::Health, records).await)
    }

    pub async fn status(&self) -> StatusResponse {
        let cycles = self
            .counters()
            .await
            .into_iter()
            .map(|(cadence, counters)| (cadence.as_str().to_string(), counters))
            .collect();
        StatusResponse {
            cycles,
            active_alerts: self.alerts.active_alerts().await,
            timestamp: Utc::now(),
        }
    }
}
