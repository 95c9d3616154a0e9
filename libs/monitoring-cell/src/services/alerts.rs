// =====================================================================================
// ALERT ENGINE
// =====================================================================================

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::models::{
    Alert, AlertSeverity, AlertTransition, AlertTransitionKind, BackupStatus, EvaluationBatch,
    HealthStatus, MonitoringError,
};
use crate::services::store::MetricsStore;
use shared_config::{Comparator, ThresholdConfig, ThresholdRule, ViolationLevel};

/// One measured value the thresholds are checked against.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub component: String,
    pub metric: &'static str,
    pub value: f64,
}

/// Stable identifier of a threshold condition: component, metric and comparator.
pub fn condition_key(component: &str, metric: &str, comparator: Comparator) -> String {
    let mut hasher = Sha256::new();
    hasher.update(component.as_bytes());
    hasher.update([0u8]);
    hasher.update(metric.as_bytes());
    hasher.update([0u8]);
    hasher.update(comparator.as_str().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

pub fn observations(batch: &EvaluationBatch) -> Vec<Observation> {
    let mut observed = Vec::new();

    for record in &batch.health {
        observed.push(Observation {
            component: record.component.clone(),
            metric: "response_time_ms",
            value: record.response_time_ms as f64,
        });
        let unavailable = matches!(record.status, HealthStatus::Critical | HealthStatus::Unknown)
            && record.error_message.is_some();
        observed.push(Observation {
            component: record.component.clone(),
            metric: "unavailable",
            value: if unavailable { 1.0 } else { 0.0 },
        });
    }

    for report in &batch.consistency {
        observed.push(Observation {
            component: report.collection.clone(),
            metric: "quality_score",
            value: report.quality_score,
        });
        observed.push(Observation {
            component: report.collection.clone(),
            metric: "consistency_check_failed",
            value: 0.0,
        });
    }
    for label in &batch.consistency_failures {
        observed.push(Observation {
            component: label.clone(),
            metric: "consistency_check_failed",
            value: 1.0,
        });
    }

    // Only the newest backup per system counts.
    let mut latest_backups = BTreeMap::new();
    for record in &batch.backups {
        let entry = latest_backups.entry(record.system.clone()).or_insert(record);
        if record.created_at >= entry.created_at {
            *entry = record;
        }
    }
    for (system, record) in latest_backups {
        observed.push(Observation {
            component: system,
            metric: "backup_failed",
            value: if record.status == BackupStatus::Failed { 1.0 } else { 0.0 },
        });
    }

    if let Some(perf) = &batch.performance {
        for (metric, value) in [
            ("cpu_usage_percentage", perf.cpu_usage_percentage),
            ("memory_usage_percentage", perf.memory_usage_percentage),
            ("disk_usage_percentage", perf.disk_usage_percentage),
        ] {
            observed.push(Observation {
                component: "host".to_string(),
                metric,
                value,
            });
        }
    }

    observed
}

/// Active (unresolved) alerts keyed by condition key. At most one per key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertRegistry {
    active: BTreeMap<String, Alert>,
}

impl AlertRegistry {
    pub fn from_alerts(alerts: impl IntoIterator<Item = Alert>) -> Self {
        let active = alerts
            .into_iter()
            .filter(Alert::is_active)
            .map(|alert| (alert.condition_key.clone(), alert))
            .collect();
        Self { active }
    }

    pub fn get(&self, condition_key: &str) -> Option<&Alert> {
        self.active.get(condition_key)
    }

    pub fn alerts(&self) -> impl Iterator<Item = &Alert> {
        self.active.values()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

fn severity_for(level: ViolationLevel) -> AlertSeverity {
    match level {
        ViolationLevel::Warning => AlertSeverity::Warning,
        ViolationLevel::Critical => AlertSeverity::Critical,
    }
}

fn violated_limit(rule: &ThresholdRule, level: ViolationLevel) -> f64 {
    match (level, rule.critical) {
        (ViolationLevel::Critical, Some(limit)) => limit,
        _ => rule.warning,
    }
}

fn describe(observation: &Observation, rule: &ThresholdRule, threshold: f64) -> String {
    let relation = match rule.comparator {
        Comparator::GreaterThan => "exceeds",
        Comparator::LessThan => "is below",
    };
    format!(
        "{} {} is {:.4}, which {} threshold {:.4}",
        observation.component, observation.metric, observation.value, relation, threshold
    )
}

/// Pure evaluation step: current registry plus a batch gives the next registry and
/// every alert that changed.
pub fn evaluate(
    registry: &AlertRegistry,
    batch: &EvaluationBatch,
    thresholds: &ThresholdConfig,
    now: DateTime<Utc>,
) -> (AlertRegistry, Vec<AlertTransition>) {
    let mut next = registry.clone();
    let mut transitions = Vec::new();

    for observation in observations(batch) {
        for (rule_name, rule) in thresholds.rules_for_metric(observation.metric) {
            let key = condition_key(&observation.component, &rule.metric, rule.comparator);
            let level = rule.level_for(observation.value);

            let current = next.active.get(&key).map(|alert| alert.severity);

            match (current, level) {
                (None, Some(level)) => {
                    let threshold = violated_limit(rule, level);
                    let alert = Alert {
                        id: Uuid::new_v4().to_string(),
                        severity: severity_for(level),
                        component: observation.component.clone(),
                        metric: rule.metric.clone(),
                        rule: rule_name.to_string(),
                        condition_key: key.clone(),
                        message: describe(&observation, rule, threshold),
                        metric_value: observation.value,
                        threshold,
                        created_at: now,
                        acknowledged: false,
                        resolved: false,
                        resolved_at: None,
                    };
                    next.active.insert(key, alert.clone());
                    transitions.push(AlertTransition {
                        kind: AlertTransitionKind::Opened,
                        alert,
                    });
                }
                (Some(current), Some(level)) => {
                    let severity = severity_for(level);
                    if current == severity {
                        continue;
                    }
                    if let Some(existing) = next.active.get_mut(&key) {
                        let threshold = violated_limit(rule, level);
                        existing.severity = severity;
                        existing.threshold = threshold;
                        existing.metric_value = observation.value;
                        existing.message = describe(&observation, rule, threshold);
                        transitions.push(AlertTransition {
                            kind: AlertTransitionKind::SeverityChanged,
                            alert: existing.clone(),
                        });
                    }
                }
                (Some(_), None) => {
                    if let Some(mut alert) = next.active.remove(&key) {
                        alert.resolved = true;
                        alert.resolved_at = Some(now);
                        alert.metric_value = observation.value;
                        transitions.push(AlertTransition {
                            kind: AlertTransitionKind::Resolved,
                            alert,
                        });
                    }
                }
                (None, None) => {}
            }
        }
    }

    (next, transitions)
}

// =====================================================================================
// ENGINE (registry owner)
// =====================================================================================

/// Owns the alert registry. Every alert mutation, and its persistence, happens
/// while holding the registry lock.
pub struct AlertEngine {
    thresholds: ThresholdConfig,
    registry: RwLock<AlertRegistry>,
    store: MetricsStore,
}

impl AlertEngine {
    pub fn new(thresholds: ThresholdConfig, store: MetricsStore) -> Self {
        Self {
            thresholds,
            registry: RwLock::new(AlertRegistry::default()),
            store,
        }
    }

    /// Rebuilds the registry from unresolved alerts already in the store.
    pub async fn restore(&self) -> Result<usize, MonitoringError> {
        let active = self.store.active_alerts().await?;
        let mut registry = self.registry.write().await;
        *registry = AlertRegistry::from_alerts(active);
        Ok(registry.len())
    }

    #[instrument(skip(self, batch))]
    pub async fn evaluate(&self, batch: &EvaluationBatch) -> Result<Vec<AlertTransition>, MonitoringError> {
        let mut registry = self.registry.write().await;
        let (next, transitions) = evaluate(&registry, batch, &self.thresholds, Utc::now());

        if !transitions.is_empty() {
            let changed = transitions.iter().map(|t| t.alert.clone()).collect();
            self.store.upsert_alerts(changed).await?;
        }
        *registry = next;
        drop(registry);

        for transition in &transitions {
            log_transition(transition);
        }
        Ok(transitions)
    }

    #[instrument(skip(self))]
    pub async fn acknowledge(&self, alert_id: &str) -> Result<Alert, MonitoringError> {
        let mut registry = self.registry.write().await;
        let key = registry
            .active
            .iter()
            .find(|(_, alert)| alert.id == alert_id)
            .map(|(key, _)| key.clone())
            .ok_or_else(|| MonitoringError::NotFound(format!("no active alert {}", alert_id)))?;

        let mut alert = registry.active[&key].clone();
        if alert.acknowledged {
            return Ok(alert);
        }
        alert.acknowledged = true;
        self.store.upsert_alerts(vec![alert.clone()]).await?;
        registry.active.insert(key, alert.clone());

        info!(alert_id = %alert.id, component = %alert.component, "alert acknowledged");
        Ok(alert)
    }

    pub async fn active_alerts(&self) -> Vec<Alert> {
        let registry = self.registry.read().await;
        registry.alerts().cloned().collect()
    }

    pub async fn get_alert_summary(&self) -> HashMap<String, u32> {
        let registry = self.registry.read().await;
        let mut summary = HashMap::new();
        for alert in registry.alerts() {
            *summary.entry(alert.severity.as_str().to_string()).or_insert(0) += 1;
        }
        summary
    }
}

fn log_transition(transition: &AlertTransition) {
    let alert = &transition.alert;
    match (transition.kind, alert.severity) {
        (AlertTransitionKind::Resolved, _) => {
            info!(alert_id = %alert.id, condition_key = %alert.condition_key, "alert resolved: {}", alert.message);
        }
        (_, AlertSeverity::Critical) => {
            error!(
                alert_id = %alert.id,
                condition_key = %alert.condition_key,
                metric = %alert.metric,
                value = %alert.metric_value,
                threshold = %alert.threshold,
                "CRITICAL ALERT {:?}: {}", transition.kind, alert.message
            );
        }
        (_, AlertSeverity::Warning) => {
            warn!(
                alert_id = %alert.id,
                condition_key = %alert.condition_key,
                value = %alert.metric_value,
                "WARNING ALERT {:?}: {}", transition.kind, alert.message
            );
        }
        (_, AlertSeverity::Info) => {
            info!(alert_id = %alert.id, "INFO ALERT {:?}: {}", transition.kind, alert.message);
        }
    }
}
