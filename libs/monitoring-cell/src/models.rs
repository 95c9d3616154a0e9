// =====================================================================================
// MONITORING CELL MODELS
// =====================================================================================

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shared_config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "Healthy",
            HealthStatus::Warning => "Warning",
            HealthStatus::Critical => "Critical",
            HealthStatus::Unknown => "Unknown",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Healthy" => Some(HealthStatus::Healthy),
            "Warning" => Some(HealthStatus::Warning),
            "Critical" => Some(HealthStatus::Critical),
            "Unknown" => Some(HealthStatus::Unknown),
            _ => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Warning)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub component: String,
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: u64,
    pub details: HashMap<String, serde_json::Value>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub collection: String,
    pub total_records: u64,
    pub valid_records: u64,
    pub invalid_records: u64,
    pub duplicate_records: u64,
    pub missing_fields: Vec<String>,
    pub quality_score: f64,
    pub sampled: bool,
    pub issues: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ConsistencyReport {
    /// Builds a report from reconciled counts. `valid` is clamped to `total`.
    pub fn from_counts(collection: &str, total: u64, valid: u64, timestamp: DateTime<Utc>) -> Self {
        let valid = valid.min(total);
        let invalid = total - valid;
        let mut issues = Vec::new();
        if invalid > 0 {
            issues.push(invalid_records_issue(collection, invalid, total, &[]));
        }
        Self {
            collection: collection.to_string(),
            total_records: total,
            valid_records: valid,
            invalid_records: invalid,
            duplicate_records: 0,
            missing_fields: Vec::new(),
            quality_score: quality_score(valid, total),
            sampled: false,
            issues,
            timestamp,
        }
    }
}

/// The single issue line summarizing invalid records, with an optional breakdown.
pub fn invalid_records_issue(collection: &str, invalid: u64, total: u64, breakdown: &[String]) -> String {
    let mut line = format!("{}: {} invalid records out of {}", collection, invalid, total);
    if !breakdown.is_empty() {
        line.push_str(&format!(" ({})", breakdown.join("; ")));
    }
    line
}

/// Fraction of valid records rounded to four places; an empty collection scores 1.0.
pub fn quality_score(valid: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    let ratio = valid.min(total) as f64 / total as f64;
    ((ratio * 10_000.0).round() / 10_000.0).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "Info",
            AlertSeverity::Warning => "Warning",
            AlertSeverity::Critical => "Critical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Info" => Some(AlertSeverity::Info),
            "Warning" => Some(AlertSeverity::Warning),
            "Critical" => Some(AlertSeverity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub severity: AlertSeverity,
    pub component: String,
    pub metric: String,
    pub rule: String,
    pub condition_key: String,
    pub message: String,
    pub metric_value: f64,
    pub threshold: f64,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn is_active(&self) -> bool {
        !self.resolved
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertTransitionKind {
    Opened,
    SeverityChanged,
    Acknowledged,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertTransition {
    pub kind: AlertTransitionKind,
    pub alert: Alert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "Full",
            BackupKind::Incremental => "Incremental",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Full" => Some(BackupKind::Full),
            "Incremental" => Some(BackupKind::Incremental),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupStatus {
    Success,
    Failed,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Success => "Success",
            BackupStatus::Failed => "Failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Success" => Some(BackupStatus::Success),
            "Failed" => Some(BackupStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub system: String,
    pub kind: BackupKind,
    pub path: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub status: BackupStatus,
    pub created_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub cpu_usage_percentage: f64,
    pub memory_usage_percentage: f64,
    pub disk_usage_percentage: f64,
    pub average_cycle_time_ms: f64,
    pub p95_cycle_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cadence {
    Health,
    Consistency,
    Backup,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Health => "health",
            Cadence::Consistency => "consistency",
            Cadence::Backup => "backup",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleCounters {
    pub runs: u64,
    pub failures: u64,
    pub last_started: Option<DateTime<Utc>>,
    pub last_completed: Option<DateTime<Utc>>,
}

/// Everything the alert engine looks at in one evaluation.
#[derive(Debug, Clone, Default)]
pub struct EvaluationBatch {
    pub health: Vec<HealthRecord>,
    pub consistency: Vec<ConsistencyReport>,
    /// Collection labels whose validation could not run this cycle.
    pub consistency_failures: Vec<String>,
    pub backups: Vec<BackupRecord>,
    pub performance: Option<PerformanceMetrics>,
}

// Request/Response models
#[derive(Debug, Serialize)]
pub struct Snapshot<T> {
    pub data: T,
    pub stale: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub cycles: HashMap<String, CycleCounters>,
    pub active_alerts: Vec<Alert>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerBackupRequest {
    pub system: String,
    pub kind: Option<BackupKind>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PruneBackupsRequest {
    pub system: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PruneBackupsResponse {
    pub system: String,
    pub pruned: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupsQuery {
    pub system: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RestoreBackupRequest {
    pub backup_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcknowledgeAlertRequest {
    pub alert_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AlertsQuery {
    pub include_resolved: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum MonitoringError {
    #[error("Adapter {component} timed out after {timeout_ms}ms")]
    AdapterTimeout { component: String, timeout_ms: u64 },
    #[error("Adapter error: {0}")]
    AdapterError(String),
    #[error("Adapter unreachable: {0}")]
    AdapterUnreachable(String),
    #[error("Consistency mismatch in {collection}: {reason}")]
    ConsistencyMismatch { collection: String, reason: String },
    #[error("Checksum mismatch for backup {backup_id}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        backup_id: String,
        expected: String,
        actual: String,
    },
    #[error("Backup I/O failure: {0}")]
    BackupIoFailure(String),
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(#[from] ConfigError),
    #[error("Notifier failure: {0}")]
    NotifierFailure(String),
    #[error("Metrics store error: {0}")]
    Storage(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl From<rusqlite::Error> for MonitoringError {
    fn from(error: rusqlite::Error) -> Self {
        MonitoringError::Storage(error.to_string())
    }
}

impl From<std::io::Error> for MonitoringError {
    fn from(error: std::io::Error) -> Self {
        MonitoringError::BackupIoFailure(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_collection_scores_one() {
        assert_eq!(quality_score(0, 0), 1.0);
        let report = ConsistencyReport::from_counts("empty", 0, 0, Utc::now());
        assert_eq!(report.quality_score, 1.0);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn report_from_counts_matches_reference_collection() {
        let report = ConsistencyReport::from_counts("wig80_historical", 32120, 32095, Utc::now());

        assert_eq!(report.quality_score, 0.9992);
        assert_eq!(report.invalid_records, 25);
        assert_eq!(report.valid_records + report.invalid_records, report.total_records);
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].contains("25 invalid records"));
    }

    #[test]
    fn valid_count_is_clamped_to_total() {
        let report = ConsistencyReport::from_counts("odd", 10, 12, Utc::now());
        assert_eq!(report.valid_records, 10);
        assert_eq!(report.invalid_records, 0);
        assert_eq!(report.quality_score, 1.0);
    }
}
