use std::collections::{BTreeMap, HashSet};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

// =====================================================================================
// THRESHOLDS
// =====================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    GreaterThan,
    LessThan,
}

impl Comparator {
    pub fn violates(&self, value: f64, limit: f64) -> bool {
        match self {
            Comparator::GreaterThan => value > limit,
            Comparator::LessThan => value < limit,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::GreaterThan => "gt",
            Comparator::LessThan => "lt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ViolationLevel {
    Warning,
    Critical,
}

/// One metric limit. `warning` opens the alert, `critical` (when set) escalates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub metric: String,
    pub comparator: Comparator,
    pub warning: f64,
    pub critical: Option<f64>,
}

impl ThresholdRule {
    pub fn new(metric: &str, comparator: Comparator, warning: f64, critical: Option<f64>) -> Self {
        Self {
            metric: metric.to_string(),
            comparator,
            warning,
            critical,
        }
    }

    pub fn level_for(&self, value: f64) -> Option<ViolationLevel> {
        if !self.comparator.violates(value, self.warning) {
            return None;
        }
        match self.critical {
            Some(limit) if self.comparator.violates(value, limit) => Some(ViolationLevel::Critical),
            _ => Some(ViolationLevel::Warning),
        }
    }
}

/// Named threshold rules, keyed by rule name (e.g. `data_quality_score_min`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub rules: BTreeMap<String, ThresholdRule>,
}

impl ThresholdConfig {
    pub fn rules_for_metric<'a>(&'a self, metric: &'a str) -> impl Iterator<Item = (&'a str, &'a ThresholdRule)> + 'a {
        self.rules
            .iter()
            .filter(move |(_, rule)| rule.metric == metric)
            .map(|(name, rule)| (name.as_str(), rule))
    }

    pub fn get(&self, name: &str) -> Option<&ThresholdRule> {
        self.rules.get(name)
    }

    fn with_limits(
        quality_min: f64,
        (response_max_ms, response_critical_ms): (f64, f64),
        cpu_max: f64,
        memory_max: f64,
        disk_max: f64,
    ) -> Self {
        let rules = BTreeMap::from([
            (
                "data_quality_score_min".to_string(),
                ThresholdRule::new("quality_score", Comparator::LessThan, quality_min, Some(quality_min / 2.0)),
            ),
            (
                "response_time_max".to_string(),
                ThresholdRule::new(
                    "response_time_ms",
                    Comparator::GreaterThan,
                    response_max_ms,
                    Some(response_critical_ms.max(response_max_ms)),
                ),
            ),
            (
                "component_unavailable_max".to_string(),
                ThresholdRule::new("unavailable", Comparator::GreaterThan, 0.0, Some(0.0)),
            ),
            (
                "consistency_check_failures_max".to_string(),
                ThresholdRule::new("consistency_check_failed", Comparator::GreaterThan, 0.0, Some(0.0)),
            ),
            (
                "backup_failures_max".to_string(),
                ThresholdRule::new("backup_failed", Comparator::GreaterThan, 0.0, Some(0.0)),
            ),
            (
                "cpu_usage_max".to_string(),
                ThresholdRule::new("cpu_usage_percentage", Comparator::GreaterThan, cpu_max, Some(95.0_f64.max(cpu_max))),
            ),
            (
                "memory_usage_max".to_string(),
                ThresholdRule::new("memory_usage_percentage", Comparator::GreaterThan, memory_max, Some(95.0_f64.max(memory_max))),
            ),
            (
                "disk_usage_max".to_string(),
                ThresholdRule::new("disk_usage_percentage", Comparator::GreaterThan, disk_max, Some(97.0_f64.max(disk_max))),
            ),
        ]);
        Self { rules }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self::with_limits(0.95, (1000.0, 5000.0), 80.0, 85.0, 90.0)
    }
}

// =====================================================================================
// SOURCES, COLLECTIONS, RETENTION
// =====================================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub name: String,
    pub primary_key: String,
    pub required_fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_count: usize,
    pub max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_count: 7,
            max_age: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

// =====================================================================================
// MONITOR CONFIG
// =====================================================================================

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub bind_addr: SocketAddr,
    pub database_path: PathBuf,
    pub backup_dir: PathBuf,
    pub sources: Vec<SourceConfig>,
    pub collections: Vec<CollectionConfig>,
    pub health_interval: Duration,
    pub consistency_interval: Duration,
    pub backup_interval: Duration,
    pub check_timeout: Duration,
    pub backup_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_concurrent_checks: Option<usize>,
    pub response_warning: Duration,
    pub response_critical: Duration,
    pub sample_ceiling: u64,
    pub numeric_tolerance: f64,
    pub retention: RetentionPolicy,
    pub thresholds: ThresholdConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            database_path: PathBuf::from("monitoring.db"),
            backup_dir: PathBuf::from("backups"),
            sources: Vec::new(),
            collections: Vec::new(),
            health_interval: Duration::from_secs(30),
            consistency_interval: Duration::from_secs(300),
            backup_interval: Duration::from_secs(86_400),
            check_timeout: Duration::from_millis(5000),
            backup_timeout: Duration::from_secs(600),
            shutdown_grace: Duration::from_millis(2000),
            max_concurrent_checks: None,
            response_warning: Duration::from_millis(1000),
            response_critical: Duration::from_millis(5000),
            sample_ceiling: 10_000,
            numeric_tolerance: 1e-6,
            retention: RetentionPolicy::default(),
            thresholds: ThresholdConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, falling back to defaults for unset keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let sources = match lookup("MONITOR_SOURCES") {
            Some(raw) => parse_sources(&raw)?,
            None => {
                warn!("MONITOR_SOURCES not set, no data sources will be monitored");
                Vec::new()
            }
        };
        let collections = match lookup("MONITOR_COLLECTIONS") {
            Some(raw) => parse_collections(&raw)?,
            None => Vec::new(),
        };

        let quality_min = parse_or(&lookup, "MONITOR_QUALITY_MIN", 0.95)?;
        let response_max_ms = parse_or(&lookup, "MONITOR_RESPONSE_TIME_MAX_MS", 1000.0)?;
        let cpu_max = parse_or(&lookup, "MONITOR_CPU_MAX", 80.0)?;
        let memory_max = parse_or(&lookup, "MONITOR_MEMORY_MAX", 85.0)?;
        let disk_max = parse_or(&lookup, "MONITOR_DISK_MAX", 90.0)?;
        let response_critical = millis_or(&lookup, "MONITOR_RESPONSE_CRITICAL_MS", defaults.response_critical)?;
        let retention_days: u64 = parse_or(&lookup, "MONITOR_RETENTION_MAX_AGE_DAYS", 30)?;
        let retention_secs = retention_days
            .checked_mul(24 * 3600)
            .ok_or_else(|| ConfigError::invalid("MONITOR_RETENTION_MAX_AGE_DAYS", "is too large"))?;

        if !(quality_min > 0.0 && quality_min <= 1.0) {
            return Err(ConfigError::invalid("MONITOR_QUALITY_MIN", "must be in (0, 1]"));
        }
        for (key, value) in [
            ("MONITOR_CPU_MAX", cpu_max),
            ("MONITOR_MEMORY_MAX", memory_max),
            ("MONITOR_DISK_MAX", disk_max),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::invalid(key, "must be a percentage"));
            }
        }

        let config = Self {
            bind_addr: parse_or(&lookup, "MONITOR_BIND_ADDR", defaults.bind_addr)?,
            database_path: lookup("MONITOR_DB_PATH").map(PathBuf::from).unwrap_or(defaults.database_path),
            backup_dir: lookup("MONITOR_BACKUP_DIR").map(PathBuf::from).unwrap_or(defaults.backup_dir),
            health_interval: secs_or(&lookup, "MONITOR_HEALTH_INTERVAL_SECS", defaults.health_interval)?,
            consistency_interval: secs_or(&lookup, "MONITOR_CONSISTENCY_INTERVAL_SECS", defaults.consistency_interval)?,
            backup_interval: secs_or(&lookup, "MONITOR_BACKUP_INTERVAL_SECS", defaults.backup_interval)?,
            check_timeout: millis_or(&lookup, "MONITOR_CHECK_TIMEOUT_MS", defaults.check_timeout)?,
            backup_timeout: secs_or(&lookup, "MONITOR_BACKUP_TIMEOUT_SECS", defaults.backup_timeout)?,
            shutdown_grace: millis_or(&lookup, "MONITOR_SHUTDOWN_GRACE_MS", defaults.shutdown_grace)?,
            max_concurrent_checks: match lookup("MONITOR_MAX_CONCURRENT_CHECKS") {
                Some(raw) => Some(parse_value::<usize>("MONITOR_MAX_CONCURRENT_CHECKS", &raw)?),
                None => None,
            },
            response_warning: millis_or(&lookup, "MONITOR_RESPONSE_WARNING_MS", defaults.response_warning)?,
            response_critical,
            sample_ceiling: parse_or(&lookup, "MONITOR_SAMPLE_CEILING", defaults.sample_ceiling)?,
            numeric_tolerance: parse_or(&lookup, "MONITOR_NUMERIC_TOLERANCE", defaults.numeric_tolerance)?,
            retention: RetentionPolicy {
                max_count: parse_or(&lookup, "MONITOR_RETENTION_MAX_COUNT", defaults.retention.max_count)?,
                max_age: Duration::from_secs(retention_secs),
            },
            thresholds: ThresholdConfig::with_limits(
                quality_min,
                (response_max_ms, response_critical.as_millis() as f64),
                cpu_max,
                memory_max,
                disk_max,
            ),
            sources,
            collections,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("MONITOR_HEALTH_INTERVAL_SECS", self.health_interval),
            ("MONITOR_CONSISTENCY_INTERVAL_SECS", self.consistency_interval),
            ("MONITOR_BACKUP_INTERVAL_SECS", self.backup_interval),
            ("MONITOR_CHECK_TIMEOUT_MS", self.check_timeout),
            ("MONITOR_BACKUP_TIMEOUT_SECS", self.backup_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }
        if self.response_warning >= self.response_critical {
            return Err(ConfigError::Inconsistent(
                "response warning threshold must be below the critical threshold".to_string(),
            ));
        }
        if self.max_concurrent_checks == Some(0) {
            return Err(ConfigError::invalid("MONITOR_MAX_CONCURRENT_CHECKS", "must be at least 1"));
        }
        if self.sample_ceiling == 0 {
            return Err(ConfigError::invalid("MONITOR_SAMPLE_CEILING", "must be at least 1"));
        }
        if self.numeric_tolerance.is_nan() || self.numeric_tolerance < 0.0 {
            return Err(ConfigError::invalid("MONITOR_NUMERIC_TOLERANCE", "must be non-negative"));
        }
        if self.retention.max_count == 0 {
            return Err(ConfigError::invalid("MONITOR_RETENTION_MAX_COUNT", "must be at least 1"));
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.name.as_str()) {
                return Err(ConfigError::Inconsistent(format!("duplicate source name '{}'", source.name)));
            }
        }
        Ok(())
    }

    /// Concurrency cap for health checks; defaults to one slot per adapter.
    pub fn check_concurrency(&self, adapter_count: usize) -> usize {
        self.max_concurrent_checks.unwrap_or(adapter_count).max(1)
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ConfigError::invalid(key, format!("cannot parse '{}'", raw)))
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn secs_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(match lookup(key) {
        Some(raw) => Duration::from_secs(parse_value(key, &raw)?),
        None => default,
    })
}

fn millis_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(match lookup(key) {
        Some(raw) => Duration::from_millis(parse_value(key, &raw)?),
        None => default,
    })
}

/// `name=path,name2=path2`
fn parse_sources(raw: &str) -> Result<Vec<SourceConfig>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, path) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::invalid("MONITOR_SOURCES", format!("expected name=path, got '{}'", entry)))?;
            let (name, path) = (name.trim(), path.trim());
            if name.is_empty() || path.is_empty() {
                return Err(ConfigError::invalid("MONITOR_SOURCES", format!("empty name or path in '{}'", entry)));
            }
            Ok(SourceConfig {
                name: name.to_string(),
                path: PathBuf::from(path),
            })
        })
        .collect()
}

/// `name:primary_key:field1|field2;name2:id`
fn parse_collections(raw: &str) -> Result<Vec<CollectionConfig>, ConfigError> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(3, ':');
            let name = parts.next().unwrap_or_default().trim();
            let primary_key = parts.next().unwrap_or_default().trim();
            if name.is_empty() || primary_key.is_empty() {
                return Err(ConfigError::invalid(
                    "MONITOR_COLLECTIONS",
                    format!("collection '{}' must name a primary key", entry),
                ));
            }
            let required_fields = parts
                .next()
                .map(|fields| {
                    fields
                        .split('|')
                        .map(str::trim)
                        .filter(|f| !f.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            Ok(CollectionConfig {
                name: name.to_string(),
                primary_key: primary_key.to_string(),
                required_fields,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = MonitorConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.health_interval, Duration::from_secs(30));
        assert_eq!(config.check_timeout, Duration::from_millis(5000));
        assert_eq!(config.check_concurrency(4), 4);
        assert!(config.thresholds.get("data_quality_score_min").is_some());
    }

    #[test]
    fn parses_sources_and_collections() {
        let config = MonitorConfig::from_lookup(lookup_from(&[
            ("MONITOR_SOURCES", "primary=/data/a.db, replica=/data/b.db"),
            ("MONITOR_COLLECTIONS", "wig80_historical:id:symbol|close;news:url"),
        ]))
        .unwrap();

        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[1].name, "replica");
        assert_eq!(config.collections[0].required_fields, vec!["symbol", "close"]);
        assert!(config.collections[1].required_fields.is_empty());
    }

    #[test]
    fn rejects_malformed_values() {
        let result = MonitorConfig::from_lookup(lookup_from(&[("MONITOR_HEALTH_INTERVAL_SECS", "soon")]));
        assert_matches!(result, Err(ConfigError::InvalidValue { .. }));

        let result = MonitorConfig::from_lookup(lookup_from(&[("MONITOR_SOURCES", "no-separator")]));
        assert_matches!(result, Err(ConfigError::InvalidValue { .. }));

        let result = MonitorConfig::from_lookup(lookup_from(&[("MONITOR_COLLECTIONS", "prices")]));
        assert_matches!(result, Err(ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn rejects_inconsistent_values() {
        let result = MonitorConfig::from_lookup(lookup_from(&[
            ("MONITOR_RESPONSE_WARNING_MS", "6000"),
            ("MONITOR_RESPONSE_CRITICAL_MS", "5000"),
        ]));
        assert_matches!(result, Err(ConfigError::Inconsistent(_)));

        let result = MonitorConfig::from_lookup(lookup_from(&[("MONITOR_SOURCES", "a=/x.db,a=/y.db")]));
        assert_matches!(result, Err(ConfigError::Inconsistent(_)));

        let result = MonitorConfig::from_lookup(lookup_from(&[("MONITOR_CHECK_TIMEOUT_MS", "0")]));
        assert_matches!(result, Err(ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn quality_rule_escalates_below_half_the_minimum() {
        let thresholds = ThresholdConfig::default();
        let rule = thresholds.get("data_quality_score_min").unwrap();

        assert_eq!(rule.level_for(0.99), None);
        assert_eq!(rule.level_for(0.90), Some(ViolationLevel::Warning));
        assert_eq!(rule.level_for(0.40), Some(ViolationLevel::Critical));
    }

    #[test]
    fn binary_rules_are_critical_on_any_violation() {
        let thresholds = ThresholdConfig::default();
        let rule = thresholds.get("backup_failures_max").unwrap();

        assert_eq!(rule.level_for(0.0), None);
        assert_eq!(rule.level_for(1.0), Some(ViolationLevel::Critical));
    }

    #[test]
    fn response_rule_escalates_at_configured_critical() {
        let config = MonitorConfig::from_lookup(lookup_from(&[
            ("MONITOR_RESPONSE_TIME_MAX_MS", "800"),
            ("MONITOR_RESPONSE_WARNING_MS", "800"),
            ("MONITOR_RESPONSE_CRITICAL_MS", "2000"),
        ]))
        .unwrap();
        let rule = config.thresholds.get("response_time_max").unwrap();

        assert_eq!(rule.critical, Some(2000.0));
        assert_eq!(rule.level_for(1500.0), Some(ViolationLevel::Warning));
        assert_eq!(rule.level_for(2500.0), Some(ViolationLevel::Critical));
    }

    #[test]
    fn rejects_retention_age_that_overflows() {
        let result = MonitorConfig::from_lookup(lookup_from(&[(
            "MONITOR_RETENTION_MAX_AGE_DAYS",
            "18446744073709551615",
        )]));
        assert_matches!(result, Err(ConfigError::InvalidValue { ref key, .. }) if key == "MONITOR_RETENTION_MAX_AGE_DAYS");
    }
}
