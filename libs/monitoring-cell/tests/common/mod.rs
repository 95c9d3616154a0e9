// =====================================================================================
// SHARED TEST FIXTURES
// =====================================================================================

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use monitoring_cell::adapters::AdapterHealth;
use monitoring_cell::models::{Alert, BackupKind, MonitoringError};
use monitoring_cell::{DataSourceAdapter, Notifier, Record};
use shared_config::{CollectionConfig, MonitorConfig, RetentionPolicy};

#[derive(Debug, Clone)]
pub enum MockFailure {
    Error(String),
    Unreachable(String),
}

/// In-memory adapter with configurable latency, failures, records and snapshot bytes.
pub struct MockAdapter {
    name: String,
    latency: Duration,
    failure: Mutex<Option<MockFailure>>,
    collections: HashMap<String, Vec<Record>>,
    snapshot: Option<Vec<u8>>,
    health_calls: AtomicUsize,
}

impl MockAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            latency: Duration::ZERO,
            failure: Mutex::new(None),
            collections: HashMap::new(),
            snapshot: None,
            health_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn failing(self, message: &str) -> Self {
        self.set_failure(Some(MockFailure::Error(message.to_string())));
        self
    }

    pub fn unreachable(self) -> Self {
        self.set_failure(Some(MockFailure::Unreachable(format!("{} refused connection", self.name))));
        self
    }

    pub fn with_records(mut self, collection: &str, records: Vec<Record>) -> Self {
        self.collections.insert(collection.to_string(), records);
        self
    }

    pub fn with_snapshot(mut self, bytes: &[u8]) -> Self {
        self.snapshot = Some(bytes.to_vec());
        self
    }

    pub fn set_failure(&self, failure: Option<MockFailure>) {
        *self.failure.lock().unwrap() = failure;
    }

    pub fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> Result<(), MonitoringError> {
        match self.failure.lock().unwrap().clone() {
            None => Ok(()),
            Some(MockFailure::Error(message)) => Err(MonitoringError::AdapterError(message)),
            Some(MockFailure::Unreachable(message)) => Err(MonitoringError::AdapterUnreachable(message)),
        }
    }
}

#[async_trait]
impl DataSourceAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check_health(&self, _timeout: Duration) -> Result<AdapterHealth, MonitoringError> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.check_failure()?;
        Ok(AdapterHealth {
            details: HashMap::from([("engine".to_string(), Value::String("mock".to_string()))]),
        })
    }

    async fn count_records(&self, collection: &str) -> Result<u64, MonitoringError> {
        self.check_failure()?;
        Ok(self.collections.get(collection).map_or(0, |r| r.len() as u64))
    }

    async fn sample_records(&self, collection: &str, limit: u64) -> Result<Vec<Record>, MonitoringError> {
        self.check_failure()?;
        Ok(self
            .collections
            .get(collection)
            .map(|records| records.iter().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn snapshot(&self, _kind: BackupKind) -> Result<Vec<u8>, MonitoringError> {
        self.check_failure()?;
        self.snapshot
            .clone()
            .ok_or_else(|| MonitoringError::AdapterError(format!("{} has no snapshot", self.name)))
    }
}

/// Keeps every alert it is handed.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Alert> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, alert: &Alert) -> Result<(), MonitoringError> {
        self.sent.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Rejects every delivery.
#[derive(Default)]
pub struct FailingNotifier {
    attempts: AtomicUsize,
}

impl FailingNotifier {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for FailingNotifier {
    async fn send(&self, _alert: &Alert) -> Result<(), MonitoringError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(MonitoringError::NotifierFailure("smtp relay unavailable".to_string()))
    }
}

pub fn record(value: Value) -> Record {
    value.as_object().cloned().expect("test records are JSON objects")
}

pub fn prices_collection() -> CollectionConfig {
    CollectionConfig {
        name: "prices".to_string(),
        primary_key: "id".to_string(),
        required_fields: vec!["symbol".to_string(), "close".to_string()],
    }
}

pub fn price_rows(count: u64) -> Vec<Record> {
    (0..count)
        .map(|id| {
            record(serde_json::json!({
                "id": id,
                "symbol": format!("SYM{}", id % 80),
                "close": 100.0 + id as f64 / 4.0,
            }))
        })
        .collect()
}

pub fn test_config(dir: &Path) -> MonitorConfig {
    MonitorConfig {
        backup_dir: dir.join("backups"),
        database_path: dir.join("monitoring.db"),
        collections: vec![prices_collection()],
        health_interval: Duration::from_millis(50),
        consistency_interval: Duration::from_millis(50),
        backup_interval: Duration::from_secs(3600),
        check_timeout: Duration::from_millis(500),
        backup_timeout: Duration::from_secs(10),
        shutdown_grace: Duration::from_millis(50),
        retention: RetentionPolicy {
            max_count: 2,
            max_age: Duration::from_secs(30 * 24 * 3600),
        },
        ..MonitorConfig::default()
    }
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn shared(adapter: MockAdapter) -> Arc<MockAdapter> {
    Arc::new(adapter)
}
