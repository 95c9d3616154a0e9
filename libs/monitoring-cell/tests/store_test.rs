// =====================================================================================
// METRICS STORE TESTS
// =====================================================================================

use std::collections::HashMap;

use chrono::Utc;

use monitoring_cell::models::{
    Alert, AlertSeverity, BackupKind, BackupRecord, BackupStatus, Cadence, ConsistencyReport, HealthRecord,
    HealthStatus,
};
use monitoring_cell::models::MonitoringError;
use monitoring_cell::MetricsStore;

fn health(component: &str, status: HealthStatus) -> HealthRecord {
    HealthRecord {
        component: component.to_string(),
        status,
        timestamp: Utc::now(),
        response_time_ms: 12,
        details: HashMap::new(),
        error_message: None,
    }
}

fn backup(id: &str, system: &str) -> BackupRecord {
    BackupRecord {
        id: id.to_string(),
        system: system.to_string(),
        kind: BackupKind::Full,
        path: format!("/var/backups/{}.jsonl.zst", id),
        size_bytes: 2048,
        checksum: "ab".repeat(32),
        status: BackupStatus::Success,
        created_at: Utc::now(),
        error_message: None,
    }
}

fn alert(id: &str) -> Alert {
    Alert {
        id: id.to_string(),
        severity: AlertSeverity::Warning,
        component: "prices".to_string(),
        metric: "quality_score".to_string(),
        rule: "data_quality_score_min".to_string(),
        condition_key: "0123456789abcdef".to_string(),
        message: "quality_score 0.9 below 0.95".to_string(),
        metric_value: 0.9,
        threshold: 0.95,
        created_at: Utc::now(),
        acknowledged: false,
        resolved: false,
        resolved_at: None,
    }
}

#[tokio::test]
async fn test_concurrent_writers_lose_nothing() {
    let store = MetricsStore::open_in_memory().unwrap();
    let mut handles = Vec::new();

    for i in 0..20 {
        let reports = store.clone();
        handles.push(tokio::spawn(async move {
            let report = ConsistencyReport::from_counts(&format!("collection_{:02}", i), 100, 99, Utc::now());
            reports.append_consistency_reports(vec![report]).await.unwrap();
        }));
        let backups = store.clone();
        handles.push(tokio::spawn(async move {
            backups.append_backup(backup(&format!("backup-{}", i), "warehouse")).await.unwrap();
        }));
        let cycles = store.clone();
        handles.push(tokio::spawn(async move {
            let now = Utc::now();
            cycles.record_cycle(Cadence::Health, now, now, None).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(store.latest_consistency().await.unwrap().len(), 20);
    assert_eq!(store.backups(None).await.unwrap().len(), 20);
    assert_eq!(store.cycle_totals().await.unwrap().get("health"), Some(&(20, 0)));
}

#[tokio::test]
async fn test_latest_health_returns_newest_batch_in_order() {
    let store = MetricsStore::open_in_memory().unwrap();

    store
        .append_health_batch(vec![health("warehouse", HealthStatus::Critical)])
        .await
        .unwrap();
    store
        .append_health_batch(vec![
            health("warehouse", HealthStatus::Healthy),
            health("replica", HealthStatus::Warning),
        ])
        .await
        .unwrap();

    let latest = store.latest_health().await.unwrap();
    assert_eq!(latest.len(), 2);
    assert_eq!(latest[0].component, "warehouse");
    assert_eq!(latest[0].status, HealthStatus::Healthy);
    assert_eq!(latest[1].status, HealthStatus::Warning);
}

#[tokio::test]
async fn test_latest_consistency_is_per_collection() {
    let store = MetricsStore::open_in_memory().unwrap();
    store
        .append_consistency_reports(vec![
            ConsistencyReport::from_counts("prices", 100, 90, Utc::now()),
            ConsistencyReport::from_counts("orders", 10, 10, Utc::now()),
        ])
        .await
        .unwrap();
    store
        .append_consistency_reports(vec![ConsistencyReport::from_counts("prices", 100, 100, Utc::now())])
        .await
        .unwrap();

    let latest = store.latest_consistency().await.unwrap();
    assert_eq!(latest.len(), 2);
    assert_eq!(latest[0].collection, "orders");
    assert_eq!(latest[1].collection, "prices");
    assert_eq!(latest[1].quality_score, 1.0);
}

#[tokio::test]
async fn test_alert_transitions_update_in_place() {
    let store = MetricsStore::open_in_memory().unwrap();
    let mut open = alert("alert-1");
    store.upsert_alerts(vec![open.clone()]).await.unwrap();

    open.severity = AlertSeverity::Critical;
    open.acknowledged = true;
    store.upsert_alerts(vec![open.clone()]).await.unwrap();

    let active = store.active_alerts().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].severity, AlertSeverity::Critical);
    assert!(active[0].acknowledged);

    open.resolved = true;
    open.resolved_at = Some(Utc::now());
    store.upsert_alerts(vec![open]).await.unwrap();

    assert!(store.active_alerts().await.unwrap().is_empty());
    let all = store.alerts(true).await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].resolved);
    assert!(all[0].resolved_at.is_some());
}

#[tokio::test]
async fn test_pruned_backups_are_hidden_but_kept() {
    let store = MetricsStore::open_in_memory().unwrap();
    store.append_backup(backup("old", "warehouse")).await.unwrap();
    store.append_backup(backup("new", "warehouse")).await.unwrap();
    store.append_backup(backup("other", "replica")).await.unwrap();

    store.mark_backups_pruned(vec!["old".to_string()]).await.unwrap();

    let listed = store.backups(Some("warehouse".to_string())).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "new");
    assert!(store.get_backup("old").await.unwrap().is_some());
    assert!(store.get_backup("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn test_file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("monitoring.db");

    {
        let store = MetricsStore::open(&path).unwrap();
        store.upsert_alerts(vec![alert("alert-1")]).await.unwrap();
        let now = Utc::now();
        store
            .record_cycle(Cadence::Backup, now, now, Some("volume offline".to_string()))
            .await
            .unwrap();
    }

    let reopened = MetricsStore::open(&path).unwrap();
    assert_eq!(reopened.active_alerts().await.unwrap().len(), 1);
    assert_eq!(reopened.cycle_totals().await.unwrap().get("backup"), Some(&(1, 1)));
}

#[tokio::test]
async fn test_corrupt_alert_severity_is_a_storage_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("monitoring.db");

    let store = MetricsStore::open(&path).unwrap();
    store.upsert_alerts(vec![alert("alert-1")]).await.unwrap();

    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute("UPDATE alerts SET severity = 'Catastrophic' WHERE id = 'alert-1'", [])
        .unwrap();
    drop(conn);

    let result = store.active_alerts().await;
    assert!(matches!(result, Err(MonitoringError::Storage(_))));
}
