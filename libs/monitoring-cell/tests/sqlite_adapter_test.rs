// =====================================================================================
// SQLITE SOURCE ADAPTER TESTS
// =====================================================================================

mod common;

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use rusqlite::{params, Connection};

use common::prices_collection;
use monitoring_cell::models::{BackupKind, MonitoringError};
use monitoring_cell::{ConsistencyValidator, DataSourceAdapter, HealthChecker, HealthStatus, SqliteSourceAdapter};

fn seed(path: &Path, rows: u64, skew_id: Option<u64>) {
    seed_range(path, 0..rows, |id| if Some(id) == skew_id { -1.0 } else { 50.0 + id as f64 });
}

fn seed_range(path: &Path, ids: Range<u64>, close: impl Fn(u64) -> f64) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch("CREATE TABLE prices (id INTEGER PRIMARY KEY, symbol TEXT, close REAL);")
        .unwrap();
    for id in ids {
        let close = close(id);
        conn.execute(
            "INSERT INTO prices (id, symbol, close) VALUES (?1, ?2, ?3)",
            params![id as i64, format!("SYM{}", id), close],
        )
        .unwrap();
    }
}

fn adapter(name: &str, path: &Path) -> SqliteSourceAdapter {
    SqliteSourceAdapter::new(name, path, vec![prices_collection()])
}

#[tokio::test]
async fn test_health_count_and_sample() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("warehouse.db");
    seed(&path, 40, None);
    let source = adapter("warehouse", &path);

    let health = source.check_health(Duration::from_secs(1)).await.unwrap();
    assert_eq!(health.details["engine"], "sqlite");

    assert_eq!(source.count_records("prices").await.unwrap(), 40);

    let sample = source.sample_records("prices", 10).await.unwrap();
    assert_eq!(sample.len(), 10);
    assert_eq!(sample[0]["id"], 0);
    assert_eq!(sample[1]["id"], 4);
    assert!(sample.iter().all(|r| !r.contains_key("__sample_rn")));

    let all = source.sample_records("prices", 100).await.unwrap();
    assert_eq!(all.len(), 40);
}

#[tokio::test]
async fn test_missing_database_is_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let source = adapter("ghost", &dir.path().join("absent.db"));

    assert_matches!(
        source.check_health(Duration::from_secs(1)).await,
        Err(MonitoringError::AdapterUnreachable(_))
    );

    let adapters: Vec<Arc<dyn DataSourceAdapter>> = vec![Arc::new(source)];
    let records = HealthChecker::with_thresholds(Duration::from_millis(1000), Duration::from_millis(5000))
        .run_all(&adapters, Duration::from_secs(1))
        .await;
    assert_eq!(records[0].status, HealthStatus::Unknown);
}

#[tokio::test]
async fn test_unknown_table_is_adapter_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("warehouse.db");
    seed(&path, 1, None);

    assert_matches!(
        adapter("warehouse", &path).count_records("orders").await,
        Err(MonitoringError::AdapterError(_))
    );
}

#[tokio::test]
async fn test_snapshot_dumps_configured_collections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("warehouse.db");
    seed(&path, 3, None);

    let bytes = adapter("warehouse", &path).snapshot(BackupKind::Full).await.unwrap();
    let lines: Vec<serde_json::Value> = String::from_utf8(bytes)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0]["system"], "warehouse");
    assert_eq!(lines[0]["kind"], "Full");
    assert_eq!(lines[1]["collection"], "prices");
    assert_eq!(lines[3]["row"]["symbol"], "SYM2");
}

#[tokio::test]
async fn test_validator_across_two_databases() {
    let dir = tempfile::tempdir().unwrap();
    let primary_path = dir.path().join("primary.db");
    let mirror_path = dir.path().join("mirror.db");
    seed(&primary_path, 20, None);
    seed(&mirror_path, 20, Some(7));

    let report = ConsistencyValidator::with_limits(1000, 1e-6)
        .validate(
            &prices_collection(),
            &adapter("primary", &primary_path),
            &adapter("mirror", &mirror_path),
        )
        .await
        .unwrap();

    assert_eq!(report.total_records, 20);
    assert_eq!(report.invalid_records, 1);
    assert_eq!(report.quality_score, 0.95);
    assert!(report.issues.iter().any(|i| i.contains("close divergent in 1")));
}

#[tokio::test]
async fn test_sampled_validation_survives_shifted_rows() {
    let dir = tempfile::tempdir().unwrap();
    let primary_path = dir.path().join("primary.db");
    let replica_path = dir.path().join("replica.db");
    seed_range(&primary_path, 0..200, |id| 50.0 + id as f64);
    seed_range(&replica_path, 1..201, |_| -1.0);

    let report = ConsistencyValidator::with_limits(100, 1e-6)
        .validate(
            &prices_collection(),
            &adapter("primary", &primary_path),
            &adapter("replica", &replica_path),
        )
        .await
        .unwrap();

    assert!(report.sampled);
    assert_eq!(report.total_records, 100);
    assert_eq!(report.valid_records, 0);
    assert_eq!(report.quality_score, 0.0);
    assert_eq!(
        report.issues[1],
        "prices: 100 invalid records out of 100 (1 missing in replica; close divergent in 99)"
    );
}

#[tokio::test]
async fn test_fetch_records_by_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("warehouse.db");
    seed(&path, 10, None);

    let keys = vec![serde_json::json!(3), serde_json::json!(7), serde_json::json!(42)];
    let records = adapter("warehouse", &path)
        .fetch_records("prices", "id", &keys)
        .await
        .unwrap();

    let mut ids: Vec<i64> = records.iter().filter_map(|r| r["id"].as_i64()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![3, 7]);
}
