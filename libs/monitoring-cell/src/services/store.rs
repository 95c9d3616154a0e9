// =====================================================================================
// METRICS STORE
// =====================================================================================
//
// Append-only SQLite history of health, consistency, performance, backup and
// alert events. The only rows ever updated are alerts (acknowledge, severity
// change, resolve). Pruned backups are recorded in `backup_prunes`, never deleted.
//

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::models::{
    Alert, AlertSeverity, BackupKind, BackupRecord, BackupStatus, Cadence, ConsistencyReport,
    HealthRecord, HealthStatus, MonitoringError, PerformanceMetrics,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS health_records (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        cycle_id         TEXT NOT NULL,
        component        TEXT NOT NULL,
        status           TEXT NOT NULL,
        timestamp        TEXT NOT NULL,
        response_time_ms INTEGER NOT NULL,
        details          TEXT NOT NULL DEFAULT '{}',
        error_message    TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_health_cycle ON health_records(cycle_id);

    CREATE TABLE IF NOT EXISTS consistency_reports (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        collection        TEXT NOT NULL,
        total_records     INTEGER NOT NULL,
        valid_records     INTEGER NOT NULL,
        invalid_records   INTEGER NOT NULL,
        duplicate_records INTEGER NOT NULL,
        missing_fields    TEXT NOT NULL DEFAULT '[]',
        quality_score     REAL NOT NULL,
        sampled           INTEGER NOT NULL DEFAULT 0,
        issues            TEXT NOT NULL DEFAULT '[]',
        timestamp         TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_consistency_collection ON consistency_reports(collection);

    CREATE TABLE IF NOT EXISTS alerts (
        id            TEXT PRIMARY KEY,
        condition_key TEXT NOT NULL,
        severity      TEXT NOT NULL,
        component     TEXT NOT NULL,
        metric        TEXT NOT NULL,
        rule          TEXT NOT NULL,
        message       TEXT NOT NULL,
        metric_value  REAL NOT NULL,
        threshold     REAL NOT NULL,
        created_at    TEXT NOT NULL,
        acknowledged  INTEGER NOT NULL DEFAULT 0,
        resolved      INTEGER NOT NULL DEFAULT 0,
        resolved_at   TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_alerts_condition ON alerts(condition_key);

    CREATE TABLE IF NOT EXISTS backup_records (
        id            TEXT PRIMARY KEY,
        system        TEXT NOT NULL,
        kind          TEXT NOT NULL,
        path          TEXT NOT NULL,
        size_bytes    INTEGER NOT NULL,
        checksum      TEXT NOT NULL,
        status        TEXT NOT NULL,
        created_at    TEXT NOT NULL,
        error_message TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_backup_system ON backup_records(system);

    CREATE TABLE IF NOT EXISTS backup_prunes (
        backup_id TEXT PRIMARY KEY,
        pruned_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS performance_metrics (
        id                      INTEGER PRIMARY KEY AUTOINCREMENT,
        cpu_usage_percentage    REAL NOT NULL,
        memory_usage_percentage REAL NOT NULL,
        disk_usage_percentage   REAL NOT NULL,
        average_cycle_time_ms   REAL NOT NULL,
        p95_cycle_time_ms       REAL NOT NULL,
        timestamp               TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS cycle_runs (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        cadence     TEXT NOT NULL,
        started_at  TEXT NOT NULL,
        finished_at TEXT NOT NULL,
        succeeded   INTEGER NOT NULL,
        error       TEXT
    );
";

#[derive(Clone)]
pub struct MetricsStore {
    conn: Arc<Mutex<Connection>>,
}

impl MetricsStore {
    pub fn open(path: &Path) -> Result<Self, MonitoringError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::initialize(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, MonitoringError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, MonitoringError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` on the connection from the blocking pool; callers are serialized.
    async fn with_conn<F, T>(&self, f: F) -> Result<T, MonitoringError>
    where
        F: FnOnce(&mut Connection) -> Result<T, MonitoringError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| MonitoringError::Storage("connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| MonitoringError::Storage(format!("store task failed: {}", e)))?
    }

    // ---------------------------------------------------------------------------------
    // Health
    // ---------------------------------------------------------------------------------

    /// Writes one cycle's records in a single transaction and returns the cycle id.
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn append_health_batch(&self, records: Vec<HealthRecord>) -> Result<String, MonitoringError> {
        let cycle_id = Uuid::new_v4().to_string();
        let id = cycle_id.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO health_records (cycle_id, component, status, timestamp, response_time_ms, details, error_message)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for record in &records {
                    stmt.execute(params![
                        id,
                        record.component,
                        record.status.as_str(),
                        record.timestamp.to_rfc3339(),
                        record.response_time_ms as i64,
                        serde_json::to_string(&record.details).unwrap_or_else(|_| "{}".to_string()),
                        record.error_message,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        debug!(cycle_id = %cycle_id, "health batch persisted");
        Ok(cycle_id)
    }

    /// Records of the most recently written health cycle.
    pub async fn latest_health(&self) -> Result<Vec<HealthRecord>, MonitoringError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT component, status, timestamp, response_time_ms, details, error_message
                 FROM health_records
                 WHERE cycle_id = (SELECT cycle_id FROM health_records ORDER BY id DESC LIMIT 1)
                 ORDER BY id",
            )?;
            let rows = stmt.query_map([], health_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    // ---------------------------------------------------------------------------------
    // Consistency
    // ---------------------------------------------------------------------------------

    pub async fn append_consistency_reports(&self, reports: Vec<ConsistencyReport>) -> Result<(), MonitoringError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO consistency_reports (collection, total_records, valid_records, invalid_records,
                        duplicate_records, missing_fields, quality_score, sampled, issues, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )?;
                for report in &reports {
                    stmt.execute(params![
                        report.collection,
                        report.total_records as i64,
                        report.valid_records as i64,
                        report.invalid_records as i64,
                        report.duplicate_records as i64,
                        serde_json::to_string(&report.missing_fields).unwrap_or_else(|_| "[]".to_string()),
                        report.quality_score,
                        report.sampled,
                        serde_json::to_string(&report.issues).unwrap_or_else(|_| "[]".to_string()),
                        report.timestamp.to_rfc3339(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Latest report per collection, ordered by collection.
    pub async fn latest_consistency(&self) -> Result<Vec<ConsistencyReport>, MonitoringError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT collection, total_records, valid_records, invalid_records, duplicate_records,
                        missing_fields, quality_score, sampled, issues, timestamp
                 FROM consistency_reports
                 WHERE id IN (SELECT MAX(id) FROM consistency_reports GROUP BY collection)
                 ORDER BY collection",
            )?;
            let rows = stmt.query_map([], consistency_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    // ---------------------------------------------------------------------------------
    // Alerts
    // ---------------------------------------------------------------------------------

    /// Inserts a new alert or applies a lifecycle transition to an existing one.
    pub async fn upsert_alerts(&self, alerts: Vec<Alert>) -> Result<(), MonitoringError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO alerts (id, condition_key, severity, component, metric, rule, message,
                        metric_value, threshold, created_at, acknowledged, resolved, resolved_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                     ON CONFLICT(id) DO UPDATE SET
                        severity = excluded.severity,
                        message = excluded.message,
                        metric_value = excluded.metric_value,
                        threshold = excluded.threshold,
                        acknowledged = excluded.acknowledged,
                        resolved = excluded.resolved,
                        resolved_at = excluded.resolved_at",
                )?;
                for alert in &alerts {
                    stmt.execute(params![
                        alert.id,
                        alert.condition_key,
                        alert.severity.as_str(),
                        alert.component,
                        alert.metric,
                        alert.rule,
                        alert.message,
                        alert.metric_value,
                        alert.threshold,
                        alert.created_at.to_rfc3339(),
                        alert.acknowledged,
                        alert.resolved,
                        alert.resolved_at.map(|t| t.to_rfc3339()),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn alerts(&self, include_resolved: bool) -> Result<Vec<Alert>, MonitoringError> {
        self.with_conn(move |conn| {
            let sql = if include_resolved {
                "SELECT * FROM alerts ORDER BY created_at DESC"
            } else {
                "SELECT * FROM alerts WHERE resolved = 0 ORDER BY created_at DESC"
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], alert_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Unresolved alerts as persisted; used to rebuild the alert registry on restart.
    pub async fn active_alerts(&self) -> Result<Vec<Alert>, MonitoringError> {
        self.alerts(false).await
    }

    // ---------------------------------------------------------------------------------
    // Backups
    // ---------------------------------------------------------------------------------

    pub async fn append_backup(&self, record: BackupRecord) -> Result<(), MonitoringError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO backup_records (id, system, kind, path, size_bytes, checksum, status, created_at, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id,
                    record.system,
                    record.kind.as_str(),
                    record.path,
                    record.size_bytes as i64,
                    record.checksum,
                    record.status.as_str(),
                    record.created_at.to_rfc3339(),
                    record.error_message,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Unpruned backups, newest first, optionally for one system.
    pub async fn backups(&self, system: Option<String>) -> Result<Vec<BackupRecord>, MonitoringError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, system, kind, path, size_bytes, checksum, status, created_at, error_message
                 FROM backup_records
                 WHERE id NOT IN (SELECT backup_id FROM backup_prunes)
                   AND (?1 IS NULL OR system = ?1)
                 ORDER BY created_at DESC, rowid DESC",
            )?;
            let rows = stmt.query_map(params![system], backup_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn get_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>, MonitoringError> {
        let backup_id = backup_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, system, kind, path, size_bytes, checksum, status, created_at, error_message
                     FROM backup_records WHERE id = ?1",
                    params![backup_id],
                    backup_from_row,
                )
                .optional()?)
        })
        .await
    }

    pub async fn mark_backups_pruned(&self, backup_ids: Vec<String>) -> Result<(), MonitoringError> {
        let pruned_at = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for id in &backup_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO backup_prunes (backup_id, pruned_at) VALUES (?1, ?2)",
                    params![id, pruned_at],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    // ---------------------------------------------------------------------------------
    // Performance & cycles
    // ---------------------------------------------------------------------------------

    pub async fn append_performance(&self, metrics: PerformanceMetrics) -> Result<(), MonitoringError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO performance_metrics (cpu_usage_percentage, memory_usage_percentage,
                    disk_usage_percentage, average_cycle_time_ms, p95_cycle_time_ms, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    metrics.cpu_usage_percentage,
                    metrics.memory_usage_percentage,
                    metrics.disk_usage_percentage,
                    metrics.average_cycle_time_ms,
                    metrics.p95_cycle_time_ms,
                    metrics.timestamp.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn latest_performance(&self) -> Result<Option<PerformanceMetrics>, MonitoringError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT cpu_usage_percentage, memory_usage_percentage, disk_usage_percentage,
                            average_cycle_time_ms, p95_cycle_time_ms, timestamp
                     FROM performance_metrics ORDER BY id DESC LIMIT 1",
                    [],
                    |row| {
                        Ok(PerformanceMetrics {
                            cpu_usage_percentage: row.get(0)?,
                            memory_usage_percentage: row.get(1)?,
                            disk_usage_percentage: row.get(2)?,
                            average_cycle_time_ms: row.get(3)?,
                            p95_cycle_time_ms: row.get(4)?,
                            timestamp: parse_time(row, 5)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    pub async fn record_cycle(
        &self,
        cadence: Cadence,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), MonitoringError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO cycle_runs (cadence, started_at, finished_at, succeeded, error)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    cadence.as_str(),
                    started_at.to_rfc3339(),
                    finished_at.to_rfc3339(),
                    error.is_none(),
                    error,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Run and failure counts per cadence name.
    pub async fn cycle_totals(&self) -> Result<HashMap<String, (u64, u64)>, MonitoringError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT cadence, COUNT(*), SUM(CASE WHEN succeeded = 0 THEN 1 ELSE 0 END)
                 FROM cycle_runs GROUP BY cadence",
            )?;
            let rows = stmt.query_map([], |row| {
                let runs: i64 = row.get(1)?;
                let failures: i64 = row.get(2)?;
                Ok((row.get::<_, String>(0)?, (runs as u64, failures as u64)))
            })?;
            Ok(rows.collect::<Result<HashMap<_, _>, _>>()?)
        })
        .await
    }
}

// =====================================================================================
// ROW MAPPING
// =====================================================================================

fn parse_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_json<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_enum<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown value '{}'", raw).into(),
        )
    })
}

fn health_from_row(row: &Row<'_>) -> rusqlite::Result<HealthRecord> {
    let response_time_ms: i64 = row.get(3)?;
    Ok(HealthRecord {
        component: row.get(0)?,
        status: parse_enum(row, 1, HealthStatus::parse)?,
        timestamp: parse_time(row, 2)?,
        response_time_ms: response_time_ms.max(0) as u64,
        details: parse_json(row, 4)?,
        error_message: row.get(5)?,
    })
}

fn consistency_from_row(row: &Row<'_>) -> rusqlite::Result<ConsistencyReport> {
    let count = |idx: usize| -> rusqlite::Result<u64> { Ok(row.get::<_, i64>(idx)?.max(0) as u64) };
    Ok(ConsistencyReport {
        collection: row.get(0)?,
        total_records: count(1)?,
        valid_records: count(2)?,
        invalid_records: count(3)?,
        duplicate_records: count(4)?,
        missing_fields: parse_json(row, 5)?,
        quality_score: row.get(6)?,
        sampled: row.get(7)?,
        issues: parse_json(row, 8)?,
        timestamp: parse_time(row, 9)?,
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let resolved_at: Option<String> = row.get("resolved_at")?;
    let resolved_at = match resolved_at {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, Box::new(e)))?,
        ),
        None => None,
    };
    let severity_idx = row.as_ref().column_index("severity")?;
    let created_at: String = row.get("created_at")?;
    Ok(Alert {
        id: row.get("id")?,
        severity: parse_enum(row, severity_idx, AlertSeverity::parse)?,
        component: row.get("component")?,
        metric: row.get("metric")?,
        rule: row.get("rule")?,
        condition_key: row.get("condition_key")?,
        message: row.get("message")?,
        metric_value: row.get("metric_value")?,
        threshold: row.get("threshold")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e)))?,
        acknowledged: row.get("acknowledged")?,
        resolved: row.get("resolved")?,
        resolved_at,
    })
}

fn backup_from_row(row: &Row<'_>) -> rusqlite::Result<BackupRecord> {
    let size_bytes: i64 = row.get(4)?;
    Ok(BackupRecord {
        id: row.get(0)?,
        system: row.get(1)?,
        kind: parse_enum(row, 2, BackupKind::parse)?,
        path: row.get(3)?,
        size_bytes: size_bytes.max(0) as u64,
        checksum: row.get(5)?,
        status: parse_enum(row, 6, BackupStatus::parse)?,
        created_at: parse_time(row, 7)?,
        error_message: row.get(8)?,
    })
}
