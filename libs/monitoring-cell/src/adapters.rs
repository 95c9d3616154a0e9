// =====================================================================================
// CAPABILITY INTERFACES: DATA SOURCES & NOTIFIERS
// =====================================================================================

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags, Params};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::models::{Alert, AlertSeverity, BackupKind, MonitoringError};
use shared_config::CollectionConfig;

/// One record as returned by an adapter: field name to value.
pub type Record = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Default)]
pub struct AdapterHealth {
    pub details: HashMap<String, Value>,
}

/// A monitored backend. Adapters report failures through `MonitoringError`;
/// `AdapterUnreachable` marks a backend that could not be contacted at all.
#[async_trait]
pub trait DataSourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn check_health(&self, timeout: Duration) -> Result<AdapterHealth, MonitoringError>;

    async fn count_records(&self, collection: &str) -> Result<u64, MonitoringError>;

    async fn sample_records(&self, collection: &str, limit: u64) -> Result<Vec<Record>, MonitoringError>;

    /// Records whose `key_field` equals one of `keys`. The default scans the whole
    /// collection; adapters with an index should override it.
    async fn fetch_records(
        &self,
        collection: &str,
        key_field: &str,
        keys: &[Value],
    ) -> Result<Vec<Record>, MonitoringError> {
        let wanted: HashSet<String> = keys.iter().map(Value::to_string).collect();
        let records = self.sample_records(collection, u64::MAX).await?;
        Ok(records
            .into_iter()
            .filter(|record| {
                record
                    .get(key_field)
                    .is_some_and(|value| wanted.contains(&value.to_string()))
            })
            .collect())
    }

    /// Serialized copy of the backend's data for backups.
    async fn snapshot(&self, _kind: BackupKind) -> Result<Vec<u8>, MonitoringError> {
        Err(MonitoringError::AdapterError(format!(
            "{} does not support snapshots",
            self.name()
        )))
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<(), MonitoringError>;
}

/// Default notifier: writes alerts to the log.
#[derive(Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send(&self, alert: &Alert) -> Result<(), MonitoringError> {
        if alert.resolved {
            info!(alert_id = %alert.id, component = %alert.component, "RESOLVED: {}", alert.message);
            return Ok(());
        }
        match alert.severity {
            AlertSeverity::Critical => {
                error!(
                    alert_id = %alert.id,
                    component = %alert.component,
                    metric = %alert.metric,
                    value = %alert.metric_value,
                    threshold = %alert.threshold,
                    "CRITICAL ALERT: {}", alert.message
                );
            }
            AlertSeverity::Warning => {
                warn!(
                    alert_id = %alert.id,
                    component = %alert.component,
                    value = %alert.metric_value,
                    "WARNING ALERT: {}", alert.message
                );
            }
            AlertSeverity::Info => {
                info!(alert_id = %alert.id, "INFO ALERT: {}", alert.message);
            }
        }
        Ok(())
    }
}

// =====================================================================================
// SQLITE SOURCE ADAPTER
// =====================================================================================

/// Adapter over a SQLite database file. Every call opens a read-only connection on
/// the blocking pool so a missing or locked file never stalls the runtime.
#[derive(Debug, Clone)]
pub struct SqliteSourceAdapter {
    name: String,
    path: PathBuf,
    collections: Vec<CollectionConfig>,
}

impl SqliteSourceAdapter {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, collections: Vec<CollectionConfig>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            collections,
        }
    }

    fn primary_key(&self, collection: &str) -> Option<String> {
        self.collections
            .iter()
            .find(|c| c.name == collection)
            .map(|c| c.primary_key.clone())
    }

    async fn with_connection<F, T>(&self, busy_timeout: Duration, f: F) -> Result<T, MonitoringError>
    where
        F: FnOnce(&Connection) -> Result<T, MonitoringError> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            if !path.exists() {
                return Err(MonitoringError::AdapterUnreachable(format!(
                    "{}: database file {} does not exist",
                    name,
                    path.display()
                )));
            }
            let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .map_err(|e| MonitoringError::AdapterUnreachable(format!("{}: {}", name, e)))?;
            conn.busy_timeout(busy_timeout)
                .map_err(|e| MonitoringError::AdapterError(e.to_string()))?;
            f(&conn)
        })
        .await
        .map_err(|e| MonitoringError::AdapterError(format!("adapter task failed: {}", e)))?
    }
}

#[async_trait]
impl DataSourceAdapter for SqliteSourceAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check_health(&self, timeout: Duration) -> Result<AdapterHealth, MonitoringError> {
        let path = self.path.clone();
        self.with_connection(timeout, move |conn| {
            let one: i64 = conn
                .query_row("SELECT 1", [], |row| row.get(0))
                .map_err(adapter_err)?;
            if one != 1 {
                return Err(MonitoringError::AdapterError("unexpected probe result".to_string()));
            }
            let page_count: i64 = conn
                .query_row("PRAGMA page_count", [], |row| row.get(0))
                .map_err(adapter_err)?;
            let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

            Ok(AdapterHealth {
                details: HashMap::from([
                    ("engine".to_string(), Value::String("sqlite".to_string())),
                    ("page_count".to_string(), Value::from(page_count)),
                    ("size_bytes".to_string(), Value::from(size_bytes)),
                ]),
            })
        })
        .await
    }

    async fn count_records(&self, collection: &str) -> Result<u64, MonitoringError> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(collection));
        self.with_connection(Duration::from_secs(5), move |conn| {
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0)).map_err(adapter_err)?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn sample_records(&self, collection: &str, limit: u64) -> Result<Vec<Record>, MonitoringError> {
        let table = quote_ident(collection);
        let order = self
            .primary_key(collection)
            .map(|pk| quote_ident(&pk))
            .unwrap_or_else(|| "rowid".to_string());
        let limit = limit.max(1);

        self.with_connection(Duration::from_secs(5), move |conn| {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                .map_err(adapter_err)?;
            let count = count.max(0) as u64;

            // Systematic sampling: every `step`-th row in key order.
            let step = count.div_ceil(limit).max(1);
            let sql = format!(
                "SELECT * FROM (SELECT *, ROW_NUMBER() OVER (ORDER BY {order}) AS __sample_rn FROM {table}) \
                 WHERE (__sample_rn - 1) % {step} = 0 LIMIT {limit}"
            );
            query_records(conn, &sql, [], &["__sample_rn"])
        })
        .await
    }

    async fn fetch_records(
        &self,
        collection: &str,
        key_field: &str,
        keys: &[Value],
    ) -> Result<Vec<Record>, MonitoringError> {
        let table = quote_ident(collection);
        let column = quote_ident(key_field);
        let keys: Vec<SqlValue> = keys.iter().map(sql_value).collect();

        self.with_connection(Duration::from_secs(5), move |conn| {
            let mut records = Vec::with_capacity(keys.len());
            for chunk in keys.chunks(FETCH_CHUNK) {
                let placeholders = vec!["?"; chunk.len()].join(", ");
                let sql = format!("SELECT * FROM {table} WHERE {column} IN ({placeholders})");
                records.extend(query_records(conn, &sql, params_from_iter(chunk.iter()), &[])?);
            }
            Ok(records)
        })
        .await
    }

    async fn snapshot(&self, kind: BackupKind) -> Result<Vec<u8>, MonitoringError> {
        let collections: Vec<String> = self.collections.iter().map(|c| c.name.clone()).collect();
        let name = self.name.clone();
        self.with_connection(Duration::from_secs(30), move |conn| {
            let mut out = Vec::new();
            let header = serde_json::json!({ "system": name, "kind": kind.as_str() });
            out.extend_from_slice(header.to_string().as_bytes());
            out.push(b'\n');
            for collection in &collections {
                let rows = query_records(conn, &format!("SELECT * FROM {}", quote_ident(collection)), [], &[])?;
                for row in rows {
                    let line = serde_json::json!({ "collection": collection, "row": row });
                    out.extend_from_slice(line.to_string().as_bytes());
                    out.push(b'\n');
                }
            }
            Ok(out)
        })
        .await
    }
}

// Stays well under SQLite's bound-parameter limit.
const FETCH_CHUNK: usize = 500;

fn adapter_err(error: rusqlite::Error) -> MonitoringError {
    MonitoringError::AdapterError(error.to_string())
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn query_records<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    skip_columns: &[&str],
) -> Result<Vec<Record>, MonitoringError> {
    let mut stmt = conn.prepare(sql).map_err(adapter_err)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query(params).map_err(adapter_err)?;
    let mut records = Vec::new();

    while let Some(row) = rows.next().map_err(adapter_err)? {
        let mut record = Record::new();
        for (idx, column) in columns.iter().enumerate() {
            if skip_columns.contains(&column.as_str()) {
                continue;
            }
            let value = match row.get_ref(idx).map_err(adapter_err)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(i) => Value::from(i),
                ValueRef::Real(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
                ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
                ValueRef::Blob(b) => {
                    let mut hex = String::with_capacity(b.len() * 2);
                    for byte in b {
                        let _ = write!(hex, "{:02x}", byte);
                    }
                    Value::String(hex)
                }
            };
            record.insert(column.clone(), value);
        }
        records.push(record);
    }
    Ok(records)
}
