// =====================================================================================
// BACKUP MANAGER
// =====================================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::DataSourceAdapter;
use crate::models::{BackupKind, BackupRecord, BackupStatus, MonitoringError};
use crate::services::store::MetricsStore;
use shared_config::{MonitorConfig, RetentionPolicy};

const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub system: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub restored_bytes: u64,
}

pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Backups to remove under `policy`, oldest first. The newest successful backup
/// is never selected.
pub fn select_prunable<'a>(
    records: &'a [BackupRecord],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<&'a BackupRecord> {
    let mut newest_first: Vec<&BackupRecord> = records.iter().collect();
    newest_first.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let last_good = newest_first
        .iter()
        .find(|r| r.status == BackupStatus::Success)
        .map(|r| r.id.clone());
    let max_age = chrono::Duration::from_std(policy.max_age).unwrap_or_else(|_| chrono::Duration::days(365 * 1000));

    let mut victims: Vec<&BackupRecord> = newest_first
        .into_iter()
        .enumerate()
        .filter(|(idx, record)| {
            let over_count = *idx >= policy.max_count;
            let over_age = now.signed_duration_since(record.created_at) > max_age;
            (over_count || over_age) && last_good.as_deref() != Some(record.id.as_str())
        })
        .map(|(_, record)| record)
        .collect();
    victims.reverse();
    victims
}

pub struct BackupManager {
    backup_dir: PathBuf,
    io_timeout: Duration,
    store: MetricsStore,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BackupManager {
    pub fn new(config: &MonitorConfig, store: MetricsStore) -> Self {
        Self::with_dir(config.backup_dir.clone(), config.backup_timeout, store)
    }

    pub fn with_dir(backup_dir: PathBuf, io_timeout: Duration, store: MetricsStore) -> Self {
        Self {
            backup_dir,
            io_timeout,
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn system_lock(&self, system: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(system.to_string()).or_default().clone()
    }

    /// Snapshots, compresses, writes and verifies one backup. The record is persisted
    /// whatever the outcome; an `Err` means only that persisting it failed.
    #[instrument(skip(self, adapter), fields(system = %adapter.name()))]
    pub async fn create_backup(
        &self,
        adapter: &dyn DataSourceAdapter,
        kind: BackupKind,
    ) -> Result<BackupRecord, MonitoringError> {
        let system = adapter.name().to_string();
        let lock = self.system_lock(&system);
        let _guard = lock.lock().await;

        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let file_name = format!(
            "{}_{}_{}_{}.jsonl.zst",
            system,
            kind.as_str().to_lowercase(),
            created_at.format("%Y%m%dT%H%M%S%3f"),
            &id[..8]
        );
        let path = self.backup_dir.join(&system).join(file_name);

        let mut record = BackupRecord {
            id,
            system: system.clone(),
            kind,
            path: path.to_string_lossy().into_owned(),
            size_bytes: 0,
            checksum: String::new(),
            status: BackupStatus::Failed,
            created_at,
            error_message: None,
        };

        match tokio::time::timeout(self.io_timeout, self.write_artifact(adapter, kind, &path)).await {
            Ok(Ok((size_bytes, checksum))) => {
                record.size_bytes = size_bytes;
                record.checksum = checksum;
                record.status = BackupStatus::Success;
                info!(backup_id = %record.id, size_bytes, "backup verified");
            }
            Ok(Err(e)) => {
                error!(backup_id = %record.id, "backup failed: {}", e);
                record.error_message = Some(e.to_string());
            }
            Err(_) => {
                let e = MonitoringError::BackupIoFailure(format!(
                    "backup did not finish within {}s",
                    self.io_timeout.as_secs()
                ));
                error!(backup_id = %record.id, "{}", e);
                record.error_message = Some(e.to_string());
            }
        }

        self.store.append_backup(record.clone()).await?;
        Ok(record)
    }

    /// Returns (size, checksum) of the verified artifact.
    async fn write_artifact(
        &self,
        adapter: &dyn DataSourceAdapter,
        kind: BackupKind,
        path: &Path,
    ) -> Result<(u64, String), MonitoringError> {
        let snapshot = adapter.snapshot(kind).await?;

        let compressed = tokio::task::spawn_blocking(move || zstd::encode_all(snapshot.as_slice(), COMPRESSION_LEVEL))
            .await
            .map_err(|e| MonitoringError::BackupIoFailure(format!("compression task failed: {}", e)))??;
        let expected = checksum(&compressed);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(&compressed).await?;
        file.sync_all().await?;
        drop(file);

        let written = tokio::fs::read(path).await?;
        let actual = checksum(&written);
        if actual != expected {
            return Err(MonitoringError::ChecksumMismatch {
                backup_id: path.display().to_string(),
                expected,
                actual,
            });
        }
        Ok((written.len() as u64, actual))
    }

    /// Validation-only restore: re-reads the artifact, checks the checksum and that
    /// the archive decompresses.
    #[instrument(skip(self))]
    pub async fn restore(&self, backup_id: &str) -> Result<RestoreReport, MonitoringError> {
        let record = self
            .store
            .get_backup(backup_id)
            .await?
            .ok_or_else(|| MonitoringError::NotFound(format!("backup {}", backup_id)))?;
        self.verify(&record).await
    }

    pub async fn verify(&self, record: &BackupRecord) -> Result<RestoreReport, MonitoringError> {
        if record.status != BackupStatus::Success {
            return Err(MonitoringError::BackupIoFailure(format!(
                "backup {} never completed successfully",
                record.id
            )));
        }

        let bytes = tokio::fs::read(&record.path).await?;
        let actual = checksum(&bytes);
        if actual != record.checksum {
            warn!(backup_id = %record.id, "checksum mismatch on restore");
            return Err(MonitoringError::ChecksumMismatch {
                backup_id: record.id.clone(),
                expected: record.checksum.clone(),
                actual,
            });
        }

        let size_bytes = bytes.len() as u64;
        let restored = tokio::task::spawn_blocking(move || zstd::decode_all(bytes.as_slice()))
            .await
            .map_err(|e| MonitoringError::BackupIoFailure(format!("decompression task failed: {}", e)))??;

        info!(backup_id = %record.id, restored_bytes = restored.len(), "backup restore validated");
        Ok(RestoreReport {
            backup_id: record.id.clone(),
            system: record.system.clone(),
            checksum: actual,
            size_bytes,
            restored_bytes: restored.len() as u64,
        })
    }

    /// Applies `policy` to one system's backups and returns the pruned ids.
    #[instrument(skip(self, policy))]
    pub async fn prune(&self, system: &str, policy: &RetentionPolicy) -> Result<Vec<String>, MonitoringError> {
        let lock = self.system_lock(system);
        let _guard = lock.lock().await;

        let records = self.store.backups(Some(system.to_string())).await?;
        let victims = select_prunable(&records, policy, Utc::now());

        let mut pruned = Vec::with_capacity(victims.len());
        for record in victims {
            match tokio::fs::remove_file(&record.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(backup_id = %record.id, "failed to remove backup artifact: {}", e);
                    continue;
                }
            }
            pruned.push(record.id.clone());
        }

        if !pruned.is_empty() {
            self.store.mark_backups_pruned(pruned.clone()).await?;
            info!(count = pruned.len(), "pruned backups");
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, status: BackupStatus, age_days: i64) -> BackupRecord {
        BackupRecord {
            id: id.to_string(),
            system: "primary".to_string(),
            kind: BackupKind::Full,
            path: format!("/tmp/{}", id),
            size_bytes: 10,
            checksum: "00".to_string(),
            status,
            created_at: Utc::now() - chrono::Duration::days(age_days),
            error_message: None,
        }
    }

    fn policy(max_count: usize, max_age_days: u64) -> RetentionPolicy {
        RetentionPolicy {
            max_count,
            max_age: Duration::from_secs(max_age_days * 24 * 3600),
        }
    }

    #[test]
    fn prunes_beyond_count_oldest_first() {
        let records = vec![
            record("d", BackupStatus::Success, 1),
            record("c", BackupStatus::Success, 2),
            record("b", BackupStatus::Success, 3),
            record("a", BackupStatus::Success, 4),
        ];
        let ids: Vec<_> = select_prunable(&records, &policy(2, 30), Utc::now())
            .into_iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn never_prunes_last_successful_backup() {
        let records = vec![
            record("f3", BackupStatus::Failed, 1),
            record("f2", BackupStatus::Failed, 2),
            record("ok", BackupStatus::Success, 90),
            record("f1", BackupStatus::Failed, 100),
        ];
        let ids: Vec<_> = select_prunable(&records, &policy(1, 30), Utc::now())
            .into_iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["f1", "f2"]);
    }

    #[test]
    fn prunes_by_age() {
        let records = vec![
            record("new", BackupStatus::Success, 1),
            record("old", BackupStatus::Success, 45),
        ];
        let ids: Vec<_> = select_prunable(&records, &policy(10, 30), Utc::now())
            .into_iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["old"]);
    }

    #[test]
    fn checksum_is_hex_sha256() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
