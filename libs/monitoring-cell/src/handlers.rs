// =====================================================================================
// MONITORING CELL HANDLERS
// =====================================================================================

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::models::{
    AcknowledgeAlertRequest, Alert, AlertsQuery, BackupKind, BackupRecord, BackupsQuery, Cadence,
    ConsistencyReport, HealthRecord, MonitoringError, PerformanceMetrics, PruneBackupsRequest, PruneBackupsResponse,
    RestoreBackupRequest, Snapshot, StatusResponse, TriggerBackupRequest,
};
use crate::services::backup::RestoreReport;
use crate::services::orchestrator::Orchestrator;

pub struct MonitoringHandlers {
    orchestrator: Arc<Orchestrator>,
}

impl MonitoringHandlers {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

// =====================================================================================
// READ ENDPOINTS
// =====================================================================================

#[instrument(skip(handlers))]
pub async fn get_health(
    State(handlers): State<Arc<MonitoringHandlers>>,
) -> Result<Json<Snapshot<Vec<HealthRecord>>>, MonitoringError> {
    Ok(Json(handlers.orchestrator.latest_health().await?))
}

#[instrument(skip(handlers))]
pub async fn get_status(State(handlers): State<Arc<MonitoringHandlers>>) -> Json<StatusResponse> {
    Json(handlers.orchestrator.status().await)
}

#[instrument(skip(handlers))]
pub async fn get_integrity(
    State(handlers): State<Arc<MonitoringHandlers>>,
) -> Result<Json<Snapshot<Vec<ConsistencyReport>>>, MonitoringError> {
    let reports = handlers.orchestrator.store().latest_consistency().await?;
    Ok(Json(handlers.orchestrator.snapshot(Cadence::Consistency, reports).await))
}

#[instrument(skip(handlers))]
pub async fn get_backups(
    State(handlers): State<Arc<MonitoringHandlers>>,
    Query(query): Query<BackupsQuery>,
) -> Result<Json<Snapshot<Vec<BackupRecord>>>, MonitoringError> {
    let backups = handlers.orchestrator.store().backups(query.system).await?;
    Ok(Json(handlers.orchestrator.snapshot(Cadence::Backup, backups).await))
}

#[instrument(skip(handlers))]
pub async fn get_performance(
    State(handlers): State<Arc<MonitoringHandlers>>,
) -> Result<Json<Snapshot<Option<PerformanceMetrics>>>, MonitoringError> {
    let metrics = handlers.orchestrator.store().latest_performance().await?;
    Ok(Json(handlers.orchestrator.snapshot(Cadence::Health, metrics).await))
}

#[instrument(skip(handlers))]
pub async fn get_alerts(
    State(handlers): State<Arc<MonitoringHandlers>>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<Snapshot<Vec<Alert>>>, MonitoringError> {
    let alerts = handlers
        .orchestrator
        .store()
        .alerts(query.include_resolved.unwrap_or(false))
        .await?;
    Ok(Json(handlers.orchestrator.snapshot(Cadence::Health, alerts).await))
}

#[instrument(skip(handlers))]
pub async fn get_alert_summary(State(handlers): State<Arc<MonitoringHandlers>>) -> Json<HashMap<String, u32>> {
    Json(handlers.orchestrator.alerts().get_alert_summary().await)
}

// =====================================================================================
// OPERATOR ACTIONS
// =====================================================================================

#[instrument(skip(handlers))]
pub async fn trigger_backup(
    State(handlers): State<Arc<MonitoringHandlers>>,
    Json(request): Json<TriggerBackupRequest>,
) -> Result<Json<BackupRecord>, MonitoringError> {
    let kind = request.kind.unwrap_or(BackupKind::Full);
    info!(system = %request.system, kind = kind.as_str(), "manual backup requested");

    let record = handlers.orchestrator.trigger_backup(&request.system, kind).await?;
    Ok(Json(record))
}

#[instrument(skip(handlers))]
pub async fn prune_backups(
    State(handlers): State<Arc<MonitoringHandlers>>,
    Json(request): Json<PruneBackupsRequest>,
) -> Result<Json<PruneBackupsResponse>, MonitoringError> {
    let pruned = handlers.orchestrator.prune_backups(&request.system).await?;
    Ok(Json(PruneBackupsResponse {
        system: request.system,
        pruned,
    }))
}

#[instrument(skip(handlers))]
pub async fn restore_backup(
    State(handlers): State<Arc<MonitoringHandlers>>,
    Json(request): Json<RestoreBackupRequest>,
) -> Result<Json<RestoreReport>, MonitoringError> {
    Ok(Json(handlers.orchestrator.restore_backup(&request.backup_id).await?))
}

#[instrument(skip(handlers))]
pub async fn acknowledge_alert(
    State(handlers): State<Arc<MonitoringHandlers>>,
    Json(request): Json<AcknowledgeAlertRequest>,
) -> Result<Json<Alert>, MonitoringError> {
    let alert = handlers.orchestrator.alerts().acknowledge(&request.alert_id).await?;
    Ok(Json(alert))
}

// =====================================================================================
// ERROR RESPONSES
// =====================================================================================

impl IntoResponse for MonitoringError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            MonitoringError::NotFound(_) => StatusCode::NOT_FOUND,
            MonitoringError::BadRequest(_) => StatusCode::BAD_REQUEST,
            MonitoringError::ChecksumMismatch { .. } | MonitoringError::ConsistencyMismatch { .. } => {
                StatusCode::CONFLICT
            }
            MonitoringError::AdapterTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            MonitoringError::AdapterError(_)
            | MonitoringError::AdapterUnreachable(_)
            | MonitoringError::NotifierFailure(_) => StatusCode::BAD_GATEWAY,
            MonitoringError::BackupIoFailure(_) | MonitoringError::ConfigInvalid(_) | MonitoringError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(serde_json::json!({
            "error": self.to_string(),
            "timestamp": chrono::Utc::now()
        }))).into_response()
    }
}
