// =====================================================================================
// MONITORING CELL ROUTER
// =====================================================================================

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::handlers::{
    acknowledge_alert, get_alert_summary, get_alerts, get_backups, get_health, get_integrity, get_performance,
    get_status, prune_backups, restore_backup, trigger_backup, MonitoringHandlers,
};

pub fn create_monitoring_router(handlers: Arc<MonitoringHandlers>) -> Router {
    // Dashboard reads
    let read_routes = Router::new()
        .route("/health", get(get_health))
        .route("/status", get(get_status))
        .route("/integrity", get(get_integrity))
        .route("/backups", get(get_backups))
        .route("/performance", get(get_performance))
        .route("/alerts", get(get_alerts))
        .route("/alerts/summary", get(get_alert_summary))
        .layer(CorsLayer::permissive())
        .with_state(handlers.clone());

    // Operator actions
    let action_routes = Router::new()
        .route("/trigger_backup", post(trigger_backup))
        .route("/prune_backups", post(prune_backups))
        .route("/restore_backup", post(restore_backup))
        .route("/acknowledge_alert", post(acknowledge_alert))
        .with_state(handlers);

    Router::new().merge(read_routes).merge(action_routes)
}
