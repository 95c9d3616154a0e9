use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use monitoring_cell::{create_monitoring_router, MonitoringHandlers};

pub fn create_router(handlers: Arc<MonitoringHandlers>) -> Router {
    Router::new()
        .route("/", get(|| async { "Data monitor is running!" }))
        .merge(create_monitoring_router(handlers))
}
