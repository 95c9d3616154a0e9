// =====================================================================================
// MONITORING CELL - DATA BACKEND HEALTH, CONSISTENCY & BACKUP INTEGRITY
// =====================================================================================
//
// This cell watches a set of pluggable data backends and provides:
// - Concurrent health checks with per-adapter timeouts
// - Cross-backend consistency validation and quality scoring
// - Deduplicated threshold alerts with an explicit lifecycle
// - Verified, compressed backups with retention pruning
// - An append-only SQLite history served over HTTP
//
// =====================================================================================

pub mod adapters;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

// Re-export commonly used types
pub use adapters::{DataSourceAdapter, LoggingNotifier, Notifier, Record, SqliteSourceAdapter};
pub use models::{
    Alert, AlertSeverity, BackupKind, BackupRecord, BackupStatus, ConsistencyReport, HealthRecord, HealthStatus,
    MonitoringError, PerformanceMetrics,
};

pub use services::{
    AlertEngine, BackupManager, ConsistencyValidator, HealthChecker, MetricsStore, Orchestrator,
    PerformanceCollector,
};

pub use handlers::MonitoringHandlers;
pub use router::create_monitoring_router;
