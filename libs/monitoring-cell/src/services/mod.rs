pub mod alerts;
pub mod backup;
pub mod consistency;
pub mod health;
pub mod orchestrator;
pub mod performance;
pub mod store;

pub use alerts::AlertEngine;
pub use backup::BackupManager;
pub use consistency::ConsistencyValidator;
pub use health::HealthChecker;
pub use orchestrator::Orchestrator;
pub use performance::PerformanceCollector;
pub use store::MetricsStore;
