//! Monitoring
//!
//! Health evaluation, alerting and Prometheus exposition.

mod exporter;
mod health;
mod monitor;

pub use exporter::PrometheusExporter;
pub use health::{HealthReport, HealthStatus, TierHealth};
pub use monitor::{Alert, HealthMonitor};
