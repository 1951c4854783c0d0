//! Health Monitor
//!
//! Periodically evaluates cache health, publishes it to the exporter and
//! raises alerts for every issue found.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::exporter::PrometheusExporter;
use super::health::{HealthReport, HealthStatus};
use crate::cache::{Cache, Tier};

/// A single health finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: HealthStatus,
    /// Tier the finding concerns
    pub tier: Option<Tier>,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    /// One alert per issue in the report
    pub fn from_report(report: &HealthReport) -> Vec<Alert> {
        report
            .tiers
            .iter()
            .flat_map(|(&tier, health)| {
                health.issues.iter().map(move |issue| Alert {
                    severity: health.status,
                    tier: Some(tier),
                    message: issue.clone(),
                    raised_at: report.checked_at,
                })
            })
            .collect()
    }
}

impl std::fmt::Display for Alert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.tier {
            Some(tier) => write!(f, "[{}] {}: {}", self.severity, tier, self.message),
            None => write!(f, "[{}] {}", self.severity, self.message),
        }
    }
}

/// Background health evaluation
pub struct HealthMonitor<V> {
    cache: Arc<Cache<V>>,
    interval: Duration,
    exporter: Option<Arc<PrometheusExporter>>,
    last: RwLock<Option<HealthReport>>,
}

impl<V> HealthMonitor<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(cache: Arc<Cache<V>>) -> Self {
        let interval = cache.config().health.interval();
        Self {
            cache,
            interval,
            exporter: None,
            last: RwLock::new(None),
        }
    }

    pub fn with_exporter(mut self, exporter: Arc<PrometheusExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one evaluation
    pub async fn tick(&self) -> HealthReport {
        let metrics = self.cache.all_metrics().await;
        let report = HealthReport::evaluate(
            &metrics,
            self.cache.l3_available(),
            &self.cache.config().health,
        );

        if let Some(exporter) = &self.exporter {
            exporter.update_tiers(&metrics);
            exporter.update_health(&report);
        }

        for alert in Alert::from_report(&report) {
            warn!(severity = %alert.severity, tier = ?alert.tier, "{}", alert.message);
            // No subscribers is fine
            let _ = self.cache.alert_sender().send(alert);
        }

        debug!(status = %report.status, "Health evaluated");
        *self.last.write() = Some(report.clone());
        report
    }

    /// Most recent report, if any tick has run
    pub fn last_report(&self) -> Option<HealthReport> {
        self.last.read().clone()
    }

    /// Evaluate on every interval until cancelled
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Starting health monitor (interval={:?})", self.interval);

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Health monitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
