//! Prometheus Exporter
//!
//! Publishes tier metrics and health as `stratacache_*` gauges labelled by
//! tier, on a dedicated registry.

use std::collections::BTreeMap;

use prometheus::{Encoder, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use super::health::{HealthReport, HealthStatus};
use crate::cache::{Tier, TierMetrics};
use crate::error::Result;

const NAMESPACE: &str = "stratacache";

/// Prometheus view of the cache
pub struct PrometheusExporter {
    registry: Registry,
    hits: IntGaugeVec,
    misses: IntGaugeVec,
    hit_rate: GaugeVec,
    keys: IntGaugeVec,
    memory_bytes: IntGaugeVec,
    evictions: IntGaugeVec,
    compression_ratio: GaugeVec,
    access_time_us: GaugeVec,
    promotions: IntGaugeVec,
    backend_errors: IntGaugeVec,
    health_status: IntGauge,
    l3_available: IntGauge,
}

impl PrometheusExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let int_vec = |name: &str, help: &str| -> Result<IntGaugeVec> {
            let gauge = IntGaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), &["tier"])?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let float_vec = |name: &str, help: &str| -> Result<GaugeVec> {
            let gauge = GaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), &["tier"])?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let int = |name: &str, help: &str| -> Result<IntGauge> {
            let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        Ok(Self {
            hits: int_vec("tier_hits", "Cache hits per tier")?,
            misses: int_vec("tier_misses", "Cache misses per tier")?,
            hit_rate: float_vec("tier_hit_rate", "Hit rate per tier (0-1)")?,
            keys: int_vec("tier_keys", "Stored keys per tier")?,
            memory_bytes: int_vec("tier_memory_bytes", "Stored payload bytes per tier")?,
            evictions: int_vec("tier_evictions", "Capacity evictions per tier")?,
            compression_ratio: float_vec(
                "tier_compression_ratio",
                "Stored/original bytes over compressed writes",
            )?,
            access_time_us: float_vec(
                "tier_access_time_microseconds",
                "Moving average of read time per tier",
            )?,
            promotions: int_vec("tier_promotions", "Promotions landing in each tier")?,
            backend_errors: int_vec("tier_backend_errors", "Backing store failures per tier")?,
            health_status: int(
                "health_status",
                "Overall health: 0 healthy, 1 degraded, 2 critical",
            )?,
            l3_available: int("l3_available", "1 when the L3 backend answered its last call")?,
            registry,
        })
    }

    /// Publish a metrics snapshot
    pub fn update_tiers(&self, metrics: &BTreeMap<Tier, TierMetrics>) {
        for (tier, m) in metrics {
            let label = [tier.label()];
            self.hits.with_label_values(&label).set(clamp(m.hits));
            self.misses.with_label_values(&label).set(clamp(m.misses));
            self.hit_rate.with_label_values(&label).set(m.hit_rate);
            self.keys.with_label_values(&label).set(clamp(m.total_keys));
            self.memory_bytes
                .with_label_values(&label)
                .set(clamp(m.memory_usage));
            self.evictions.with_label_values(&label).set(clamp(m.evictions));
            self.compression_ratio
                .with_label_values(&label)
                .set(m.compression_ratio);
            self.access_time_us
                .with_label_values(&label)
                .set(m.average_access_time_us);
            self.promotions
                .with_label_values(&label)
                .set(clamp(m.promotions_in));
            self.backend_errors
                .with_label_values(&label)
                .set(clamp(m.backend_errors));
        }
    }

    /// Publish a health report
    pub fn update_health(&self, report: &HealthReport) {
        let status = match report.status {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Critical => 2,
        };
        self.health_status.set(status);
        self.l3_available.set(i64::from(report.l3_available));
    }

    /// Prometheus text exposition
    pub fn encode(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    /// Content type of [`encode`](Self::encode) output
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

fn clamp(value: u64) -> i64 {
    value.min(i64::MAX as u64) as i64
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;

    #[test]
    fn test_exposition() {
        let exporter = PrometheusExporter::new().unwrap();

        let mut metrics = BTreeMap::new();
        metrics.insert(
            Tier::L1,
            TierMetrics {
                hits: 9,
                misses: 1,
                hit_rate: 0.9,
                total_keys: 4,
                ..TierMetrics::default()
            },
        );
        metrics.insert(Tier::L3, TierMetrics::default());
        exporter.update_tiers(&metrics);
        exporter.update_health(&HealthReport::evaluate(&metrics, false, &HealthConfig::default()));

        let text = String::from_utf8(exporter.encode().unwrap()).unwrap();
        assert!(text.contains("stratacache_tier_hits{tier=\"l1\"} 9"));
        assert!(text.contains("stratacache_tier_hit_rate{tier=\"l1\"} 0.9"));
        assert!(text.contains("stratacache_tier_keys{tier=\"l3\"} 0"));
        assert!(text.contains("stratacache_health_status 1"));
        assert!(text.contains("stratacache_l3_available 0"));
        assert!(exporter.content_type().starts_with("text/plain"));
    }

    #[test]
    fn test_registries_are_independent() {
        // Two exporters in one process must not collide
        let _a = PrometheusExporter::new().unwrap();
        let _b = PrometheusExporter::new().unwrap();
    }
}
