//! Health Checks
//!
//! Compares tier metrics with configured thresholds.
//!
//! - `Critical`: a tier's evictions exceed `max_eviction_ratio` of its keys
//! - `Degraded`: a tier with enough observations is below `min_hit_rate`, or
//!   the L3 backend is unavailable
//! - `Healthy`: otherwise
//!
//! Critical dominates degraded.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{Tier, TierMetrics};
use crate::config::HealthConfig;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All thresholds met
    Healthy,
    /// Operational but below target
    Degraded,
    /// Needs attention now
    Critical,
}

impl HealthStatus {
    /// Check if status is healthy or degraded (operational)
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Critical => write!(f, "Critical"),
        }
    }
}

/// Health of one tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierHealth {
    pub status: HealthStatus,
    pub hit_rate: f64,
    /// Reads observed so far
    pub observations: u64,
    /// Evictions per stored key; absent when the tier holds no keys
    pub eviction_ratio: Option<f64>,
    /// Human-readable findings
    pub issues: Vec<String>,
}

/// Overall health report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst status across all checks
    pub status: HealthStatus,
    /// Per-tier results
    pub tiers: BTreeMap<Tier, TierHealth>,
    /// L3 backend reachable on its last call
    pub l3_available: bool,
    /// Suggested operator actions
    pub recommendations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Evaluate metrics against thresholds
    pub fn evaluate(
        metrics: &BTreeMap<Tier, TierMetrics>,
        l3_available: bool,
        thresholds: &HealthConfig,
    ) -> Self {
        let mut tiers = BTreeMap::new();
        let mut recommendations = Vec::new();

        for (&tier, m) in metrics {
            let mut status = HealthStatus::Healthy;
            let mut issues = Vec::new();

            let observations = m.observations();
            if observations >= thresholds.min_samples.max(1) && m.hit_rate < thresholds.min_hit_rate {
                status = status.max(HealthStatus::Degraded);
                issues.push(format!(
                    "hit rate {:.1}% is below {:.1}%",
                    m.hit_rate * 100.0,
                    thresholds.min_hit_rate * 100.0
                ));
                recommendations.push(format!(
                    "Hit rate for {} is {:.1}% (target {:.1}%); review TTLs and the pattern table for hot key families",
                    tier,
                    m.hit_rate * 100.0,
                    thresholds.min_hit_rate * 100.0
                ));
            }

            let eviction_limit = thresholds.max_eviction_ratio * m.total_keys as f64;
            if m.evictions as f64 > eviction_limit {
                status = HealthStatus::Critical;
                issues.push(format!(
                    "{} evictions exceed {:.0}% of {} stored keys",
                    m.evictions,
                    thresholds.max_eviction_ratio * 100.0,
                    m.total_keys
                ));
                recommendations.push(format!(
                    "Evictions in {} are above {:.0}% of its keys; raise max_keys or shorten TTLs",
                    tier,
                    thresholds.max_eviction_ratio * 100.0
                ));
            }

            if tier == Tier::L3 && !l3_available {
                status = status.max(HealthStatus::Degraded);
                issues.push("backend unavailable".to_string());
                recommendations.push(
                    "L3 backend is unavailable; requests are served from L1/L2 only".to_string(),
                );
            }

            let eviction_ratio =
                (m.total_keys > 0).then(|| m.evictions as f64 / m.total_keys as f64);

            tiers.insert(
                tier,
                TierHealth {
                    status,
                    hit_rate: m.hit_rate,
                    observations,
                    eviction_ratio,
                    issues,
                },
            );
        }

        let status = tiers
            .values()
            .map(|t| t.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            tiers,
            l3_available,
            recommendations,
            checked_at: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(hits: u64, misses: u64, total_keys: u64, evictions: u64) -> TierMetrics {
        let total = hits + misses;
        TierMetrics {
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            total_keys,
            evictions,
            compression_ratio: 1.0,
            ..TierMetrics::default()
        }
    }

    fn all(l1: TierMetrics, l2: TierMetrics, l3: TierMetrics) -> BTreeMap<Tier, TierMetrics> {
        [(Tier::L1, l1), (Tier::L2, l2), (Tier::L3, l3)].into()
    }

    #[test]
    fn test_status_ordering() {
        assert!(HealthStatus::Critical > HealthStatus::Degraded);
        assert!(HealthStatus::Degraded > HealthStatus::Healthy);
        assert!(HealthStatus::Degraded.is_operational());
        assert!(!HealthStatus::Critical.is_operational());
        assert_eq!(format!("{}", HealthStatus::Critical), "Critical");
    }

    #[test]
    fn test_idle_cache_is_healthy() {
        let report = HealthReport::evaluate(
            &all(metrics(0, 0, 0, 0), metrics(0, 0, 0, 0), metrics(0, 0, 0, 0)),
            true,
            &HealthConfig::default(),
        );
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.recommendations.is_empty());
        assert_eq!(report.tiers[&Tier::L1].eviction_ratio, None);
    }

    #[test]
    fn test_low_hit_rate_degrades() {
        let report = HealthReport::evaluate(
            &all(metrics(5, 5, 100, 0), metrics(9, 1, 100, 5), metrics(0, 0, 0, 0)),
            true,
            &HealthConfig::default(),
        );
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.tiers[&Tier::L1].status, HealthStatus::Degraded);
        assert_eq!(report.tiers[&Tier::L2].status, HealthStatus::Healthy);
        assert_eq!(report.tiers[&Tier::L2].eviction_ratio, Some(0.05));
        assert_eq!(report.recommendations.len(), 1);
        assert!(report.recommendations[0].contains("l1"));
    }

    #[test]
    fn test_min_samples_gate() {
        let thresholds = HealthConfig {
            min_samples: 20,
            ..HealthConfig::default()
        };
        let report = HealthReport::evaluate(
            &all(metrics(1, 9, 10, 0), metrics(0, 0, 0, 0), metrics(0, 0, 0, 0)),
            true,
            &thresholds,
        );
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_evictions_are_critical() {
        let report = HealthReport::evaluate(
            &all(metrics(5, 5, 100, 0), metrics(10, 0, 100, 11), metrics(0, 0, 0, 0)),
            true,
            &HealthConfig::default(),
        );
        assert_eq!(report.status, HealthStatus::Critical);
        assert_eq!(report.tiers[&Tier::L2].status, HealthStatus::Critical);
        assert_eq!(report.recommendations.len(), 2);
    }

    #[test]
    fn test_l3_unavailable_degrades() {
        let report = HealthReport::evaluate(
            &all(metrics(10, 0, 1, 0), metrics(0, 0, 0, 0), metrics(0, 0, 0, 0)),
            false,
            &HealthConfig::default(),
        );
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.tiers[&Tier::L3].issues, vec!["backend unavailable".to_string()]);
        assert!(!report.l3_available);
    }

    #[test]
    fn test_report_serializes() {
        let report = HealthReport::evaluate(
            &all(metrics(0, 0, 0, 0), metrics(0, 0, 0, 0), metrics(0, 0, 0, 0)),
            true,
            &HealthConfig::default(),
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "healthy");
        assert!(json["tiers"]["l1"].is_object());
    }
}
