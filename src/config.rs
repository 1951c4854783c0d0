//! Cache Configuration
//!
//! Everything is defaulted, so an empty YAML document yields a working cache.
//! `validate()` runs at construction time; a bad config never reaches the
//! request path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{EvictionPolicy, InvalidationRule, PatternRule, Tier};
use crate::error::{Error, Result};

/// Default compression threshold (1KB)
pub const DEFAULT_COMPRESSION_THRESHOLD: u64 = 1024;

/// Default deadline for L3 backend calls
pub const DEFAULT_L3_TIMEOUT_MS: u64 = 250;

/// Longest TTL an entry can carry (100 years); caller TTLs are clamped to it
pub const MAX_TTL_SECS: u64 = 100 * 365 * 24 * 3600;

// =============================================================================
// Tier Configuration
// =============================================================================

/// Per-tier store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierConfig {
    /// TTL in seconds when neither caller nor pattern table supplies one
    pub default_ttl: u64,
    /// Hard cap on stored keys
    pub max_keys: usize,
    /// Interval between proactive purges of expired entries
    pub check_interval_secs: u64,
    /// Victim selection when full
    #[serde(default)]
    pub eviction: EvictionPolicy,
    /// Lock shards (power of two)
    #[serde(default = "default_shards")]
    pub shards: usize,
    /// Compress large values written to this tier
    #[serde(default = "default_true")]
    pub compression: bool,
}

fn default_shards() -> usize {
    16
}

fn default_true() -> bool {
    true
}

impl TierConfig {
    /// L1: small, short-lived
    pub fn l1_defaults() -> Self {
        Self {
            default_ttl: 300,
            max_keys: 10_000,
            check_interval_secs: 60,
            eviction: EvictionPolicy::Lru,
            shards: default_shards(),
            compression: true,
        }
    }

    /// L2: medium
    pub fn l2_defaults() -> Self {
        Self {
            default_ttl: 3600,
            max_keys: 50_000,
            check_interval_secs: 120,
            eviction: EvictionPolicy::Lru,
            shards: default_shards(),
            compression: true,
        }
    }

    /// L3: large, long-lived
    pub fn l3_defaults() -> Self {
        Self {
            default_ttl: 86_400,
            max_keys: 100_000,
            check_interval_secs: 600,
            eviction: EvictionPolicy::Lfu,
            shards: default_shards(),
            compression: true,
        }
    }

    /// Purge interval as a Duration
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    fn validate(&self, tier: Tier) -> Result<()> {
        if self.default_ttl == 0 {
            return Err(Error::Config(format!("{}: default_ttl must be positive", tier)));
        }
        if self.default_ttl > MAX_TTL_SECS {
            return Err(Error::Config(format!(
                "{}: default_ttl {} exceeds the maximum of {}s",
                tier, self.default_ttl, MAX_TTL_SECS
            )));
        }
        if self.max_keys == 0 {
            return Err(Error::Config(format!("{}: max_keys must be positive", tier)));
        }
        if self.check_interval_secs == 0 {
            return Err(Error::Config(format!(
                "{}: check_interval_secs must be positive",
                tier
            )));
        }
        if self.shards == 0 || !self.shards.is_power_of_two() {
            return Err(Error::Config(format!(
                "{}: shards must be a power of two, got {}",
                tier, self.shards
            )));
        }
        Ok(())
    }
}

// =============================================================================
// L3 Backend Configuration
// =============================================================================

/// Backing store for the L3 tier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum L3BackendConfig {
    /// Volatile in-process store
    #[default]
    Memory,
    /// Durable store, one file per entry
    Disk { path: PathBuf },
}

// =============================================================================
// Health Configuration
// =============================================================================

/// Health thresholds and monitor cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    /// Minimum acceptable hit rate per tier
    pub min_hit_rate: f64,
    /// Maximum evictions as a fraction of key count
    pub max_eviction_ratio: f64,
    /// Observations required before hit rate is judged
    pub min_samples: u64,
    /// Monitor tick interval
    pub interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            min_hit_rate: 0.8,
            max_eviction_ratio: 0.1,
            min_samples: 1,
            interval_secs: 30,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_hit_rate) {
            return Err(Error::Config(format!(
                "health.min_hit_rate must be within [0, 1], got {}",
                self.min_hit_rate
            )));
        }
        if !(self.max_eviction_ratio >= 0.0) {
            return Err(Error::Config(format!(
                "health.max_eviction_ratio must be non-negative, got {}",
                self.max_eviction_ratio
            )));
        }
        if self.interval_secs == 0 {
            return Err(Error::Config("health.interval_secs must be positive".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Cache Configuration
// =============================================================================

/// Complete cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// L1 store
    pub l1: TierConfig,
    /// L2 store
    pub l2: TierConfig,
    /// L3 store
    pub l3: TierConfig,
    /// L3 backing store
    pub l3_backend: L3BackendConfig,
    /// Deadline for each L3 call
    pub l3_timeout_ms: u64,
    /// Values larger than this are compressed
    pub compression_threshold: u64,
    /// Ordered placement table
    pub patterns: Vec<PatternRule>,
    /// Cascading invalidation rules
    pub invalidation_rules: Vec<InvalidationRule>,
    /// Health thresholds
    pub health: HealthConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1: TierConfig::l1_defaults(),
            l2: TierConfig::l2_defaults(),
            l3: TierConfig::l3_defaults(),
            l3_backend: L3BackendConfig::Memory,
            l3_timeout_ms: DEFAULT_L3_TIMEOUT_MS,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            patterns: PatternRule::defaults(),
            invalidation_rules: InvalidationRule::defaults(),
            health: HealthConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CacheConfig = if yaml.trim().is_empty() {
            CacheConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&yaml)
    }

    /// Store configuration for a tier
    pub fn tier(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::L1 => &self.l1,
            Tier::L2 => &self.l2,
            Tier::L3 => &self.l3,
        }
    }

    /// L3 call deadline
    pub fn l3_timeout(&self) -> Duration {
        Duration::from_millis(self.l3_timeout_ms)
    }

    /// Check every field; called by `Cache::new`
    pub fn validate(&self) -> Result<()> {
        for tier in Tier::ALL {
            self.tier(tier).validate(tier)?;
        }

        if self.l3_timeout_ms == 0 {
            return Err(Error::Config("l3_timeout_ms must be positive".into()));
        }

        for (i, rule) in self.patterns.iter().enumerate() {
            if rule.pattern.is_empty() {
                return Err(Error::Config(format!("patterns[{}]: empty pattern", i)));
            }
            if rule.ttl == 0 {
                return Err(Error::Config(format!(
                    "patterns[{}] ({}): ttl must be positive",
                    i, rule.pattern
                )));
            }
            if rule.ttl > MAX_TTL_SECS {
                return Err(Error::Config(format!(
                    "patterns[{}] ({}): ttl exceeds the maximum of {}s",
                    i, rule.pattern, MAX_TTL_SECS
                )));
            }
        }

        for (i, rule) in self.invalidation_rules.iter().enumerate() {
            if rule.source.is_empty() {
                return Err(Error::Config(format!(
                    "invalidation_rules[{}]: empty source prefix",
                    i
                )));
            }
            if rule.dependents.is_empty() || rule.dependents.iter().any(String::is_empty) {
                return Err(Error::Config(format!(
                    "invalidation_rules[{}] ({}): dependents must be non-empty prefixes",
                    i, rule.source
                )));
            }
        }

        self.health.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        config.validate().unwrap();
        assert_eq!(config.l1.default_ttl, 300);
        assert_eq!(config.l3.eviction, EvictionPolicy::Lfu);
        assert_eq!(config.patterns.len(), 7);
        assert_eq!(config.health.min_hit_rate, 0.8);
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = CacheConfig::from_yaml_str("").unwrap();
        assert_eq!(config, CacheConfig::default());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
l1:
  default_ttl: 60
  max_keys: 100
  check_interval_secs: 5
l3_backend:
  type: disk
  path: /var/cache/strata
compression_threshold: 4096
patterns:
  - pattern: "report"
    ttl: 600
    tier: l3
invalidation_rules:
  - source: "order:"
    dependents: ["invoice:"]
health:
  min_hit_rate: 0.5
"#;
        let config = CacheConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.l1.max_keys, 100);
        assert_eq!(config.l1.shards, 16);
        assert!(config.l1.compression);
        assert_eq!(config.l2, TierConfig::l2_defaults());
        assert_eq!(
            config.l3_backend,
            L3BackendConfig::Disk {
                path: PathBuf::from("/var/cache/strata")
            }
        );
        assert_eq!(config.patterns, vec![PatternRule::new("report", 600, Tier::L3)]);
        assert_eq!(config.invalidation_rules[0].source, "order:");
        assert_eq!(config.health.min_hit_rate, 0.5);
        assert_eq!(config.health.interval_secs, 30);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = CacheConfig::from_yaml_str("l1_size: 10\n");
        assert_matches!(result, Err(Error::Yaml(_)));
    }

    #[test]
    fn test_invalid_tier_name_rejected() {
        let yaml = "patterns:\n  - pattern: x\n    ttl: 5\n    tier: l9\n";
        assert_matches!(CacheConfig::from_yaml_str(yaml), Err(Error::Yaml(_)));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let mut config = CacheConfig::default();
        config.l2.default_ttl = 0;
        assert_matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("l2"));

        let mut config = CacheConfig::default();
        config.patterns.push(PatternRule::new("bad", 0, Tier::L1));
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_oversized_ttl_rejected() {
        let mut config = CacheConfig::default();
        config.l3.default_ttl = u64::MAX;
        assert_matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("l3"));

        let mut config = CacheConfig::default();
        config
            .patterns
            .push(PatternRule::new("forever", MAX_TTL_SECS + 1, Tier::L3));
        assert_matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("forever"));

        let mut config = CacheConfig::default();
        config.l3.default_ttl = MAX_TTL_SECS;
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_shards_rejected() {
        let mut config = CacheConfig::default();
        config.l1.shards = 12;
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_malformed_rules_rejected() {
        let mut config = CacheConfig::default();
        config.patterns.push(PatternRule::new("", 10, Tier::L1));
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let mut config = CacheConfig::default();
        config.invalidation_rules = vec![InvalidationRule::new("a:", Vec::<String>::new())];
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_health_thresholds_rejected() {
        let mut config = CacheConfig::default();
        config.health.min_hit_rate = 1.5;
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let mut config = CacheConfig::default();
        config.health.max_eviction_ratio = f64::NAN;
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }
}
