//! Tier Selection and Eviction Policies
//!
//! Placement is data driven: an ordered key-pattern table decides tier and TTL
//! for known key families, value size decides the rest.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{L1_SIZE_LIMIT, L2_SIZE_LIMIT};
use crate::error::Error;

// =============================================================================
// Tiers
// =============================================================================

/// Cache tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// L1 - fastest, smallest, shortest-lived
    L1,
    /// L2 - medium
    L2,
    /// L3 - slowest, largest, longest-lived, may be durable
    L3,
}

impl Tier {
    /// All tiers, fastest first
    pub const ALL: [Tier; 3] = [Tier::L1, Tier::L2, Tier::L3];

    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            Tier::L1 => "l1",
            Tier::L2 => "l2",
            Tier::L3 => "l3",
        }
    }

    /// Tiers faster than this one, nearest first
    pub fn faster_tiers(&self) -> &'static [Tier] {
        match self {
            Tier::L1 => &[],
            Tier::L2 => &[Tier::L1],
            Tier::L3 => &[Tier::L2, Tier::L1],
        }
    }

    /// Next faster tier, target of a promotion
    pub fn promotion_target(&self) -> Option<Tier> {
        match self {
            Tier::L1 => None,
            Tier::L2 => Some(Tier::L1),
            Tier::L3 => Some(Tier::L2),
        }
    }

    #[inline]
    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l1" => Ok(Tier::L1),
            "l2" => Ok(Tier::L2),
            "l3" => Ok(Tier::L3),
            _ => Err(Error::InvalidTier(s.to_string())),
        }
    }
}

/// Requested placement for a write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierChoice {
    /// Let the selector decide
    #[default]
    Auto,
    L1,
    L2,
    L3,
}

impl TierChoice {
    /// The explicit tier, if one was requested
    pub fn explicit(&self) -> Option<Tier> {
        match self {
            TierChoice::Auto => None,
            TierChoice::L1 => Some(Tier::L1),
            TierChoice::L2 => Some(Tier::L2),
            TierChoice::L3 => Some(Tier::L3),
        }
    }
}

impl From<Tier> for TierChoice {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::L1 => TierChoice::L1,
            Tier::L2 => TierChoice::L2,
            Tier::L3 => TierChoice::L3,
        }
    }
}

impl FromStr for TierChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            return Ok(TierChoice::Auto);
        }
        s.parse::<Tier>().map(TierChoice::from)
    }
}

// =============================================================================
// Tier Selector
// =============================================================================

/// One row of the placement table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternRule {
    /// Key substring to match
    pub pattern: String,
    /// TTL in seconds for matching keys
    pub ttl: u64,
    /// Tier for matching keys
    pub tier: Tier,
}

impl PatternRule {
    pub fn new(pattern: impl Into<String>, ttl: u64, tier: Tier) -> Self {
        Self {
            pattern: pattern.into(),
            ttl,
            tier,
        }
    }

    /// Default placement table
    ///
    /// Order matters: the first matching substring wins.
    pub fn defaults() -> Vec<PatternRule> {
        vec![
            PatternRule::new("user", 1800, Tier::L1),
            PatternRule::new("customer", 3600, Tier::L2),
            PatternRule::new("ai_result", 7200, Tier::L1),
            PatternRule::new("analytics", 86_400, Tier::L3),
            PatternRule::new("static", 604_800, Tier::L3),
            PatternRule::new("session", 1800, Tier::L1),
            PatternRule::new("api_response", 300, Tier::L1),
        ]
    }
}

/// Decides which tier a key/value lives in
#[derive(Debug, Clone)]
pub struct TierSelector {
    rules: Vec<PatternRule>,
}

impl TierSelector {
    /// Create a selector over an ordered rule table
    pub fn new(rules: Vec<PatternRule>) -> Self {
        Self { rules }
    }

    /// First rule whose pattern occurs in the key
    pub fn rule_for(&self, key: &str) -> Option<&PatternRule> {
        self.rules.iter().find(|rule| key.contains(&rule.pattern))
    }

    /// Resolve the tier for a write
    ///
    /// Explicit choice, then pattern table, then serialized size.
    pub fn select(&self, key: &str, size: u64, choice: TierChoice) -> Tier {
        if let Some(tier) = choice.explicit() {
            return tier;
        }
        if let Some(rule) = self.rule_for(key) {
            return rule.tier;
        }
        Self::tier_for_size(size)
    }

    /// Size fallback
    pub fn tier_for_size(size: u64) -> Tier {
        if size < L1_SIZE_LIMIT {
            Tier::L1
        } else if size < L2_SIZE_LIMIT {
            Tier::L2
        } else {
            Tier::L3
        }
    }

    /// Resolve TTL: caller value, then pattern table, then the tier default
    pub fn resolve_ttl(&self, key: &str, explicit: Option<u64>, tier_default: u64) -> u64 {
        explicit
            .or_else(|| self.rule_for(key).map(|rule| rule.ttl))
            .unwrap_or(tier_default)
    }
}

impl Default for TierSelector {
    fn default() -> Self {
        Self::new(PatternRule::defaults())
    }
}

// =============================================================================
// Eviction Policy
// =============================================================================

/// Victim selection when a tier reaches `max_keys`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently accessed first
    #[default]
    Lru,
    /// Lowest access count first, oldest access breaks ties
    Lfu,
}

impl EvictionPolicy {
    /// Ordering key; the smallest key is evicted first
    pub fn rank(&self, last_accessed: i64, access_count: u64) -> (i64, i64) {
        let count = access_count.min(i64::MAX as u64) as i64;
        match self {
            EvictionPolicy::Lru => (last_accessed, count),
            EvictionPolicy::Lfu => (count, last_accessed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::CacheEntry;
    use bytes::Bytes;

    #[test]
    fn test_tier_parse() {
        assert_eq!("l1".parse::<Tier>().unwrap(), Tier::L1);
        assert_eq!(" L3 ".parse::<Tier>().unwrap(), Tier::L3);
        assert!(matches!("l4".parse::<Tier>(), Err(Error::InvalidTier(_))));

        assert_eq!("auto".parse::<TierChoice>().unwrap(), TierChoice::Auto);
        assert_eq!("l2".parse::<TierChoice>().unwrap(), TierChoice::L2);
        assert!("fast".parse::<TierChoice>().is_err());
    }

    #[test]
    fn test_tier_ordering() {
        assert_eq!(Tier::L3.faster_tiers(), &[Tier::L2, Tier::L1]);
        assert!(Tier::L1.faster_tiers().is_empty());
        assert_eq!(Tier::L3.promotion_target(), Some(Tier::L2));
        assert_eq!(Tier::L1.promotion_target(), None);
        assert!(Tier::L1 < Tier::L3);
    }

    #[test]
    fn test_tier_serde() {
        assert_eq!(serde_json::to_string(&Tier::L2).unwrap(), "\"l2\"");
        let choice: TierChoice = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(choice, TierChoice::Auto);
    }

    #[test]
    fn test_explicit_tier_wins() {
        let selector = TierSelector::default();
        assert_eq!(selector.select("user:1", 10, TierChoice::L3), Tier::L3);
    }

    #[test]
    fn test_pattern_before_size() {
        let selector = TierSelector::default();
        // Large value but a volatile key family stays in L1
        assert_eq!(selector.select("session:abc", 50_000, TierChoice::Auto), Tier::L1);
        // Tiny value but analytics goes to L3
        assert_eq!(selector.select("analytics:daily", 10, TierChoice::Auto), Tier::L3);
        assert_eq!(selector.select("customer:42", 10, TierChoice::Auto), Tier::L2);
    }

    #[test]
    fn test_first_match_wins() {
        let selector = TierSelector::default();
        // Contains both "user" and "analytics"; "user" is earlier in the table
        let rule = selector.rule_for("analytics:user:7").unwrap();
        assert_eq!(rule.pattern, "user");
        assert_eq!(rule.tier, Tier::L1);
    }

    #[test]
    fn test_size_fallback() {
        let selector = TierSelector::default();
        assert_eq!(selector.select("blob:1", 1023, TierChoice::Auto), Tier::L1);
        assert_eq!(selector.select("blob:1", 1024, TierChoice::Auto), Tier::L2);
        assert_eq!(selector.select("blob:1", 10 * 1024 - 1, TierChoice::Auto), Tier::L2);
        assert_eq!(selector.select("blob:1", 10 * 1024, TierChoice::Auto), Tier::L3);
    }

    #[test]
    fn test_resolve_ttl() {
        let selector = TierSelector::default();
        assert_eq!(selector.resolve_ttl("user:1", Some(5), 300), 5);
        assert_eq!(selector.resolve_ttl("user:1", None, 300), 1800);
        assert_eq!(selector.resolve_ttl("blob:1", None, 300), 300);
    }

    #[test]
    fn test_eviction_rank() {
        let stale = CacheEntry::new("a", Bytes::new(), 0, false, 60, 0);
        stale.record_access(100);
        stale.record_access(110);
        stale.record_access(120);

        let fresh = CacheEntry::new("b", Bytes::new(), 0, false, 60, 0);
        fresh.record_access(500);

        let rank = |policy: EvictionPolicy, e: &CacheEntry| {
            policy.rank(e.last_accessed(), e.access_count())
        };

        // LRU evicts the one read longest ago
        assert!(rank(EvictionPolicy::Lru, &stale) < rank(EvictionPolicy::Lru, &fresh));
        // LFU evicts the one read least often
        assert!(rank(EvictionPolicy::Lfu, &fresh) < rank(EvictionPolicy::Lfu, &stale));
    }
}
