//! Invalidation Index
//!
//! Tag bookkeeping, invalidation targets and the cascading rule table.
//!
//! The index never talks to the tiers itself: callers hand it the keys (or
//! entry metadata) currently stored and get back the keys to delete.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::entry::EntryInfo;
use super::policy::Tier;
use crate::error::{Error, Result};

// =============================================================================
// Targets
// =============================================================================

/// What to invalidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// Every key starting with the prefix; a trailing `*` is ignored
    Pattern(String),
    /// Every key recorded under the tag
    Tag(String),
    /// Every entry matching all of the query's filters
    Query(InvalidationQuery),
}

impl Invalidation {
    pub fn pattern(prefix: impl Into<String>) -> Self {
        Invalidation::Pattern(prefix.into())
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        Invalidation::Tag(tag.into())
    }

    /// Reject targets that are malformed or would match everything
    pub fn validate(&self) -> Result<()> {
        match self {
            Invalidation::Pattern(pattern) => {
                if normalize_prefix(pattern).is_empty() {
                    return Err(Error::InvalidationQuery(
                        "pattern must not be empty".into(),
                    ));
                }
                Ok(())
            }
            Invalidation::Tag(tag) => {
                if tag.is_empty() {
                    return Err(Error::InvalidationQuery("tag must not be empty".into()));
                }
                Ok(())
            }
            Invalidation::Query(query) => query.validate(),
        }
    }
}

impl From<&str> for Invalidation {
    fn from(pattern: &str) -> Self {
        Invalidation::Pattern(pattern.to_string())
    }
}

impl From<String> for Invalidation {
    fn from(pattern: String) -> Self {
        Invalidation::Pattern(pattern)
    }
}

impl From<InvalidationQuery> for Invalidation {
    fn from(query: InvalidationQuery) -> Self {
        Invalidation::Query(query)
    }
}

/// Strip an optional trailing wildcard
pub fn normalize_prefix(pattern: &str) -> &str {
    pattern.strip_suffix('*').unwrap_or(pattern)
}

/// Structured invalidation query; all present filters must match
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InvalidationQuery {
    /// Key prefix
    pub pattern: Option<String>,
    /// Owning tier
    pub tier: Option<Tier>,
    /// Metadata `tenant` attribute
    pub tenant: Option<String>,
    /// Created strictly before this epoch-millis timestamp
    pub older_than: Option<i64>,
    /// Read fewer than this many times
    pub accessed_fewer_than: Option<u64>,
}

impl InvalidationQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn in_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn for_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn older_than(mut self, millis: i64) -> Self {
        self.older_than = Some(millis);
        self
    }

    pub fn accessed_fewer_than(mut self, count: u64) -> Self {
        self.accessed_fewer_than = Some(count);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.pattern.is_none()
            && self.tier.is_none()
            && self.tenant.is_none()
            && self.older_than.is_none()
            && self.accessed_fewer_than.is_none()
        {
            return Err(Error::InvalidationQuery(
                "query must set at least one filter".into(),
            ));
        }
        if let Some(pattern) = &self.pattern {
            if normalize_prefix(pattern).is_empty() {
                return Err(Error::InvalidationQuery(
                    "pattern must not be empty".into(),
                ));
            }
        }
        if self.tenant.as_deref() == Some("") {
            return Err(Error::InvalidationQuery("tenant must not be empty".into()));
        }
        if self.accessed_fewer_than == Some(0) {
            return Err(Error::InvalidationQuery(
                "accessed_fewer_than must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Check an entry against every present filter
    pub fn matches(&self, info: &EntryInfo) -> bool {
        if let Some(pattern) = &self.pattern {
            if !info.key.starts_with(normalize_prefix(pattern)) {
                return false;
            }
        }
        if let Some(tier) = self.tier {
            if info.tier != tier {
                return false;
            }
        }
        if let Some(tenant) = &self.tenant {
            if info.tenant() != Some(tenant.as_str()) {
                return false;
            }
        }
        if let Some(older_than) = self.older_than {
            if info.created_at >= older_than {
                return false;
            }
        }
        if let Some(limit) = self.accessed_fewer_than {
            if info.access_count >= limit {
                return false;
            }
        }
        true
    }
}

// =============================================================================
// Cascade Rules
// =============================================================================

/// Invalidating a key under `source` also invalidates keys under `dependents`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvalidationRule {
    /// Source key prefix
    pub source: String,
    /// Dependent key prefixes
    pub dependents: Vec<String>,
}

impl InvalidationRule {
    pub fn new<I, S>(source: impl Into<String>, dependents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source: source.into(),
            dependents: dependents.into_iter().map(Into::into).collect(),
        }
    }

    /// Default rule table
    pub fn defaults() -> Vec<InvalidationRule> {
        vec![InvalidationRule::new(
            "customer:",
            ["deals:", "analytics:customer"],
        )]
    }

    pub fn applies_to(&self, key: &str) -> bool {
        key.starts_with(&self.source)
    }
}

// =============================================================================
// Index
// =============================================================================

#[derive(Debug, Default)]
struct TagMaps {
    by_tag: HashMap<String, HashSet<String>>,
    by_key: HashMap<String, HashSet<String>>,
}

impl TagMaps {
    fn detach(&mut self, key: &str) {
        if let Some(tags) = self.by_key.remove(key) {
            for tag in tags {
                if let Some(keys) = self.by_tag.get_mut(&tag) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.by_tag.remove(&tag);
                    }
                }
            }
        }
    }
}

/// Tag maps plus the cascade rule table
#[derive(Debug, Default)]
pub struct InvalidationIndex {
    maps: RwLock<TagMaps>,
    rules: Vec<InvalidationRule>,
}

impl InvalidationIndex {
    pub fn new(rules: Vec<InvalidationRule>) -> Self {
        Self {
            maps: RwLock::new(TagMaps::default()),
            rules,
        }
    }

    /// Replace the tags recorded for a key
    pub fn record_tags(&self, key: &str, tags: &[String]) {
        let mut maps = self.maps.write();
        maps.detach(key);
        if tags.is_empty() {
            return;
        }

        let set: HashSet<String> = tags.iter().filter(|t| !t.is_empty()).cloned().collect();
        for tag in &set {
            maps.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        maps.by_key.insert(key.to_string(), set);
    }

    /// Drop all tag associations of the given keys
    pub fn forget<'a>(&self, keys: impl IntoIterator<Item = &'a str>) {
        let mut maps = self.maps.write();
        for key in keys {
            maps.detach(key);
        }
    }

    /// Keys recorded under a tag, sorted
    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        let maps = self.maps.read();
        let mut keys: Vec<String> = maps
            .by_tag
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Tags recorded for a key, sorted
    pub fn tags_for_key(&self, key: &str) -> Vec<String> {
        let maps = self.maps.read();
        let mut tags: Vec<String> = maps
            .by_key
            .get(key)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default();
        tags.sort();
        tags
    }

    /// Every key with at least one tag, sorted
    pub fn tagged_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.maps.read().by_key.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop keys for which `retain` is false; returns the number dropped
    pub fn prune(&self, retain: impl Fn(&str) -> bool) -> usize {
        let mut maps = self.maps.write();
        let stale: Vec<String> = maps
            .by_key
            .keys()
            .filter(|key| !retain(key))
            .cloned()
            .collect();
        for key in &stale {
            maps.detach(key);
        }
        stale.len()
    }

    /// Number of distinct tags
    pub fn tag_count(&self) -> usize {
        self.maps.read().by_tag.len()
    }

    /// Number of tagged keys
    pub fn tagged_key_count(&self) -> usize {
        self.maps.read().by_key.len()
    }

    /// Present keys under a prefix
    pub fn find_by_pattern<'a>(
        &self,
        pattern: &str,
        present: impl IntoIterator<Item = &'a String>,
    ) -> BTreeSet<String> {
        let prefix = normalize_prefix(pattern);
        present
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Keys of entries matching a query
    pub fn find_by_query<'a>(
        &self,
        query: &InvalidationQuery,
        entries: impl IntoIterator<Item = &'a EntryInfo>,
    ) -> BTreeSet<String> {
        entries
            .into_iter()
            .filter(|info| query.matches(info))
            .map(|info| info.key.clone())
            .collect()
    }

    /// Apply the rule table once
    ///
    /// Returns present keys under any dependent prefix of a rule whose source
    /// matches an invalidated key, excluding keys already invalidated. The
    /// result is not fed back into the rules.
    pub fn cascade_for<'a>(
        &self,
        invalidated: &BTreeSet<String>,
        present: impl IntoIterator<Item = &'a String>,
    ) -> BTreeSet<String> {
        let dependents: Vec<&str> = self
            .rules
            .iter()
            .filter(|rule| invalidated.iter().any(|key| rule.applies_to(key)))
            .flat_map(|rule| rule.dependents.iter().map(String::as_str))
            .collect();

        if dependents.is_empty() {
            return BTreeSet::new();
        }

        present
            .into_iter()
            .filter(|key| !invalidated.contains(*key))
            .filter(|key| dependents.iter().any(|prefix| key.starts_with(prefix)))
            .cloned()
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn info(key: &str, tier: Tier, tenant: Option<&str>, created_at: i64, reads: u64) -> EntryInfo {
        let mut metadata = HashMap::new();
        if let Some(tenant) = tenant {
            metadata.insert("tenant".to_string(), tenant.to_string());
        }
        EntryInfo {
            key: key.to_string(),
            tier,
            ttl: 600,
            created_at,
            last_accessed: created_at,
            access_count: reads,
            size: 1,
            stored_size: 1,
            compressed: false,
            metadata,
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_targets_from_str() {
        assert_eq!(Invalidation::from("user:"), Invalidation::Pattern("user:".into()));
        assert_eq!(normalize_prefix("user:*"), "user:");
        assert_eq!(normalize_prefix("user:"), "user:");
    }

    #[test]
    fn test_target_validation() {
        assert_matches!(Invalidation::from("*").validate(), Err(Error::InvalidationQuery(_)));
        assert_matches!(Invalidation::tag("").validate(), Err(Error::InvalidationQuery(_)));
        assert!(Invalidation::from("user:*").validate().is_ok());
    }

    #[test]
    fn test_query_validation() {
        assert_matches!(InvalidationQuery::new().validate(), Err(Error::InvalidationQuery(_)));
        assert_matches!(
            InvalidationQuery::new().with_pattern("").validate(),
            Err(Error::InvalidationQuery(_))
        );
        assert_matches!(
            InvalidationQuery::new().accessed_fewer_than(0).validate(),
            Err(Error::InvalidationQuery(_))
        );
        assert!(InvalidationQuery::new().in_tier(Tier::L2).validate().is_ok());
    }

    #[test]
    fn test_query_filters_are_anded() {
        let query = InvalidationQuery::new()
            .with_pattern("report:")
            .for_tenant("acme")
            .older_than(1_000)
            .accessed_fewer_than(3);

        assert!(query.matches(&info("report:1", Tier::L3, Some("acme"), 500, 2)));
        assert!(!query.matches(&info("invoice:1", Tier::L3, Some("acme"), 500, 2)));
        assert!(!query.matches(&info("report:1", Tier::L3, Some("other"), 500, 2)));
        assert!(!query.matches(&info("report:1", Tier::L3, None, 500, 2)));
        assert!(!query.matches(&info("report:1", Tier::L3, Some("acme"), 1_000, 2)));
        assert!(!query.matches(&info("report:1", Tier::L3, Some("acme"), 500, 3)));

        let by_tier = InvalidationQuery::new().in_tier(Tier::L1);
        assert!(by_tier.matches(&info("x", Tier::L1, None, 0, 0)));
        assert!(!by_tier.matches(&info("x", Tier::L2, None, 0, 0)));
    }

    #[test]
    fn test_query_deserialize_rejects_unknown() {
        let ok: InvalidationQuery = serde_json::from_str(r#"{"tier":"l2"}"#).unwrap();
        assert_eq!(ok.tier, Some(Tier::L2));
        assert!(serde_json::from_str::<InvalidationQuery>(r#"{"region":"eu"}"#).is_err());
    }

    #[test]
    fn test_tag_bookkeeping() {
        let index = InvalidationIndex::default();
        index.record_tags("user:1", &keys(&["users", "tenant:acme"]));
        index.record_tags("user:2", &keys(&["users"]));

        assert_eq!(index.keys_for_tag("users"), keys(&["user:1", "user:2"]));
        assert_eq!(index.tags_for_key("user:1"), keys(&["tenant:acme", "users"]));

        // Re-recording replaces the tag set
        index.record_tags("user:1", &keys(&["vip"]));
        assert_eq!(index.keys_for_tag("users"), keys(&["user:2"]));
        assert!(index.keys_for_tag("tenant:acme").is_empty());
        assert_eq!(index.tag_count(), 2);

        index.forget(["user:2"]);
        assert!(index.keys_for_tag("users").is_empty());
        assert_eq!(index.tagged_key_count(), 1);
    }

    #[test]
    fn test_prune() {
        let index = InvalidationIndex::default();
        index.record_tags("a", &keys(&["t"]));
        index.record_tags("b", &keys(&["t"]));

        assert_eq!(index.prune(|key| key == "a"), 1);
        assert_eq!(index.keys_for_tag("t"), keys(&["a"]));
    }

    #[test]
    fn test_find_by_pattern() {
        let index = InvalidationIndex::default();
        let present = keys(&["user:1", "user:2", "users", "customer:1"]);
        let found = index.find_by_pattern("user:*", &present);
        assert_eq!(found.into_iter().collect::<Vec<_>>(), keys(&["user:1", "user:2"]));
    }

    #[test]
    fn test_cascade_default_rule() {
        let index = InvalidationIndex::new(InvalidationRule::defaults());
        let present = keys(&[
            "customer:1",
            "deals:9",
            "analytics:customer:1",
            "analytics:daily",
        ]);
        let invalidated: BTreeSet<String> = ["customer:1".to_string()].into();

        let cascade = index.cascade_for(&invalidated, &present);
        assert_eq!(
            cascade.into_iter().collect::<Vec<_>>(),
            keys(&["analytics:customer:1", "deals:9"])
        );
    }

    #[test]
    fn test_cascade_is_one_level() {
        let index = InvalidationIndex::new(vec![
            InvalidationRule::new("a:", ["b:"]),
            InvalidationRule::new("b:", ["c:"]),
        ]);
        let present = keys(&["a:1", "b:1", "c:1"]);
        let invalidated: BTreeSet<String> = ["a:1".to_string()].into();

        let cascade = index.cascade_for(&invalidated, &present);
        assert_eq!(cascade.into_iter().collect::<Vec<_>>(), keys(&["b:1"]));
    }

    #[test]
    fn test_cascade_without_matching_rule() {
        let index = InvalidationIndex::new(InvalidationRule::defaults());
        let present = keys(&["deals:1"]);
        let invalidated: BTreeSet<String> = ["user:1".to_string()].into();
        assert!(index.cascade_for(&invalidated, &present).is_empty());
    }
}
