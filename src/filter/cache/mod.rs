//! Reputation cache
//!
//! TTL cache for actor and asset reputation facts. Every entry carries its
//! own `fetched_at` timestamp used only for expiry bookkeeping; business
//! fields such as `age_days` are never used to compute staleness.
//!
//! The cache is not internally synchronized. It lives inside the detector's
//! shared state and is mutated under the same lock as the position book.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::config::CacheConfig;
use crate::types::Namespace;

/// Risk facts returned by a reputation provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReputationFacts {
    /// Days since the subject was first seen
    pub age_days: f64,
    /// Transactions observed in the provider's recent window
    #[serde(default)]
    pub recent_activity_count: u64,
    /// Share of supply/holdings held by the top holders (0-1), when known
    #[serde(default)]
    pub concentration_ratio: Option<f64>,
}

/// Cached reputation facts with TTL bookkeeping
#[derive(Debug, Clone)]
pub struct ReputationEntry {
    pub subject_id: String,
    pub facts: ReputationFacts,
    pub fetched_at: DateTime<Utc>,
}

impl ReputationEntry {
    pub fn new(subject_id: impl Into<String>, facts: ReputationFacts, fetched_at: DateTime<Utc>) -> Self {
        Self {
            subject_id: subject_id.into(),
            facts,
            fetched_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.fetched_at > ttl
    }
}

/// Two-namespace TTL cache (actors, assets)
#[derive(Debug)]
pub struct ReputationCache {
    ttl: Duration,
    max_entries: usize,
    actors: HashMap<String, ReputationEntry>,
    assets: HashMap<String, ReputationEntry>,
}

impl ReputationCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            actors: HashMap::new(),
            assets: HashMap::new(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.ttl(), config.max_entries)
    }

    fn namespace(&self, namespace: Namespace) -> &HashMap<String, ReputationEntry> {
        match namespace {
            Namespace::Actor => &self.actors,
            Namespace::Asset => &self.assets,
        }
    }

    fn namespace_mut(&mut self, namespace: Namespace) -> &mut HashMap<String, ReputationEntry> {
        match namespace {
            Namespace::Actor => &mut self.actors,
            Namespace::Asset => &mut self.assets,
        }
    }

    /// Get fresh facts for a subject; an expired entry is dropped and reported as a miss
    pub fn get(&mut self, namespace: Namespace, subject_id: &str, now: DateTime<Utc>) -> Option<ReputationFacts> {
        let ttl = self.ttl;
        let map = self.namespace_mut(namespace);
        let expired = match map.get(subject_id) {
            Some(entry) if !entry.is_expired(now, ttl) => return Some(entry.facts.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            map.remove(subject_id);
        }
        None
    }

    /// Store facts fetched at `now`
    pub fn insert(&mut self, namespace: Namespace, subject_id: &str, facts: ReputationFacts, now: DateTime<Utc>) {
        let max_entries = self.max_entries;
        let map = self.namespace_mut(namespace);

        // Evict the oldest ~10% when full
        if map.len() >= max_entries && !map.contains_key(subject_id) {
            let to_remove = (max_entries / 10).max(1);
            let mut by_age: Vec<(DateTime<Utc>, String)> = map
                .values()
                .map(|e| (e.fetched_at, e.subject_id.clone()))
                .collect();
            by_age.sort();
            for (_, key) in by_age.into_iter().take(to_remove) {
                map.remove(&key);
            }
            debug!(namespace = %namespace, evicted = to_remove, "Reputation cache full, evicted oldest entries");
        }

        map.insert(
            subject_id.to_string(),
            ReputationEntry::new(subject_id, facts, now),
        );
    }

    /// Drop every expired entry in both namespaces, returning how many were removed
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let ttl = self.ttl;
        let before = self.actors.len() + self.assets.len();
        self.actors.retain(|_, e| !e.is_expired(now, ttl));
        self.assets.retain(|_, e| !e.is_expired(now, ttl));
        before - (self.actors.len() + self.assets.len())
    }

    pub fn len(&self, namespace: Namespace) -> usize {
        self.namespace(namespace).len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty() && self.assets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(age: f64) -> ReputationFacts {
        ReputationFacts {
            age_days: age,
            recent_activity_count: 4,
            concentration_ratio: None,
        }
    }

    #[test]
    fn test_hit_then_expire() {
        let mut cache = ReputationCache::new(Duration::seconds(60), 100);
        let t0 = Utc::now();
        cache.insert(Namespace::Actor, "wallet1", facts(3.0), t0);

        let hit = cache.get(Namespace::Actor, "wallet1", t0 + Duration::seconds(30));
        assert_eq!(hit.map(|f| f.age_days), Some(3.0));

        assert!(cache.get(Namespace::Actor, "wallet1", t0 + Duration::seconds(61)).is_none());
        assert_eq!(cache.len(Namespace::Actor), 0);
    }

    #[test]
    fn test_expiry_uses_fetch_time_not_age() {
        // A very old subject fetched just now is fresh
        let mut cache = ReputationCache::new(Duration::seconds(60), 100);
        let now = Utc::now();
        cache.insert(Namespace::Actor, "ancient", facts(4_000.0), now);
        assert!(cache.get(Namespace::Actor, "ancient", now).is_some());
    }

    #[test]
    fn test_namespaces_are_separate() {
        let mut cache = ReputationCache::new(Duration::seconds(60), 100);
        let now = Utc::now();
        cache.insert(Namespace::Asset, "same-id", facts(10.0), now);
        assert!(cache.get(Namespace::Actor, "same-id", now).is_none());
        assert!(cache.get(Namespace::Asset, "same-id", now).is_some());
    }

    #[test]
    fn test_purge_expired() {
        let mut cache = ReputationCache::new(Duration::seconds(60), 100);
        let t0 = Utc::now();
        cache.insert(Namespace::Actor, "old", facts(1.0), t0);
        cache.insert(Namespace::Asset, "old-asset", facts(1.0), t0);
        cache.insert(Namespace::Actor, "new", facts(1.0), t0 + Duration::seconds(50));

        let removed = cache.purge_expired(t0 + Duration::seconds(90));
        assert_eq!(removed, 2);
        assert_eq!(cache.len(Namespace::Actor), 1);
        assert_eq!(cache.len(Namespace::Asset), 0);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = ReputationCache::new(Duration::seconds(600), 10);
        let t0 = Utc::now();
        for i in 0..10 {
            cache.insert(Namespace::Actor, &format!("w{}", i), facts(1.0), t0 + Duration::seconds(i));
        }
        cache.insert(Namespace::Actor, "w10", facts(1.0), t0 + Duration::seconds(10));

        assert_eq!(cache.len(Namespace::Actor), 10);
        let now = t0 + Duration::seconds(11);
        assert!(cache.get(Namespace::Actor, "w0", now).is_none());
        assert!(cache.get(Namespace::Actor, "w10", now).is_some());
    }
}
