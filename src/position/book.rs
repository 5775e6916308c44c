//! Active aggregate map
//!
//! An aggregate is present here exactly while it is open; removing it is
//! the first step of finalization.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use super::aggregate::Aggregate;
use crate::types::AggregateKey;

#[derive(Debug, Default)]
pub struct PositionBook {
    active: HashMap<AggregateKey, Aggregate>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &AggregateKey) -> Option<&Aggregate> {
        self.active.get(key)
    }

    pub fn get_mut(&mut self, key: &AggregateKey) -> Option<&mut Aggregate> {
        self.active.get_mut(key)
    }

    /// Existing aggregate for `key`, or a new one anchored at `anchor`
    pub fn get_or_open(&mut self, key: &AggregateKey, anchor: DateTime<Utc>) -> &mut Aggregate {
        self.active
            .entry(key.clone())
            .or_insert_with(|| Aggregate::open(key.clone(), anchor))
    }

    pub fn remove(&mut self, key: &AggregateKey) -> Option<Aggregate> {
        self.active.remove(key)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Keys whose aggregates have been quiet for longer than `timeout`
    pub fn idle_keys(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<AggregateKey> {
        let mut keys: Vec<_> = self
            .active
            .values()
            .filter(|a| a.is_idle(now, timeout))
            .map(|a| (a.last_buy_time, a.key.clone()))
            .collect();
        keys.sort();
        keys.into_iter().map(|(_, k)| k).collect()
    }

    /// Remove the oldest-by-anchor aggregates until at most `cap` remain.
    ///
    /// `keep` is never evicted (the aggregate that was just extended).
    pub fn evict_oldest(&mut self, cap: usize, keep: Option<&AggregateKey>) -> Vec<Aggregate> {
        if self.active.len() <= cap {
            return Vec::new();
        }
        let excess = self.active.len() - cap;

        let mut candidates: Vec<(DateTime<Utc>, AggregateKey)> = self
            .active
            .values()
            .filter(|a| Some(&a.key) != keep)
            .map(|a| (a.first_buy_time, a.key.clone()))
            .collect();
        candidates.sort();

        candidates
            .into_iter()
            .take(excess)
            .filter_map(|(_, key)| self.active.remove(&key))
            .collect()
    }

    /// Remove every aggregate (force flush)
    pub fn drain(&mut self) -> Vec<Aggregate> {
        let mut all: Vec<_> = self.active.drain().map(|(_, a)| a).collect();
        all.sort_by(|a, b| a.first_buy_time.cmp(&b.first_buy_time));
        all
    }
}
