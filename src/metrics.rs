//! Detector counters for monitoring

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::filter::RejectReason;

/// Counters shared by every detector component
#[derive(Debug, Default)]
pub struct DetectorMetrics {
    pub events_admitted: AtomicU64,
    pub events_rejected: AtomicU64,
    pub rejected_direction: AtomicU64,
    pub rejected_amount: AtomicU64,
    pub rejected_reputation: AtomicU64,
    pub rejected_out_of_order: AtomicU64,
    pub rejected_duplicate: AtomicU64,
    pub rejected_position_full: AtomicU64,
    pub invariant_guards: AtomicU64,
    pub lookup_failures: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub active_aggregates: AtomicU64,
    pub escalations: AtomicU64,
    pub finalized: AtomicU64,
    pub reported: AtomicU64,
    pub evictions: AtomicU64,
    pub delivery_failures: AtomicU64,
    pub scoring_panics: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub events_admitted: u64,
    pub events_rejected: u64,
    pub rejected_direction: u64,
    pub rejected_amount: u64,
    pub rejected_reputation: u64,
    pub rejected_out_of_order: u64,
    pub rejected_duplicate: u64,
    pub rejected_position_full: u64,
    pub invariant_guards: u64,
    pub lookup_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub active_aggregates: u64,
    pub escalations: u64,
    pub finalized: u64,
    pub reported: u64,
    pub evictions: u64,
    pub delivery_failures: u64,
    pub scoring_panics: u64,
}

fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl DetectorMetrics {
    pub fn record_admitted(&self) {
        incr(&self.events_admitted);
    }

    pub fn record_rejected(&self, reason: &RejectReason) {
        incr(&self.events_rejected);
        let counter = match reason {
            RejectReason::NotABuy => &self.rejected_direction,
            RejectReason::BelowFloor { .. } | RejectReason::AboveCeiling { .. } => {
                &self.rejected_amount
            }
            RejectReason::ActorTooYoung { .. } | RejectReason::ActorTooActive { .. } => {
                &self.rejected_reputation
            }
            RejectReason::OutOfOrder { .. } => &self.rejected_out_of_order,
            RejectReason::Duplicate => &self.rejected_duplicate,
            RejectReason::PositionFull { .. } => &self.rejected_position_full,
        };
        incr(counter);
    }

    pub fn record_invariant_guard(&self) {
        incr(&self.invariant_guards);
    }

    pub fn record_lookup_failure(&self) {
        incr(&self.lookup_failures);
    }

    pub fn record_cache_hit(&self) {
        incr(&self.cache_hits);
    }

    pub fn record_cache_miss(&self) {
        incr(&self.cache_misses);
    }

    pub fn set_active(&self, count: usize) {
        self.active_aggregates.store(count as u64, Ordering::Relaxed);
    }

    pub fn record_escalation(&self) {
        incr(&self.escalations);
    }

    pub fn record_finalized(&self) {
        incr(&self.finalized);
    }

    pub fn record_reported(&self) {
        incr(&self.reported);
    }

    pub fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_delivery_failure(&self) {
        incr(&self.delivery_failures);
    }

    pub fn record_scoring_panic(&self) {
        incr(&self.scoring_panics);
    }

    /// Cache hit rate in [0, 1]
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            events_admitted: load(&self.events_admitted),
            events_rejected: load(&self.events_rejected),
            rejected_direction: load(&self.rejected_direction),
            rejected_amount: load(&self.rejected_amount),
            rejected_reputation: load(&self.rejected_reputation),
            rejected_out_of_order: load(&self.rejected_out_of_order),
            rejected_duplicate: load(&self.rejected_duplicate),
            rejected_position_full: load(&self.rejected_position_full),
            invariant_guards: load(&self.invariant_guards),
            lookup_failures: load(&self.lookup_failures),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            active_aggregates: load(&self.active_aggregates),
            escalations: load(&self.escalations),
            finalized: load(&self.finalized),
            reported: load(&self.reported),
            evictions: load(&self.evictions),
            delivery_failures: load(&self.delivery_failures),
            scoring_panics: load(&self.scoring_panics),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_split_by_reason() {
        let metrics = DetectorMetrics::default();
        metrics.record_rejected(&RejectReason::AboveCeiling {
            amount_usd: 8_500.0,
            ceiling_usd: 8_000.0,
        });
        metrics.record_rejected(&RejectReason::Duplicate);
        metrics.record_admitted();

        let snap = metrics.snapshot();
        assert_eq!(snap.events_rejected, 2);
        assert_eq!(snap.rejected_amount, 1);
        assert_eq!(snap.rejected_duplicate, 1);
        assert_eq!(snap.events_admitted, 1);
    }

    #[test]
    fn test_hit_rate() {
        let metrics = DetectorMetrics::default();
        assert_eq!(metrics.cache_hit_rate(), 0.0);
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        assert!((metrics.cache_hit_rate() - 0.666).abs() < 0.01);
    }
}
