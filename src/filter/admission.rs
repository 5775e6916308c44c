//! Admission filter
//!
//! Decides whether a purchase event may create or extend an aggregate:
//! 1. Direction and amount bounds (floor, per-purchase ceiling)
//! 2. Actor reputation (minimum age, maximum recent activity)
//!
//! Reputation lookups are fail-open: a provider error or timeout admits the
//! event and is logged, so a provider outage never blocks detection.

use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Error;
use crate::filter::cache::ReputationFacts;
use crate::filter::reputation::ReputationProvider;
use crate::metrics::DetectorMetrics;
use crate::state::SharedState;
use crate::types::{Direction, Namespace, PurchaseEvent};

/// Why an event was not aggregated
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    NotABuy,
    BelowFloor { amount_usd: f64, floor_usd: f64 },
    /// Too large to be a split fragment
    AboveCeiling { amount_usd: f64, ceiling_usd: f64 },
    ActorTooYoung { age_days: f64, min_age_days: f64 },
    /// Anti-automation heuristic
    ActorTooActive { recent_activity: u64, max_activity: u64 },
    /// Older than the anchor of the open aggregate
    OutOfOrder { anchor: chrono::DateTime<Utc> },
    /// Transaction already counted in the open aggregate
    Duplicate,
    PositionFull { max_purchases: usize },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotABuy => write!(f, "not a buy"),
            RejectReason::BelowFloor { amount_usd, floor_usd } => {
                write!(f, "${:.2} below analysis floor ${:.2}", amount_usd, floor_usd)
            }
            RejectReason::AboveCeiling { amount_usd, ceiling_usd } => {
                write!(f, "${:.2} above per-purchase ceiling ${:.2}", amount_usd, ceiling_usd)
            }
            RejectReason::ActorTooYoung { age_days, min_age_days } => {
                write!(f, "actor age {:.2}d below minimum {:.2}d", age_days, min_age_days)
            }
            RejectReason::ActorTooActive { recent_activity, max_activity } => {
                write!(f, "actor activity {} above maximum {}", recent_activity, max_activity)
            }
            RejectReason::OutOfOrder { anchor } => {
                write!(f, "timestamp before aggregate anchor {}", anchor)
            }
            RejectReason::Duplicate => write!(f, "duplicate transaction"),
            RejectReason::PositionFull { max_purchases } => {
                write!(f, "aggregate already holds {} purchases", max_purchases)
            }
        }
    }
}

/// Reputation facts gathered while admitting an event
#[derive(Debug, Clone, Default)]
pub struct Reputation {
    pub actor: Option<ReputationFacts>,
    pub asset: Option<ReputationFacts>,
}

/// Pre-aggregation gate
pub struct AdmissionFilter {
    floor_usd: f64,
    ceiling_usd: f64,
    min_actor_age_days: f64,
    max_actor_recent_activity: u64,
    lookup_assets: bool,
    lookup_timeout: Duration,
    provider: Option<Arc<dyn ReputationProvider>>,
    metrics: Arc<DetectorMetrics>,
}

impl AdmissionFilter {
    pub fn new(
        config: &Config,
        provider: Option<Arc<dyn ReputationProvider>>,
        metrics: Arc<DetectorMetrics>,
    ) -> Self {
        Self {
            floor_usd: config.detection.analysis_floor_usd,
            ceiling_usd: config.detection.per_purchase_ceiling_usd,
            min_actor_age_days: config.admission.min_actor_age_days,
            max_actor_recent_activity: config.admission.max_actor_recent_activity,
            lookup_assets: config.admission.lookup_assets,
            lookup_timeout: config.reputation.lookup_timeout(),
            provider,
            metrics,
        }
    }

    /// Cheap checks that need no reputation data
    pub fn screen(&self, event: &PurchaseEvent) -> Option<RejectReason> {
        if event.direction != Direction::Buy {
            return Some(RejectReason::NotABuy);
        }
        if event.amount_usd > self.ceiling_usd {
            return Some(RejectReason::AboveCeiling {
                amount_usd: event.amount_usd,
                ceiling_usd: self.ceiling_usd,
            });
        }
        if event.amount_usd < self.floor_usd {
            return Some(RejectReason::BelowFloor {
                amount_usd: event.amount_usd,
                floor_usd: self.floor_usd,
            });
        }
        None
    }

    /// Actor reputation gate
    pub fn check_actor(&self, facts: &ReputationFacts) -> Option<RejectReason> {
        if self.min_actor_age_days > 0.0 && facts.age_days < self.min_actor_age_days {
            return Some(RejectReason::ActorTooYoung {
                age_days: facts.age_days,
                min_age_days: self.min_actor_age_days,
            });
        }
        if facts.recent_activity_count > self.max_actor_recent_activity {
            return Some(RejectReason::ActorTooActive {
                recent_activity: facts.recent_activity_count,
                max_activity: self.max_actor_recent_activity,
            });
        }
        None
    }

    /// Fetch reputation (cache first) and apply the actor gate
    pub async fn check_reputation(
        &self,
        event: &PurchaseEvent,
        state: &SharedState,
    ) -> Result<Reputation, RejectReason> {
        let actor = self.lookup(Namespace::Actor, &event.actor_id, state).await;
        if let Some(facts) = &actor {
            if let Some(reason) = self.check_actor(facts) {
                return Err(reason);
            }
        }

        let asset = if self.lookup_assets {
            self.lookup(Namespace::Asset, &event.asset_id, state).await
        } else {
            None
        };

        Ok(Reputation { actor, asset })
    }

    /// Cached lookup; the lock is released while the provider is called
    async fn lookup(
        &self,
        namespace: Namespace,
        subject_id: &str,
        state: &SharedState,
    ) -> Option<ReputationFacts> {
        let provider = self.provider.as_ref()?;

        let cached = state
            .lock()
            .await
            .reputation
            .get(namespace, subject_id, Utc::now());
        if let Some(facts) = cached {
            self.metrics.record_cache_hit();
            return Some(facts);
        }
        self.metrics.record_cache_miss();

        match tokio::time::timeout(self.lookup_timeout, provider.lookup(namespace, subject_id)).await {
            Ok(Ok(facts)) => {
                state
                    .lock()
                    .await
                    .reputation
                    .insert(namespace, subject_id, facts.clone(), Utc::now());
                debug!(%namespace, subject = %subject_id, age_days = facts.age_days, "Reputation fetched");
                Some(facts)
            }
            Ok(Err(e)) => {
                self.fail_open(provider.name(), namespace, subject_id, e);
                None
            }
            Err(_) => {
                let e = Error::LookupTimeout(self.lookup_timeout.as_millis() as u64);
                self.fail_open(provider.name(), namespace, subject_id, e);
                None
            }
        }
    }

    fn fail_open(&self, provider: &str, namespace: Namespace, subject_id: &str, error: Error) {
        self.metrics.record_lookup_failure();
        warn!(
            provider,
            %namespace,
            subject = %subject_id,
            %error,
            retryable = error.is_retryable(),
            "Reputation lookup failed, admitting (fail-open)"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::filter::reputation::StaticReputationProvider;
    use crate::state::DetectorState;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    fn event(usd: f64, direction: Direction) -> PurchaseEvent {
        PurchaseEvent {
            actor_id: "wallet1".to_string(),
            asset_id: "TOKEN".to_string(),
            tx_id: "sig".to_string(),
            amount_usd: usd,
            amount_units: 10.0,
            timestamp: Utc::now(),
            direction,
        }
    }

    fn filter_with(config: &Config, provider: Option<Arc<dyn ReputationProvider>>) -> AdmissionFilter {
        AdmissionFilter::new(config, provider, Arc::new(DetectorMetrics::default()))
    }

    struct FailingProvider;

    #[async_trait]
    impl ReputationProvider for FailingProvider {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn lookup(&self, namespace: Namespace, subject_id: &str) -> Result<ReputationFacts> {
            Err(Error::LookupFailed {
                subject: format!("{}:{}", namespace, subject_id),
                reason: "503".to_string(),
            })
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl ReputationProvider for SlowProvider {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn lookup(&self, _namespace: Namespace, _subject_id: &str) -> Result<ReputationFacts> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ReputationFacts::default())
        }
    }

    #[test]
    fn test_screen_bounds() {
        let config = Config::default();
        let filter = filter_with(&config, None);

        assert_eq!(filter.screen(&event(3_000.0, Direction::Buy)), None);
        assert_eq!(filter.screen(&event(3_000.0, Direction::Sell)), Some(RejectReason::NotABuy));
        assert!(matches!(
            filter.screen(&event(8_500.0, Direction::Buy)),
            Some(RejectReason::AboveCeiling { .. })
        ));
        assert!(matches!(
            filter.screen(&event(100.0, Direction::Buy)),
            Some(RejectReason::BelowFloor { .. })
        ));
        // Bounds are inclusive
        assert_eq!(filter.screen(&event(8_000.0, Direction::Buy)), None);
        assert_eq!(filter.screen(&event(500.0, Direction::Buy)), None);
    }

    #[test]
    fn test_actor_gate() {
        let mut config = Config::default();
        config.admission.min_actor_age_days = 2.0;
        config.admission.max_actor_recent_activity = 100;
        let filter = filter_with(&config, None);

        let young = ReputationFacts { age_days: 1.0, recent_activity_count: 5, concentration_ratio: None };
        assert!(matches!(filter.check_actor(&young), Some(RejectReason::ActorTooYoung { .. })));

        let bot = ReputationFacts { age_days: 30.0, recent_activity_count: 500, concentration_ratio: None };
        assert!(matches!(filter.check_actor(&bot), Some(RejectReason::ActorTooActive { .. })));

        let normal = ReputationFacts { age_days: 30.0, recent_activity_count: 10, concentration_ratio: None };
        assert_eq!(filter.check_actor(&normal), None);
    }

    #[tokio::test]
    async fn test_lookup_failure_is_fail_open() {
        let config = Config::default();
        let state = Mutex::new(DetectorState::new(&config));
        let metrics = Arc::new(DetectorMetrics::default());
        let filter = AdmissionFilter::new(&config, Some(Arc::new(FailingProvider)), metrics.clone());

        let rep = filter.check_reputation(&event(3_000.0, Direction::Buy), &state).await;
        let rep = rep.expect("lookup failure must admit");
        assert!(rep.actor.is_none());
        assert_eq!(metrics.snapshot().lookup_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_timeout_is_fail_open() {
        let mut config = Config::default();
        config.admission.lookup_assets = false;
        let state = Mutex::new(DetectorState::new(&config));
        let metrics = Arc::new(DetectorMetrics::default());
        let filter = AdmissionFilter::new(&config, Some(Arc::new(SlowProvider)), metrics.clone());

        let rep = filter.check_reputation(&event(3_000.0, Direction::Buy), &state).await;
        assert!(rep.is_ok());
        assert_eq!(metrics.snapshot().lookup_failures, 1);
    }

    #[tokio::test]
    async fn test_second_lookup_hits_cache() {
        let config = Config::default();
        let state = Mutex::new(DetectorState::new(&config));
        let metrics = Arc::new(DetectorMetrics::default());
        let provider = StaticReputationProvider::new()
            .with_actor("wallet1", ReputationFacts { age_days: 3.0, ..Default::default() })
            .with_asset("TOKEN", ReputationFacts { age_days: 1.0, ..Default::default() });
        let filter = AdmissionFilter::new(&config, Some(Arc::new(provider)), metrics.clone());

        let e = event(3_000.0, Direction::Buy);
        filter.check_reputation(&e, &state).await.unwrap();
        let rep = filter.check_reputation(&e, &state).await.unwrap();

        assert_eq!(rep.actor.map(|f| f.age_days), Some(3.0));
        let snap = metrics.snapshot();
        assert_eq!(snap.cache_misses, 2);
        assert_eq!(snap.cache_hits, 2);
    }

    #[tokio::test]
    async fn test_rejected_actor_from_provider() {
        let mut config = Config::default();
        config.admission.max_actor_recent_activity = 50;
        let state = Mutex::new(DetectorState::new(&config));
        let provider = StaticReputationProvider::new().with_actor(
            "wallet1",
            ReputationFacts { age_days: 90.0, recent_activity_count: 400, concentration_ratio: None },
        );
        let filter = filter_with(&config, Some(Arc::new(provider)));

        let result = filter.check_reputation(&event(3_000.0, Direction::Buy), &state).await;
        assert!(matches!(result, Err(RejectReason::ActorTooActive { .. })));
    }
}
