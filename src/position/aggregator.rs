//! Position aggregator
//!
//! Sole mutating entry point for purchase events. For each admitted event:
//! 1. Find or open the aggregate for (actor, asset)
//! 2. Roll over to a fresh aggregate if the event is outside the window
//! 3. Append, rescore, and fire a one-shot immediate escalation when the
//!    score crosses the auto-report threshold and the aggregate is reportable
//! 4. Enforce the active-aggregate cap
//!
//! State changes happen under the shared state lock; finalization and any
//! other collaborator call happens after the guard is dropped.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::aggregate::{Aggregate, Purchase, ScoringParams};
use super::finalizer::{FinalizeMode, FinalizeSummary, Finalizer, ReportGate};
use crate::config::Config;
use crate::error::Result;
use crate::filter::admission::{AdmissionFilter, RejectReason, Reputation};
use crate::filter::reputation::ReputationProvider;
use crate::metrics::DetectorMetrics;
use crate::scoring::RiskTier;
use crate::sink::{AlertSink, PersistenceSink};
use crate::state::{DetectorState, SharedState};
use crate::types::{AggregateKey, PurchaseEvent};

/// What happened to one ingested event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Rejected(RejectReason),
    Extended {
        aggregate_id: Uuid,
        purchase_count: usize,
        suspicion: f64,
        confidence: f64,
        risk_tier: RiskTier,
        /// The previous aggregate for this key was closed by the window
        rolled_over: bool,
        /// This event fired the immediate escalation
        escalated: bool,
    },
}

impl IngestOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self, IngestOutcome::Rejected(_))
    }
}

/// Aggregates to finalize once the lock is released
type Jobs = Vec<(Aggregate, FinalizeMode)>;

pub struct PositionAggregator {
    state: Arc<SharedState>,
    admission: AdmissionFilter,
    finalizer: Arc<Finalizer>,
    params: ScoringParams,
    gate: ReportGate,
    window: Duration,
    timeout: Duration,
    min_purchase_count: usize,
    max_purchase_count: usize,
    auto_report_threshold: f64,
    max_active: usize,
    finalize_on_evict: bool,
    metrics: Arc<DetectorMetrics>,
}

impl PositionAggregator {
    pub fn new(
        config: &Config,
        provider: Option<Arc<dyn ReputationProvider>>,
        store: Arc<dyn PersistenceSink>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let metrics = Arc::new(DetectorMetrics::default());
        let state = Arc::new(SharedState::new(DetectorState::new(config)));
        let admission = AdmissionFilter::new(config, provider, metrics.clone());
        let finalizer = Arc::new(Finalizer::new(config, store, alerts, metrics.clone()));

        Self {
            state,
            admission,
            finalizer,
            params: ScoringParams::from_config(config),
            gate: ReportGate::from_config(config),
            window: config.detection.window(),
            timeout: config.detection.timeout(),
            min_purchase_count: config.detection.min_purchase_count,
            max_purchase_count: config.detection.max_purchase_count,
            auto_report_threshold: config.scoring.auto_report_threshold,
            max_active: config.lifecycle.max_active_aggregates,
            finalize_on_evict: config.lifecycle.finalize_on_evict,
            metrics,
        }
    }

    pub fn metrics(&self) -> Arc<DetectorMetrics> {
        self.metrics.clone()
    }

    /// Admit and aggregate one event.
    ///
    /// Rejections are an `Ok` outcome; only an invariant guard (an event
    /// that would poison aggregate statistics) is returned as an error.
    pub async fn ingest(&self, event: PurchaseEvent) -> Result<IngestOutcome> {
        if let Some(reason) = self.admission.screen(&event) {
            return Ok(self.reject(&event, reason));
        }

        let purchase = match Purchase::from_event(&event) {
            Ok(purchase) => purchase,
            Err(e) => {
                self.metrics.record_invariant_guard();
                error!(actor = %event.actor_id, asset = %event.asset_id, tx = %event.tx_id, error = %e, "Purchase rejected");
                return Err(e);
            }
        };

        let reputation = match self.admission.check_reputation(&event, &self.state).await {
            Ok(reputation) => reputation,
            Err(reason) => return Ok(self.reject(&event, reason)),
        };

        let key = event.key();
        let extended = {
            let mut state = self.state.lock().await;
            self.extend(&mut state, &key, purchase, &reputation)
        };

        let (outcome, jobs) = match extended {
            Ok(extended) => extended,
            Err(reason) => return Ok(self.reject(&event, reason)),
        };
        self.metrics.record_admitted();

        self.run_jobs(jobs).await;
        Ok(outcome)
    }

    fn reject(&self, event: &PurchaseEvent, reason: RejectReason) -> IngestOutcome {
        self.metrics.record_rejected(&reason);
        debug!(
            actor = %event.actor_id,
            asset = %event.asset_id,
            tx = %event.tx_id,
            amount_usd = event.amount_usd,
            %reason,
            "Event rejected"
        );
        IngestOutcome::Rejected(reason)
    }

    /// Apply an admitted purchase. Runs under the state lock.
    fn extend(
        &self,
        state: &mut DetectorState,
        key: &AggregateKey,
        purchase: Purchase,
        reputation: &Reputation,
    ) -> std::result::Result<(IngestOutcome, Jobs), RejectReason> {
        let mut jobs = Jobs::new();
        let mut rolled_over = false;

        if let Some(existing) = state.positions.get(key) {
            if purchase.timestamp < existing.first_buy_time {
                return Err(RejectReason::OutOfOrder {
                    anchor: existing.first_buy_time,
                });
            }
            if existing.contains_tx(&purchase.tx_id) {
                return Err(RejectReason::Duplicate);
            }

            let outside = existing.is_outside_window(purchase.timestamp, self.window);
            let full = existing.purchase_count >= self.max_purchase_count;

            if outside {
                if let Some(closed) = state.positions.remove(key) {
                    info!(
                        %key,
                        aggregate = %closed.id,
                        count = closed.purchase_count,
                        "Window elapsed, rolling over"
                    );
                    jobs.push((closed, FinalizeMode::Rollover));
                    rolled_over = true;
                }
            } else if full {
                return Err(RejectReason::PositionFull {
                    max_purchases: self.max_purchase_count,
                });
            }
        }

        let aggregate = state.positions.get_or_open(key, purchase.timestamp);
        aggregate.apply_reputation(reputation.actor.as_ref(), reputation.asset.as_ref());
        aggregate.push(purchase);
        if !aggregate.rescore(&self.params) {
            self.metrics.record_scoring_panic();
        }

        // The flag is only spent on an escalation that will be reported
        let mut escalated = false;
        if !aggregate.escalated
            && aggregate.purchase_count >= self.min_purchase_count
            && aggregate.score.suspicion >= self.auto_report_threshold
            && self.gate.evaluate(aggregate).is_empty()
        {
            aggregate.escalated = true;
            escalated = true;
            self.metrics.record_escalation();
            warn!(
                %key,
                aggregate = %aggregate.id,
                suspicion = aggregate.score.suspicion,
                count = aggregate.purchase_count,
                "Auto-report threshold crossed, escalating"
            );
            jobs.push((aggregate.clone(), FinalizeMode::Immediate));
        }

        let outcome = IngestOutcome::Extended {
            aggregate_id: aggregate.id,
            purchase_count: aggregate.purchase_count,
            suspicion: aggregate.score.suspicion,
            confidence: aggregate.score.confidence,
            risk_tier: aggregate.score.risk_tier,
            rolled_over,
            escalated,
        };

        let evicted = state.positions.evict_oldest(self.max_active, Some(key));
        if !evicted.is_empty() {
            self.record_evictions(&evicted);
            if self.finalize_on_evict {
                jobs.extend(evicted.into_iter().map(|a| (a, FinalizeMode::Evicted)));
            }
        }
        self.metrics.set_active(state.positions.len());

        Ok((outcome, jobs))
    }

    fn record_evictions(&self, evicted: &[Aggregate]) {
        self.metrics.record_evictions(evicted.len());
        warn!(
            count = evicted.len(),
            cap = self.max_active,
            finalize = self.finalize_on_evict,
            "Active aggregate cap exceeded, evicting oldest"
        );
    }

    /// Finalize queued aggregates. Must be called without the lock held.
    async fn run_jobs(&self, jobs: Jobs) -> Vec<FinalizeSummary> {
        let mut summaries = Vec::with_capacity(jobs.len());
        for (aggregate, mode) in jobs {
            let key = aggregate.key.clone();
            let summary = self.finalizer.finalize(aggregate, mode).await;

            if mode == FinalizeMode::Immediate && summary.record_id.is_some() {
                // The aggregate may have rolled over or been evicted meanwhile
                let mut state = self.state.lock().await;
                match state.positions.get_mut(&key) {
                    Some(open) if open.id == summary.aggregate_id => {
                        open.escalation_record_id = summary.record_id.clone();
                    }
                    _ => debug!(%key, "Escalated aggregate closed before write-back"),
                }
            }
            summaries.push(summary);
        }
        summaries
    }

    /// Finalize every aggregate idle for longer than the timeout.
    ///
    /// Checks `shutdown` between aggregates; idleness is re-validated under
    /// the lock before each removal.
    pub async fn sweep_timeouts(
        &self,
        now: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> Vec<FinalizeSummary> {
        let keys = self.state.lock().await.positions.idle_keys(now, self.timeout);
        let mut summaries = Vec::new();

        for key in keys {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, stopping timeout sweep");
                break;
            }

            let closed = {
                let mut state = self.state.lock().await;
                let idle = state
                    .positions
                    .get(&key)
                    .map(|a| a.is_idle(now, self.timeout))
                    .unwrap_or(false);
                let closed = if idle { state.positions.remove(&key) } else { None };
                self.metrics.set_active(state.positions.len());
                closed
            };

            if let Some(aggregate) = closed {
                summaries.extend(self.run_jobs(vec![(aggregate, FinalizeMode::Timeout)]).await);
            }
        }

        if !summaries.is_empty() {
            info!(closed = summaries.len(), "Timeout sweep finished");
        }
        summaries
    }

    /// Trim the active map down to the configured cap
    pub async fn enforce_capacity(&self) -> usize {
        let evicted = {
            let mut state = self.state.lock().await;
            let evicted = state.positions.evict_oldest(self.max_active, None);
            self.metrics.set_active(state.positions.len());
            evicted
        };
        if evicted.is_empty() {
            return 0;
        }

        let count = evicted.len();
        self.record_evictions(&evicted);
        if self.finalize_on_evict {
            self.run_jobs(evicted.into_iter().map(|a| (a, FinalizeMode::Evicted)).collect())
                .await;
        }
        count
    }

    /// Drop expired reputation entries
    pub async fn purge_cache(&self, now: DateTime<Utc>) -> usize {
        let purged = self.state.lock().await.reputation.purge_expired(now);
        if purged > 0 {
            debug!(purged, "Expired reputation entries purged");
        }
        purged
    }

    /// Finalize every open aggregate (shutdown, end of replay)
    pub async fn flush_all(&self) -> Vec<FinalizeSummary> {
        let drained = {
            let mut state = self.state.lock().await;
            let drained = state.positions.drain();
            self.metrics.set_active(0);
            drained
        };
        info!(count = drained.len(), "Flushing open aggregates");
        self.run_jobs(drained.into_iter().map(|a| (a, FinalizeMode::Flush)).collect())
            .await
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.positions.len()
    }

    /// Copy of the open aggregate for `key`
    pub async fn snapshot(&self, key: &AggregateKey) -> Option<Aggregate> {
        self.state.lock().await.positions.get(key).cloned()
    }

    #[cfg(test)]
    pub(crate) fn shared_state(&self) -> &SharedState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::filter::cache::ReputationFacts;
    use crate::filter::reputation::StaticReputationProvider;
    use crate::sink::{Alert, AlertKind, MemoryRecordStore};
    use crate::types::Direction;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingAlerts {
        alerts: Mutex<Vec<Alert>>,
    }

    #[async_trait]
    impl AlertSink for RecordingAlerts {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send(&self, alert: &Alert) -> Result<()> {
            self.alerts.lock().await.push(alert.clone());
            Ok(())
        }
    }

    struct Harness {
        aggregator: PositionAggregator,
        store: Arc<MemoryRecordStore>,
        alerts: Arc<RecordingAlerts>,
    }

    fn harness(config: Config) -> Harness {
        harness_with(config, None)
    }

    fn harness_with(config: Config, provider: Option<Arc<dyn ReputationProvider>>) -> Harness {
        let store = Arc::new(MemoryRecordStore::new());
        let alerts = Arc::new(RecordingAlerts::default());
        let aggregator = PositionAggregator::new(&config, provider, store.clone(), alerts.clone());
        Harness { aggregator, store, alerts }
    }

    fn buy(actor: &str, tx: &str, usd: f64, at: DateTime<Utc>) -> PurchaseEvent {
        PurchaseEvent {
            actor_id: actor.to_string(),
            asset_id: "TOKEN".to_string(),
            tx_id: tx.to_string(),
            amount_usd: usd,
            amount_units: usd / 0.5,
            timestamp: at,
            direction: Direction::Buy,
        }
    }

    fn key(actor: &str) -> AggregateKey {
        AggregateKey::new(actor, "TOKEN")
    }

    #[tokio::test]
    async fn test_three_similar_purchases() {
        let mut config = Config::default();
        config.similarity.tolerance_percent = 2.0;
        let h = harness(config);
        let t0 = Utc::now() - Duration::minutes(30);

        for (i, usd) in [3_000.0, 3_050.0, 2_980.0].iter().enumerate() {
            let at = t0 + Duration::minutes(i as i64 * 10);
            let outcome = h.aggregator.ingest(buy("wallet1", &format!("s{}", i), *usd, at)).await.unwrap();
            assert!(!outcome.is_rejected());
        }

        let agg = h.aggregator.snapshot(&key("wallet1")).await.unwrap();
        assert!(agg.similarity.has_similar_sizes);
        assert_eq!(agg.similarity.similar_count, 3);
        assert!((agg.similarity.size_tolerance_percent - 1.6667).abs() < 0.01);
        assert_eq!(agg.elapsed_minutes, 20.0);
    }

    #[tokio::test]
    async fn test_above_ceiling_does_not_extend() {
        let h = harness(Config::default());
        let t0 = Utc::now();

        h.aggregator.ingest(buy("wallet1", "s1", 3_000.0, t0)).await.unwrap();
        let outcome = h
            .aggregator
            .ingest(buy("wallet1", "s2", 8_500.0, t0 + Duration::minutes(1)))
            .await
            .unwrap();

        assert!(matches!(outcome, IngestOutcome::Rejected(RejectReason::AboveCeiling { .. })));
        assert_eq!(h.aggregator.snapshot(&key("wallet1")).await.unwrap().purchase_count, 1);
        assert_eq!(h.aggregator.metrics().snapshot().rejected_amount, 1);
    }

    #[tokio::test]
    async fn test_window_cutover_starts_fresh_aggregate() {
        let h = harness(Config::default());
        let t0 = Utc::now() - Duration::hours(2);

        h.aggregator.ingest(buy("wallet1", "s1", 3_000.0, t0)).await.unwrap();
        h.aggregator.ingest(buy("wallet1", "s2", 3_000.0, t0 + Duration::minutes(5))).await.unwrap();
        let first_id = h.aggregator.snapshot(&key("wallet1")).await.unwrap().id;

        let late = t0 + Duration::minutes(60) + Duration::seconds(1);
        let outcome = h.aggregator.ingest(buy("wallet1", "s3", 3_000.0, late)).await.unwrap();

        match outcome {
            IngestOutcome::Extended { rolled_over, purchase_count, aggregate_id, .. } => {
                assert!(rolled_over);
                assert_eq!(purchase_count, 1);
                assert_ne!(aggregate_id, first_id);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let agg = h.aggregator.snapshot(&key("wallet1")).await.unwrap();
        assert_eq!(agg.purchase_count, 1);
        assert_eq!(agg.first_buy_time, late);
        assert_eq!(h.aggregator.metrics().snapshot().finalized, 1);
    }

    #[tokio::test]
    async fn test_exactly_at_window_edge_extends() {
        let h = harness(Config::default());
        let t0 = Utc::now() - Duration::hours(2);

        h.aggregator.ingest(buy("wallet1", "s1", 3_000.0, t0)).await.unwrap();
        let outcome = h
            .aggregator
            .ingest(buy("wallet1", "s2", 3_000.0, t0 + Duration::minutes(60)))
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Extended { rolled_over: false, purchase_count: 2, .. }));
    }

    #[tokio::test]
    async fn test_escalation_fires_at_most_once() {
        let h = harness(Config::default());
        let t0 = Utc::now() - Duration::minutes(20);

        let mut escalations = 0;
        for i in 0..10 {
            let at = t0 + Duration::minutes(i);
            let outcome = h.aggregator.ingest(buy("wallet1", &format!("s{}", i), 4_000.0, at)).await.unwrap();
            if let IngestOutcome::Extended { escalated: true, .. } = outcome {
                escalations += 1;
            }
        }

        assert_eq!(escalations, 1);
        assert_eq!(h.aggregator.metrics().snapshot().escalations, 1);

        let agg = h.aggregator.snapshot(&key("wallet1")).await.unwrap();
        assert!(agg.escalated);
        assert_eq!(agg.purchase_count, 10);
        assert!(agg.escalation_record_id.is_some());

        let alerts = h.alerts.alerts.lock().await.clone();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Escalation);
        assert_eq!(alerts[0].purchase_count, 3);
    }

    #[tokio::test]
    async fn test_escalation_waits_until_reportable() {
        let mut config = Config::default();
        config.similarity.tolerance_percent = 2.0;
        let h = harness(config);
        let t0 = Utc::now() - Duration::minutes(50);

        // Third purchase scores above the auto-report threshold but the
        // total is still under the reporting minimum
        let mut escalated_at = Vec::new();
        for (i, usd) in [3_000.0, 3_050.0, 2_980.0, 3_010.0, 3_020.0].iter().enumerate() {
            let at = t0 + Duration::minutes(i as i64 * 10);
            let outcome = h.aggregator.ingest(buy("wallet1", &format!("s{}", i), *usd, at)).await.unwrap();
            if let IngestOutcome::Extended { escalated: true, suspicion, .. } = outcome {
                assert!(suspicion >= 85.0);
                escalated_at.push(i + 1);
            }
        }

        assert_eq!(escalated_at, vec![4]);
        assert_eq!(h.aggregator.metrics().snapshot().escalations, 1);

        let alerts = h.alerts.alerts.lock().await.clone();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Escalation);
        assert_eq!(alerts[0].purchase_count, 4);
        assert!(h.aggregator.snapshot(&key("wallet1")).await.unwrap().escalation_record_id.is_some());
    }

    #[tokio::test]
    async fn test_flush_after_escalation_reports_final_record() {
        let h = harness(Config::default());
        let t0 = Utc::now() - Duration::minutes(20);
        for i in 0..5 {
            let at = t0 + Duration::minutes(i);
            h.aggregator.ingest(buy("wallet1", &format!("s{}", i), 4_000.0, at)).await.unwrap();
        }

        let summaries = h.aggregator.flush_all().await;
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].reportable);
        assert_eq!(h.aggregator.active_count().await, 0);

        let records = h.store.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].1.mode, FinalizeMode::Immediate);
        assert!(!records[0].1.escalated_earlier);
        assert_eq!(records[1].1.mode, FinalizeMode::Flush);
        assert!(records[1].1.escalated_earlier);
        assert_eq!(records[1].1.purchase_count, 5);
    }

    #[tokio::test]
    async fn test_sum_invariant_across_rollovers() {
        let h = harness(Config::default());
        let t0 = Utc::now() - Duration::hours(3);
        let amounts = [512.25, 7_999.5, 1_234.56, 3_333.33, 6_001.01, 999.99, 2_500.0];

        for (i, usd) in amounts.iter().enumerate() {
            let at = t0 + Duration::minutes(i as i64 * 7);
            h.aggregator.ingest(buy("wallet1", &format!("s{}", i), *usd, at)).await.unwrap();
            let agg = h.aggregator.snapshot(&key("wallet1")).await.unwrap();
            let sum: f64 = agg.purchases.iter().map(|p| p.amount_usd).sum();
            assert!((agg.total_usd - sum).abs() <= sum * 1e-6);
            assert_eq!(agg.purchase_count, agg.purchases.len());
            assert!(agg.min_purchase_usd <= agg.avg_purchase_usd && agg.avg_purchase_usd <= agg.max_purchase_usd);
        }
    }

    #[tokio::test]
    async fn test_capacity_bound_on_ingest() {
        let mut config = Config::default();
        config.lifecycle.max_active_aggregates = 3;
        let h = harness(config);
        let t0 = Utc::now() - Duration::minutes(10);

        for i in 0..6 {
            let at = t0 + Duration::seconds(i);
            h.aggregator.ingest(buy(&format!("w{}", i), "s", 1_000.0, at)).await.unwrap();
            assert!(h.aggregator.active_count().await <= 3);
        }

        // The newest aggregate survives, the oldest are gone
        assert!(h.aggregator.snapshot(&key("w5")).await.is_some());
        assert!(h.aggregator.snapshot(&key("w0")).await.is_none());
        let snap = h.aggregator.metrics().snapshot();
        assert_eq!(snap.evictions, 3);
        assert_eq!(snap.finalized, 0);
    }

    #[tokio::test]
    async fn test_enforce_capacity_evicts_oldest_anchors() {
        let mut config = Config::default();
        config.lifecycle.max_active_aggregates = 2;
        config.lifecycle.finalize_on_evict = true;
        let h = harness(config);
        let t0 = Utc::now() - Duration::minutes(10);

        {
            let mut state = h.aggregator.shared_state().lock().await;
            for i in 0..5 {
                let at = t0 + Duration::seconds(i);
                let actor = format!("w{}", i);
                let purchase = Purchase::from_event(&buy(&actor, "s", 1_000.0, at)).unwrap();
                state.positions.get_or_open(&key(&actor), at).push(purchase);
            }
        }

        assert_eq!(h.aggregator.enforce_capacity().await, 3);
        assert_eq!(h.aggregator.active_count().await, 2);
        assert!(h.aggregator.snapshot(&key("w3")).await.is_some());
        assert!(h.aggregator.snapshot(&key("w4")).await.is_some());

        let snap = h.aggregator.metrics().snapshot();
        assert_eq!(snap.evictions, 3);
        assert_eq!(snap.finalized, 3);
        assert_eq!(snap.active_aggregates, 2);

        // Already within the cap
        assert_eq!(h.aggregator.enforce_capacity().await, 0);
    }

    #[tokio::test]
    async fn test_finalize_on_evict() {
        let mut config = Config::default();
        config.lifecycle.max_active_aggregates = 1;
        config.lifecycle.finalize_on_evict = true;
        let h = harness(config);
        let t0 = Utc::now() - Duration::minutes(10);

        h.aggregator.ingest(buy("w0", "a", 1_000.0, t0)).await.unwrap();
        h.aggregator.ingest(buy("w1", "b", 1_000.0, t0 + Duration::seconds(1))).await.unwrap();

        assert_eq!(h.aggregator.active_count().await, 1);
        assert_eq!(h.aggregator.metrics().snapshot().finalized, 1);
    }

    #[tokio::test]
    async fn test_timeout_sweep_finalizes_exactly_once() {
        let h = harness(Config::default());
        let last = Utc::now() - Duration::minutes(45);
        for i in 0..5 {
            let at = last - Duration::minutes(4 - i);
            h.aggregator.ingest(buy("wallet1", &format!("s{}", i), 2_500.0, at)).await.unwrap();
        }
        h.aggregator.ingest(buy("fresh", "f", 2_500.0, Utc::now())).await.unwrap();

        let token = CancellationToken::new();
        let now = Utc::now();
        let first = h.aggregator.sweep_timeouts(now, &token).await;
        let second = h.aggregator.sweep_timeouts(now, &token).await;

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].mode, FinalizeMode::Timeout);
        assert_eq!(first[0].key, key("wallet1"));
        assert!(second.is_empty());
        assert_eq!(h.aggregator.active_count().await, 1);
        assert_eq!(h.aggregator.metrics().snapshot().finalized, 1);
    }

    #[tokio::test]
    async fn test_cancelled_sweep_leaves_aggregates() {
        let h = harness(Config::default());
        h.aggregator
            .ingest(buy("wallet1", "s1", 2_500.0, Utc::now() - Duration::hours(1)))
            .await
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        assert!(h.aggregator.sweep_timeouts(Utc::now(), &token).await.is_empty());
        assert_eq!(h.aggregator.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_out_of_order() {
        let h = harness(Config::default());
        let t0 = Utc::now() - Duration::minutes(30);

        h.aggregator.ingest(buy("wallet1", "s1", 3_000.0, t0 + Duration::minutes(5))).await.unwrap();

        let dup = h.aggregator.ingest(buy("wallet1", "s1", 3_000.0, t0 + Duration::minutes(5))).await.unwrap();
        assert_eq!(dup, IngestOutcome::Rejected(RejectReason::Duplicate));

        let early = h.aggregator.ingest(buy("wallet1", "s0", 3_000.0, t0)).await.unwrap();
        assert!(matches!(early, IngestOutcome::Rejected(RejectReason::OutOfOrder { .. })));

        // Late but still after the anchor is accepted
        h.aggregator.ingest(buy("wallet1", "s3", 3_000.0, t0 + Duration::minutes(20))).await.unwrap();
        let late = h.aggregator.ingest(buy("wallet1", "s2", 3_000.0, t0 + Duration::minutes(10))).await.unwrap();
        assert!(!late.is_rejected());

        let agg = h.aggregator.snapshot(&key("wallet1")).await.unwrap();
        assert_eq!(agg.purchase_count, 3);
        assert_eq!(agg.last_buy_time, t0 + Duration::minutes(20));
        assert_eq!(agg.elapsed_minutes, 15.0);
    }

    #[tokio::test]
    async fn test_position_full() {
        let mut config = Config::default();
        config.detection.max_purchase_count = 3;
        let h = harness(config);
        let t0 = Utc::now() - Duration::minutes(30);

        for i in 0..3 {
            h.aggregator.ingest(buy("wallet1", &format!("s{}", i), 600.0, t0 + Duration::minutes(i))).await.unwrap();
        }
        let outcome = h.aggregator.ingest(buy("wallet1", "s9", 600.0, t0 + Duration::minutes(5))).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Rejected(RejectReason::PositionFull { max_purchases: 3 }));
    }

    #[tokio::test]
    async fn test_invariant_guard_leaves_state_untouched() {
        let h = harness(Config::default());
        let mut event = buy("wallet1", "s1", 3_000.0, Utc::now());
        event.amount_units = 0.0;

        let err = h.aggregator.ingest(event).await.unwrap_err();
        assert!(matches!(err, Error::InvariantGuard(_)));
        assert_eq!(h.aggregator.active_count().await, 0);
        assert_eq!(h.aggregator.metrics().snapshot().invariant_guards, 1);
    }

    #[tokio::test]
    async fn test_young_actor_raises_score() {
        let provider = StaticReputationProvider::new()
            .with_actor("fresh", ReputationFacts { age_days: 0.5, ..Default::default() });
        let h = harness_with(Config::default(), Some(Arc::new(provider)));
        let t0 = Utc::now() - Duration::minutes(10);

        h.aggregator.ingest(buy("fresh", "s1", 1_000.0, t0)).await.unwrap();
        let agg = h.aggregator.snapshot(&key("fresh")).await.unwrap();
        assert_eq!(agg.actor_age_days, Some(0.5));
        assert!(agg.score.reasons.iter().any(|r| r.contains("actor")));
    }

    #[tokio::test]
    async fn test_concurrent_ingest_keeps_map_consistent() {
        let h = Arc::new(harness(Config::default()));
        let t0 = Utc::now() - Duration::minutes(30);

        let mut handles = Vec::new();
        for actor in 0..8 {
            let h = h.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..5 {
                    let at = t0 + Duration::minutes(i);
                    h.aggregator
                        .ingest(buy(&format!("w{}", actor), &format!("s{}", i), 1_500.0, at))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(h.aggregator.active_count().await, 8);
        for actor in 0..8 {
            let agg = h.aggregator.snapshot(&key(&format!("w{}", actor))).await.unwrap();
            assert_eq!(agg.purchase_count, 5);
            assert_eq!(agg.total_usd, 7_500.0);
        }
        assert_eq!(h.aggregator.metrics().snapshot().events_admitted, 40);
    }
}
