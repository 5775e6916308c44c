//! Aggregate finalization
//!
//! Decides whether a closed (or escalating) aggregate is reportable and
//! hands reportable ones to the persistence and alert sinks. Delivery is
//! best-effort: every sink call is bounded by a timeout, and failures are
//! logged and counted but never propagated.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::aggregate::{Aggregate, ScoringParams};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::DetectorMetrics;
use crate::scoring::RiskTier;
use crate::sink::{Alert, AlertSink, DetectionRecord, PersistenceSink};
use crate::types::AggregateKey;

/// Why an aggregate is being finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeMode {
    /// Score threshold crossed; the aggregate stays open
    Immediate,
    /// A later purchase fell outside the window
    Rollover,
    /// Idle longer than the timeout
    Timeout,
    /// Explicit force flush
    Flush,
    /// Removed by the capacity sweep
    Evicted,
}

impl fmt::Display for FinalizeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinalizeMode::Immediate => "immediate",
            FinalizeMode::Rollover => "rollover",
            FinalizeMode::Timeout => "timeout",
            FinalizeMode::Flush => "flush",
            FinalizeMode::Evicted => "evicted",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one finalization, returned whether or not it was reported
#[derive(Debug, Clone, Serialize)]
pub struct FinalizeSummary {
    pub aggregate_id: Uuid,
    pub key: AggregateKey,
    pub mode: FinalizeMode,
    pub reportable: bool,
    /// Failed gate conditions, empty when reportable
    pub reasons_not_reportable: Vec<String>,
    pub purchase_count: usize,
    pub total_usd: f64,
    pub suspicion: f64,
    pub confidence: f64,
    pub risk_tier: RiskTier,
    pub record_id: Option<String>,
    pub alert_sent: bool,
}

/// Reportability thresholds
#[derive(Debug, Clone)]
pub struct ReportGate {
    pub min_purchase_count: usize,
    pub min_total_usd: f64,
    pub min_suspicion_score: f64,
    pub min_confidence: f64,
    pub window: Duration,
}

impl ReportGate {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_purchase_count: config.detection.min_purchase_count,
            min_total_usd: config.detection.min_total_usd,
            min_suspicion_score: config.scoring.min_suspicion_score,
            min_confidence: config.scoring.min_confidence,
            window: config.detection.window(),
        }
    }

    /// Failed conditions; empty means reportable
    pub fn evaluate(&self, aggregate: &Aggregate) -> Vec<String> {
        let mut failed = Vec::new();
        if aggregate.purchase_count < self.min_purchase_count {
            failed.push(format!(
                "count {} < {}",
                aggregate.purchase_count, self.min_purchase_count
            ));
        }
        if aggregate.total_usd < self.min_total_usd {
            failed.push(format!(
                "total ${:.2} < ${:.2}",
                aggregate.total_usd, self.min_total_usd
            ));
        }
        if aggregate.score.suspicion < self.min_suspicion_score {
            failed.push(format!(
                "suspicion {:.0} < {:.0}",
                aggregate.score.suspicion, self.min_suspicion_score
            ));
        }
        if !aggregate.similarity.has_similar_sizes {
            failed.push("no similar-size cluster".to_string());
        }
        if aggregate.window_elapsed() > self.window {
            failed.push(format!(
                "elapsed {:.1} min exceeds window",
                aggregate.elapsed_minutes
            ));
        }
        if aggregate.score.confidence < self.min_confidence {
            failed.push(format!(
                "confidence {:.0} < {:.0}",
                aggregate.score.confidence, self.min_confidence
            ));
        }
        failed
    }
}

pub struct Finalizer {
    gate: ReportGate,
    params: ScoringParams,
    store: Arc<dyn PersistenceSink>,
    alerts: Arc<dyn AlertSink>,
    delivery_timeout: std::time::Duration,
    metrics: Arc<DetectorMetrics>,
}

impl Finalizer {
    pub fn new(
        config: &Config,
        store: Arc<dyn PersistenceSink>,
        alerts: Arc<dyn AlertSink>,
        metrics: Arc<DetectorMetrics>,
    ) -> Self {
        Self {
            gate: ReportGate::from_config(config),
            params: ScoringParams::from_config(config),
            store,
            alerts,
            delivery_timeout: config.sinks.delivery_timeout(),
            metrics,
        }
    }

    pub fn gate(&self) -> &ReportGate {
        &self.gate
    }

    /// Score, gate and (if reportable) persist and alert.
    ///
    /// Must be called without holding the detector state lock.
    pub async fn finalize(&self, mut aggregate: Aggregate, mode: FinalizeMode) -> FinalizeSummary {
        if !aggregate.rescore(&self.params) {
            self.metrics.record_scoring_panic();
        }

        let failed = self.gate.evaluate(&aggregate);
        let reportable = failed.is_empty();

        if mode != FinalizeMode::Immediate {
            self.metrics.record_finalized();
        }

        let mut summary = FinalizeSummary {
            aggregate_id: aggregate.id,
            key: aggregate.key.clone(),
            mode,
            reportable,
            reasons_not_reportable: failed,
            purchase_count: aggregate.purchase_count,
            total_usd: aggregate.total_usd,
            suspicion: aggregate.score.suspicion,
            confidence: aggregate.score.confidence,
            risk_tier: aggregate.score.risk_tier,
            record_id: None,
            alert_sent: false,
        };

        if !reportable {
            debug!(
                key = %summary.key,
                %mode,
                suspicion = summary.suspicion,
                confidence = summary.confidence,
                reasons = ?summary.reasons_not_reportable,
                "Aggregate not reportable"
            );
            return summary;
        }

        self.metrics.record_reported();
        info!(
            key = %summary.key,
            %mode,
            count = summary.purchase_count,
            total_usd = summary.total_usd,
            suspicion = summary.suspicion,
            confidence = summary.confidence,
            tier = %summary.risk_tier,
            "Structuring detected"
        );

        let record = DetectionRecord::from_aggregate(&aggregate, mode, Utc::now());

        summary.record_id = self.deliver(self.store.name(), self.store.save(&record)).await;

        let alert = Alert::from_record(&record, summary.record_id.clone());
        summary.alert_sent = self
            .deliver(self.alerts.name(), self.alerts.send(&alert))
            .await
            .is_some();

        if let Some(id) = &summary.record_id {
            self.deliver(
                self.store.name(),
                self.store.mark_processed(id, summary.alert_sent),
            )
            .await;
        }

        summary
    }

    /// Run one sink call under the delivery timeout; failures are swallowed
    async fn deliver<T, F>(&self, sink: &str, call: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        let err = match tokio::time::timeout(self.delivery_timeout, call).await {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(e)) => e,
            Err(_) => Error::DeliveryTimeout {
                sink: sink.to_string(),
                timeout_ms: self.delivery_timeout.as_millis() as u64,
            },
        };
        self.metrics.record_delivery_failure();
        warn!(sink, error = %err, "Delivery failed, dropping");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::aggregate::Purchase;
    use crate::sink::MemoryRecordStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingAlerts {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl AlertSink for RecordingAlerts {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send(&self, _alert: &Alert) -> Result<()> {
            self.sent.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct DownAlerts;

    #[async_trait]
    impl AlertSink for DownAlerts {
        fn name(&self) -> &'static str {
            "down"
        }

        async fn send(&self, _alert: &Alert) -> Result<()> {
            Err(Error::DeliveryFailed { sink: "down".into(), reason: "connection refused".into() })
        }
    }

    struct HangingStore;

    #[async_trait]
    impl PersistenceSink for HangingStore {
        fn name(&self) -> &'static str {
            "hanging"
        }

        async fn save(&self, _record: &DetectionRecord) -> Result<String> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok("never".to_string())
        }

        async fn mark_processed(&self, _id: &str, _escalated: bool) -> Result<()> {
            Ok(())
        }
    }

    fn aggregate(amounts: &[f64], spacing_min: i64) -> Aggregate {
        let t0 = Utc::now();
        let mut agg = Aggregate::open(AggregateKey::new("wallet1", "TOKEN"), t0);
        for (i, usd) in amounts.iter().enumerate() {
            agg.push(Purchase {
                tx_id: format!("sig{}", i),
                amount_usd: *usd,
                amount_units: usd / 2.0,
                unit_price: 2.0,
                timestamp: t0 + Duration::minutes(i as i64 * spacing_min),
            });
        }
        agg
    }

    #[tokio::test]
    async fn test_reportable_aggregate_is_saved_alerted_and_marked() {
        let config = Config::default();
        let store = Arc::new(MemoryRecordStore::new());
        let alerts = Arc::new(RecordingAlerts::default());
        let metrics = Arc::new(DetectorMetrics::default());
        let finalizer = Finalizer::new(&config, store.clone(), alerts.clone(), metrics.clone());

        let agg = aggregate(&[3_000.0, 3_050.0, 2_980.0, 3_010.0, 3_020.0], 5);
        let summary = finalizer.finalize(agg, FinalizeMode::Timeout).await;

        assert!(summary.reportable, "not reportable: {:?}", summary.reasons_not_reportable);
        assert!(summary.alert_sent);
        assert_eq!(alerts.sent.load(Ordering::Relaxed), 1);

        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1.mode, FinalizeMode::Timeout);
        assert_eq!(store.processed().await, vec![(records[0].0.clone(), true)]);

        let snap = metrics.snapshot();
        assert_eq!(snap.finalized, 1);
        assert_eq!(snap.reported, 1);
    }

    #[tokio::test]
    async fn test_small_aggregate_not_reportable() {
        let config = Config::default();
        let store = Arc::new(MemoryRecordStore::new());
        let finalizer = Finalizer::new(
            &config,
            store.clone(),
            Arc::new(RecordingAlerts::default()),
            Arc::new(DetectorMetrics::default()),
        );

        let summary = finalizer.finalize(aggregate(&[3_000.0, 3_050.0], 5), FinalizeMode::Flush).await;
        assert!(!summary.reportable);
        assert!(summary.reasons_not_reportable.iter().any(|r| r.starts_with("count")));
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_alert_failure_is_swallowed() {
        let config = Config::default();
        let store = Arc::new(MemoryRecordStore::new());
        let metrics = Arc::new(DetectorMetrics::default());
        let finalizer = Finalizer::new(&config, store.clone(), Arc::new(DownAlerts), metrics.clone());

        let agg = aggregate(&[3_000.0, 3_050.0, 2_980.0, 3_010.0, 3_020.0], 5);
        let summary = finalizer.finalize(agg, FinalizeMode::Rollover).await;

        assert!(summary.reportable);
        assert!(!summary.alert_sent);
        assert!(summary.record_id.is_some());
        assert_eq!(metrics.snapshot().delivery_failures, 1);
        // Still marked, with escalated = false
        assert_eq!(store.processed().await.len(), 1);
        assert!(!store.processed().await[0].1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_store_times_out() {
        let config = Config::default();
        let alerts = Arc::new(RecordingAlerts::default());
        let metrics = Arc::new(DetectorMetrics::default());
        let finalizer = Finalizer::new(&config, Arc::new(HangingStore), alerts.clone(), metrics.clone());

        let agg = aggregate(&[3_000.0, 3_050.0, 2_980.0, 3_010.0, 3_020.0], 5);
        let summary = finalizer.finalize(agg, FinalizeMode::Timeout).await;

        assert!(summary.record_id.is_none());
        // The alert still goes out without a record id
        assert!(summary.alert_sent);
        assert_eq!(metrics.snapshot().delivery_failures, 1);
    }

    #[tokio::test]
    async fn test_immediate_mode_does_not_count_as_finalized() {
        let config = Config::default();
        let metrics = Arc::new(DetectorMetrics::default());
        let finalizer = Finalizer::new(
            &config,
            Arc::new(MemoryRecordStore::new()),
            Arc::new(RecordingAlerts::default()),
            metrics.clone(),
        );

        finalizer
            .finalize(aggregate(&[3_000.0, 3_050.0, 2_980.0, 3_010.0, 3_020.0], 5), FinalizeMode::Immediate)
            .await;
        assert_eq!(metrics.snapshot().finalized, 0);
    }

    #[test]
    fn test_gate_rejects_wide_spread() {
        let config = Config::default();
        let gate = ReportGate::from_config(&config);
        let mut agg = aggregate(&[1_000.0, 4_000.0, 7_500.0], 5);
        agg.rescore(&ScoringParams::from_config(&config));
        let failed = gate.evaluate(&agg);
        assert!(failed.iter().any(|r| r == "no similar-size cluster"));
    }
}
