//! Windowed purchase aggregate for one (actor, asset) key
//!
//! Tracks the purchases of an open aggregate and the statistics the
//! scorer reads. Purchases are append-only.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::filter::cache::ReputationFacts;
use crate::scoring::{self, ScoreInput, SimilarityResult, SuspicionScore};
use crate::types::{AggregateKey, PurchaseEvent};

/// One admitted buy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    pub tx_id: String,
    pub amount_usd: f64,
    pub amount_units: f64,
    /// USD per asset unit
    pub unit_price: f64,
    pub timestamp: DateTime<Utc>,
}

impl Purchase {
    /// Build a purchase, refusing values that would poison aggregate stats
    pub fn from_event(event: &PurchaseEvent) -> Result<Self> {
        if !event.amount_usd.is_finite() || event.amount_usd <= 0.0 {
            return Err(Error::InvariantGuard(format!(
                "tx {} has invalid usd amount {}",
                event.tx_id, event.amount_usd
            )));
        }
        if !event.amount_units.is_finite() || event.amount_units <= 0.0 {
            return Err(Error::InvariantGuard(format!(
                "tx {} has invalid unit amount {}",
                event.tx_id, event.amount_units
            )));
        }

        let unit_price = event.amount_usd / event.amount_units;
        if !unit_price.is_finite() {
            return Err(Error::InvariantGuard(format!(
                "tx {} unit price is not finite",
                event.tx_id
            )));
        }

        Ok(Self {
            tx_id: event.tx_id.clone(),
            amount_usd: event.amount_usd,
            amount_units: event.amount_units,
            unit_price,
            timestamp: event.timestamp,
        })
    }
}

/// Scoring parameters taken from configuration
#[derive(Debug, Clone)]
pub struct ScoringParams {
    pub tolerance_percent: f64,
    pub min_similar_purchases: usize,
    pub min_suspicion_score: f64,
    pub high_risk_threshold: f64,
    pub per_purchase_ceiling_usd: f64,
}

impl ScoringParams {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            tolerance_percent: config.similarity.tolerance_percent,
            min_similar_purchases: config.similarity.min_similar_purchases,
            min_suspicion_score: config.scoring.min_suspicion_score,
            high_risk_threshold: config.scoring.high_risk_threshold,
            per_purchase_ceiling_usd: config.detection.per_purchase_ceiling_usd,
        }
    }
}

/// Open position being accumulated by an actor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregate {
    /// Distinguishes this aggregate from later ones with the same key
    pub id: Uuid,
    pub key: AggregateKey,
    pub purchases: Vec<Purchase>,

    pub total_usd: f64,
    pub total_units: f64,
    pub purchase_count: usize,
    pub avg_purchase_usd: f64,
    pub median_purchase_usd: f64,
    pub max_purchase_usd: f64,
    pub min_purchase_usd: f64,
    pub std_dev_usd: f64,
    pub coefficient_of_variation: f64,

    /// Window anchor
    pub first_buy_time: DateTime<Utc>,
    pub last_buy_time: DateTime<Utc>,
    pub elapsed_minutes: f64,

    pub actor_age_days: Option<f64>,
    /// Informational; carried into records, never scored or gated
    pub asset_reputation: Option<ReputationFacts>,

    pub similarity: SimilarityResult,
    pub score: SuspicionScore,

    /// Immediate escalation already fired for this aggregate
    pub escalated: bool,
    pub escalation_record_id: Option<String>,
}

impl Aggregate {
    /// Open an empty aggregate anchored at `anchor`
    pub fn open(key: AggregateKey, anchor: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            purchases: Vec::new(),
            total_usd: 0.0,
            total_units: 0.0,
            purchase_count: 0,
            avg_purchase_usd: 0.0,
            median_purchase_usd: 0.0,
            max_purchase_usd: 0.0,
            min_purchase_usd: 0.0,
            std_dev_usd: 0.0,
            coefficient_of_variation: 0.0,
            first_buy_time: anchor,
            last_buy_time: anchor,
            elapsed_minutes: 0.0,
            actor_age_days: None,
            asset_reputation: None,
            similarity: SimilarityResult::default(),
            score: SuspicionScore::default(),
            escalated: false,
            escalation_record_id: None,
        }
    }

    pub fn contains_tx(&self, tx_id: &str) -> bool {
        self.purchases.iter().any(|p| p.tx_id == tx_id)
    }

    /// Time from the anchor to `at` exceeds the window
    pub fn is_outside_window(&self, at: DateTime<Utc>, window: Duration) -> bool {
        at - self.first_buy_time > window
    }

    /// No activity for longer than `timeout`
    pub fn is_idle(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_buy_time > timeout
    }

    pub fn window_elapsed(&self) -> Duration {
        self.last_buy_time - self.first_buy_time
    }

    /// Remember the freshest reputation facts seen for this key
    pub fn apply_reputation(&mut self, actor: Option<&ReputationFacts>, asset: Option<&ReputationFacts>) {
        if let Some(actor) = actor {
            self.actor_age_days = Some(actor.age_days);
        }
        if let Some(asset) = asset {
            self.asset_reputation = Some(asset.clone());
        }
    }

    /// Append a purchase and refresh running totals and statistics.
    ///
    /// Callers reject purchases older than the anchor; `last_buy_time`
    /// only moves forward so the elapsed window is never negative.
    pub fn push(&mut self, purchase: Purchase) {
        self.total_usd += purchase.amount_usd;
        self.total_units += purchase.amount_units;
        if purchase.timestamp > self.last_buy_time {
            self.last_buy_time = purchase.timestamp;
        }
        self.purchases.push(purchase);
        self.purchase_count = self.purchases.len();
        self.elapsed_minutes = self.window_elapsed().num_milliseconds().max(0) as f64 / 60_000.0;
        self.recompute_stats();
    }

    fn recompute_stats(&mut self) {
        let n = self.purchases.len();
        if n == 0 {
            return;
        }

        let mut amounts = self.amounts();
        amounts.sort_by(|a, b| a.total_cmp(b));

        let avg = self.total_usd / n as f64;
        let variance = amounts.iter().map(|a| (a - avg).powi(2)).sum::<f64>() / n as f64;
        let std_dev = variance.sqrt();

        self.avg_purchase_usd = avg;
        self.min_purchase_usd = amounts[0];
        self.max_purchase_usd = amounts[n - 1];
        self.median_purchase_usd = if n % 2 == 0 {
            (amounts[n / 2 - 1] + amounts[n / 2]) / 2.0
        } else {
            amounts[n / 2]
        };
        self.std_dev_usd = std_dev;
        self.coefficient_of_variation = if avg > 0.0 { std_dev / avg } else { 0.0 };
    }

    /// Purchase amounts in arrival order
    pub fn amounts(&self) -> Vec<f64> {
        self.purchases.iter().map(|p| p.amount_usd).collect()
    }

    pub fn score_input(&self, per_purchase_ceiling_usd: f64) -> ScoreInput {
        ScoreInput {
            purchase_count: self.purchase_count,
            total_usd: self.total_usd,
            avg_purchase_usd: self.avg_purchase_usd,
            min_purchase_usd: self.min_purchase_usd,
            max_purchase_usd: self.max_purchase_usd,
            coefficient_of_variation: self.coefficient_of_variation,
            elapsed_minutes: self.elapsed_minutes,
            actor_age_days: self.actor_age_days,
            per_purchase_ceiling_usd,
        }
    }

    /// Recompute similarity and scores.
    ///
    /// A panic inside scoring is contained here: the aggregate keeps its
    /// previous derived metrics and `false` is returned.
    pub fn rescore(&mut self, params: &ScoringParams) -> bool {
        let amounts = self.amounts();
        let input = self.score_input(params.per_purchase_ceiling_usd);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let similarity = scoring::cluster_amounts(
                &amounts,
                params.tolerance_percent,
                params.min_similar_purchases,
            );
            let score = scoring::score(
                &input,
                &similarity,
                params.min_suspicion_score,
                params.high_risk_threshold,
            );
            (similarity, score)
        }));

        match outcome {
            Ok((similarity, score)) => {
                self.similarity = similarity;
                self.score = score;
                true
            }
            Err(_) => {
                tracing::error!(key = %self.key, aggregate = %self.id, "Scoring panicked, keeping previous metrics");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    fn event(tx: &str, usd: f64, units: f64, at: DateTime<Utc>) -> PurchaseEvent {
        PurchaseEvent {
            actor_id: "wallet1".to_string(),
            asset_id: "TOKEN".to_string(),
            tx_id: tx.to_string(),
            amount_usd: usd,
            amount_units: units,
            timestamp: at,
            direction: Direction::Buy,
        }
    }

    fn params() -> ScoringParams {
        ScoringParams::from_config(&crate::config::Config::default())
    }

    #[test]
    fn test_zero_units_rejected() {
        let err = Purchase::from_event(&event("t1", 1_000.0, 0.0, Utc::now())).unwrap_err();
        assert!(matches!(err, Error::InvariantGuard(_)));

        let err = Purchase::from_event(&event("t2", f64::NAN, 10.0, Utc::now())).unwrap_err();
        assert!(matches!(err, Error::InvariantGuard(_)));
    }

    #[test]
    fn test_stats_and_sum_invariant() {
        let t0 = Utc::now();
        let mut agg = Aggregate::open(AggregateKey::new("wallet1", "TOKEN"), t0);
        let amounts = [3_000.0, 3_050.0, 2_980.0, 3_010.0];
        for (i, usd) in amounts.iter().enumerate() {
            let at = t0 + Duration::minutes(i as i64 * 5);
            agg.push(Purchase::from_event(&event(&format!("t{}", i), *usd, 100.0, at)).unwrap());
        }

        let expected: f64 = amounts.iter().sum();
        assert!((agg.total_usd - expected).abs() <= expected * 1e-6);
        assert_eq!(agg.purchase_count, agg.purchases.len());
        assert_eq!(agg.min_purchase_usd, 2_980.0);
        assert_eq!(agg.max_purchase_usd, 3_050.0);
        assert_eq!(agg.median_purchase_usd, 3_005.0);
        assert!(agg.min_purchase_usd <= agg.avg_purchase_usd);
        assert!(agg.avg_purchase_usd <= agg.max_purchase_usd);
        assert_eq!(agg.elapsed_minutes, 15.0);
        assert!(agg.coefficient_of_variation < 0.01);
    }

    #[test]
    fn test_late_but_in_window_purchase_keeps_last_time() {
        let t0 = Utc::now();
        let mut agg = Aggregate::open(AggregateKey::new("wallet1", "TOKEN"), t0);
        agg.push(Purchase::from_event(&event("a", 1_000.0, 1.0, t0 + Duration::minutes(10))).unwrap());
        agg.push(Purchase::from_event(&event("b", 1_000.0, 1.0, t0 + Duration::minutes(4))).unwrap());
        assert_eq!(agg.last_buy_time, t0 + Duration::minutes(10));
        assert_eq!(agg.elapsed_minutes, 10.0);
    }

    #[test]
    fn test_rescore_populates_similarity() {
        let t0 = Utc::now();
        let mut agg = Aggregate::open(AggregateKey::new("wallet1", "TOKEN"), t0);
        for (i, usd) in [3_000.0, 3_050.0, 2_980.0].iter().enumerate() {
            let at = t0 + Duration::minutes(i as i64 * 10);
            agg.push(Purchase::from_event(&event(&format!("t{}", i), *usd, 50.0, at)).unwrap());
        }
        assert!(agg.rescore(&params()));
        assert!(agg.similarity.has_similar_sizes);
        assert_eq!(agg.similarity.similar_count, 3);
        assert!(agg.score.suspicion > 0.0);
    }

    #[test]
    fn test_window_predicates() {
        let t0 = Utc::now();
        let agg = Aggregate::open(AggregateKey::new("a", "b"), t0);
        let window = Duration::minutes(60);
        assert!(!agg.is_outside_window(t0 + window, window));
        assert!(agg.is_outside_window(t0 + window + Duration::seconds(1), window));
        assert!(agg.is_idle(t0 + Duration::minutes(31), Duration::minutes(30)));
    }
}
