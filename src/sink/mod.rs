//! Downstream collaborators: detection persistence and alert delivery
//!
//! Both are best-effort from the detector's point of view. Errors are
//! logged and counted by the finalizer, never retried.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::position::aggregate::Aggregate;
use crate::position::finalizer::FinalizeMode;
use crate::scoring::RiskTier;

pub mod alert;
pub mod store;

pub use alert::{FanoutAlertSink, LogAlertSink, WebhookAlertSink};
pub use store::{JsonlRecordStore, MemoryRecordStore};

/// Durable record of a reportable aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub aggregate_id: Uuid,
    pub actor_id: String,
    pub asset_id: String,
    pub mode: FinalizeMode,
    pub purchase_count: usize,
    pub total_usd: f64,
    pub total_units: f64,
    pub avg_purchase_usd: f64,
    pub median_purchase_usd: f64,
    pub min_purchase_usd: f64,
    pub max_purchase_usd: f64,
    pub coefficient_of_variation: f64,
    pub first_buy_time: DateTime<Utc>,
    pub last_buy_time: DateTime<Utc>,
    pub elapsed_minutes: f64,
    pub has_similar_sizes: bool,
    pub similar_count: usize,
    pub size_tolerance_percent: f64,
    pub suspicion_score: f64,
    pub confidence_score: f64,
    pub risk_tier: RiskTier,
    pub reasons: Vec<String>,
    pub actor_age_days: Option<f64>,
    /// Asset facts are context for reviewers; they do not affect the score
    pub asset_age_days: Option<f64>,
    #[serde(default)]
    pub asset_concentration_ratio: Option<f64>,
    /// An immediate escalation already went out for this aggregate
    pub escalated_earlier: bool,
    pub tx_ids: Vec<String>,
    pub finalized_at: DateTime<Utc>,
}

impl DetectionRecord {
    pub fn from_aggregate(aggregate: &Aggregate, mode: FinalizeMode, finalized_at: DateTime<Utc>) -> Self {
        Self {
            aggregate_id: aggregate.id,
            actor_id: aggregate.key.actor_id.clone(),
            asset_id: aggregate.key.asset_id.clone(),
            mode,
            purchase_count: aggregate.purchase_count,
            total_usd: aggregate.total_usd,
            total_units: aggregate.total_units,
            avg_purchase_usd: aggregate.avg_purchase_usd,
            median_purchase_usd: aggregate.median_purchase_usd,
            min_purchase_usd: aggregate.min_purchase_usd,
            max_purchase_usd: aggregate.max_purchase_usd,
            coefficient_of_variation: aggregate.coefficient_of_variation,
            first_buy_time: aggregate.first_buy_time,
            last_buy_time: aggregate.last_buy_time,
            elapsed_minutes: aggregate.elapsed_minutes,
            has_similar_sizes: aggregate.similarity.has_similar_sizes,
            similar_count: aggregate.similarity.similar_count,
            size_tolerance_percent: aggregate.similarity.size_tolerance_percent,
            suspicion_score: aggregate.score.suspicion,
            confidence_score: aggregate.score.confidence,
            risk_tier: aggregate.score.risk_tier,
            reasons: aggregate.score.reasons.clone(),
            actor_age_days: aggregate.actor_age_days,
            asset_age_days: aggregate.asset_reputation.as_ref().map(|r| r.age_days),
            asset_concentration_ratio: aggregate.asset_reputation.as_ref().and_then(|r| r.concentration_ratio),
            escalated_earlier: mode != FinalizeMode::Immediate && aggregate.escalated,
            tx_ids: aggregate.purchases.iter().map(|p| p.tx_id.clone()).collect(),
            finalized_at,
        }
    }
}

/// Alert category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Sent while the aggregate is still open
    Escalation,
    /// Sent when the aggregate closes
    Detection,
}

/// Human-facing alert payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub record_id: Option<String>,
    pub aggregate_id: Uuid,
    pub actor_id: String,
    pub asset_id: String,
    pub risk_tier: RiskTier,
    pub suspicion_score: f64,
    pub confidence_score: f64,
    pub purchase_count: usize,
    pub similar_count: usize,
    pub total_usd: f64,
    pub elapsed_minutes: f64,
    pub escalated_earlier: bool,
    pub message: String,
}

impl Alert {
    pub fn from_record(record: &DetectionRecord, record_id: Option<String>) -> Self {
        let kind = if record.mode == FinalizeMode::Immediate {
            AlertKind::Escalation
        } else {
            AlertKind::Detection
        };
        let message = format!(
            "{} risk split buying: {} bought {} x ~${:.0} of {} (total ${:.0}) in {:.0} min, score {:.0}, confidence {:.0}",
            record.risk_tier,
            record.actor_id,
            record.purchase_count,
            record.avg_purchase_usd,
            record.asset_id,
            record.total_usd,
            record.elapsed_minutes,
            record.suspicion_score,
            record.confidence_score,
        );
        Self {
            kind,
            record_id,
            aggregate_id: record.aggregate_id,
            actor_id: record.actor_id.clone(),
            asset_id: record.asset_id.clone(),
            risk_tier: record.risk_tier,
            suspicion_score: record.suspicion_score,
            confidence_score: record.confidence_score,
            purchase_count: record.purchase_count,
            similar_count: record.similar_count,
            total_usd: record.total_usd,
            elapsed_minutes: record.elapsed_minutes,
            escalated_earlier: record.escalated_earlier,
            message,
        }
    }
}

/// Durable storage for detection records
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Store a record and return its id
    async fn save(&self, record: &DetectionRecord) -> Result<String>;

    /// Mark a stored record as handled
    async fn mark_processed(&self, id: &str, escalated: bool) -> Result<()>;
}

/// Alert delivery channel
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, alert: &Alert) -> Result<()>;
}
