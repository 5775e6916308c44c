//! Suspicion and confidence scoring for purchase aggregates
//!
//! Both scores are additive point models clamped to 0-100. The suspicion
//! score estimates how much an aggregate looks like a split purchase; the
//! confidence score measures how much evidence backs that estimate and is
//! used as a separate reporting gate.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::similarity::SimilarityResult;

/// Risk tier derived from the suspicion score
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskTier {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn from_score(score: f64, min_suspicion: f64, high_risk: f64) -> Self {
        if score >= high_risk {
            RiskTier::High
        } else if score >= min_suspicion {
            RiskTier::Medium
        } else {
            RiskTier::Low
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTier::Low => write!(f, "LOW"),
            RiskTier::Medium => write!(f, "MEDIUM"),
            RiskTier::High => write!(f, "HIGH"),
        }
    }
}

/// Aggregate statistics the scorer reads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreInput {
    pub purchase_count: usize,
    pub total_usd: f64,
    pub avg_purchase_usd: f64,
    pub min_purchase_usd: f64,
    pub max_purchase_usd: f64,
    pub coefficient_of_variation: f64,
    pub elapsed_minutes: f64,
    /// Actor age from reputation data, if known
    pub actor_age_days: Option<f64>,
    pub per_purchase_ceiling_usd: f64,
}

/// Scores for one aggregate snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuspicionScore {
    pub suspicion: f64,
    pub confidence: f64,
    pub risk_tier: RiskTier,
    /// Rule names that added or removed points
    pub reasons: Vec<String>,
}

fn clamp_score(points: f64) -> f64 {
    if points.is_finite() {
        points.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Compute the 0-100 suspicion score and the list of contributing rules.
pub fn suspicion_points(input: &ScoreInput, similarity: &SimilarityResult) -> (f64, Vec<String>) {
    let mut score = 0.0;
    let mut reasons = Vec::new();

    // Purchase count tiers (cumulative)
    let count = input.purchase_count;
    if count >= 3 {
        score += 20.0;
        reasons.push(format!("{} purchases", count));
    }
    if count >= 5 {
        score += 15.0;
    }
    if count >= 8 {
        score += 10.0;
    }

    // Total USD tiers (cumulative)
    if input.total_usd >= 10_000.0 {
        score += 15.0;
        reasons.push(format!("total ${:.0}", input.total_usd));
    }
    if input.total_usd >= 25_000.0 {
        score += 10.0;
    }
    if input.total_usd >= 50_000.0 {
        score += 10.0;
    }

    if similarity.has_similar_sizes {
        score += 30.0;
        let tol = similarity.size_tolerance_percent;
        if tol <= 1.0 {
            score += 15.0;
        } else if tol <= 2.0 {
            score += 10.0;
        } else if tol <= 5.0 {
            score += 5.0;
        }
        score += (similarity.similar_count as f64 * 2.0).min(10.0);
        reasons.push(format!(
            "{} similar sizes within {:.2}%",
            similarity.similar_count, tol
        ));
    }

    let cov = input.coefficient_of_variation;
    if cov <= 0.10 {
        score += 10.0;
        reasons.push("uniform sizes".to_string());
    } else if cov <= 0.20 {
        score += 5.0;
    }

    if input.elapsed_minutes <= 30.0 {
        score += 10.0;
        reasons.push("rapid sequence".to_string());
    } else if input.elapsed_minutes <= 60.0 {
        score += 5.0;
    }

    if input.min_purchase_usd > 0.0 && input.max_purchase_usd / input.min_purchase_usd > 3.0 {
        score -= 15.0;
        reasons.push("wide size spread".to_string());
    }

    if let Some(age) = input.actor_age_days {
        if age < 1.0 {
            score += 20.0;
            reasons.push("actor younger than 1 day".to_string());
        } else if age < 7.0 {
            score += 10.0;
            reasons.push("actor younger than 7 days".to_string());
        }
    }

    if input.per_purchase_ceiling_usd > 0.0 {
        let ratio = input.avg_purchase_usd / input.per_purchase_ceiling_usd;
        if ratio > 0.8 {
            score += 15.0;
            reasons.push("sizes just under ceiling".to_string());
        } else if ratio > 0.6 {
            score += 10.0;
        }
    }

    (clamp_score(score), reasons)
}

/// Compute the 0-100 confidence score.
pub fn confidence_points(input: &ScoreInput, similarity: &SimilarityResult) -> f64 {
    let mut confidence = 50.0;

    if similarity.has_similar_sizes {
        confidence += 30.0;
    }
    if input.coefficient_of_variation < 0.15 {
        confidence += 20.0;
    }
    if input.purchase_count >= 5 {
        confidence += 15.0;
    }
    if input.elapsed_minutes <= 60.0 {
        confidence += 10.0;
    }
    if input.purchase_count < 4 {
        confidence -= 20.0;
    }
    if similarity.size_tolerance_percent > 5.0 {
        confidence -= 15.0;
    }
    if input.elapsed_minutes > 120.0 {
        confidence -= 10.0;
    }

    clamp_score(confidence)
}

/// Score an aggregate snapshot
pub fn score(
    input: &ScoreInput,
    similarity: &SimilarityResult,
    min_suspicion: f64,
    high_risk: f64,
) -> SuspicionScore {
    let (suspicion, reasons) = suspicion_points(input, similarity);
    let confidence = confidence_points(input, similarity);
    SuspicionScore {
        suspicion,
        confidence,
        risk_tier: RiskTier::from_score(suspicion, min_suspicion, high_risk),
        reasons,
    }
}
