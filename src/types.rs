//! Shared input types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trade direction of a purchase event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

/// A normalized trade produced by the ingestion collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseEvent {
    pub actor_id: String,
    pub asset_id: String,
    pub tx_id: String,
    pub amount_usd: f64,
    /// Amount in asset units
    pub amount_units: f64,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
}

impl PurchaseEvent {
    pub fn key(&self) -> AggregateKey {
        AggregateKey::new(&self.actor_id, &self.asset_id)
    }
}

/// Identity of an aggregate: one actor accumulating one asset
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateKey {
    pub actor_id: String,
    pub asset_id: String,
}

impl AggregateKey {
    pub fn new(actor_id: impl Into<String>, asset_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            asset_id: asset_id.into(),
        }
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.actor_id, self.asset_id)
    }
}

/// Reputation subject namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Actor,
    Asset,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Actor => "actor",
            Namespace::Asset => "asset",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
