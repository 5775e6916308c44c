//! Alert sinks
//!
//! - `LogAlertSink`: structured log line per alert (always available)
//! - `WebhookAlertSink`: JSON POST to an HTTP endpoint
//! - `FanoutAlertSink`: delivers to several sinks concurrently

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{Alert, AlertKind, AlertSink};
use crate::error::{Error, Result};
use crate::scoring::RiskTier;

/// Writes alerts to the tracing log
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let kind = match alert.kind {
            AlertKind::Escalation => "escalation",
            AlertKind::Detection => "detection",
        };
        if alert.risk_tier == RiskTier::High {
            warn!(
                kind,
                actor = %alert.actor_id,
                asset = %alert.asset_id,
                suspicion = alert.suspicion_score,
                confidence = alert.confidence_score,
                record = alert.record_id.as_deref().unwrap_or("-"),
                "ALERT: {}",
                alert.message
            );
        } else {
            info!(
                kind,
                actor = %alert.actor_id,
                asset = %alert.asset_id,
                suspicion = alert.suspicion_score,
                confidence = alert.confidence_score,
                record = alert.record_id.as_deref().unwrap_or("-"),
                "Alert: {}",
                alert.message
            );
        }
        Ok(())
    }
}

/// POSTs alerts as JSON
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| Error::DeliveryFailed {
                sink: self.name().to_string(),
                reason: format!("HTTP request failed: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::DeliveryFailed {
                sink: self.name().to_string(),
                reason: format!("HTTP {}", status),
            });
        }
        Ok(())
    }
}

/// Sends to every inner sink; succeeds if at least one delivery succeeds
pub struct FanoutAlertSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanoutAlertSink {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl AlertSink for FanoutAlertSink {
    fn name(&self) -> &'static str {
        "fanout"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        if self.sinks.is_empty() {
            return Ok(());
        }

        let results = join_all(self.sinks.iter().map(|s| s.send(alert))).await;

        let mut failures = Vec::new();
        for (sink, result) in self.sinks.iter().zip(results) {
            if let Err(e) = result {
                warn!(sink = sink.name(), error = %e, "Alert delivery failed");
                failures.push(format!("{}: {}", sink.name(), e));
            }
        }

        if failures.len() == self.sinks.len() {
            return Err(Error::DeliveryFailed {
                sink: self.name().to_string(),
                reason: failures.join("; "),
            });
        }
        Ok(())
    }
}
