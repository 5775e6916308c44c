//! Reputation providers
//!
//! Provides actor and asset risk facts to the admission filter:
//! - HTTP reputation service (`{base}/{namespace}/{id}`)
//! - Static table loaded from a JSON file (replays, offline analysis)

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::filter::cache::ReputationFacts;
use crate::types::Namespace;

/// Source of reputation facts for actors and assets
#[async_trait]
pub trait ReputationProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &'static str;

    /// Look up one subject; errors are treated as fail-open by the caller
    async fn lookup(&self, namespace: Namespace, subject_id: &str) -> Result<ReputationFacts>;
}

/// HTTP reputation service client
pub struct HttpReputationProvider {
    /// HTTP client
    client: Client,
    /// Base URL without trailing slash
    base_url: String,
    /// Request timeout
    timeout: Duration,
}

impl HttpReputationProvider {
    /// Create a new client for `base_url`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn subject_url(&self, namespace: Namespace, subject_id: &str) -> String {
        format!("{}/{}s/{}", self.base_url, namespace.as_str(), subject_id)
    }
}

#[async_trait]
impl ReputationProvider for HttpReputationProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn lookup(&self, namespace: Namespace, subject_id: &str) -> Result<ReputationFacts> {
        let url = self.subject_url(namespace, subject_id);

        debug!("Fetching {} reputation for {}", namespace, subject_id);

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::LookupFailed {
                subject: format!("{}:{}", namespace, subject_id),
                reason: format!("request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::LookupFailed {
                subject: format!("{}:{}", namespace, subject_id),
                reason: format!("reputation API error {}: {}", status, body),
            });
        }

        response
            .json::<ReputationFacts>()
            .await
            .map_err(|e| Error::Serialization(format!("Failed to parse reputation response: {}", e)))
    }
}

/// On-disk layout for `StaticReputationProvider::load`
#[derive(Debug, Default, Deserialize)]
struct StaticTable {
    #[serde(default)]
    actors: HashMap<String, ReputationFacts>,
    #[serde(default)]
    assets: HashMap<String, ReputationFacts>,
}

/// Fixed reputation table; unknown subjects are lookup failures
#[derive(Debug, Default)]
pub struct StaticReputationProvider {
    actors: HashMap<String, ReputationFacts>,
    assets: HashMap<String, ReputationFacts>,
}

impl StaticReputationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `{"actors": {...}, "assets": {...}}` from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let table: StaticTable = serde_json::from_str(&data)?;
        Ok(Self {
            actors: table.actors,
            assets: table.assets,
        })
    }

    pub fn with_actor(mut self, id: impl Into<String>, facts: ReputationFacts) -> Self {
        self.actors.insert(id.into(), facts);
        self
    }

    pub fn with_asset(mut self, id: impl Into<String>, facts: ReputationFacts) -> Self {
        self.assets.insert(id.into(), facts);
        self
    }
}

#[async_trait]
impl ReputationProvider for StaticReputationProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn lookup(&self, namespace: Namespace, subject_id: &str) -> Result<ReputationFacts> {
        let table = match namespace {
            Namespace::Actor => &self.actors,
            Namespace::Asset => &self.assets,
        };
        table.get(subject_id).cloned().ok_or_else(|| Error::LookupFailed {
            subject: format!("{}:{}", namespace, subject_id),
            reason: "unknown subject".to_string(),
        })
    }
}
