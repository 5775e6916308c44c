//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub reputation: ReputationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub sinks: SinkConfig,
}

/// Windowing and aggregate-level thresholds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectionConfig {
    /// Window measured from the first buy of an aggregate (minutes)
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u64,
    /// Idle time after the last buy before a sweep closes the aggregate (minutes)
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    /// Purchases below this USD amount are ignored
    #[serde(default = "default_analysis_floor_usd")]
    pub analysis_floor_usd: f64,
    /// Purchases above this USD amount are too large to be a split fragment
    #[serde(default = "default_per_purchase_ceiling_usd")]
    pub per_purchase_ceiling_usd: f64,
    #[serde(default = "default_min_purchase_count")]
    pub min_purchase_count: usize,
    /// Aggregates holding this many purchases stop accepting more
    #[serde(default = "default_max_purchase_count")]
    pub max_purchase_count: usize,
    #[serde(default = "default_min_total_usd")]
    pub min_total_usd: f64,
}

fn default_window_minutes() -> u64 { 60 }
fn default_timeout_minutes() -> u64 { 30 }
fn default_analysis_floor_usd() -> f64 { 500.0 }
fn default_per_purchase_ceiling_usd() -> f64 { 8_000.0 }
fn default_min_purchase_count() -> usize { 3 }
fn default_max_purchase_count() -> usize { 50 }
fn default_min_total_usd() -> f64 { 10_000.0 }

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            window_minutes: default_window_minutes(),
            timeout_minutes: default_timeout_minutes(),
            analysis_floor_usd: default_analysis_floor_usd(),
            per_purchase_ceiling_usd: default_per_purchase_ceiling_usd(),
            min_purchase_count: default_min_purchase_count(),
            max_purchase_count: default_max_purchase_count(),
            min_total_usd: default_min_total_usd(),
        }
    }
}

impl DetectionConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.window_minutes as i64)
    }

    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.timeout_minutes as i64)
    }
}

/// Purchase-size clustering parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimilarityConfig {
    /// Max relative distance from a cluster anchor, in percent (5.0 = 5%)
    #[serde(default = "default_tolerance_percent")]
    pub tolerance_percent: f64,
    /// Dominant cluster size needed for `has_similar_sizes`
    #[serde(default = "default_min_similar_purchases")]
    pub min_similar_purchases: usize,
}

fn default_tolerance_percent() -> f64 { 5.0 }
fn default_min_similar_purchases() -> usize { 3 }

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            tolerance_percent: default_tolerance_percent(),
            min_similar_purchases: default_min_similar_purchases(),
        }
    }
}

/// Score thresholds (all on the 0-100 scale)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScoringConfig {
    #[serde(default = "default_min_suspicion_score")]
    pub min_suspicion_score: f64,
    #[serde(default = "default_high_risk_threshold")]
    pub high_risk_threshold: f64,
    /// Score that triggers an immediate escalation while the aggregate is still open
    #[serde(default = "default_auto_report_threshold")]
    pub auto_report_threshold: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

fn default_min_suspicion_score() -> f64 { 60.0 }
fn default_high_risk_threshold() -> f64 { 80.0 }
fn default_auto_report_threshold() -> f64 { 85.0 }
fn default_min_confidence() -> f64 { 60.0 }

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            min_suspicion_score: default_min_suspicion_score(),
            high_risk_threshold: default_high_risk_threshold(),
            auto_report_threshold: default_auto_report_threshold(),
            min_confidence: default_min_confidence(),
        }
    }
}

/// Actor reputation gates applied before aggregation
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdmissionConfig {
    /// Actors younger than this are rejected (0 disables the check)
    #[serde(default)]
    pub min_actor_age_days: f64,
    /// Actors with more recent transactions than this look automated
    #[serde(default = "default_max_actor_recent_activity")]
    pub max_actor_recent_activity: u64,
    /// Look up asset reputation as well (informational only)
    #[serde(default = "default_true")]
    pub lookup_assets: bool,
}

fn default_max_actor_recent_activity() -> u64 { 1_000 }

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            min_actor_age_days: 0.0,
            max_actor_recent_activity: default_max_actor_recent_activity(),
            lookup_assets: true,
        }
    }
}

/// Where reputation facts come from
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReputationConfig {
    /// Base URL of an HTTP reputation service
    #[serde(default)]
    pub endpoint: Option<String>,
    /// JSON file with static reputation facts (used when no endpoint is set)
    #[serde(default)]
    pub static_file: Option<String>,
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
}

fn default_lookup_timeout_ms() -> u64 { 2_000 }

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            static_file: None,
            lookup_timeout_ms: default_lookup_timeout_ms(),
        }
    }
}

impl ReputationConfig {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

/// Reputation cache sizing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Maximum entries per namespace (actor, asset)
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

fn default_cache_ttl_secs() -> u64 { 3_600 }
fn default_cache_max_entries() -> usize { 10_000 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_cache_max_entries(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs as i64)
    }
}

/// Sweep cadence and memory bounds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_max_active_aggregates")]
    pub max_active_aggregates: usize,
    #[serde(default = "default_timeout_sweep_secs")]
    pub timeout_sweep_secs: u64,
    #[serde(default = "default_capacity_sweep_secs")]
    pub capacity_sweep_secs: u64,
    #[serde(default = "default_cache_sweep_secs")]
    pub cache_sweep_secs: u64,
    /// Score and report aggregates evicted for capacity instead of dropping them
    #[serde(default)]
    pub finalize_on_evict: bool,
}

fn default_max_active_aggregates() -> usize { 10_000 }
fn default_timeout_sweep_secs() -> u64 { 300 }
fn default_capacity_sweep_secs() -> u64 { 60 }
fn default_cache_sweep_secs() -> u64 { 600 }

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_active_aggregates: default_max_active_aggregates(),
            timeout_sweep_secs: default_timeout_sweep_secs(),
            capacity_sweep_secs: default_capacity_sweep_secs(),
            cache_sweep_secs: default_cache_sweep_secs(),
            finalize_on_evict: false,
        }
    }
}

/// Downstream persistence and alerting
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkConfig {
    /// JSONL file receiving detection records
    #[serde(default = "default_records_path")]
    pub records_path: String,
    /// Optional webhook receiving alerts as JSON
    #[serde(default)]
    pub alert_webhook_url: Option<String>,
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
}

fn default_records_path() -> String { "data/detections.jsonl".to_string() }
fn default_delivery_timeout_ms() -> u64 { 5_000 }

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            records_path: default_records_path(),
            alert_webhook_url: None,
            delivery_timeout_ms: default_delivery_timeout_ms(),
        }
    }
}

impl SinkConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

fn default_true() -> bool { true }

impl Config {
    /// Load configuration from file and environment
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix SPLITWATCH_)
            .add_source(
                config::Environment::with_prefix("SPLITWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let d = &self.detection;
        if d.window_minutes == 0 {
            anyhow::bail!("detection.window_minutes must be positive");
        }
        if d.timeout_minutes == 0 {
            anyhow::bail!("detection.timeout_minutes must be positive");
        }
        if d.analysis_floor_usd < 0.0 {
            anyhow::bail!("detection.analysis_floor_usd cannot be negative");
        }
        if d.per_purchase_ceiling_usd <= 0.0 {
            anyhow::bail!("detection.per_purchase_ceiling_usd must be positive");
        }
        if d.analysis_floor_usd > d.per_purchase_ceiling_usd {
            anyhow::bail!(
                "detection.analysis_floor_usd ({}) exceeds per_purchase_ceiling_usd ({})",
                d.analysis_floor_usd,
                d.per_purchase_ceiling_usd
            );
        }
        if d.min_purchase_count == 0 || d.max_purchase_count < d.min_purchase_count {
            anyhow::bail!(
                "purchase count bounds invalid: min {}, max {}",
                d.min_purchase_count,
                d.max_purchase_count
            );
        }

        let tol = self.similarity.tolerance_percent;
        if !(tol > 0.0 && tol <= 100.0) {
            anyhow::bail!("similarity.tolerance_percent must be in (0, 100], got {}", tol);
        }
        if self.similarity.min_similar_purchases == 0 {
            anyhow::bail!("similarity.min_similar_purchases must be positive");
        }

        let s = &self.scoring;
        for (name, value) in [
            ("min_suspicion_score", s.min_suspicion_score),
            ("high_risk_threshold", s.high_risk_threshold),
            ("auto_report_threshold", s.auto_report_threshold),
            ("min_confidence", s.min_confidence),
        ] {
            if !(0.0..=100.0).contains(&value) {
                anyhow::bail!("scoring.{} must be within 0-100, got {}", name, value);
            }
        }
        if s.high_risk_threshold < s.min_suspicion_score {
            anyhow::bail!("scoring.high_risk_threshold cannot be below min_suspicion_score");
        }

        if self.cache.ttl_secs == 0 || self.cache.max_entries == 0 {
            anyhow::bail!("cache.ttl_secs and cache.max_entries must be positive");
        }

        let l = &self.lifecycle;
        if l.max_active_aggregates == 0 {
            anyhow::bail!("lifecycle.max_active_aggregates must be positive");
        }
        if l.timeout_sweep_secs == 0 || l.capacity_sweep_secs == 0 || l.cache_sweep_secs == 0 {
            anyhow::bail!("lifecycle sweep intervals must be positive");
        }

        if self.reputation.lookup_timeout_ms == 0 || self.sinks.delivery_timeout_ms == 0 {
            anyhow::bail!("collaborator timeouts must be positive");
        }

        Ok(())
    }

    /// Human-readable configuration with credentials in URLs masked
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Detection:
    window: {} min
    timeout: {} min
    purchase range: ${} - ${}
    purchase count: {} - {}
    min_total: ${}
  Similarity:
    tolerance: {}%
    min_similar: {}
  Scoring:
    min_suspicion: {}
    high_risk: {}
    auto_report: {}
    min_confidence: {}
  Admission:
    min_actor_age: {} days
    max_actor_activity: {}
    lookup_assets: {}
  Reputation:
    endpoint: {}
    static_file: {}
    timeout: {}ms
  Cache:
    ttl: {}s
    max_entries: {}
  Lifecycle:
    max_active: {}
    sweeps: timeout {}s, capacity {}s, cache {}s
    finalize_on_evict: {}
  Sinks:
    records: {}
    webhook: {}
    timeout: {}ms
"#,
            self.detection.window_minutes,
            self.detection.timeout_minutes,
            self.detection.analysis_floor_usd,
            self.detection.per_purchase_ceiling_usd,
            self.detection.min_purchase_count,
            self.detection.max_purchase_count,
            self.detection.min_total_usd,
            self.similarity.tolerance_percent,
            self.similarity.min_similar_purchases,
            self.scoring.min_suspicion_score,
            self.scoring.high_risk_threshold,
            self.scoring.auto_report_threshold,
            self.scoring.min_confidence,
            self.admission.min_actor_age_days,
            self.admission.max_actor_recent_activity,
            self.admission.lookup_assets,
            self.reputation.endpoint.as_deref().map(mask_url).unwrap_or_else(|| "(not set)".to_string()),
            self.reputation.static_file.as_deref().unwrap_or("(not set)"),
            self.reputation.lookup_timeout_ms,
            self.cache.ttl_secs,
            self.cache.max_entries,
            self.lifecycle.max_active_aggregates,
            self.lifecycle.timeout_sweep_secs,
            self.lifecycle.capacity_sweep_secs,
            self.lifecycle.cache_sweep_secs,
            self.lifecycle.finalize_on_evict,
            self.sinks.records_path,
            self.sinks.alert_webhook_url.as_deref().map(mask_url).unwrap_or_else(|| "(not set)".to_string()),
            self.sinks.delivery_timeout_ms,
        )
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}
