//! CLI command implementations

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::filter::{HttpReputationProvider, ReputationProvider, StaticReputationProvider};
use crate::lifecycle::LifecycleManager;
use crate::metrics::MetricsSnapshot;
use crate::position::{Aggregate, FinalizeSummary, PositionAggregator, Purchase, ReportGate, ScoringParams};
use crate::sink::{AlertSink, FanoutAlertSink, JsonlRecordStore, LogAlertSink, WebhookAlertSink};
use crate::stream::{ingest_all, JsonlReader};
use crate::types::AggregateKey;

/// Event channel depth between the reader and the ingest loop
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Interval between metrics log lines while running
const METRICS_LOG_SECS: u64 = 60;

/// Reputation provider from configuration: endpoint, then static file, then none
pub fn build_provider(config: &Config) -> Result<Option<Arc<dyn ReputationProvider>>> {
    if let Some(endpoint) = &config.reputation.endpoint {
        info!("Using HTTP reputation provider");
        let provider = HttpReputationProvider::new(endpoint, config.reputation.lookup_timeout())?;
        return Ok(Some(Arc::new(provider)));
    }
    if let Some(path) = &config.reputation.static_file {
        info!(path = %path, "Using static reputation table");
        let provider = StaticReputationProvider::load(path)
            .with_context(|| format!("Failed to load reputation table {}", path))?;
        return Ok(Some(Arc::new(provider)));
    }
    warn!("No reputation provider configured, actor gates disabled");
    Ok(None)
}

/// Log sink plus the optional webhook
pub fn build_alerts(config: &Config) -> Result<Arc<dyn AlertSink>> {
    let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogAlertSink)];
    if let Some(url) = &config.sinks.alert_webhook_url {
        sinks.push(Arc::new(WebhookAlertSink::new(url.clone(), config.sinks.delivery_timeout())?));
    }
    Ok(Arc::new(FanoutAlertSink::new(sinks)))
}

pub fn build_aggregator(config: &Config) -> Result<Arc<PositionAggregator>> {
    let provider = build_provider(config)?;
    let store = Arc::new(JsonlRecordStore::new(&config.sinks.records_path));
    let alerts = build_alerts(config)?;
    Ok(Arc::new(PositionAggregator::new(config, provider, store, alerts)))
}

async fn open_input(input: Option<&Path>) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    match input {
        Some(path) if path != Path::new("-") => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            Ok(Box::new(BufReader::new(file)))
        }
        _ => Ok(Box::new(BufReader::new(tokio::io::stdin()))),
    }
}

/// Run the detector on a live event stream until input ends or Ctrl+C
pub async fn run(config: &Config, input: Option<&Path>) -> Result<()> {
    info!("Starting split-purchase detector...");
    info!(
        "Window: {} min, timeout: {} min, purchase range: ${} - ${}",
        config.detection.window_minutes,
        config.detection.timeout_minutes,
        config.detection.analysis_floor_usd,
        config.detection.per_purchase_ceiling_usd
    );

    let aggregator = build_aggregator(config)?;
    let shutdown = CancellationToken::new();

    let sweeps = LifecycleManager::new(aggregator.clone(), shutdown.clone()).spawn(&config.lifecycle);

    let (event_tx, mut event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let reader = JsonlReader::new(open_input(input).await?);
    let reader_task = tokio::spawn(async move {
        if let Err(e) = reader.forward(event_tx).await {
            error!("Event source failed: {}", e);
        }
    });

    let mut metrics_timer = tokio::time::interval(std::time::Duration::from_secs(METRICS_LOG_SECS));
    info!("Detector started. Listening for purchase events...");

    // Single consumer: events are applied in submission order
    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else {
                    info!("Event stream ended");
                    break;
                };
                if let Err(e) = aggregator.ingest(event).await {
                    error!("Event dropped: {}", e);
                }
            }
            _ = metrics_timer.tick() => {
                log_metrics(&aggregator.metrics().snapshot());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    shutdown.cancel();
    reader_task.abort();
    for handle in sweeps {
        if let Err(e) = handle.await {
            warn!("Sweep task ended abnormally: {}", e);
        }
    }

    let summaries = aggregator.flush_all().await;
    print_summaries(&summaries);
    log_metrics(&aggregator.metrics().snapshot());

    info!("Detector stopped");
    Ok(())
}

/// Replay a recorded event file, then flush everything still open
pub async fn replay(config: &Config, input: &Path) -> Result<()> {
    info!(input = %input.display(), "Replaying events");

    let aggregator = build_aggregator(config)?;
    let reader = open_input(Some(input)).await?;
    let ingested = ingest_all(reader, aggregator.clone(), &CancellationToken::new()).await;

    // Open aggregates are still finalized when the input breaks off
    let summaries = aggregator.flush_all().await;
    let stats = ingested.context("Replay input failed")?;

    println!("\n=== REPLAY RESULT ===\n");
    println!("Events read:    {}", stats.read);
    println!("Extended:       {}", stats.extended);
    println!("Rejected:       {}", stats.rejected);
    println!("Errors:         {}", stats.errors);
    println!("Malformed:      {}", stats.malformed);
    println!("Escalations:    {}", stats.escalations);
    print_summaries(&summaries);

    let snapshot = aggregator.metrics().snapshot();
    println!("\n=== METRICS ===\n");
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

/// Show current configuration (credentials masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Score a hypothetical purchase sequence without touching any sink
pub fn score(config: &Config, amounts: &[f64], minutes: f64, actor_age_days: Option<f64>) -> Result<()> {
    if amounts.is_empty() {
        anyhow::bail!("at least one amount is required");
    }

    let aggregate = synthetic_aggregate(config, amounts, minutes, actor_age_days)?;
    let failed = ReportGate::from_config(config).evaluate(&aggregate);

    println!("\n=== SCORE ===\n");
    println!("Purchases:   {}", aggregate.purchase_count);
    println!("Total:       ${:.2}", aggregate.total_usd);
    println!("Average:     ${:.2} (CoV {:.3})", aggregate.avg_purchase_usd, aggregate.coefficient_of_variation);
    println!(
        "Similarity:  {} ({} similar, {:.2}% max deviation)",
        aggregate.similarity.has_similar_sizes,
        aggregate.similarity.similar_count,
        aggregate.similarity.size_tolerance_percent
    );
    println!("Suspicion:   {:.0} ({})", aggregate.score.suspicion, aggregate.score.risk_tier);
    println!("Confidence:  {:.0}", aggregate.score.confidence);
    for reason in &aggregate.score.reasons {
        println!("  + {}", reason);
    }
    if failed.is_empty() {
        println!("\nReportable: yes");
    } else {
        println!("\nReportable: no");
        for reason in &failed {
            println!("  - {}", reason);
        }
    }
    Ok(())
}

/// Aggregate with purchases spread evenly over `minutes`
fn synthetic_aggregate(
    config: &Config,
    amounts: &[f64],
    minutes: f64,
    actor_age_days: Option<f64>,
) -> Result<Aggregate> {
    let t0 = Utc::now();
    let step_ms = if amounts.len() > 1 {
        (minutes * 60_000.0 / (amounts.len() - 1) as f64) as i64
    } else {
        0
    };

    let mut aggregate = Aggregate::open(AggregateKey::new("cli", "cli"), t0);
    aggregate.actor_age_days = actor_age_days;
    for (i, usd) in amounts.iter().enumerate() {
        if !usd.is_finite() || *usd <= 0.0 {
            anyhow::bail!("amount #{} must be a positive number, got {}", i + 1, usd);
        }
        aggregate.push(Purchase {
            tx_id: format!("cli-{}", i),
            amount_usd: *usd,
            amount_units: *usd,
            unit_price: 1.0,
            timestamp: t0 + Duration::milliseconds(step_ms * i as i64),
        });
    }
    aggregate.rescore(&ScoringParams::from_config(config));
    Ok(aggregate)
}

fn print_summaries(summaries: &[FinalizeSummary]) {
    let reported: Vec<_> = summaries.iter().filter(|s| s.reportable).collect();
    println!("\n=== FLUSHED AGGREGATES ===\n");
    println!("Closed: {}, reportable: {}", summaries.len(), reported.len());
    for s in reported {
        println!(
            "  {} | {} purchases | ${:.0} | score {:.0} | confidence {:.0} | {}",
            s.key, s.purchase_count, s.total_usd, s.suspicion, s.confidence, s.risk_tier
        );
    }
}

fn log_metrics(m: &MetricsSnapshot) {
    info!(
        admitted = m.events_admitted,
        rejected = m.events_rejected,
        active = m.active_aggregates,
        escalations = m.escalations,
        reported = m.reported,
        evictions = m.evictions,
        cache_hits = m.cache_hits,
        cache_misses = m.cache_misses,
        delivery_failures = m.delivery_failures,
        "Detector metrics"
    );
}
