//! Periodic maintenance of the detector state
//!
//! Three independent sweeps, each on its own ticker:
//! - timeout: finalize aggregates idle longer than the timeout
//! - capacity: evict the oldest aggregates above the active cap
//! - cache: purge expired reputation entries
//!
//! Each sweep runs inline in its own loop, so a slow run delays (and with
//! `MissedTickBehavior::Skip`, drops) the next tick instead of overlapping.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::LifecycleConfig;
use crate::position::PositionAggregator;

/// Source of sweep ticks
#[async_trait]
pub trait Ticker: Send {
    /// Wait for the next tick; `false` means the ticker is finished
    async fn tick(&mut self) -> bool;
}

/// Wall-clock ticker
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Ticker driven by hand, for tests and embedding
pub struct ManualTicker {
    rx: mpsc::Receiver<()>,
}

impl ManualTicker {
    pub fn channel() -> (mpsc::Sender<()>, Self) {
        let (tx, rx) = mpsc::channel(16);
        (tx, Self { rx })
    }
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) -> bool {
        if self.rx.recv().await.is_none() {
            return false;
        }
        // Coalesce ticks queued while the previous sweep was running
        while self.rx.try_recv().is_ok() {}
        true
    }
}

/// Which sweep produced a report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    Timeout,
    Capacity,
    Cache,
}

/// Result of one sweep run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub kind: SweepKind,
    /// Aggregates finalized, aggregates evicted, or cache entries purged
    pub affected: usize,
}

pub struct LifecycleManager {
    aggregator: Arc<PositionAggregator>,
    shutdown: CancellationToken,
    reports: Option<mpsc::UnboundedSender<SweepReport>>,
}

impl LifecycleManager {
    pub fn new(aggregator: Arc<PositionAggregator>, shutdown: CancellationToken) -> Self {
        Self {
            aggregator,
            shutdown,
            reports: None,
        }
    }

    /// Send a report after every sweep run
    pub fn with_reports(mut self, tx: mpsc::UnboundedSender<SweepReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    /// Spawn all sweeps on interval tickers from configuration
    pub fn spawn(self, config: &LifecycleConfig) -> Vec<JoinHandle<()>> {
        info!(
            timeout_secs = config.timeout_sweep_secs,
            capacity_secs = config.capacity_sweep_secs,
            cache_secs = config.cache_sweep_secs,
            "Starting lifecycle sweeps"
        );
        self.spawn_with(
            IntervalTicker::new(Duration::from_secs(config.timeout_sweep_secs)),
            IntervalTicker::new(Duration::from_secs(config.capacity_sweep_secs)),
            IntervalTicker::new(Duration::from_secs(config.cache_sweep_secs)),
        )
    }

    /// Spawn all sweeps on the given tickers
    pub fn spawn_with<A, B, C>(self, timeout: A, capacity: B, cache: C) -> Vec<JoinHandle<()>>
    where
        A: Ticker + 'static,
        B: Ticker + 'static,
        C: Ticker + 'static,
    {
        let this = Arc::new(self);
        vec![
            tokio::spawn(this.clone().run(SweepKind::Timeout, timeout)),
            tokio::spawn(this.clone().run(SweepKind::Capacity, capacity)),
            tokio::spawn(this.run(SweepKind::Cache, cache)),
        ]
    }

    async fn run<T: Ticker>(self: Arc<Self>, kind: SweepKind, mut ticker: T) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                more = ticker.tick() => {
                    if !more {
                        break;
                    }
                }
            }

            let affected = self.sweep(kind).await;
            if let Some(tx) = &self.reports {
                let _ = tx.send(SweepReport { kind, affected });
            }
        }
        debug!(?kind, "Sweep loop stopped");
    }

    /// Run one sweep of `kind` immediately
    pub async fn sweep(&self, kind: SweepKind) -> usize {
        match kind {
            SweepKind::Timeout => self
                .aggregator
                .sweep_timeouts(Utc::now(), &self.shutdown)
                .await
                .len(),
            SweepKind::Capacity => self.aggregator.enforce_capacity().await,
            SweepKind::Cache => self.aggregator.purge_cache(Utc::now()).await,
        }
    }
}
