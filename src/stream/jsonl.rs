//! Newline-delimited JSON purchase event source
//!
//! One `PurchaseEvent` object per line. Blank lines are skipped; malformed
//! lines are logged and skipped so one bad record never stops a stream.

use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::position::{IngestOutcome, PositionAggregator};
use crate::types::PurchaseEvent;

/// Line-by-line event reader
pub struct JsonlReader<R> {
    reader: R,
    buf: Vec<u8>,
    line_no: u64,
    malformed: u64,
}

impl<R: AsyncBufRead + Unpin> JsonlReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            line_no: 0,
            malformed: 0,
        }
    }

    /// Next well-formed event, or `None` at end of input.
    ///
    /// Lines are read as raw bytes so invalid UTF-8 is skipped like any
    /// other malformed line.
    pub async fn next_event(&mut self) -> Result<Option<PurchaseEvent>> {
        loop {
            self.buf.clear();
            if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let line = match std::str::from_utf8(&self.buf) {
                Ok(line) => line.trim(),
                Err(e) => {
                    self.malformed += 1;
                    warn!(line = self.line_no, error = %e, "Skipping non UTF-8 event line");
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<PurchaseEvent>(line) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => {
                    self.malformed += 1;
                    warn!(line = self.line_no, error = %e, "Skipping malformed event");
                }
            }
        }
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Forward events into a channel until input ends or the receiver closes
    pub async fn forward(mut self, tx: mpsc::Sender<PurchaseEvent>) -> Result<u64> {
        let mut sent = 0;
        while let Some(event) = self.next_event().await? {
            tx.send(event)
                .await
                .map_err(|e| Error::Internal(format!("event channel closed: {}", e)))?;
            sent += 1;
        }
        debug!(sent, malformed = self.malformed, "Event source exhausted");
        Ok(sent)
    }
}

/// Counters for one ingest run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub read: u64,
    pub extended: u64,
    pub rejected: u64,
    pub errors: u64,
    pub malformed: u64,
    pub escalations: u64,
}

impl IngestStats {
    fn record(&mut self, outcome: &Result<IngestOutcome>) {
        self.read += 1;
        match outcome {
            Ok(IngestOutcome::Rejected(_)) => self.rejected += 1,
            Ok(IngestOutcome::Extended { escalated, .. }) => {
                self.extended += 1;
                if *escalated {
                    self.escalations += 1;
                }
            }
            Err(_) => self.errors += 1,
        }
    }
}

/// Ingest every event from `reader` in order.
///
/// Events are awaited one at a time, which preserves per-key submission
/// order. Stops early when `shutdown` is cancelled.
pub async fn ingest_all<R>(
    reader: R,
    aggregator: Arc<PositionAggregator>,
    shutdown: &CancellationToken,
) -> Result<IngestStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut source = JsonlReader::new(reader);
    let mut stats = IngestStats::default();

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, stopping ingest");
                break;
            }
            event = source.next_event() => event?,
        };
        let Some(event) = event else { break };

        let outcome = aggregator.ingest(event).await;
        if let Err(e) = &outcome {
            error!(error = %e, "Event dropped");
        }
        stats.record(&outcome);
    }

    stats.malformed = source.malformed();
    Ok(stats)
}
