//! Windowed position aggregation
//!
//! - `aggregate`: one open (actor, asset) position and its statistics
//! - `book`: the active key -> aggregate map
//! - `aggregator`: ingest, rollover, escalation and sweeps
//! - `finalizer`: reportability gate and sink hand-off

pub mod aggregate;
pub mod aggregator;
pub mod book;
pub mod finalizer;

pub use aggregate::{Aggregate, Purchase, ScoringParams};
pub use aggregator::{IngestOutcome, PositionAggregator};
pub use book::PositionBook;
pub use finalizer::{FinalizeMode, FinalizeSummary, Finalizer, ReportGate};
