//! Split-purchase (structuring) detector
//!
//! Windows purchase events by (actor, asset), fingerprints purchase sizes,
//! scores each sequence and reports high-confidence detections.

pub mod cli;
pub mod config;
pub mod error;
pub mod filter;
pub mod lifecycle;
pub mod metrics;
pub mod position;
pub mod scoring;
pub mod sink;
pub mod state;
pub mod stream;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use position::{IngestOutcome, PositionAggregator};
pub use types::{Direction, PurchaseEvent};
