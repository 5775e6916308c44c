//! Event ingestion sources
//!
//! Supports newline-delimited JSON from a file or stdin.

pub mod jsonl;

pub use jsonl::{ingest_all, IngestStats, JsonlReader};
