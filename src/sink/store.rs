//! Detection record stores
//!
//! `JsonlRecordStore` appends one JSON object per line; status updates from
//! `mark_processed` are appended as separate lines referencing the record id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{DetectionRecord, PersistenceSink};
use crate::error::{Error, Result};

/// One line of the JSONL file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoredLine {
    Record {
        id: String,
        #[serde(flatten)]
        record: Box<DetectionRecord>,
    },
    Processed {
        id: String,
        escalated: bool,
        processed_at: DateTime<Utc>,
    },
}

/// Append-only JSONL file store
pub struct JsonlRecordStore {
    path: PathBuf,
    /// Serializes appends so lines never interleave
    write_lock: Mutex<()>,
}

impl JsonlRecordStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, line: &StoredLine) -> Result<()> {
        let mut data = serde_json::to_string(line)?;
        data.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::DeliveryFailed {
                sink: "jsonl".to_string(),
                reason: format!("open {}: {}", self.path.display(), e),
            })?;
        file.write_all(data.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read every line back (reporting and tests)
    pub async fn read_all(&self) -> Result<Vec<StoredLine>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(Error::from))
            .collect()
    }
}

#[async_trait]
impl PersistenceSink for JsonlRecordStore {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn save(&self, record: &DetectionRecord) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.append(&StoredLine::Record {
            id: id.clone(),
            record: Box::new(record.clone()),
        })
        .await?;
        debug!(id = %id, path = %self.path.display(), "Detection record saved");
        Ok(id)
    }

    async fn mark_processed(&self, id: &str, escalated: bool) -> Result<()> {
        self.append(&StoredLine::Processed {
            id: id.to_string(),
            escalated,
            processed_at: Utc::now(),
        })
        .await
    }
}

/// In-memory store, useful when embedding the detector
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<(String, DetectionRecord)>>,
    processed: Mutex<Vec<(String, bool)>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<(String, DetectionRecord)> {
        self.records.lock().await.clone()
    }

    pub async fn processed(&self) -> Vec<(String, bool)> {
        self.processed.lock().await.clone()
    }
}

#[async_trait]
impl PersistenceSink for MemoryRecordStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn save(&self, record: &DetectionRecord) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.records.lock().await.push((id.clone(), record.clone()));
        Ok(id)
    }

    async fn mark_processed(&self, id: &str, escalated: bool) -> Result<()> {
        self.processed.lock().await.push((id.to_string(), escalated));
        Ok(())
    }
}
