use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::TransferRecord;

/// Result of a checkpoint write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointWrite {
    Advanced,
    /// The write would have moved the watermark backwards and was dropped.
    Rejected { current: u64 },
}

/// Per-address "fully processed up to" watermark.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get(&self, contract: &str) -> Result<Option<u64>, StoreError>;

    /// Upsert the watermark. Never lowers an existing value.
    async fn set(&self, contract: &str, height: u64) -> Result<CheckpointWrite, StoreError>;
}

/// Result of inserting one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Same key, same event: nothing to do.
    Duplicate,
    /// Same key, different payload. The stored row wins.
    Conflict,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertSummary {
    pub inserted: usize,
    pub duplicates: usize,
    pub conflicts: usize,
}

impl InsertSummary {
    pub fn record(&mut self, outcome: InsertOutcome) {
        match outcome {
            InsertOutcome::Inserted => self.inserted += 1,
            InsertOutcome::Duplicate => self.duplicates += 1,
            InsertOutcome::Conflict => self.conflicts += 1,
        }
    }
}

/// Write-once collection of transfers keyed by `(tx_hash, log_index)`.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert(&self, record: &TransferRecord) -> Result<InsertOutcome, StoreError>;

    /// Insert one chunk's records. Implementations should make this a single
    /// transaction; the fallback inserts one at a time, which is still safe
    /// because every insert is idempotent.
    async fn insert_batch(&self, records: &[TransferRecord]) -> Result<InsertSummary, StoreError> {
        let mut summary = InsertSummary::default();
        for record in records {
            summary.record(self.insert(record).await?);
        }
        Ok(summary)
    }
}
