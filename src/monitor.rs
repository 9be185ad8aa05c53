//! Per-contract polling loop.
//!
//! Each tick computes the unprocessed range `[max(checkpoint + 1, start), head]`,
//! splits it into chunks of at most `max_chunk_width` blocks and, strictly in
//! ascending order, fetches, decodes and persists each chunk before moving the
//! checkpoint to the chunk's last block. Any fetch or store failure ends the
//! tick with the checkpoint where the last committed chunk left it; the next
//! tick starts again from there.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunk::{chunk_range, next_block, BlockRange};
use crate::error::TickError;
use crate::models::{ContractDescriptor, TransferRecord};
use crate::parser::{decode_transfer, TRANSFER_TOPIC};
use crate::rpc::ChainReader;
use crate::store::{CheckpointWrite, EventStore, InsertSummary, ProgressStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Polling,
    Fetching,
    Decoding,
    Persisting,
    Stopping,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Fetching => "fetching",
            Self::Decoding => "decoding",
            Self::Persisting => "persisting",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub max_chunk_width: u64,
    pub confirmations: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkSummary {
    pub fetched: usize,
    pub skipped: usize,
    pub stored: InsertSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub range: BlockRange,
    pub chunks: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub stored: InsertSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing between the checkpoint and the (confirmed) head.
    UpToDate,
    Advanced(TickSummary),
    /// A stop was requested between chunks. `completed` chunks were committed.
    Interrupted { completed: usize },
}

pub struct ContractMonitor {
    contract: ContractDescriptor,
    chain: Arc<dyn ChainReader>,
    progress: Arc<dyn ProgressStore>,
    events: Arc<dyn EventStore>,
    settings: MonitorSettings,
    state: watch::Sender<MonitorState>,
}

/// Race a chain call or a store read against the stop signal. Never used for
/// writes.
async fn interruptible<T, E, F>(cancel: &CancellationToken, call: F) -> Result<T, TickError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<TickError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TickError::Cancelled),
        res = call => res.map_err(Into::into),
    }
}

impl ContractMonitor {
    pub fn new(
        contract: ContractDescriptor,
        chain: Arc<dyn ChainReader>,
        progress: Arc<dyn ProgressStore>,
        events: Arc<dyn EventStore>,
        settings: MonitorSettings,
    ) -> Self {
        let (state, _) = watch::channel(MonitorState::Idle);
        Self {
            contract,
            chain,
            progress,
            events,
            settings,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: MonitorState) {
        self.state.send_replace(state);
    }

    /// Poll until `cancel` fires. The first tick runs immediately.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            contract = %self.contract.name,
            address = %self.contract.address,
            start_block = self.contract.start_block,
            "starting monitor"
        );

        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.tick(&cancel).await {
                Ok(TickOutcome::UpToDate) => {
                    debug!(contract = %self.contract.name, "no new blocks");
                }
                Ok(TickOutcome::Advanced(summary)) => {
                    info!(
                        contract = %self.contract.name,
                        range = %summary.range,
                        blocks = summary.range.len(),
                        chunks = summary.chunks,
                        inserted = summary.stored.inserted,
                        duplicates = summary.stored.duplicates,
                        "caught up"
                    );
                }
                Ok(TickOutcome::Interrupted { completed }) => {
                    info!(contract = %self.contract.name, completed, "tick interrupted by stop");
                }
                Err(TickError::Cancelled) => {
                    debug!(contract = %self.contract.name, "chain call abandoned on stop");
                }
                Err(e) => {
                    error!(
                        contract = %self.contract.name,
                        error = %e,
                        "tick failed, will retry from last checkpoint"
                    );
                }
            }
        }

        self.set_state(MonitorState::Stopping);
        info!(contract = %self.contract.name, "monitor stopped");
        self.set_state(MonitorState::Idle);
    }

    /// One polling pass. Ends with the monitor back in `Idle`, whatever the
    /// outcome.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickOutcome, TickError> {
        let result = self.tick_inner(cancel).await;
        self.set_state(MonitorState::Idle);
        result
    }

    async fn tick_inner(&self, cancel: &CancellationToken) -> Result<TickOutcome, TickError> {
        self.set_state(MonitorState::Polling);

        let checkpoint = interruptible(cancel, self.progress.get(&self.contract.address)).await?;
        let from = next_block(checkpoint, self.contract.start_block);
        let head = interruptible(cancel, self.chain.current_height()).await?;
        let range = BlockRange::new(from, head.saturating_sub(self.settings.confirmations));
        if range.is_empty() {
            return Ok(TickOutcome::UpToDate);
        }

        let mut timestamps = HashMap::new();
        let mut chunks = 0;
        let mut fetched = 0;
        let mut skipped = 0;
        let mut stored = InsertSummary::default();

        for chunk in chunk_range(range.from, range.to, self.settings.max_chunk_width) {
            if cancel.is_cancelled() {
                return Ok(TickOutcome::Interrupted { completed: chunks });
            }
            let summary = self.process_chunk(chunk, &mut timestamps, cancel).await?;
            chunks += 1;
            fetched += summary.fetched;
            skipped += summary.skipped;
            stored.inserted += summary.stored.inserted;
            stored.duplicates += summary.stored.duplicates;
            stored.conflicts += summary.stored.conflicts;
        }

        Ok(TickOutcome::Advanced(TickSummary {
            range,
            chunks,
            fetched,
            skipped,
            stored,
        }))
    }

    /// Fetch, decode and persist one chunk, then advance the checkpoint to
    /// `chunk.to`. Once persisting starts the chunk runs to completion.
    async fn process_chunk(
        &self,
        chunk: BlockRange,
        timestamps: &mut HashMap<u64, DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<ChunkSummary, TickError> {
        self.set_state(MonitorState::Fetching);
        let logs = interruptible(
            cancel,
            self.chain
                .filter_logs(&self.contract.address, TRANSFER_TOPIC, chunk.from, chunk.to),
        )
        .await?;

        self.set_state(MonitorState::Decoding);
        let mut records = Vec::with_capacity(logs.len());
        let mut skipped = 0;
        for log in &logs {
            let transfer = match decode_transfer(log) {
                Ok(t) => t,
                Err(e) => {
                    warn!(
                        contract = %self.contract.name,
                        tx_hash = %log.tx_hash,
                        log_index = log.log_index,
                        error = %e,
                        "skipping undecodable log"
                    );
                    skipped += 1;
                    continue;
                }
            };

            let block_timestamp = match timestamps.get(&transfer.block_number) {
                Some(ts) => *ts,
                None => {
                    let lookup = self.chain.block_timestamp(transfer.block_number);
                    let ts = interruptible(cancel, lookup).await?;
                    timestamps.insert(transfer.block_number, ts);
                    ts
                }
            };

            records.push(TransferRecord {
                tx_hash: transfer.tx_hash,
                log_index: transfer.log_index,
                block_number: transfer.block_number,
                contract_address: self.contract.address.clone(),
                token_name: self.contract.name.clone(),
                from_address: transfer.from,
                to_address: transfer.to,
                amount: transfer.amount.to_string(),
                price_usd: None,
                value_usd: None,
                block_timestamp,
            });
        }

        self.set_state(MonitorState::Persisting);
        let stored = self.events.insert_batch(&records).await?;
        if stored.conflicts > 0 {
            warn!(
                contract = %self.contract.name,
                range = %chunk,
                conflicts = stored.conflicts,
                "stored rows kept for conflicting transfers"
            );
        }

        match self.progress.set(&self.contract.address, chunk.to).await? {
            CheckpointWrite::Advanced => {}
            CheckpointWrite::Rejected { current } => warn!(
                contract = %self.contract.name,
                attempted = chunk.to,
                current,
                "checkpoint regression rejected"
            ),
        }

        info!(
            contract = %self.contract.name,
            from = chunk.from,
            to = chunk.to,
            fetched = logs.len(),
            inserted = stored.inserted,
            duplicates = stored.duplicates,
            skipped,
            "processed chunk"
        );

        Ok(ChunkSummary {
            fetched: logs.len(),
            skipped,
            stored,
        })
    }
}
