#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{B256, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coin_indexer::db::Database;
use coin_indexer::error::{RpcError, StoreError};
use coin_indexer::models::{ContractDescriptor, LogEntry, TransferRecord};
use coin_indexer::monitor::{ContractMonitor, MonitorSettings};
use coin_indexer::parser::TRANSFER_TOPIC;
use coin_indexer::rpc::ChainReader;
use coin_indexer::store::{
    CheckpointWrite, EventStore, InsertOutcome, InsertSummary, ProgressStore,
};
use tokio_util::sync::CancellationToken;

pub const USDC: &str = "0x2791bca1f2de4661ed88a30c99a7a9449aa84174";
pub const WETH: &str = "0x7ceb23fd6bc0add59e62ac25578270cff1b9f619";
pub const SENDER: &str = "0xe7804c37c13166ff0b37f5ae0bb07a3aebb6e245";
pub const RECIPIENT: &str = "0xf977814e90da44bfa03b6295a0616a897441acec";

pub fn descriptor(name: &str, address: &str, start_block: u64) -> ContractDescriptor {
    ContractDescriptor::new(name, address, start_block).unwrap()
}

pub fn settings(max_chunk_width: u64) -> MonitorSettings {
    MonitorSettings {
        poll_interval: Duration::from_millis(10),
        max_chunk_width,
        confirmations: 0,
    }
}

pub fn block_time(height: u64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_600_000_000 + height as i64 * 2, 0).unwrap()
}

fn address_topic(address: &str) -> B256 {
    let raw = hex::decode(address.trim_start_matches("0x")).unwrap();
    let mut bytes = [0u8; 32];
    bytes[12..].copy_from_slice(&raw);
    B256::from(bytes)
}

pub fn tx_hash(contract: &str, block: u64, log_index: u64) -> String {
    format!("0x{}{:016x}{:08x}", &contract[2..10], block, log_index)
}

pub fn transfer_log(contract: &str, block: u64, log_index: u64, amount: u64) -> LogEntry {
    LogEntry {
        address: contract.to_string(),
        topics: vec![TRANSFER_TOPIC, address_topic(SENDER), address_topic(RECIPIENT)],
        data: U256::from(amount).to_be_bytes::<32>().to_vec(),
        tx_hash: tx_hash(contract, block, log_index),
        block_number: block,
        log_index,
    }
}

#[derive(Default)]
struct ChainState {
    height: u64,
    logs: Vec<LogEntry>,
    fail_logs_at: Option<u64>,
    fail_height: bool,
    hang_logs_for: HashSet<String>,
    requests: Vec<(String, u64, u64)>,
}

/// In-process chain node driven by the test.
#[derive(Default)]
pub struct ScriptedChain {
    state: Mutex<ChainState>,
    timestamp_calls: AtomicUsize,
}

impl ScriptedChain {
    pub fn new(height: u64) -> Arc<Self> {
        let chain = Self::default();
        chain.state.lock().unwrap().height = height;
        Arc::new(chain)
    }

    pub fn set_height(&self, height: u64) {
        self.state.lock().unwrap().height = height;
    }

    pub fn push(&self, log: LogEntry) {
        self.state.lock().unwrap().logs.push(log);
    }

    /// Fail any `eth_getLogs` whose range contains `block`.
    pub fn fail_logs_at(&self, block: Option<u64>) {
        self.state.lock().unwrap().fail_logs_at = block;
    }

    pub fn fail_height(&self, fail: bool) {
        self.state.lock().unwrap().fail_height = fail;
    }

    /// Never answer log queries for `address`.
    pub fn hang_logs_for(&self, address: &str) {
        self.state.lock().unwrap().hang_logs_for.insert(address.to_string());
    }

    pub fn requests_for(&self, address: &str) -> Vec<(u64, u64)> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|(a, _, _)| a == address)
            .map(|(_, from, to)| (*from, *to))
            .collect()
    }

    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }

    pub fn timestamp_calls(&self) -> usize {
        self.timestamp_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainReader for ScriptedChain {
    async fn current_height(&self) -> Result<u64, RpcError> {
        let state = self.state.lock().unwrap();
        if state.fail_height {
            return Err(RpcError::Malformed("injected height failure".into()));
        }
        Ok(state.height)
    }

    async fn filter_logs(
        &self,
        address: &str,
        topic: B256,
        from: u64,
        to: u64,
    ) -> Result<Vec<LogEntry>, RpcError> {
        let hang = {
            let mut state = self.state.lock().unwrap();
            state.requests.push((address.to_string(), from, to));
            if let Some(block) = state.fail_logs_at {
                if (from..=to).contains(&block) {
                    return Err(RpcError::Node {
                        code: -32000,
                        message: "injected getLogs failure".into(),
                    });
                }
            }
            state.hang_logs_for.contains(address)
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let state = self.state.lock().unwrap();
        Ok(state
            .logs
            .iter()
            .filter(|l| l.address == address)
            .filter(|l| (from..=to).contains(&l.block_number))
            .filter(|l| l.topics.first().map_or(true, |t| *t == topic))
            .cloned()
            .collect())
    }

    async fn block_timestamp(&self, height: u64) -> Result<DateTime<Utc>, RpcError> {
        self.timestamp_calls.fetch_add(1, Ordering::SeqCst);
        Ok(block_time(height))
    }
}

/// Event store that fails the n-th batch (1-based) after writing half of it.
pub struct FlakyEvents {
    inner: Database,
    calls: AtomicUsize,
    fail_on: Mutex<Option<usize>>,
}

impl FlakyEvents {
    pub fn new(inner: Database) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: AtomicUsize::new(0),
            fail_on: Mutex::new(None),
        })
    }

    pub fn fail_on_batch(&self, n: Option<usize>) {
        self.calls.store(0, Ordering::SeqCst);
        *self.fail_on.lock().unwrap() = n;
    }
}

#[async_trait]
impl EventStore for FlakyEvents {
    async fn insert(&self, record: &TransferRecord) -> Result<InsertOutcome, StoreError> {
        self.inner.insert(record).await
    }

    async fn insert_batch(&self, records: &[TransferRecord]) -> Result<InsertSummary, StoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let fail_on = *self.fail_on.lock().unwrap();
        if fail_on == Some(call) {
            self.inner.insert_batch(&records[..records.len() / 2]).await?;
            return Err(StoreError::Corrupt {
                table: "transactions",
                detail: "injected write failure".into(),
            });
        }
        self.inner.insert_batch(records).await
    }
}

/// Event store that raises the stop signal while a batch is being written,
/// then lets the write finish.
pub struct StopDuringPersist {
    inner: Database,
    stop: CancellationToken,
}

impl StopDuringPersist {
    pub fn new(inner: Database, stop: CancellationToken) -> Arc<Self> {
        Arc::new(Self { inner, stop })
    }
}

#[async_trait]
impl EventStore for StopDuringPersist {
    async fn insert(&self, record: &TransferRecord) -> Result<InsertOutcome, StoreError> {
        self.inner.insert(record).await
    }

    async fn insert_batch(&self, records: &[TransferRecord]) -> Result<InsertSummary, StoreError> {
        self.stop.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.inner.insert_batch(records).await
    }
}

/// Progress store whose checkpoint reads never return, like a database
/// stuck behind a lock.
pub struct StalledProgress {
    inner: Database,
}

impl StalledProgress {
    pub fn new(inner: Database) -> Arc<Self> {
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl ProgressStore for StalledProgress {
    async fn get(&self, _contract: &str) -> Result<Option<u64>, StoreError> {
        std::future::pending().await
    }

    async fn set(&self, contract: &str, height: u64) -> Result<CheckpointWrite, StoreError> {
        self.inner.set(contract, height).await
    }
}

pub fn monitor_with(
    contract: ContractDescriptor,
    chain: Arc<ScriptedChain>,
    progress: Arc<dyn ProgressStore>,
    events: Arc<dyn EventStore>,
    settings: MonitorSettings,
) -> ContractMonitor {
    ContractMonitor::new(contract, chain, progress, events, settings)
}

pub async fn wait_for_checkpoint(db: &Database, address: &str, target: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        if db.get(address).await.unwrap() == Some(target) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "checkpoint for {address} never reached {target}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
