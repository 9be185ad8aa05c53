// src/rpc.rs
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::B256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::RpcError;
use crate::models::LogEntry;

/// Read side of the chain node the monitors poll.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn current_height(&self) -> Result<u64, RpcError>;

    /// Logs emitted by `address` whose first topic is `topic`, in the
    /// inclusive block range `[from, to]`.
    async fn filter_logs(
        &self,
        address: &str,
        topic: B256,
        from: u64,
        to: u64,
    ) -> Result<Vec<LogEntry>, RpcError>;

    async fn block_timestamp(&self, height: u64) -> Result<DateTime<Utc>, RpcError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RpcResponse<T> {
    // error first: a missing `result` would otherwise satisfy `Option<T>`
    Error { error: RpcErrorObject },
    Success { result: T },
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcLog {
    address: String,
    topics: Vec<String>,
    data: String,
    #[serde(rename = "blockNumber")]
    block_number: Option<String>,
    #[serde(rename = "transactionHash")]
    tx_hash: Option<String>,
    #[serde(rename = "logIndex")]
    log_index: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcBlockHeader {
    timestamp: String,
}

fn parse_quantity(field: &str, value: &str) -> Result<u64, RpcError> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|_| RpcError::Malformed(format!("{field} is not a hex quantity: {value:?}")))
}

fn required<'a>(field: &str, value: &'a Option<String>) -> Result<&'a str, RpcError> {
    value
        .as_deref()
        .ok_or_else(|| RpcError::Malformed(format!("log is missing {field} (pending log?)")))
}

impl TryFrom<RpcLog> for LogEntry {
    type Error = RpcError;

    fn try_from(log: RpcLog) -> Result<Self, Self::Error> {
        let topics = log
            .topics
            .iter()
            .map(|t| {
                B256::from_str(t).map_err(|_| RpcError::Malformed(format!("bad topic {t:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let data = hex::decode(log.data.trim_start_matches("0x"))
            .map_err(|_| RpcError::Malformed(format!("bad log data {:?}", log.data)))?;

        Ok(LogEntry {
            address: log.address.to_lowercase(),
            topics,
            data,
            tx_hash: required("transactionHash", &log.tx_hash)?.to_lowercase(),
            block_number: parse_quantity(
                "blockNumber",
                required("blockNumber", &log.block_number)?,
            )?,
            log_index: parse_quantity("logIndex", required("logIndex", &log.log_index)?)?,
        })
    }
}

/// JSON-RPC 2.0 client over HTTP. Does not retry: a failed call fails the
/// caller's tick and the next tick tries again.
#[derive(Debug, Clone)]
pub struct RpcClient {
    client: Client,
    url: String,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RpcError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        debug!(method, url = %self.url, "sending RPC request");

        let resp = self.client.post(&self.url).json(&payload).send().await?;
        if resp.status() != StatusCode::OK {
            return Err(RpcError::Status(resp.status()));
        }
        let text = resp.text().await?;

        match serde_json::from_str::<RpcResponse<T>>(&text) {
            Ok(RpcResponse::Success { result }) => Ok(result),
            Ok(RpcResponse::Error { error }) => Err(RpcError::Node {
                code: error.code,
                message: error.message,
            }),
            Err(e) => Err(RpcError::Malformed(format!("{method}: {e}"))),
        }
    }
}

#[async_trait]
impl ChainReader for RpcClient {
    async fn current_height(&self) -> Result<u64, RpcError> {
        let hex: String = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity("eth_blockNumber", &hex)
    }

    async fn filter_logs(
        &self,
        address: &str,
        topic: B256,
        from: u64,
        to: u64,
    ) -> Result<Vec<LogEntry>, RpcError> {
        let logs: Vec<RpcLog> = self
            .call(
                "eth_getLogs",
                json!([{
                    "fromBlock": format!("0x{:x}", from),
                    "toBlock": format!("0x{:x}", to),
                    "address": address,
                    "topics": [format!("0x{}", hex::encode(topic))],
                }]),
            )
            .await?;
        logs.into_iter().map(LogEntry::try_from).collect()
    }

    async fn block_timestamp(&self, height: u64) -> Result<DateTime<Utc>, RpcError> {
        let block: Option<RpcBlockHeader> = self
            .call(
                "eth_getBlockByNumber",
                json!([format!("0x{:x}", height), false]),
            )
            .await?;
        let block = block.ok_or(RpcError::BlockNotFound(height))?;
        let secs = parse_quantity("timestamp", &block.timestamp)?;
        i64::try_from(secs)
            .ok()
            .and_then(|s| DateTime::from_timestamp(s, 0))
            .ok_or_else(|| RpcError::Malformed(format!("timestamp out of range: {secs}")))
    }
}
