// src/models.rs
use std::str::FromStr;

use alloy::primitives::{Address, B256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Render an address as canonical lowercase `0x` hex.
pub fn format_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}

/// Parse any hex address spelling (mixed case, checksummed or not) into its
/// canonical lowercase form.
pub fn normalize_address(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    if !trimmed.starts_with("0x") && !trimmed.starts_with("0X") {
        return Err(ConfigError::InvalidAddress(raw.to_string()));
    }
    let address = Address::from_str(&trimmed[2..])
        .map_err(|_| ConfigError::InvalidAddress(raw.to_string()))?;
    Ok(format_address(&address))
}

/// A token contract to monitor. Immutable once its monitor is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractDescriptor {
    pub name: String,
    /// Canonical lowercase hex.
    pub address: String,
    /// Blocks below this height are never polled for this contract.
    pub start_block: u64,
}

impl ContractDescriptor {
    pub fn new(
        name: impl Into<String>,
        address: &str,
        start_block: u64,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::InvalidContractEntry(format!(
                "{name}:{address}:{start_block}"
            )));
        }
        Ok(Self {
            name,
            address: normalize_address(address)?,
            start_block,
        })
    }
}

/// A log as returned by the chain node, already converted out of its wire
/// encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub address: String,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    pub tx_hash: String,
    pub block_number: u64,
    pub log_index: u64,
}

/// A persisted ERC20 transfer. Write-once, keyed by `(tx_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub contract_address: String,
    pub token_name: String,
    pub from_address: String,
    pub to_address: String,
    pub amount: String, // decimal string, full uint256 range
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_usd: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_usd: Option<Decimal>,
    pub block_timestamp: DateTime<Utc>,
}

impl TransferRecord {
    /// True when both records describe the same on-chain event. Price
    /// annotations are not part of the event itself and are ignored.
    pub fn same_event(&self, other: &TransferRecord) -> bool {
        self.tx_hash == other.tx_hash
            && self.log_index == other.log_index
            && self.block_number == other.block_number
            && self.contract_address == other.contract_address
            && self.from_address == other.from_address
            && self.to_address == other.to_address
            && self.amount == other.amount
            && self.block_timestamp == other.block_timestamp
    }
}

/// Row of the contract registry.
#[derive(Debug, Clone, Serialize)]
pub struct ContractRow {
    pub name: String,
    pub address: String,
    pub start_block: u64,
    pub is_active: bool,
    pub last_block: Option<u64>,
    pub created_at: String,
    pub updated_at: String,
}

impl ContractRow {
    pub fn descriptor(&self) -> ContractDescriptor {
        ContractDescriptor {
            name: self.name.clone(),
            address: self.address.clone(),
            start_block: self.start_block,
        }
    }
}
