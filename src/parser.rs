// src/parser.rs
use alloy::primitives::{b256, Address, B256, U256};

use crate::error::DecodeError;
use crate::models::{format_address, LogEntry};

/// ERC20 Transfer event topic keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

/// A decoded ERC20 Transfer, still missing its block timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTransfer {
    pub from: String,
    pub to: String,
    pub amount: U256,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
}

fn topic_to_address(topic: &B256) -> Address {
    // indexed addresses are left-padded to 32 bytes; the address is the last 20
    Address::from_slice(&topic[12..])
}

/// Decode a single log into a `DecodedTransfer`.
pub fn decode_transfer(log: &LogEntry) -> Result<DecodedTransfer, DecodeError> {
    match log.topics.first() {
        Some(topic) if *topic == TRANSFER_TOPIC => {}
        Some(_) => return Err(DecodeError::UnknownSignature),
        None => return Err(DecodeError::MissingTopics { found: 0 }),
    }
    if log.topics.len() < 3 {
        return Err(DecodeError::MissingTopics {
            found: log.topics.len(),
        });
    }
    if log.data.len() < 32 {
        return Err(DecodeError::ShortData {
            len: log.data.len(),
        });
    }

    Ok(DecodedTransfer {
        from: format_address(&topic_to_address(&log.topics[1])),
        to: format_address(&topic_to_address(&log.topics[2])),
        amount: U256::from_be_slice(&log.data[..32]),
        block_number: log.block_number,
        tx_hash: log.tx_hash.clone(),
        log_index: log.log_index,
    })
}
