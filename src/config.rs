use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs};

use dotenvy::dotenv;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::models::ContractDescriptor;

const DEFAULT_DB_PATH: &str = "indexer.db";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;
const DEFAULT_BATCH_SIZE: u64 = 1000;
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct Config {
    /// Only the indexing commands need a node.
    pub rpc_http_url: Option<String>,
    pub db_path: String,
    pub host: String,
    pub port: u16,
    pub poll_interval: Duration,
    /// Upper bound on blocks per `eth_getLogs` call and per store transaction.
    pub max_chunk_width: u64,
    /// Blocks held back from the chain head.
    pub confirmations: u64,
    pub rpc_timeout: Duration,
    pub contracts: Vec<ContractDescriptor>,
}

#[derive(Debug, Deserialize)]
struct ContractEntry {
    name: String,
    address: String,
    start_block: u64,
}

/// Load from the process environment, after reading `.env` if present.
pub fn load() -> Result<Config, ConfigError> {
    dotenv().ok();
    let cfg = Config::from_lookup(|key| env::var(key).ok())?;

    info!(
        rpc = cfg.rpc_http_url.as_deref().unwrap_or("-"),
        db = %cfg.db_path,
        poll_interval_secs = cfg.poll_interval.as_secs(),
        max_chunk_width = cfg.max_chunk_width,
        confirmations = cfg.confirmations,
        contracts = cfg.contracts.len(),
        "loaded config"
    );
    Ok(cfg)
}

impl Config {
    /// Build and validate a config from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let rpc_http_url = get("RPC_HTTP_URL").or_else(|| get("PROVIDER_URL"));
        if let Some(url) = &rpc_http_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidValue {
                    key: "RPC_HTTP_URL",
                    value: url.clone(),
                });
            }
        }

        let poll_interval_secs: u64 =
            parse_or(&get, "POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?;
        let max_chunk_width: u64 = parse_or(&get, "BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        let rpc_timeout_secs: u64 =
            parse_or(&get, "RPC_TIMEOUT_SECS", DEFAULT_RPC_TIMEOUT_SECS)?;
        for (key, value) in [
            ("POLL_INTERVAL_SECS", poll_interval_secs),
            ("BATCH_SIZE", max_chunk_width),
            ("RPC_TIMEOUT_SECS", rpc_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: value.to_string(),
                });
            }
        }

        let mut entries = Vec::new();
        if let Some(list) = get("CONTRACTS") {
            entries.extend(parse_contract_list(&list));
        }
        if let Some(path) = get("CONTRACTS_FILE") {
            let raw = fs::read_to_string(&path)?;
            let parsed: Vec<ContractEntry> = serde_json::from_str(&raw)?;
            entries.extend(
                parsed
                    .into_iter()
                    .map(|e| ContractDescriptor::new(e.name, &e.address, e.start_block)),
            );
        }

        Ok(Config {
            rpc_http_url,
            db_path: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            host: get("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_or(&get, "PORT", DEFAULT_PORT)?,
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_chunk_width,
            confirmations: parse_or(&get, "CONFIRMATIONS", 0)?,
            rpc_timeout: Duration::from_secs(rpc_timeout_secs),
            contracts: accept_contracts(entries),
        })
    }

    pub fn rpc_endpoint(&self) -> Result<&str, ConfigError> {
        self.rpc_http_url
            .as_deref()
            .ok_or(ConfigError::Missing("RPC_HTTP_URL"))
    }
}

fn parse_or<G, T>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

/// Parse `name:address:start_block` entries separated by commas.
fn parse_contract_list(list: &str) -> Vec<Result<ContractDescriptor, ConfigError>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            match parts.as_slice() {
                [name, address, start] => {
                    let start = start
                        .parse::<u64>()
                        .map_err(|_| ConfigError::InvalidContractEntry(entry.to_string()))?;
                    ContractDescriptor::new(*name, address, start)
                }
                _ => Err(ConfigError::InvalidContractEntry(entry.to_string())),
            }
        })
        .collect()
}

/// A bad or repeated contract entry only drops that contract.
fn accept_contracts(
    entries: Vec<Result<ContractDescriptor, ConfigError>>,
) -> Vec<ContractDescriptor> {
    let mut seen = HashSet::new();
    let mut accepted = Vec::new();
    for entry in entries {
        match entry {
            Ok(contract) if seen.insert(contract.address.clone()) => accepted.push(contract),
            Ok(contract) => warn!(
                error = %ConfigError::DuplicateContract(contract.address),
                "skipping contract"
            ),
            Err(e) => warn!(error = %e, "skipping contract"),
        }
    }
    accepted
}
