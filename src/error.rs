use thiserror::Error;

/// Errors raised while loading and validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("invalid contract address {0:?}")]
    InvalidAddress(String),

    #[error("invalid contract entry {0:?}, expected name:address:start_block")]
    InvalidContractEntry(String),

    #[error("contract {0} is configured more than once")]
    DuplicateContract(String),

    #[error("failed to read contracts file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse contracts file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from the chain node. All of them are transient from the monitor's
/// point of view: the tick is aborted and retried on the next timer tick.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("RPC transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("RPC returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("RPC node error {code}: {message}")]
    Node { code: i64, message: String },

    #[error("malformed RPC response: {0}")]
    Malformed(String),

    #[error("block {0} not found")]
    BlockNotFound(u64),
}

/// Reasons a log cannot be turned into a transfer. The offending log is
/// skipped; the rest of the batch is still processed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("first topic is not the Transfer signature")]
    UnknownSignature,

    #[error("expected at least 3 topics, found {found}")]
    MissingTopics { found: usize },

    #[error("expected at least 32 bytes of data, found {len}")]
    ShortData { len: usize },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database connection lock poisoned")]
    Poisoned,

    #[error("blocking store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("contract {0} is already registered")]
    DuplicateContract(String),

    #[error("contract {0} is not registered")]
    UnknownContract(String),

    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

/// Why a single polling tick stopped early. None of these are fatal to the
/// monitor.
#[derive(Debug, Error)]
pub enum TickError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("stop requested while waiting on the chain or store")]
    Cancelled,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("contract {0} already has a running monitor")]
    AlreadyRegistered(String),

    #[error("contract {0} has no running monitor")]
    NotRegistered(String),

    #[error("supervisor is shutting down")]
    ShuttingDown,
}
