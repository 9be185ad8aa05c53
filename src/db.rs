use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::DateTime;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use tokio::task;
use tracing::warn;

use crate::error::StoreError;
use crate::models::{ContractDescriptor, ContractRow, TransferRecord};
use crate::store::{CheckpointWrite, EventStore, InsertOutcome, InsertSummary, ProgressStore};

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS contracts (
  id          INTEGER PRIMARY KEY AUTOINCREMENT,
  name        TEXT NOT NULL,
  address     TEXT UNIQUE NOT NULL,
  start_block INTEGER NOT NULL,
  is_active   INTEGER NOT NULL DEFAULT 1,
  created_at  TEXT NOT NULL DEFAULT (datetime('now')),
  updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS transactions (
  id               INTEGER PRIMARY KEY AUTOINCREMENT,
  tx_hash          TEXT NOT NULL,
  log_index        INTEGER NOT NULL,
  block_number     INTEGER NOT NULL,
  contract_address TEXT NOT NULL,
  token_name       TEXT NOT NULL,
  from_address     TEXT NOT NULL,
  to_address       TEXT NOT NULL,
  amount           TEXT NOT NULL, -- uint256 as decimal string
  price_usd        TEXT,
  value_usd        TEXT,
  block_timestamp  INTEGER NOT NULL, -- unix seconds
  created_at       TEXT NOT NULL DEFAULT (datetime('now')),
  UNIQUE(tx_hash, log_index)
);

CREATE INDEX IF NOT EXISTS idx_transactions_contract_block
  ON transactions(contract_address, block_number);
CREATE INDEX IF NOT EXISTS idx_transactions_from ON transactions(from_address);
CREATE INDEX IF NOT EXISTS idx_transactions_to ON transactions(to_address);

CREATE TABLE IF NOT EXISTS block_progress (
  contract   TEXT PRIMARY KEY,
  last_block INTEGER NOT NULL,
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

const TRANSFER_COLUMNS: &str = "tx_hash, log_index, block_number, contract_address, token_name, \
     from_address, to_address, amount, price_usd, value_usd, block_timestamp";

/// Connect to SQLite (with WAL mode for concurrent readers)
pub fn connect(path: &str) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

/// Run schema migrations
pub fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(INIT_SQL)?;
    Ok(())
}

fn decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        s.parse::<Decimal>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn row_to_transfer(row: &Row<'_>) -> rusqlite::Result<TransferRecord> {
    let secs: i64 = row.get(10)?;
    let block_timestamp = DateTime::from_timestamp(secs, 0)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(10, secs))?;

    Ok(TransferRecord {
        tx_hash: row.get(0)?,
        log_index: row.get::<_, i64>(1)? as u64,
        block_number: row.get::<_, i64>(2)? as u64,
        contract_address: row.get(3)?,
        token_name: row.get(4)?,
        from_address: row.get(5)?,
        to_address: row.get(6)?,
        amount: row.get(7)?,
        price_usd: decimal_column(row, 8)?,
        value_usd: decimal_column(row, 9)?,
        block_timestamp,
    })
}

fn row_to_contract(row: &Row<'_>) -> rusqlite::Result<ContractRow> {
    Ok(ContractRow {
        name: row.get(0)?,
        address: row.get(1)?,
        start_block: row.get::<_, i64>(2)? as u64,
        is_active: row.get(3)?,
        last_block: row.get::<_, Option<i64>>(4)?.map(|b| b as u64),
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

pub fn transfer_by_key(
    conn: &Connection,
    tx_hash: &str,
    log_index: u64,
) -> Result<Option<TransferRecord>, StoreError> {
    let sql = format!(
        "SELECT {TRANSFER_COLUMNS} FROM transactions WHERE tx_hash = ?1 AND log_index = ?2"
    );
    let record = conn
        .query_row(&sql, params![tx_hash, log_index as i64], row_to_transfer)
        .optional()?;
    Ok(record)
}

/// Insert a transfer unless its `(tx_hash, log_index)` already exists. An
/// existing row is never overwritten.
pub fn insert_transfer(
    conn: &Connection,
    rec: &TransferRecord,
) -> Result<InsertOutcome, StoreError> {
    let changed = conn.execute(
        r#"
        INSERT INTO transactions (
            tx_hash, log_index, block_number,
            contract_address, token_name, from_address, to_address,
            amount, price_usd, value_usd, block_timestamp
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(tx_hash, log_index) DO NOTHING
        "#,
        params![
            rec.tx_hash,
            rec.log_index as i64,
            rec.block_number as i64,
            rec.contract_address,
            rec.token_name,
            rec.from_address,
            rec.to_address,
            rec.amount,
            rec.price_usd.map(|d| d.to_string()),
            rec.value_usd.map(|d| d.to_string()),
            rec.block_timestamp.timestamp(),
        ],
    )?;
    if changed == 1 {
        return Ok(InsertOutcome::Inserted);
    }

    match transfer_by_key(conn, &rec.tx_hash, rec.log_index)? {
        Some(existing) if existing.same_event(rec) => Ok(InsertOutcome::Duplicate),
        Some(existing) => {
            warn!(
                tx_hash = %rec.tx_hash,
                log_index = rec.log_index,
                stored_amount = %existing.amount,
                incoming_amount = %rec.amount,
                "conflicting transfer for existing key, keeping stored row"
            );
            Ok(InsertOutcome::Conflict)
        }
        None => Err(StoreError::Corrupt {
            table: "transactions",
            detail: format!("insert of {}#{} ignored but no row found", rec.tx_hash, rec.log_index),
        }),
    }
}

pub fn get_checkpoint(conn: &Connection, contract: &str) -> Result<Option<u64>, StoreError> {
    let last: Option<i64> = conn
        .query_row(
            "SELECT last_block FROM block_progress WHERE contract = ?1",
            params![contract],
            |r| r.get(0),
        )
        .optional()?;
    Ok(last.map(|b| b as u64))
}

/// Upsert the watermark, refusing to move it backwards.
pub fn set_checkpoint(
    conn: &Connection,
    contract: &str,
    height: u64,
) -> Result<CheckpointWrite, StoreError> {
    let changed = conn.execute(
        r#"
        INSERT INTO block_progress (contract, last_block, updated_at)
        VALUES (?1, ?2, datetime('now'))
        ON CONFLICT(contract) DO UPDATE SET
            last_block = excluded.last_block,
            updated_at = excluded.updated_at
        WHERE excluded.last_block >= block_progress.last_block
        "#,
        params![contract, height as i64],
    )?;
    if changed > 0 {
        return Ok(CheckpointWrite::Advanced);
    }
    let current = get_checkpoint(conn, contract)?.unwrap_or_default();
    Ok(CheckpointWrite::Rejected { current })
}

/// Insert or refresh a contract from static configuration. Reactivates it if
/// it had been deactivated.
pub fn upsert_contract(conn: &Connection, contract: &ContractDescriptor) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO contracts (name, address, start_block, is_active)
        VALUES (?1, ?2, ?3, 1)
        ON CONFLICT(address) DO UPDATE SET
            name        = excluded.name,
            start_block = excluded.start_block,
            is_active   = 1,
            updated_at  = datetime('now')
        "#,
        params![contract.name, contract.address, contract.start_block as i64],
    )?;
    Ok(())
}

/// Register a contract at runtime. Fails if it is already active.
pub fn register_contract(
    conn: &Connection,
    contract: &ContractDescriptor,
) -> Result<(), StoreError> {
    let active: Option<bool> = conn
        .query_row(
            "SELECT is_active FROM contracts WHERE address = ?1",
            params![contract.address],
            |r| r.get(0),
        )
        .optional()?;
    if active == Some(true) {
        return Err(StoreError::DuplicateContract(contract.address.clone()));
    }
    upsert_contract(conn, contract)
}

pub fn deactivate_contract(conn: &Connection, address: &str) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE contracts SET is_active = 0, updated_at = datetime('now') WHERE address = ?1",
        params![address],
    )?;
    if changed == 0 {
        return Err(StoreError::UnknownContract(address.to_string()));
    }
    Ok(())
}

pub fn list_contracts(
    conn: &Connection,
    only_active: bool,
) -> Result<Vec<ContractRow>, StoreError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT c.name, c.address, c.start_block, c.is_active, p.last_block,
               c.created_at, c.updated_at
        FROM contracts c
        LEFT JOIN block_progress p ON p.contract = c.address
        WHERE (?1 = 0 OR c.is_active = 1)
        ORDER BY c.id
        "#,
    )?;
    let rows = stmt
        .query_map(params![only_active], row_to_contract)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Filter for transfer queries. Addresses must already be canonical.
#[derive(Debug, Clone, Default)]
pub struct TransferFilter {
    pub contract: Option<String>,
    /// Matches either side of the transfer.
    pub address: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

pub fn query_transfers(
    conn: &Connection,
    filter: &TransferFilter,
) -> Result<Vec<TransferRecord>, StoreError> {
    let sql = format!(
        "SELECT {TRANSFER_COLUMNS} FROM transactions
         WHERE (?1 IS NULL OR contract_address = ?1)
           AND (?2 IS NULL OR from_address = ?2 OR to_address = ?2)
         ORDER BY block_number DESC, log_index DESC
         LIMIT ?3 OFFSET ?4"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![filter.contract, filter.address, filter.limit, filter.offset],
            row_to_transfer,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn transfers_by_hash(
    conn: &Connection,
    tx_hash: &str,
) -> Result<Vec<TransferRecord>, StoreError> {
    let sql = format!(
        "SELECT {TRANSFER_COLUMNS} FROM transactions WHERE tx_hash = ?1 ORDER BY log_index"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![tx_hash], row_to_transfer)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count_transfers(conn: &Connection, contract: &str) -> Result<u64, StoreError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM transactions WHERE contract_address = ?1",
        params![contract],
        |r| r.get(0),
    )?;
    Ok(n as u64)
}

/// Shared SQLite handle. Implements both ingestion stores and the query
/// helpers the API needs. Every call runs on the blocking pool.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = connect(path)?;
        run_migrations(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut *guard)
        })
        .await?
    }

    pub async fn upsert_contract(&self, contract: ContractDescriptor) -> Result<(), StoreError> {
        self.call(move |conn| upsert_contract(conn, &contract)).await
    }

    pub async fn register_contract(&self, contract: ContractDescriptor) -> Result<(), StoreError> {
        self.call(move |conn| register_contract(conn, &contract)).await
    }

    pub async fn deactivate_contract(&self, address: String) -> Result<(), StoreError> {
        self.call(move |conn| deactivate_contract(conn, &address)).await
    }

    pub async fn contracts(&self, only_active: bool) -> Result<Vec<ContractRow>, StoreError> {
        self.call(move |conn| list_contracts(conn, only_active)).await
    }

    pub async fn transfers(
        &self,
        filter: TransferFilter,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        self.call(move |conn| query_transfers(conn, &filter)).await
    }

    pub async fn transfers_by_hash(
        &self,
        tx_hash: String,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        self.call(move |conn| transfers_by_hash(conn, &tx_hash)).await
    }

    pub async fn count_transfers(&self, contract: String) -> Result<u64, StoreError> {
        self.call(move |conn| count_transfers(conn, &contract)).await
    }
}

#[async_trait]
impl ProgressStore for Database {
    async fn get(&self, contract: &str) -> Result<Option<u64>, StoreError> {
        let contract = contract.to_string();
        self.call(move |conn| get_checkpoint(conn, &contract)).await
    }

    async fn set(&self, contract: &str, height: u64) -> Result<CheckpointWrite, StoreError> {
        let contract = contract.to_string();
        self.call(move |conn| set_checkpoint(conn, &contract, height)).await
    }
}

#[async_trait]
impl EventStore for Database {
    async fn insert(&self, record: &TransferRecord) -> Result<InsertOutcome, StoreError> {
        let record = record.clone();
        self.call(move |conn| insert_transfer(conn, &record)).await
    }

    async fn insert_batch(&self, records: &[TransferRecord]) -> Result<InsertSummary, StoreError> {
        let records = records.to_vec();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let mut summary = InsertSummary::default();
            for record in &records {
                summary.record(insert_transfer(&tx, record)?);
            }
            tx.commit()?;
            Ok(summary)
        })
        .await
    }
}
