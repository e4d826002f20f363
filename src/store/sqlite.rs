//! SQLite backed store.
//!
//! Every unit of work is a `BEGIN IMMEDIATE` transaction on a single shared
//! connection, so the write claim covers the whole database. That is a
//! superset of the per-account claims the engine needs and is trivially
//! acquired in a fixed order. Other processes sharing the file wait on the
//! busy timeout and surface as [`StoreError::Conflict`] when it expires.

use super::{LedgerStore, UnitOfWork};
use crate::account::{AccountId, Balance};
use crate::error::StoreError;
use crate::history::{HistoryEntry, NewHistoryEntry};
use chrono::{DateTime, SecondsFormat, Utc};
use log::{trace, warn};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS point_balance (
    account_id INTEGER PRIMARY KEY,
    amount TEXT NOT NULL,
    last_updated TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS point_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL,
    change_kind TEXT NOT NULL,
    amount TEXT NOT NULL,
    description TEXT NOT NULL,
    created_at TEXT NOT NULL,
    transaction_id TEXT NOT NULL UNIQUE,
    trace_id TEXT,
    source TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS point_history_account_created
    ON point_history (account_id, created_at DESC);
";

const HISTORY_COLUMNS: &str = "id, account_id, change_kind, amount, description, created_at, \
     transaction_id, trace_id, source";

/// Ledger store persisted in a SQLite database.
#[derive(Debug)]
pub struct SqliteStore {
    connection: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and ensures the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let connection = Connection::open(path)?;
        connection.busy_timeout(BUSY_TIMEOUT)?;
        Self::with_connection(connection)
    }

    /// Creates a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(connection: Connection) -> Result<Self, StoreError> {
        connection.execute_batch(SCHEMA)?;
        Ok(SqliteStore {
            connection: Mutex::new(connection),
        })
    }
}

fn account_param(account: AccountId) -> Result<i64, StoreError> {
    i64::try_from(account.0).map_err(|_| {
        StoreError::Unavailable(format!("account {} exceeds the storable id range", account))
    })
}

fn timestamp(at: &DateTime<Utc>) -> String {
    // Fixed width, so lexical order in SQL matches chronological order.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parsed_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|err| conversion_error(idx, err))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| conversion_error(idx, err))
}

fn account_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<AccountId> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw)
        .map(AccountId)
        .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, raw))
}

fn map_balance(row: &Row<'_>) -> rusqlite::Result<Balance> {
    Ok(Balance {
        account: account_column(row, 0)?,
        amount: parsed_column(row, 1)?,
        last_updated: timestamp_column(row, 2)?,
    })
}

fn map_history(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let id: i64 = row.get(0)?;
    Ok(HistoryEntry {
        id: u64::try_from(id).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(0, id))?,
        account: account_column(row, 1)?,
        kind: parsed_column(row, 2)?,
        amount: parsed_column(row, 3)?,
        description: row.get(4)?,
        created_at: timestamp_column(row, 5)?,
        transaction_id: row.get(6)?,
        trace_id: row.get(7)?,
        source: parsed_column(row, 8)?,
    })
}

fn select_balance(
    connection: &Connection,
    account: AccountId,
) -> Result<Option<Balance>, StoreError> {
    let balance = connection
        .prepare_cached(
            "SELECT account_id, amount, last_updated FROM point_balance WHERE account_id = ?1",
        )?
        .query_row([account_param(account)?], map_balance)
        .optional()?;
    Ok(balance)
}

fn transaction_exists(connection: &Connection, transaction_id: &str) -> Result<bool, StoreError> {
    let exists = connection
        .prepare_cached("SELECT EXISTS(SELECT 1 FROM point_history WHERE transaction_id = ?1)")?
        .query_row([transaction_id], |row| row.get(0))?;
    Ok(exists)
}

impl LedgerStore for SqliteStore {
    type Unit<'a> = SqliteUnit<'a>;

    fn begin(&self, accounts: &[AccountId]) -> Result<SqliteUnit<'_>, StoreError> {
        let connection = self.connection.lock();
        connection.execute_batch("BEGIN IMMEDIATE")?;
        trace!("Opened write transaction for accounts {:?}", accounts);
        Ok(SqliteUnit {
            connection,
            open: true,
        })
    }

    fn has_transaction(&self, transaction_id: &str) -> Result<bool, StoreError> {
        transaction_exists(&self.connection.lock(), transaction_id)
    }

    fn balance(&self, account: AccountId) -> Result<Option<Balance>, StoreError> {
        select_balance(&self.connection.lock(), account)
    }

    fn history(&self, account: AccountId) -> Result<Vec<HistoryEntry>, StoreError> {
        let connection = self.connection.lock();
        let mut statement = connection.prepare_cached(&format!(
            "SELECT {HISTORY_COLUMNS} FROM point_history
             WHERE account_id = ?1
             ORDER BY created_at DESC, id DESC"
        ))?;
        let entries = statement
            .query_map([account_param(account)?], map_history)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn balances(&self) -> Result<Vec<Balance>, StoreError> {
        let connection = self.connection.lock();
        let mut statement = connection.prepare_cached(
            "SELECT account_id, amount, last_updated FROM point_balance ORDER BY account_id",
        )?;
        let balances = statement
            .query_map([], map_balance)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(balances)
    }
}

/// An open `BEGIN IMMEDIATE` transaction. Rolled back on drop unless committed.
#[derive(Debug)]
pub struct SqliteUnit<'a> {
    connection: MutexGuard<'a, Connection>,
    open: bool,
}

impl UnitOfWork for SqliteUnit<'_> {
    fn has_transaction(&mut self, transaction_id: &str) -> Result<bool, StoreError> {
        transaction_exists(&self.connection, transaction_id)
    }

    fn balance(&mut self, account: AccountId) -> Result<Option<Balance>, StoreError> {
        select_balance(&self.connection, account)
    }

    fn put_balance(&mut self, balance: &Balance) -> Result<(), StoreError> {
        self.connection
            .prepare_cached(
                "INSERT INTO point_balance (account_id, amount, last_updated)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(account_id) DO UPDATE SET
                     amount = excluded.amount,
                     last_updated = excluded.last_updated",
            )?
            .execute((
                account_param(balance.account)?,
                balance.amount.to_string(),
                timestamp(&balance.last_updated),
            ))?;
        Ok(())
    }

    fn append(&mut self, entry: NewHistoryEntry) -> Result<(), StoreError> {
        self.connection
            .prepare_cached(
                "INSERT INTO point_history
                     (account_id, change_kind, amount, description, created_at,
                      transaction_id, trace_id, source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?
            .execute((
                account_param(entry.account)?,
                entry.kind.as_str(),
                entry.amount.to_string(),
                &entry.description,
                timestamp(&Utc::now()),
                &entry.transaction_id,
                &entry.trace_id,
                entry.source.name(),
            ))?;
        Ok(())
    }

    fn commit(mut self) -> Result<(), StoreError> {
        self.connection.execute_batch("COMMIT")?;
        self.open = false;
        Ok(())
    }
}

impl Drop for SqliteUnit<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(err) = self.connection.execute_batch("ROLLBACK") {
                warn!("Failed to roll back write transaction: {}", err);
            }
        }
    }
}
