//! Balance and history storage.
//!
//! A store hands out [`UnitOfWork`]s: atomic scopes holding exclusive claims
//! on a set of accounts. Writes staged in a unit become visible together on
//! [`UnitOfWork::commit`]; dropping an uncommitted unit discards them.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::account::{AccountId, Balance};
use crate::error::StoreError;
use crate::history::{HistoryEntry, NewHistoryEntry};

/// Shared durable state behind the ledger engine.
///
/// Implementations must be safe to share between threads. They must not
/// serve balances from a cache that can go stale across units.
pub trait LedgerStore: Send + Sync {
    type Unit<'a>: UnitOfWork
    where
        Self: 'a;

    /// Opens an atomic unit with exclusive claims on `accounts`.
    ///
    /// Claims are taken in ascending account order regardless of the order
    /// given, so two units over the same accounts cannot deadlock.
    fn begin(&self, accounts: &[AccountId]) -> Result<Self::Unit<'_>, StoreError>;

    /// Returns `true` if a history entry with this transaction id exists.
    fn has_transaction(&self, transaction_id: &str) -> Result<bool, StoreError>;

    fn balance(&self, account: AccountId) -> Result<Option<Balance>, StoreError>;

    /// All history entries of `account`, newest first.
    fn history(&self, account: AccountId) -> Result<Vec<HistoryEntry>, StoreError>;

    /// All balances, ordered by account.
    fn balances(&self) -> Result<Vec<Balance>, StoreError>;
}

/// One atomic read-modify-write scope.
pub trait UnitOfWork {
    /// Checks committed history and entries staged in this unit.
    fn has_transaction(&mut self, transaction_id: &str) -> Result<bool, StoreError>;

    /// Reads a balance, seeing writes staged in this unit.
    fn balance(&mut self, account: AccountId) -> Result<Option<Balance>, StoreError>;

    fn put_balance(&mut self, balance: &Balance) -> Result<(), StoreError>;

    /// Stages a history entry. A transaction id that is already recorded
    /// fails with [`StoreError::Conflict`], here or at commit.
    fn append(&mut self, entry: NewHistoryEntry) -> Result<(), StoreError>;

    fn commit(self) -> Result<(), StoreError>;
}

/// Sorted, deduplicated claim order for a set of accounts.
pub(crate) fn claim_order(accounts: &[AccountId]) -> Vec<AccountId> {
    let mut ordered = accounts.to_vec();
    ordered.sort_unstable();
    ordered.dedup();
    ordered
}
