//! In-process store.
//!
//! Accounts are claimed one by one in ascending order through a shared claim
//! set and a condition variable. Writes are staged in the unit and applied
//! under a single state lock at commit, where transaction id uniqueness is
//! checked again.

use super::{claim_order, LedgerStore, UnitOfWork};
use crate::account::{AccountId, Balance};
use crate::error::StoreError;
use crate::history::{newest_first, HistoryEntry, NewHistoryEntry};
use chrono::Utc;
use log::trace;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Default)]
struct State {
    balances: BTreeMap<AccountId, Balance>,
    history: Vec<HistoryEntry>,
    by_account: HashMap<AccountId, Vec<usize>>,
    transaction_ids: HashSet<String>,
}

/// Thread-safe in-memory ledger store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    claimed: Mutex<HashSet<AccountId>>,
    released: Condvar,
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&self, accounts: &[AccountId]) -> Claim<'_> {
        let mut claimed = self.claimed.lock();
        let mut claim = Claim {
            store: self,
            accounts: Vec::with_capacity(accounts.len()),
        };

        for account in claim_order(accounts) {
            while claimed.contains(&account) {
                self.released.wait(&mut claimed);
            }
            claimed.insert(account);
            claim.accounts.push(account);
        }

        trace!("Claimed accounts {:?}", claim.accounts);
        claim
    }
}

/// Exclusive hold on a set of accounts, released on drop.
#[derive(Debug)]
struct Claim<'a> {
    store: &'a MemoryStore,
    accounts: Vec<AccountId>,
}

impl Claim<'_> {
    fn covers(&self, account: AccountId) -> bool {
        self.accounts.contains(&account)
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut claimed = self.store.claimed.lock();
        for account in &self.accounts {
            claimed.remove(account);
        }
        self.store.released.notify_all();
    }
}

/// Unit of work over a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryUnit<'a> {
    store: &'a MemoryStore,
    claim: Claim<'a>,
    balances: HashMap<AccountId, Balance>,
    entries: Vec<NewHistoryEntry>,
}

impl LedgerStore for MemoryStore {
    type Unit<'a> = MemoryUnit<'a>;

    fn begin(&self, accounts: &[AccountId]) -> Result<MemoryUnit<'_>, StoreError> {
        Ok(MemoryUnit {
            store: self,
            claim: self.claim(accounts),
            balances: HashMap::new(),
            entries: Vec::new(),
        })
    }

    fn has_transaction(&self, transaction_id: &str) -> Result<bool, StoreError> {
        Ok(self.state.read().transaction_ids.contains(transaction_id))
    }

    fn balance(&self, account: AccountId) -> Result<Option<Balance>, StoreError> {
        Ok(self.state.read().balances.get(&account).cloned())
    }

    fn history(&self, account: AccountId) -> Result<Vec<HistoryEntry>, StoreError> {
        let state = self.state.read();
        let mut entries: Vec<HistoryEntry> = state
            .by_account
            .get(&account)
            .map(|positions| {
                positions
                    .iter()
                    .map(|&pos| state.history[pos].clone())
                    .collect()
            })
            .unwrap_or_default();
        newest_first(&mut entries);
        Ok(entries)
    }

    fn balances(&self) -> Result<Vec<Balance>, StoreError> {
        Ok(self.state.read().balances.values().cloned().collect())
    }
}

impl MemoryUnit<'_> {
    fn ensure_claimed(&self, account: AccountId) -> Result<(), StoreError> {
        if self.claim.covers(account) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!(
                "account {} is not claimed by this unit",
                account
            )))
        }
    }
}

impl UnitOfWork for MemoryUnit<'_> {
    fn has_transaction(&mut self, transaction_id: &str) -> Result<bool, StoreError> {
        if self.entries.iter().any(|e| e.transaction_id == transaction_id) {
            return Ok(true);
        }
        self.store.has_transaction(transaction_id)
    }

    fn balance(&mut self, account: AccountId) -> Result<Option<Balance>, StoreError> {
        self.ensure_claimed(account)?;
        if let Some(staged) = self.balances.get(&account) {
            return Ok(Some(staged.clone()));
        }
        self.store.balance(account)
    }

    fn put_balance(&mut self, balance: &Balance) -> Result<(), StoreError> {
        self.ensure_claimed(balance.account)?;
        self.balances.insert(balance.account, balance.clone());
        Ok(())
    }

    fn append(&mut self, entry: NewHistoryEntry) -> Result<(), StoreError> {
        self.ensure_claimed(entry.account)?;
        if self.has_transaction(&entry.transaction_id)? {
            return Err(StoreError::Conflict(format!(
                "transaction id {:?} already recorded",
                entry.transaction_id
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    fn commit(self) -> Result<(), StoreError> {
        let mut state = self.store.state.write();

        // Another unit may have recorded one of our ids since `append`.
        if let Some(taken) = self
            .entries
            .iter()
            .find(|e| state.transaction_ids.contains(&e.transaction_id))
        {
            return Err(StoreError::Conflict(format!(
                "transaction id {:?} already recorded",
                taken.transaction_id
            )));
        }

        let created_at = Utc::now();
        for (account, balance) in self.balances {
            state.balances.insert(account, balance);
        }
        for entry in self.entries {
            let position = state.history.len();
            state.transaction_ids.insert(entry.transaction_id.clone());
            state
                .by_account
                .entry(entry.account)
                .or_default()
                .push(position);
            let recorded = entry.recorded(position as u64 + 1, created_at);
            state.history.push(recorded);
        }

        Ok(())
    }
}
