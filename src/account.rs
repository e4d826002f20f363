//! Account identifiers, balance records and account resolution.
//!
//! A [`Balance`] never goes negative: debits go through
//! [`Balance::debit`], which refuses to overdraw.

use crate::points::Points;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Opaque account identifier. The ledger references accounts but does not own them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AccountId(pub u64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for AccountId {
    fn from(id: u64) -> Self {
        AccountId(id)
    }
}

/// The current point balance of one account.
///
/// # Invariants
///
/// - `amount >= 0` after every debit
/// - `last_updated` moves forward on every change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub account: AccountId,
    pub amount: Points,
    pub last_updated: DateTime<Utc>,
}

impl Balance {
    /// Creates an empty balance, used when an account is first credited.
    pub fn new(account: AccountId) -> Self {
        Balance {
            account,
            amount: Points::ZERO,
            last_updated: Utc::now(),
        }
    }

    /// Credits the balance.
    ///
    /// Returns `false` (and leaves the balance untouched) on decimal overflow.
    pub fn credit(&mut self, amount: Points) -> bool {
        match self.amount.checked_add(amount) {
            Some(updated) => {
                self.amount = updated;
                self.last_updated = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Debits the balance.
    ///
    /// Returns `false` if `amount > self.amount`; no partial debit is applied.
    pub fn debit(&mut self, amount: Points) -> bool {
        match self.amount.checked_debit(amount) {
            Some(updated) => {
                self.amount = updated;
                self.last_updated = Utc::now();
                true
            }
            None => false,
        }
    }
}

/// Resolves caller-supplied identifiers to known accounts.
///
/// Account lifecycle lives outside the ledger; the engine only asks whether
/// an account exists before touching its balance.
pub trait AccountResolver: Send + Sync {
    fn resolve(&self, id: AccountId) -> Option<AccountId>;
}

/// Resolver that accepts every identifier.
///
/// Used by the event replay driver, where upstream services have already
/// validated the account.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyAccount;

impl AccountResolver for AnyAccount {
    fn resolve(&self, id: AccountId) -> Option<AccountId> {
        Some(id)
    }
}

/// Resolver backed by a fixed set of registered accounts.
#[derive(Debug, Clone, Default)]
pub struct KnownAccounts {
    accounts: HashSet<AccountId>,
}

impl KnownAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: AccountId) {
        self.accounts.insert(id);
    }
}

impl FromIterator<AccountId> for KnownAccounts {
    fn from_iter<I: IntoIterator<Item = AccountId>>(iter: I) -> Self {
        KnownAccounts {
            accounts: iter.into_iter().collect(),
        }
    }
}

impl AccountResolver for KnownAccounts {
    fn resolve(&self, id: AccountId) -> Option<AccountId> {
        self.accounts.get(&id).copied()
    }
}
