//! Transaction id deduplication.
//!
//! The check here is a fast path only. The unique transaction id in the
//! history store decides: the engine repeats the check inside the atomic
//! unit, and a lost race surfaces as a commit conflict.

use crate::error::StoreError;
use crate::store::{LedgerStore, UnitOfWork};
use log::warn;

/// Read-only duplicate detection over a store's history.
#[derive(Debug)]
pub struct IdempotencyGuard<'s, S> {
    store: &'s S,
}

impl<'s, S: LedgerStore> IdempotencyGuard<'s, S> {
    pub fn new(store: &'s S) -> Self {
        IdempotencyGuard { store }
    }

    /// Returns `true` if `transaction_id` has already been recorded.
    pub fn is_duplicate(&self, transaction_id: &str) -> Result<bool, StoreError> {
        let seen = self.store.has_transaction(transaction_id)?;
        if seen {
            warn!("Duplicate transaction id {:?}, skipping", transaction_id);
        }
        Ok(seen)
    }
}

/// The same check, made inside an open unit of work.
pub fn is_duplicate_in<U: UnitOfWork>(
    unit: &mut U,
    transaction_id: &str,
) -> Result<bool, StoreError> {
    let seen = unit.has_transaction(transaction_id)?;
    if seen {
        warn!(
            "Transaction id {:?} was recorded concurrently, skipping",
            transaction_id
        );
    }
    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountId;
    use crate::history::{ChangeKind, NewHistoryEntry, Source};
    use crate::points::Points;
    use crate::store::MemoryStore;

    #[test]
    fn test_guard_reports_recorded_ids_only() {
        let store = MemoryStore::new();
        let mut unit = store.begin(&[AccountId(1)]).unwrap();
        unit.append(NewHistoryEntry {
            account: AccountId(1),
            kind: ChangeKind::Save,
            amount: Points::whole(5),
            description: "welcome bonus".to_string(),
            transaction_id: "t1".to_string(),
            trace_id: None,
            source: Source::OrderReward,
        })
        .unwrap();

        assert!(is_duplicate_in(&mut unit, "t1").unwrap());
        assert!(!IdempotencyGuard::new(&store).is_duplicate("t1").unwrap());

        unit.commit().unwrap();
        assert!(IdempotencyGuard::new(&store).is_duplicate("t1").unwrap());
        assert!(!IdempotencyGuard::new(&store).is_duplicate("t2").unwrap());
    }
}
