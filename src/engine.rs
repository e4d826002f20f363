//! Core ledger engine.
//!
//! Every mutation runs the same protocol inside one unit of work:
//! duplicate check, claim and load the balances involved, apply the
//! arithmetic, then persist balances and history together. A failed
//! precondition aborts before anything is written. Storage conflicts are
//! retried with the same operation; its transaction id makes a replay a
//! no-op.

use crate::account::{AccountId, AccountResolver, AnyAccount, Balance};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result, StoreError};
use crate::guard::{is_duplicate_in, IdempotencyGuard};
use crate::history::{ChangeKind, HistoryEntry, NewHistoryEntry, ADJUST_PREFIX, CANCEL_PREFIX};
use crate::operation::{
    AdjustRequest, Operation, Outcome, Receipt, Rejection, SaveRequest, TransferRequest,
    UseRequest,
};
use crate::points::Points;
use crate::store::{LedgerStore, UnitOfWork};
use log::{debug, error, warn};
use std::io::Write;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Credit,
    Debit,
}

/// One balance change and the history row recording it.
#[derive(Debug, Clone)]
struct Leg {
    direction: Direction,
    entry: NewHistoryEntry,
}

/// A validated mutation, ready to run against the store.
#[derive(Debug, Clone)]
struct Plan {
    /// Transaction id that deduplicates the whole plan.
    anchor: String,
    amount: Points,
    legs: Vec<Leg>,
}

impl Plan {
    fn accounts(&self) -> Vec<AccountId> {
        self.legs.iter().map(|leg| leg.entry.account).collect()
    }
}

/// The ledger engine.
///
/// Holds no balances of its own: every read and write goes through the
/// store, so any number of engines may share one store. The engine is
/// `Sync` whenever its store and resolver are, and is meant to be shared
/// across request handlers and event consumers.
#[derive(Debug)]
pub struct LedgerEngine<S, R = AnyAccount> {
    store: S,
    accounts: R,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl<S: LedgerStore> LedgerEngine<S, AnyAccount> {
    /// Creates an engine that accepts every account id.
    pub fn open(store: S) -> Self {
        LedgerEngine::new(store, AnyAccount)
    }
}

impl<S: LedgerStore, R: AccountResolver> LedgerEngine<S, R> {
    /// Creates an engine with the default retry policy.
    pub fn new(store: S, accounts: R) -> Self {
        let defaults = LedgerConfig::default();
        LedgerEngine {
            store,
            accounts,
            max_attempts: defaults.max_attempts,
            retry_backoff: defaults.retry_backoff,
        }
    }

    /// Applies the retry policy from `config`.
    pub fn configured(mut self, config: &LedgerConfig) -> Self {
        self.max_attempts = config.max_attempts.max(1);
        self.retry_backoff = config.retry_backoff;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Dispatches any operation to its protocol.
    pub fn apply(&self, operation: Operation) -> Result<Outcome> {
        match operation {
            Operation::Save(req) => self.apply_save(req),
            Operation::Use(req) => self.apply_use(req),
            Operation::Cancel(req) => self.apply_cancel(req),
            Operation::Transfer(req) => self.apply_transfer(req),
            Operation::Adjust(req) => self.apply_adjust(req),
        }
    }

    /// Credits `req.amount` to the account, creating its balance if needed.
    pub fn apply_save(&self, req: SaveRequest) -> Result<Outcome> {
        let description = req.reason.clone();
        self.single(req, Direction::Credit, ChangeKind::Save, description)
    }

    /// Restores a prior debit. Recorded as a save whose description starts
    /// with `[CANCEL] `.
    pub fn apply_cancel(&self, req: SaveRequest) -> Result<Outcome> {
        let description = format!("{}{}", CANCEL_PREFIX, req.reason);
        self.single(req, Direction::Credit, ChangeKind::Save, description)
    }

    /// Debits `req.amount` if the account holds at least that much.
    pub fn apply_use(&self, req: UseRequest) -> Result<Outcome> {
        let description = req.reason.clone();
        let req = SaveRequest {
            account: req.account,
            amount: req.amount,
            reason: req.reason,
            transaction_id: req.transaction_id,
            trace_id: req.trace_id,
            source: req.source,
        };
        self.single(req, Direction::Debit, ChangeKind::Use, description)
    }

    /// Administrative save or use, tagged `[ADJUST] ` in the history.
    pub fn apply_adjust(&self, req: AdjustRequest) -> Result<Outcome> {
        let direction = match req.kind {
            ChangeKind::Save => Direction::Credit,
            ChangeKind::Use => Direction::Debit,
            other => {
                return Ok(self.rejected(
                    &req.transaction_id,
                    Rejection::UnsupportedChangeKind(other),
                ))
            }
        };
        let description = format!("{}{}", ADJUST_PREFIX, req.reason);
        let kind = req.kind;
        let req = SaveRequest {
            account: req.account,
            amount: req.amount,
            reason: req.reason,
            transaction_id: req.transaction_id,
            trace_id: req.trace_id,
            source: req.source,
        };
        self.single(req, direction, kind, description)
    }

    /// Moves points from sender to receiver as one atomic unit.
    ///
    /// Deduplicated on the sender's transaction id: a replay skips both legs.
    pub fn apply_transfer(&self, req: TransferRequest) -> Result<Outcome> {
        if let Some(rejection) = self.precheck(
            req.amount,
            &[&req.sender_transaction_id, &req.receiver_transaction_id],
            &[req.sender, req.receiver],
        ) {
            return Ok(self.rejected(&req.sender_transaction_id, rejection));
        }
        if req.sender == req.receiver {
            return Ok(self.rejected(
                &req.sender_transaction_id,
                Rejection::SelfTransfer(req.sender),
            ));
        }
        if req.sender_transaction_id == req.receiver_transaction_id {
            return Ok(self.rejected(
                &req.sender_transaction_id,
                Rejection::TransactionIdConflict(req.receiver_transaction_id.clone()),
            ));
        }

        let debit = Leg {
            direction: Direction::Debit,
            entry: NewHistoryEntry {
                account: req.sender,
                kind: ChangeKind::Transfer,
                amount: -req.amount,
                description: format!("to {}: {}", req.receiver, req.reason),
                transaction_id: req.sender_transaction_id.clone(),
                trace_id: req.sender_trace_id,
                source: req.source,
            },
        };
        let credit = Leg {
            direction: Direction::Credit,
            entry: NewHistoryEntry {
                account: req.receiver,
                kind: ChangeKind::Save,
                amount: req.amount,
                description: format!("from {}: {}", req.sender, req.reason),
                transaction_id: req.receiver_transaction_id,
                trace_id: req.receiver_trace_id,
                source: req.source,
            },
        };

        self.execute(Plan {
            anchor: req.sender_transaction_id,
            amount: req.amount,
            legs: vec![debit, credit],
        })
    }

    /// Current balance; zero for accounts that were never credited.
    pub fn get_balance(&self, account: AccountId) -> Result<Points> {
        Ok(self
            .store
            .balance(account)?
            .map(|balance| balance.amount)
            .unwrap_or(Points::ZERO))
    }

    /// Every accepted mutation of `account`, newest first.
    pub fn get_history(&self, account: AccountId) -> Result<Vec<HistoryEntry>> {
        Ok(self.store.history(account)?)
    }

    /// All balance records, ordered by account.
    pub fn balances(&self) -> Result<Vec<Balance>> {
        Ok(self.store.balances()?)
    }

    /// Writes all balances as CSV (`account,balance`), sorted by account.
    pub fn write_balances<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(["account", "balance"])?;

        for balance in self.balances()? {
            csv_writer.write_record([balance.account.0.to_string(), balance.amount.to_string()])?;
        }

        csv_writer.flush()?;
        Ok(())
    }

    fn single(
        &self,
        req: SaveRequest,
        direction: Direction,
        kind: ChangeKind,
        description: String,
    ) -> Result<Outcome> {
        if let Some(rejection) =
            self.precheck(req.amount, &[&req.transaction_id], &[req.account])
        {
            return Ok(self.rejected(&req.transaction_id, rejection));
        }

        let leg = Leg {
            direction,
            entry: NewHistoryEntry {
                account: req.account,
                kind,
                amount: req.amount,
                description,
                transaction_id: req.transaction_id.clone(),
                trace_id: req.trace_id,
                source: req.source,
            },
        };

        self.execute(Plan {
            anchor: req.transaction_id,
            amount: req.amount,
            legs: vec![leg],
        })
    }

    /// Checks made before any store access.
    fn precheck(
        &self,
        amount: Points,
        transaction_ids: &[&str],
        accounts: &[AccountId],
    ) -> Option<Rejection> {
        if !amount.is_positive() {
            return Some(Rejection::InvalidAmount(amount));
        }
        if transaction_ids.iter().any(|id| id.trim().is_empty()) {
            return Some(Rejection::MissingTransactionId);
        }
        accounts
            .iter()
            .find(|&&account| self.accounts.resolve(account).is_none())
            .map(|&account| Rejection::AccountNotFound(account))
    }

    fn rejected(&self, transaction_id: &str, rejection: Rejection) -> Outcome {
        debug!("Rejected transaction {:?}: {}", transaction_id, rejection);
        Outcome::Rejected(rejection)
    }

    /// Runs a plan, retrying storage conflicts up to `max_attempts` times.
    fn execute(&self, plan: Plan) -> Result<Outcome> {
        if IdempotencyGuard::new(&self.store).is_duplicate(&plan.anchor)? {
            return Ok(Outcome::Duplicate);
        }

        let accounts = plan.accounts();
        let mut attempt = 1;
        loop {
            match self.attempt(&plan, &accounts) {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        "Transaction {:?}: attempt {}/{} failed ({}), retrying",
                        plan.anchor, attempt, self.max_attempts, err
                    );
                    thread::sleep(self.backoff(attempt));
                    attempt += 1;
                }
                Err(err) => {
                    error!(
                        "Transaction {:?}: giving up after {} attempt(s): {}",
                        plan.anchor, attempt, err
                    );
                    return Err(LedgerError::from(err));
                }
            }
        }
    }

    /// Linear backoff before retry number `attempt`.
    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff.saturating_mul(attempt)
    }

    fn attempt(&self, plan: &Plan, accounts: &[AccountId]) -> std::result::Result<Outcome, StoreError> {
        let mut unit = self.store.begin(accounts)?;

        if is_duplicate_in(&mut unit, &plan.anchor)? {
            return Ok(Outcome::Duplicate);
        }
        for leg in plan.legs.iter().filter(|leg| leg.entry.transaction_id != plan.anchor) {
            if unit.has_transaction(&leg.entry.transaction_id)? {
                return Ok(self.rejected(
                    &plan.anchor,
                    Rejection::TransactionIdConflict(leg.entry.transaction_id.clone()),
                ));
            }
        }

        let mut balances = Vec::with_capacity(plan.legs.len());
        for leg in &plan.legs {
            let account = leg.entry.account;
            let mut balance = unit
                .balance(account)?
                .unwrap_or_else(|| Balance::new(account));

            let applied = match leg.direction {
                Direction::Credit => balance.credit(plan.amount),
                Direction::Debit => balance.debit(plan.amount),
            };
            if !applied {
                let rejection = match leg.direction {
                    Direction::Debit => Rejection::InsufficientBalance {
                        account,
                        available: balance.amount,
                        requested: plan.amount,
                    },
                    Direction::Credit => Rejection::Overflow(account),
                };
                return Ok(self.rejected(&plan.anchor, rejection));
            }

            unit.put_balance(&balance)?;
            balances.push(balance);
        }

        for leg in &plan.legs {
            unit.append(leg.entry.clone())?;
        }
        unit.commit()?;

        debug!(
            "Applied transaction {:?}: {}",
            plan.anchor,
            balances
                .iter()
                .map(|b| format!("{} -> {}", b.account, b.amount))
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Outcome::Accepted(Receipt {
            transaction_id: plan.anchor.clone(),
            balances,
        }))
    }
}
