//! Ledger operations and their outcomes.

use crate::account::{AccountId, Balance};
use crate::history::{ChangeKind, Source};
use crate::points::Points;
use thiserror::Error;

/// Credit an account. Also used for compensations (see [`Operation::Cancel`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRequest {
    pub account: AccountId,
    pub amount: Points,
    pub reason: String,
    pub transaction_id: String,
    pub trace_id: Option<String>,
    pub source: Source,
}

/// Debit an account if it holds enough points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UseRequest {
    pub account: AccountId,
    pub amount: Points,
    pub reason: String,
    pub transaction_id: String,
    pub trace_id: Option<String>,
    pub source: Source,
}

/// Move points between two accounts.
///
/// Each leg carries its own transaction and trace id. The sender's
/// transaction id is the deduplication anchor for the whole transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub sender: AccountId,
    pub receiver: AccountId,
    pub amount: Points,
    pub reason: String,
    pub sender_transaction_id: String,
    pub sender_trace_id: Option<String>,
    pub receiver_transaction_id: String,
    pub receiver_trace_id: Option<String>,
    pub source: Source,
}

/// Administrative credit or debit. `kind` must be `Save` or `Use`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustRequest {
    pub account: AccountId,
    pub amount: Points,
    pub kind: ChangeKind,
    pub reason: String,
    pub transaction_id: String,
    pub trace_id: Option<String>,
    pub source: Source,
}

/// Any ledger mutation, for callers that dispatch on a kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Save(SaveRequest),
    Use(UseRequest),
    /// Restores a prior debit; applied as a save with a `[CANCEL]` description.
    Cancel(SaveRequest),
    Transfer(TransferRequest),
    Adjust(AdjustRequest),
}

impl Operation {
    /// The transaction id that deduplicates this operation.
    pub fn transaction_id(&self) -> &str {
        match self {
            Operation::Save(req) | Operation::Cancel(req) => &req.transaction_id,
            Operation::Use(req) => &req.transaction_id,
            Operation::Transfer(req) => &req.sender_transaction_id,
            Operation::Adjust(req) => &req.transaction_id,
        }
    }
}

/// Why an operation was refused. No state was changed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("amount must be positive, got {0}")]
    InvalidAmount(Points),

    #[error("transaction id must not be blank")]
    MissingTransactionId,

    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("account {account} holds {available}, cannot debit {requested}")]
    InsufficientBalance {
        account: AccountId,
        available: Points,
        requested: Points,
    },

    #[error("account {0} cannot transfer to itself")]
    SelfTransfer(AccountId),

    #[error("transaction id {0:?} is already recorded for another mutation")]
    TransactionIdConflict(String),

    #[error("change kind {0} is not supported here")]
    UnsupportedChangeKind(ChangeKind),

    #[error("balance of account {0} would overflow")]
    Overflow(AccountId),
}

/// Balances after an accepted operation, one per touched account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_id: String,
    pub balances: Vec<Balance>,
}

impl Receipt {
    /// The post-operation balance of `account`, if it was touched.
    pub fn balance_of(&self, account: AccountId) -> Option<Points> {
        self.balances
            .iter()
            .find(|b| b.account == account)
            .map(|b| b.amount)
    }
}

/// Result of applying an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Applied exactly once.
    Accepted(Receipt),
    /// The transaction id was already recorded; nothing was changed.
    Duplicate,
    /// Refused before any write.
    Rejected(Rejection),
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Outcome::Duplicate)
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Outcome::Rejected(reason) => Some(reason),
            _ => None,
        }
    }
}
