//! # Points Ledger
//!
//! Per-account point balances with an immutable history of every change,
//! fed concurrently by synchronous requests (transfer, adjust) and an
//! at-least-once event stream (save, use, cancel).
//!
//! ## Design Principles
//!
//! - **Exactly once in effect**: every mutation carries a caller-supplied
//!   transaction id; a replay returns [`Outcome::Duplicate`] and changes nothing
//! - **Atomic units**: balance writes and history rows commit together or not at all
//! - **Ordered claims**: accounts are claimed in ascending id order, so
//!   opposing transfers cannot deadlock
//! - **No balance cache**: every read goes to the store
//! - **Fixed-point arithmetic**: 4 decimal places via `rust_decimal`
//!
//! ## Example
//!
//! ```
//! use points_ledger::{AccountId, LedgerEngine, MemoryStore, Points, SaveRequest, Source};
//!
//! let engine = LedgerEngine::open(MemoryStore::new());
//! let reward = SaveRequest {
//!     account: AccountId(1),
//!     amount: Points::whole(500),
//!     reason: "order reward".to_string(),
//!     transaction_id: "order-42-reward".to_string(),
//!     trace_id: None,
//!     source: Source::OrderReward,
//! };
//!
//! assert!(engine.apply_save(reward.clone()).unwrap().is_accepted());
//! assert!(engine.apply_save(reward).unwrap().is_duplicate());
//! assert_eq!(engine.get_balance(AccountId(1)).unwrap(), Points::whole(500));
//! ```

pub mod account;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod guard;
pub mod history;
pub mod operation;
pub mod points;
pub mod store;

pub use account::{AccountId, AccountResolver, AnyAccount, Balance, KnownAccounts};
pub use config::LedgerConfig;
pub use consumer::{ConsumeSummary, DeadLetter, EventConsumer, PointChangedEvent};
pub use engine::LedgerEngine;
pub use error::{LedgerError, Result, StoreError};
pub use history::{ChangeKind, HistoryEntry, Source};
pub use operation::{
    AdjustRequest, Operation, Outcome, Receipt, Rejection, SaveRequest, TransferRequest,
    UseRequest,
};
pub use points::Points;
pub use store::{LedgerStore, MemoryStore, SqliteStore, UnitOfWork};
