//! Consumer for `point.changed` events published by other services.
//!
//! Delivery is at least once and unordered across accounts; the engine's
//! transaction id check is the only defence against duplicates. Events that
//! cannot be applied are dead-lettered rather than dropped.

use crate::account::{AccountId, AccountResolver};
use crate::engine::LedgerEngine;
use crate::error::Result;
use crate::history::{ChangeKind, Source};
use crate::operation::{Outcome, Rejection, SaveRequest, UseRequest};
use crate::points::{ParsePointsError, Points};
use crate::store::LedgerStore;
use csv::{ReaderBuilder, Trim};
use log::{debug, error, info};
use serde::Deserialize;
use std::io::Read;
use std::str::FromStr;
use thiserror::Error;

/// Raw event record as read from CSV.
#[derive(Debug, Clone, Deserialize)]
pub struct PointChangedRecord {
    /// SAVE, USE or CANCEL
    pub change_type: String,

    pub account: u64,

    pub amount: Option<String>,

    pub reason: Option<String>,

    pub transaction_id: String,

    pub trace_id: Option<String>,

    /// Enum name or `service:operation` value, see [`Source`].
    pub source: String,
}

/// Why a record could not be turned into an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("unsupported change type {0:?}")]
    UnsupportedChangeType(String),

    #[error("missing amount")]
    MissingAmount,

    #[error("invalid amount: {0}")]
    InvalidAmount(#[from] ParsePointsError),

    #[error("unknown source {0:?}")]
    UnknownSource(String),

    #[error("missing transaction id")]
    MissingTransactionId,

    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("rejected: {0}")]
    Rejected(Rejection),
}

/// A validated `point.changed` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointChangedEvent {
    pub kind: ChangeKind,
    pub account: AccountId,
    pub amount: Points,
    pub reason: String,
    pub transaction_id: String,
    pub trace_id: Option<String>,
    pub source: Source,
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl PointChangedRecord {
    /// Parses the raw record into a typed event.
    ///
    /// Transfers are not accepted on the event stream; they only arrive
    /// through the synchronous API, which carries both legs.
    pub fn parse(&self) -> std::result::Result<PointChangedEvent, EventError> {
        let kind = match ChangeKind::from_str(&self.change_type) {
            Ok(kind @ (ChangeKind::Save | ChangeKind::Use | ChangeKind::Cancel)) => kind,
            _ => return Err(EventError::UnsupportedChangeType(self.change_type.clone())),
        };

        let amount = non_blank(&self.amount).ok_or(EventError::MissingAmount)?;
        let amount = Points::from_str(&amount)?;

        let source = Source::from_str(&self.source)
            .map_err(|_| EventError::UnknownSource(self.source.clone()))?;

        let transaction_id = self.transaction_id.trim();
        if transaction_id.is_empty() {
            return Err(EventError::MissingTransactionId);
        }

        Ok(PointChangedEvent {
            kind,
            account: AccountId(self.account),
            amount,
            reason: non_blank(&self.reason).unwrap_or_default(),
            transaction_id: transaction_id.to_string(),
            trace_id: non_blank(&self.trace_id),
            source,
        })
    }
}

/// An event that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// 1-indexed input row, accounting for the header.
    pub row: usize,
    pub transaction_id: Option<String>,
    pub error: EventError,
}

/// Counts for one consumed stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub accepted: usize,
    pub duplicates: usize,
    pub dead_letters: Vec<DeadLetter>,
}

/// Feeds events into a [`LedgerEngine`].
#[derive(Debug)]
pub struct EventConsumer<'e, S, R> {
    engine: &'e LedgerEngine<S, R>,
}

impl<'e, S: LedgerStore, R: AccountResolver> EventConsumer<'e, S, R> {
    pub fn new(engine: &'e LedgerEngine<S, R>) -> Self {
        EventConsumer { engine }
    }

    /// Applies one event. CANCEL restores points through the save path.
    pub fn consume(&self, event: PointChangedEvent) -> Result<Outcome> {
        debug!(
            "Received point.changed: account={}, type={}, amount={}, tx={:?}",
            event.account, event.kind, event.amount, event.transaction_id
        );

        let save = SaveRequest {
            account: event.account,
            amount: event.amount,
            reason: event.reason,
            transaction_id: event.transaction_id,
            trace_id: event.trace_id,
            source: event.source,
        };

        match event.kind {
            ChangeKind::Save => self.engine.apply_save(save),
            ChangeKind::Cancel => self.engine.apply_cancel(save),
            ChangeKind::Use => self.engine.apply_use(UseRequest {
                account: save.account,
                amount: save.amount,
                reason: save.reason,
                transaction_id: save.transaction_id,
                trace_id: save.trace_id,
                source: save.source,
            }),
            ChangeKind::Transfer => Ok(Outcome::Rejected(Rejection::UnsupportedChangeKind(
                ChangeKind::Transfer,
            ))),
        }
    }

    /// Consumes a CSV stream of events in order.
    ///
    /// Unparseable rows and rejected events are dead-lettered and
    /// consumption continues. A storage failure stops consumption and is
    /// returned: the failing event has not been acknowledged and the whole
    /// stream can be replayed safely.
    pub fn consume_csv<Rd: Read>(&self, reader: Rd) -> Result<ConsumeSummary> {
        let mut csv_reader = ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(reader);

        let mut summary = ConsumeSummary::default();

        for (row_idx, result) in csv_reader.deserialize::<PointChangedRecord>().enumerate() {
            let row = row_idx + 2; // 1-indexed, accounting for header row

            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    dead_letter(&mut summary, row, None, EventError::Malformed(e.to_string()));
                    continue;
                }
            };

            let event = match record.parse() {
                Ok(event) => event,
                Err(e) => {
                    let tx = Some(record.transaction_id.clone()).filter(|t| !t.is_empty());
                    dead_letter(&mut summary, row, tx, e);
                    continue;
                }
            };

            let transaction_id = event.transaction_id.clone();
            match self.consume(event)? {
                Outcome::Accepted(_) => summary.accepted += 1,
                Outcome::Duplicate => summary.duplicates += 1,
                Outcome::Rejected(rejection) => dead_letter(
                    &mut summary,
                    row,
                    Some(transaction_id),
                    EventError::Rejected(rejection),
                ),
            }
        }

        info!(
            "Consumed events: {} accepted, {} duplicate, {} dead-lettered",
            summary.accepted,
            summary.duplicates,
            summary.dead_letters.len()
        );
        Ok(summary)
    }
}

fn dead_letter(
    summary: &mut ConsumeSummary,
    row: usize,
    transaction_id: Option<String>,
    error: EventError,
) {
    error!(
        "Row {}: dead-lettering point.changed (tx={:?}): {}",
        row, transaction_id, error
    );
    summary.dead_letters.push(DeadLetter {
        row,
        transaction_id,
        error,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::io::Cursor;

    fn record(change_type: &str, amount: Option<&str>, source: &str) -> PointChangedRecord {
        PointChangedRecord {
            change_type: change_type.to_string(),
            account: 1,
            amount: amount.map(str::to_string),
            reason: Some("order 7".to_string()),
            transaction_id: "evt-1".to_string(),
            trace_id: None,
            source: source.to_string(),
        }
    }

    #[test]
    fn test_parse_save() {
        let event = record("SAVE", Some("10.5"), "ORDER_REWARD").parse().unwrap();
        assert_eq!(event.kind, ChangeKind::Save);
        assert_eq!(event.account, AccountId(1));
        assert_eq!(event.amount.to_string(), "10.5000");
        assert_eq!(event.source, Source::OrderReward);
        assert_eq!(event.reason, "order 7");
    }

    #[test]
    fn test_parse_accepts_service_style_source() {
        let event = record("cancel", Some("3"), "order-payment-service:refund")
            .parse()
            .unwrap();
        assert_eq!(event.kind, ChangeKind::Cancel);
        assert_eq!(event.source, Source::OrderRefund);
    }

    #[test]
    fn test_parse_rejects_unknown_and_transfer_kinds() {
        assert_eq!(
            record("EXPIRE", Some("1"), "ORDER_REWARD").parse(),
            Err(EventError::UnsupportedChangeType("EXPIRE".to_string()))
        );
        assert_eq!(
            record("TRANSFER", Some("1"), "MEMBER_TRANSFER").parse(),
            Err(EventError::UnsupportedChangeType("TRANSFER".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_missing_amount_and_source() {
        assert_eq!(
            record("SAVE", None, "ORDER_REWARD").parse(),
            Err(EventError::MissingAmount)
        );
        assert_eq!(
            record("SAVE", Some("  "), "ORDER_REWARD").parse(),
            Err(EventError::MissingAmount)
        );
        assert_eq!(
            record("SAVE", Some("1"), "NEWSLETTER").parse(),
            Err(EventError::UnknownSource("NEWSLETTER".to_string()))
        );
        assert!(matches!(
            record("SAVE", Some("1.00001"), "ORDER_REWARD").parse(),
            Err(EventError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_consume_csv_dispatches_and_dead_letters() {
        let engine = LedgerEngine::open(MemoryStore::new());
        let csv = "change_type,account,amount,reason,transaction_id,trace_id,source
SAVE,1,100,order reward,e1,tr-1,ORDER_REWARD
USE,1,30,checkout,e2,,ORDER_REWARD
CANCEL,1,30,order cancelled,e3,,ORDER_REFUND
SAVE,1,100,order reward,e1,tr-1,ORDER_REWARD
EXPIRE,1,5,yearly expiry,e4,,ORDER_REWARD
USE,1,1000,too much,e5,,ORDER_REWARD
";

        let summary = EventConsumer::new(&engine)
            .consume_csv(Cursor::new(csv))
            .unwrap();

        assert_eq!(summary.accepted, 3);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.dead_letters.len(), 2);
        assert_eq!(summary.dead_letters[0].row, 6);
        assert_eq!(
            summary.dead_letters[0].error,
            EventError::UnsupportedChangeType("EXPIRE".to_string())
        );
        assert_eq!(summary.dead_letters[1].transaction_id.as_deref(), Some("e5"));
        assert!(matches!(
            summary.dead_letters[1].error,
            EventError::Rejected(Rejection::InsufficientBalance { .. })
        ));

        assert_eq!(engine.get_balance(AccountId(1)).unwrap(), Points::whole(100));
        let history = engine.get_history(AccountId(1)).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].description, "[CANCEL] order cancelled");
    }
}
