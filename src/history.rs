//! History entries: the immutable audit record of every accepted mutation.

use crate::account::AccountId;
use crate::points::Points;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Description prefix marking a compensation that restores a prior debit.
pub const CANCEL_PREFIX: &str = "[CANCEL] ";

/// Description prefix marking an administrative adjustment.
pub const ADJUST_PREFIX: &str = "[ADJUST] ";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {what}: {value:?}")]
pub struct UnknownVariant {
    what: &'static str,
    value: String,
}

/// The kind of balance change a history row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    /// Credit.
    Save,
    /// Debit.
    Use,
    /// Compensation of a prior debit. Credited like `Save`.
    Cancel,
    /// Debit leg of an account-to-account transfer.
    Transfer,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Save => "SAVE",
            ChangeKind::Use => "USE",
            ChangeKind::Cancel => "CANCEL",
            ChangeKind::Transfer => "TRANSFER",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = UnknownVariant;

    /// Case-insensitive, surrounding whitespace ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "SAVE" => Ok(ChangeKind::Save),
            "USE" => Ok(ChangeKind::Use),
            "CANCEL" => Ok(ChangeKind::Cancel),
            "TRANSFER" => Ok(ChangeKind::Transfer),
            _ => Err(UnknownVariant {
                what: "change kind",
                value: s.to_string(),
            }),
        }
    }
}

/// The service or surface a mutation originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Source {
    MemberTransfer,
    MemberAdjust,
    OrderReward,
    OrderRefund,
    DeliveryCompensation,
}

impl Source {
    const ALL: [Source; 5] = [
        Source::MemberTransfer,
        Source::MemberAdjust,
        Source::OrderReward,
        Source::OrderRefund,
        Source::DeliveryCompensation,
    ];

    /// Enum-style name, as stored.
    pub fn name(&self) -> &'static str {
        match self {
            Source::MemberTransfer => "MEMBER_TRANSFER",
            Source::MemberAdjust => "MEMBER_ADJUST",
            Source::OrderReward => "ORDER_REWARD",
            Source::OrderRefund => "ORDER_REFUND",
            Source::DeliveryCompensation => "DELIVERY_COMPENSATION",
        }
    }

    /// `service:operation` form used by the publishing services.
    pub fn service(&self) -> &'static str {
        match self {
            Source::MemberTransfer => "api-member-service:transfer",
            Source::MemberAdjust => "api-member-service:adjust",
            Source::OrderReward => "order-payment-service:reward",
            Source::OrderRefund => "order-payment-service:refund",
            Source::DeliveryCompensation => "delivery-service:compensation",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Source {
    type Err = UnknownVariant;

    /// Accepts either the enum name or the service value.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Source::ALL
            .into_iter()
            .find(|source| {
                source.name().eq_ignore_ascii_case(trimmed) || source.service() == trimmed
            })
            .ok_or_else(|| UnknownVariant {
                what: "source",
                value: s.to_string(),
            })
    }
}

/// A history row before the store has assigned its id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHistoryEntry {
    pub account: AccountId,
    pub kind: ChangeKind,
    pub amount: Points,
    pub description: String,
    pub transaction_id: String,
    pub trace_id: Option<String>,
    pub source: Source,
}

impl NewHistoryEntry {
    /// Stamps the entry with its store-assigned id and creation time.
    pub fn recorded(self, id: u64, created_at: DateTime<Utc>) -> HistoryEntry {
        HistoryEntry {
            id,
            account: self.account,
            kind: self.kind,
            amount: self.amount,
            description: self.description,
            created_at,
            transaction_id: self.transaction_id,
            trace_id: self.trace_id,
            source: self.source,
        }
    }
}

/// An accepted mutation. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub id: u64,
    pub account: AccountId,
    pub kind: ChangeKind,
    pub amount: Points,
    pub description: String,
    pub created_at: DateTime<Utc>,
    /// Globally unique; the idempotency key.
    pub transaction_id: String,
    pub trace_id: Option<String>,
    pub source: Source,
}

/// Orders entries newest first; ties on `created_at` fall back to insertion order.
pub fn newest_first(entries: &mut [HistoryEntry]) {
    entries.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}
