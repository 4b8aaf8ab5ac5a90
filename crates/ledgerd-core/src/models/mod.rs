use std::fmt::Display;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod write;
pub mod read;

/// The three kinds of row a ledger store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Account,
    Entry,
    Transfer,
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EntityKind::Account => "account",
            EntityKind::Entry => "entry",
            EntityKind::Transfer => "transfer",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub owner: String,
    pub balance: i64,
    pub currency: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One signed balance change on one account. Negative amounts are debits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: i64,
    pub account_id: i64,
    /// Transfer that produced this entry, if any. Cleared when the transfer is deleted.
    pub transfer_id: Option<i64>,
    pub amount: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: i64,
    pub source_account_id: i64,
    pub destination_account_id: i64,
    /// Always positive when written by the transfer executor.
    pub amount: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Offset pagination window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub const DEFAULT_SIZE: i64 = 10;

    pub fn new(limit: i64, offset: i64) -> Self {
        Self { limit: limit.max(0), offset: offset.max(0) }
    }

    /// Page `number` (1-based) of `size` rows.
    pub fn number(number: i64, size: i64) -> Self {
        let size = size.max(0);
        Self::new(size, (number.max(1) - 1).saturating_mul(size))
    }

    /// Everything from the first row on.
    pub fn all() -> Self {
        Self { limit: i64::MAX, offset: 0 }
    }

    /// Applies the window to an already ordered iterator.
    pub fn apply<T>(&self, rows: impl Iterator<Item = T>) -> Vec<T> {
        rows.skip(usize::try_from(self.offset).unwrap_or(usize::MAX))
            .take(usize::try_from(self.limit).unwrap_or(usize::MAX))
            .collect()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::number(1, Self::DEFAULT_SIZE)
    }
}
