use serde::{Deserialize, Serialize};

use super::{Account, Entry, Transfer};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFilter {
    pub owner: Option<String>,
}

impl AccountFilter {
    pub fn matches(&self, account: &Account) -> bool {
        self.owner.as_deref().map_or(true, |owner| account.owner == owner)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFilter {
    pub account_id: Option<i64>,
    pub transfer_id: Option<i64>,
}

impl EntryFilter {
    pub fn account(account_id: i64) -> Self {
        Self { account_id: Some(account_id), transfer_id: None }
    }

    pub fn transfer(transfer_id: i64) -> Self {
        Self { account_id: None, transfer_id: Some(transfer_id) }
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        self.account_id.map_or(true, |id| entry.account_id == id)
            && self.transfer_id.map_or(true, |id| entry.transfer_id == Some(id))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferFilter {
    #[default]
    All,
    /// Transfers whose source is the account.
    Outbound(i64),
    /// Transfers whose destination is the account.
    Inbound(i64),
}

impl TransferFilter {
    pub fn matches(&self, transfer: &Transfer) -> bool {
        match self {
            TransferFilter::All => true,
            TransferFilter::Outbound(id) => transfer.source_account_id == *id,
            TransferFilter::Inbound(id) => transfer.destination_account_id == *id,
        }
    }
}
