use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::Duration,
};

use time::OffsetDateTime;

use ledgerd_core::{
    Account, AccountFilter, AccountUpdate, EntityKind, Entry, EntryFilter, LedgerOps, NewAccount,
    NewEntry, NewTransfer, Page, StorageBackend, StorageError, Transfer, TransactionId,
    TransactionScope, TransferFilter,
};

use crate::locks::{RowKey, RowLocks};

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
}

pub struct InMemoryStorage {
    tables: RwLock<Tables>,
    locks: RowLocks,
    account_seq: AtomicI64,
    entry_seq: AtomicI64,
    transfer_seq: AtomicI64,
    tx_counter: AtomicU64,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_lock_timeout(None)
    }

    /// A store whose row-lock waits give up after `timeout`.
    pub fn with_lock_timeout(timeout: Option<Duration>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            locks: RowLocks::new(timeout),
            account_seq: AtomicI64::new(1),
            entry_seq: AtomicI64::new(1),
            transfer_seq: AtomicI64::new(1),
            tx_counter: AtomicU64::new(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StorageBackend for InMemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn begin(&self) -> Result<Box<dyn TransactionScope + '_>, StorageError> {
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, "Transaction started");
        Ok(Box::new(MemoryScope {
            storage: self,
            tx_id,
            pending: Tables::default(),
            deleted: HashSet::new(),
            held: Vec::new(),
            finished: false,
        }))
    }
}

/// One open unit of work: buffered writes plus the row locks it holds.
pub struct MemoryScope<'a> {
    storage: &'a InMemoryStorage,
    tx_id: TransactionId,
    pending: Tables,
    deleted: HashSet<RowKey>,
    held: Vec<RowKey>,
    finished: bool,
}

impl<'a> MemoryScope<'a> {
    fn lock_row(&mut self, kind: EntityKind, id: i64) -> Result<(), StorageError> {
        if self.storage.locks.acquire((kind, id), self.tx_id)? {
            self.held.push((kind, id));
        }
        Ok(())
    }

    fn release(&mut self) {
        self.storage.locks.release_all(self.tx_id, &self.held);
        self.held.clear();
        self.pending = Tables::default();
        self.deleted.clear();
        self.finished = true;
    }

    fn visible_account(&self, id: i64) -> Option<Account> {
        if self.deleted.contains(&(EntityKind::Account, id)) {
            return None;
        }
        self.pending.accounts.get(&id).cloned()
            .or_else(|| self.storage.read().accounts.get(&id).cloned())
    }

    fn visible_entry(&self, id: i64) -> Option<Entry> {
        if self.deleted.contains(&(EntityKind::Entry, id)) {
            return None;
        }
        self.pending.entries.get(&id).cloned()
            .or_else(|| self.storage.read().entries.get(&id).cloned())
    }

    fn visible_transfer(&self, id: i64) -> Option<Transfer> {
        if self.deleted.contains(&(EntityKind::Transfer, id)) {
            return None;
        }
        self.pending.transfers.get(&id).cloned()
            .or_else(|| self.storage.read().transfers.get(&id).cloned())
    }

    fn visible_entries(&self) -> BTreeMap<i64, Entry> {
        merge(&self.storage.read().entries, &self.pending.entries, &self.deleted, EntityKind::Entry)
    }

    fn visible_accounts(&self) -> BTreeMap<i64, Account> {
        merge(&self.storage.read().accounts, &self.pending.accounts, &self.deleted, EntityKind::Account)
    }

    /// One account per (owner, currency).
    fn require_unique_owner(&self, owner: &str, currency: &str, id: Option<i64>) -> Result<(), StorageError> {
        let taken = self.visible_accounts().values()
            .any(|a| Some(a.id) != id && a.owner == owner && a.currency == currency);
        if taken {
            return Err(duplicate_owner(owner, currency));
        }
        Ok(())
    }

    fn visible_transfers(&self) -> BTreeMap<i64, Transfer> {
        merge(&self.storage.read().transfers, &self.pending.transfers, &self.deleted, EntityKind::Transfer)
    }

    fn require_account(&self, id: i64) -> Result<Account, StorageError> {
        self.visible_account(id)
            .ok_or_else(|| StorageError::not_found(EntityKind::Account, id))
    }

    /// Foreign keys of buffered rows may have been invalidated by units of
    /// work that committed after they were checked.
    fn validate(&self, committed: &Tables) -> Result<(), StorageError> {
        let account_exists = |id: i64| {
            !self.deleted.contains(&(EntityKind::Account, id))
                && (self.pending.accounts.contains_key(&id) || committed.accounts.contains_key(&id))
        };
        let transfer_exists = |id: i64| {
            !self.deleted.contains(&(EntityKind::Transfer, id))
                && (self.pending.transfers.contains_key(&id) || committed.transfers.contains_key(&id))
        };

        for account in self.pending.accounts.values() {
            let taken = committed.accounts.values().any(|other| {
                other.id != account.id
                    && !self.deleted.contains(&(EntityKind::Account, other.id))
                    && !self.pending.accounts.contains_key(&other.id)
                    && other.owner == account.owner
                    && other.currency == account.currency
            });
            if taken {
                return Err(duplicate_owner(&account.owner, &account.currency));
            }
        }

        for entry in self.pending.entries.values() {
            if !account_exists(entry.account_id) {
                return Err(StorageError::not_found(EntityKind::Account, entry.account_id));
            }
            if let Some(transfer_id) = entry.transfer_id {
                if !transfer_exists(transfer_id) {
                    return Err(StorageError::not_found(EntityKind::Transfer, transfer_id));
                }
            }
        }
        for transfer in self.pending.transfers.values() {
            for id in [transfer.source_account_id, transfer.destination_account_id] {
                if !account_exists(id) {
                    return Err(StorageError::not_found(EntityKind::Account, id));
                }
            }
        }

        for (kind, id) in &self.deleted {
            if *kind != EntityKind::Account {
                continue;
            }
            let referenced = committed.entries.values()
                .filter(|e| !self.deleted.contains(&(EntityKind::Entry, e.id)))
                .any(|e| e.account_id == *id)
                || committed.transfers.values()
                    .filter(|t| !self.deleted.contains(&(EntityKind::Transfer, t.id)))
                    .any(|t| t.source_account_id == *id || t.destination_account_id == *id);
            if referenced {
                return Err(StorageError::Constraint(format!("account {} is still referenced", id)));
            }
        }

        Ok(())
    }
}

fn duplicate_owner(owner: &str, currency: &str) -> StorageError {
    StorageError::Constraint(format!("{} already has a {} account", owner, currency))
}

fn merge<T: Clone>(
    committed: &BTreeMap<i64, T>,
    pending: &BTreeMap<i64, T>,
    deleted: &HashSet<RowKey>,
    kind: EntityKind,
) -> BTreeMap<i64, T> {
    let mut rows: BTreeMap<i64, T> = committed.iter()
        .filter(|(id, _)| !deleted.contains(&(kind, **id)))
        .map(|(id, row)| (*id, row.clone()))
        .collect();
    for (id, row) in pending {
        rows.insert(*id, row.clone());
    }
    rows
}

impl<'a> LedgerOps for MemoryScope<'a> {
    fn get_account(&mut self, id: i64) -> Result<Account, StorageError> {
        self.require_account(id)
    }

    fn create_account(&mut self, account: &NewAccount) -> Result<Account, StorageError> {
        self.require_unique_owner(&account.owner, &account.currency, None)?;
        let account = Account {
            id: self.storage.account_seq.fetch_add(1, Ordering::SeqCst),
            owner: account.owner.clone(),
            balance: 0,
            currency: account.currency.clone(),
            created_at: OffsetDateTime::now_utc(),
        };
        self.pending.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    fn update_account(&mut self, id: i64, update: &AccountUpdate) -> Result<Account, StorageError> {
        self.lock_row(EntityKind::Account, id)?;
        let mut account = self.require_account(id)?;
        self.require_unique_owner(&update.owner, &update.currency, Some(id))?;
        account.owner = update.owner.clone();
        account.balance = update.balance;
        account.currency = update.currency.clone();
        self.pending.accounts.insert(id, account.clone());
        Ok(account)
    }

    fn add_account_balance(&mut self, id: i64, delta: i64) -> Result<Account, StorageError> {
        self.lock_row(EntityKind::Account, id)?;
        let mut account = self.require_account(id)?;
        account.balance = account.balance.checked_add(delta)
            .ok_or_else(|| StorageError::Constraint(format!("balance of account {} out of range", id)))?;
        self.pending.accounts.insert(id, account.clone());
        Ok(account)
    }

    fn delete_account(&mut self, id: i64) -> Result<(), StorageError> {
        self.lock_row(EntityKind::Account, id)?;
        self.require_account(id)?;
        let referenced = self.visible_entries().values().any(|e| e.account_id == id)
            || self.visible_transfers().values()
                .any(|t| t.source_account_id == id || t.destination_account_id == id);
        if referenced {
            return Err(StorageError::Constraint(format!("account {} is still referenced", id)));
        }
        self.pending.accounts.remove(&id);
        self.deleted.insert((EntityKind::Account, id));
        Ok(())
    }

    fn list_accounts(&mut self, filter: &AccountFilter, page: Page) -> Result<Vec<Account>, StorageError> {
        Ok(page.apply(self.visible_accounts().into_values().filter(|a| filter.matches(a))))
    }

    fn get_entry(&mut self, id: i64) -> Result<Entry, StorageError> {
        self.visible_entry(id)
            .ok_or_else(|| StorageError::not_found(EntityKind::Entry, id))
    }

    fn create_entry(&mut self, entry: &NewEntry) -> Result<Entry, StorageError> {
        self.require_account(entry.account_id)?;
        if let Some(transfer_id) = entry.transfer_id {
            self.visible_transfer(transfer_id)
                .ok_or_else(|| StorageError::not_found(EntityKind::Transfer, transfer_id))?;
        }
        let entry = Entry {
            id: self.storage.entry_seq.fetch_add(1, Ordering::SeqCst),
            account_id: entry.account_id,
            transfer_id: entry.transfer_id,
            amount: entry.amount,
            created_at: OffsetDateTime::now_utc(),
        };
        self.pending.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    fn update_entry(&mut self, id: i64, amount: i64) -> Result<Entry, StorageError> {
        self.lock_row(EntityKind::Entry, id)?;
        let mut entry = self.get_entry(id)?;
        entry.amount = amount;
        self.pending.entries.insert(id, entry.clone());
        Ok(entry)
    }

    fn delete_entry(&mut self, id: i64) -> Result<(), StorageError> {
        self.lock_row(EntityKind::Entry, id)?;
        self.get_entry(id)?;
        self.pending.entries.remove(&id);
        self.deleted.insert((EntityKind::Entry, id));
        Ok(())
    }

    fn list_entries(&mut self, filter: &EntryFilter, page: Page) -> Result<Vec<Entry>, StorageError> {
        Ok(page.apply(self.visible_entries().into_values().filter(|e| filter.matches(e))))
    }

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StorageError> {
        self.visible_transfer(id)
            .ok_or_else(|| StorageError::not_found(EntityKind::Transfer, id))
    }

    fn create_transfer(&mut self, transfer: &NewTransfer) -> Result<Transfer, StorageError> {
        self.require_account(transfer.source_account_id)?;
        self.require_account(transfer.destination_account_id)?;
        let transfer = Transfer {
            id: self.storage.transfer_seq.fetch_add(1, Ordering::SeqCst),
            source_account_id: transfer.source_account_id,
            destination_account_id: transfer.destination_account_id,
            amount: transfer.amount,
            created_at: OffsetDateTime::now_utc(),
        };
        self.pending.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    fn update_transfer(&mut self, id: i64, amount: i64) -> Result<Transfer, StorageError> {
        self.lock_row(EntityKind::Transfer, id)?;
        let mut transfer = self.get_transfer(id)?;
        transfer.amount = amount;
        self.pending.transfers.insert(id, transfer.clone());
        Ok(transfer)
    }

    fn delete_transfer(&mut self, id: i64) -> Result<(), StorageError> {
        self.lock_row(EntityKind::Transfer, id)?;
        self.get_transfer(id)?;

        let linked: Vec<i64> = self.visible_entries().values()
            .filter(|e| e.transfer_id == Some(id))
            .map(|e| e.id)
            .collect();
        for entry_id in linked {
            self.lock_row(EntityKind::Entry, entry_id)?;
            if let Some(mut entry) = self.visible_entry(entry_id) {
                entry.transfer_id = None;
                self.pending.entries.insert(entry_id, entry);
            }
        }

        self.pending.transfers.remove(&id);
        self.deleted.insert((EntityKind::Transfer, id));
        Ok(())
    }

    fn list_transfers(&mut self, filter: &TransferFilter, page: Page) -> Result<Vec<Transfer>, StorageError> {
        Ok(page.apply(self.visible_transfers().into_values().filter(|t| filter.matches(t))))
    }
}

impl<'a> TransactionScope for MemoryScope<'a> {
    fn id(&self) -> TransactionId {
        self.tx_id
    }

    fn ops(&mut self) -> &mut dyn LedgerOps {
        self
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        let storage = self.storage;
        let mut tables = storage.write();

        if let Err(e) = self.validate(&tables) {
            drop(tables);
            self.release();
            tracing::debug!(tx_id = self.tx_id, error = %e, "Commit rejected, transaction rolled back");
            return Err(e);
        }

        for (kind, id) in &self.deleted {
            match kind {
                EntityKind::Account => {
                    tables.accounts.remove(id);
                }
                EntityKind::Entry => {
                    tables.entries.remove(id);
                }
                EntityKind::Transfer => {
                    tables.transfers.remove(id);
                    for entry in tables.entries.values_mut() {
                        if entry.transfer_id == Some(*id) {
                            entry.transfer_id = None;
                        }
                    }
                }
            }
        }

        let pending = std::mem::take(&mut self.pending);
        tables.accounts.extend(pending.accounts);
        tables.entries.extend(pending.entries);
        tables.transfers.extend(pending.transfers);
        drop(tables);

        self.release();
        tracing::debug!(tx_id = self.tx_id, "Transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.release();
        tracing::debug!(tx_id = self.tx_id, "Transaction rolled back");
        Ok(())
    }
}

impl<'a> Drop for MemoryScope<'a> {
    fn drop(&mut self) {
        if !self.finished {
            self.release();
            tracing::debug!(tx_id = self.tx_id, "Unfinished transaction rolled back");
        }
    }
}
