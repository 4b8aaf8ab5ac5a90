use std::sync::Arc;

use ledgerd_core::{
    run_atomic, Account, AccountFilter, AccountUpdate, AtomicError, Entry, EntryFilter, LedgerOps, NewAccount,
    NewEntry, NewTransfer, Page, StorageBackend, StorageError, Transfer, TransferFilter,
};
use ledgerd_memory::InMemoryStorage;
use ledgerd_postgres::PostgresStorage;
use ledgerd_sqlite::SqliteStorage;

use crate::config::{BackendKind, StorageConfig};

/// Opens the backend named by the configuration. May block on network I/O.
pub fn open_backend(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
    let backend: Arc<dyn StorageBackend> = match config.backend {
        BackendKind::Memory => Arc::new(InMemoryStorage::with_lock_timeout(config.lock_timeout())),
        BackendKind::Sqlite => Arc::new(SqliteStorage::new(&config.path)?),
        BackendKind::Postgres => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| StorageError::Other("storage.url is required for the postgres backend".to_string()))?;
            Arc::new(PostgresStorage::with_pool_size(url, config.pool_size)?)
        }
    };
    tracing::info!(backend = backend.name(), "Storage backend opened");
    Ok(backend)
}

/// Single-operation access to the ledger. Every call is its own unit of
/// work; use [`LedgerStore::atomic`] to group several.
#[derive(Clone)]
pub struct LedgerStore {
    backend: Arc<dyn StorageBackend>,
}

impl LedgerStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn atomic<T, E, F>(&self, work: F) -> Result<T, E>
    where
        E: AtomicError,
        F: FnOnce(&mut dyn LedgerOps) -> Result<T, E>,
    {
        run_atomic(self.backend.as_ref(), work)
    }

    pub fn get_account(&self, id: i64) -> Result<Account, StorageError> {
        self.atomic(|s| s.get_account(id))
    }

    pub fn create_account(&self, account: &NewAccount) -> Result<Account, StorageError> {
        self.atomic(|s| s.create_account(account))
    }

    pub fn update_account(&self, id: i64, update: &AccountUpdate) -> Result<Account, StorageError> {
        self.atomic(|s| s.update_account(id, update))
    }

    pub fn add_account_balance(&self, id: i64, delta: i64) -> Result<Account, StorageError> {
        self.atomic(|s| s.add_account_balance(id, delta))
    }

    pub fn delete_account(&self, id: i64) -> Result<(), StorageError> {
        self.atomic(|s| s.delete_account(id))
    }

    pub fn list_accounts(&self, filter: &AccountFilter, page: Page) -> Result<Vec<Account>, StorageError> {
        self.atomic(|s| s.list_accounts(filter, page))
    }

    pub fn get_entry(&self, id: i64) -> Result<Entry, StorageError> {
        self.atomic(|s| s.get_entry(id))
    }

    pub fn create_entry(&self, entry: &NewEntry) -> Result<Entry, StorageError> {
        self.atomic(|s| s.create_entry(entry))
    }

    pub fn update_entry(&self, id: i64, amount: i64) -> Result<Entry, StorageError> {
        self.atomic(|s| s.update_entry(id, amount))
    }

    pub fn delete_entry(&self, id: i64) -> Result<(), StorageError> {
        self.atomic(|s| s.delete_entry(id))
    }

    pub fn list_entries(&self, filter: &EntryFilter, page: Page) -> Result<Vec<Entry>, StorageError> {
        self.atomic(|s| s.list_entries(filter, page))
    }

    pub fn get_transfer(&self, id: i64) -> Result<Transfer, StorageError> {
        self.atomic(|s| s.get_transfer(id))
    }

    pub fn create_transfer(&self, transfer: &NewTransfer) -> Result<Transfer, StorageError> {
        self.atomic(|s| s.create_transfer(transfer))
    }

    pub fn update_transfer(&self, id: i64, amount: i64) -> Result<Transfer, StorageError> {
        self.atomic(|s| s.update_transfer(id, amount))
    }

    pub fn delete_transfer(&self, id: i64) -> Result<(), StorageError> {
        self.atomic(|s| s.delete_transfer(id))
    }

    pub fn list_transfers(&self, filter: &TransferFilter, page: Page) -> Result<Vec<Transfer>, StorageError> {
        self.atomic(|s| s.list_transfers(filter, page))
    }
}
