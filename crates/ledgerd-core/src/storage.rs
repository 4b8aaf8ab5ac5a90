use crate::models::{
    read::{AccountFilter, EntryFilter, TransferFilter},
    write::{AccountUpdate, NewAccount, NewEntry, NewTransfer},
    Account, EntityKind, Entry, Page, Transfer,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: i64 },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("{0}")]
    Other(String),
    #[error("no active transaction")]
    NoActiveTransaction,
    #[error("{cause}; rollback failed: {rollback}")]
    RollbackFailed {
        cause: Box<StorageError>,
        rollback: Box<StorageError>,
    },
}

impl StorageError {
    pub fn not_found(kind: EntityKind, id: i64) -> Self {
        StorageError::NotFound { kind, id }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::NotFound { .. } => true,
            StorageError::RollbackFailed { cause, .. } => cause.is_not_found(),
            _ => false,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        match self {
            StorageError::Unavailable(_) => true,
            StorageError::RollbackFailed { cause, .. } => cause.is_unavailable(),
            _ => false,
        }
    }
}

pub type TransactionId = u64;

/// Every read and write a unit of work can perform. All ids are opaque
/// integers assigned by the store; lists are ordered by ascending id.
pub trait LedgerOps {
    fn get_account(&mut self, id: i64) -> Result<Account, StorageError>;
    fn create_account(&mut self, account: &NewAccount) -> Result<Account, StorageError>;
    fn update_account(&mut self, id: i64, update: &AccountUpdate) -> Result<Account, StorageError>;
    /// `balance += delta`, holding the account row until the unit of work ends.
    fn add_account_balance(&mut self, id: i64, delta: i64) -> Result<Account, StorageError>;
    fn delete_account(&mut self, id: i64) -> Result<(), StorageError>;
    fn list_accounts(&mut self, filter: &AccountFilter, page: Page) -> Result<Vec<Account>, StorageError>;

    fn get_entry(&mut self, id: i64) -> Result<Entry, StorageError>;
    fn create_entry(&mut self, entry: &NewEntry) -> Result<Entry, StorageError>;
    fn update_entry(&mut self, id: i64, amount: i64) -> Result<Entry, StorageError>;
    fn delete_entry(&mut self, id: i64) -> Result<(), StorageError>;
    fn list_entries(&mut self, filter: &EntryFilter, page: Page) -> Result<Vec<Entry>, StorageError>;

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StorageError>;
    fn create_transfer(&mut self, transfer: &NewTransfer) -> Result<Transfer, StorageError>;
    fn update_transfer(&mut self, id: i64, amount: i64) -> Result<Transfer, StorageError>;
    fn delete_transfer(&mut self, id: i64) -> Result<(), StorageError>;
    fn list_transfers(&mut self, filter: &TransferFilter, page: Page) -> Result<Vec<Transfer>, StorageError>;
}

/// An open unit of work. Dropping a scope that was neither committed nor
/// rolled back rolls it back.
pub trait TransactionScope: LedgerOps {
    fn id(&self) -> TransactionId;
    fn ops(&mut self) -> &mut dyn LedgerOps;
    fn commit(self: Box<Self>) -> Result<(), StorageError>;
    fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn begin(&self) -> Result<Box<dyn TransactionScope + '_>, StorageError>;
}

/// Errors a unit of work may fail with. A failed rollback must be folded
/// into the original error, never dropped.
pub trait AtomicError: From<StorageError> {
    fn with_rollback_failure(self, rollback: StorageError) -> Self;
}

impl AtomicError for StorageError {
    fn with_rollback_failure(self, rollback: StorageError) -> Self {
        StorageError::RollbackFailed {
            cause: Box::new(self),
            rollback: Box::new(rollback),
        }
    }
}

/// Runs `work` as one all-or-nothing unit against `backend`.
///
/// Commits when `work` returns `Ok`, rolls back when it returns `Err`. A
/// panic inside `work` unwinds through the scope's `Drop`, which rolls back.
pub fn run_atomic<T, E, F>(backend: &dyn StorageBackend, work: F) -> Result<T, E>
where
    E: AtomicError,
    F: FnOnce(&mut dyn LedgerOps) -> Result<T, E>,
{
    let mut scope = backend.begin()?;
    let tx_id = scope.id();

    match work(scope.ops()) {
        Ok(value) => {
            scope.commit()?;
            Ok(value)
        }
        Err(err) => match scope.rollback() {
            Ok(()) => Err(err),
            Err(rollback) => {
                tracing::error!(tx_id, backend = backend.name(), error = %rollback, "Rollback failed");
                Err(err.with_rollback_failure(rollback))
            }
        },
    }
}
