use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ledgerd_core::{
    run_atomic, Account, AtomicError, Entry, LedgerOps, NewEntry, NewTransfer, StorageBackend, StorageError, Transfer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub source_account_id: i64,
    pub destination_account_id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer: Transfer,
    pub source_account: Account,
    pub destination_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("transfer cancelled")]
    Cancelled,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{cause}; rollback failed: {rollback}")]
    RollbackFailed {
        cause: Box<TransferError>,
        rollback: StorageError,
    },
}

impl TransferError {
    pub fn is_not_found(&self) -> bool {
        match self {
            TransferError::Storage(e) => e.is_not_found(),
            TransferError::RollbackFailed { cause, .. } => cause.is_not_found(),
            _ => false,
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            TransferError::InvalidArgument(_) => "invalid",
            TransferError::Cancelled => "cancelled",
            e if e.is_not_found() => "not_found",
            TransferError::RollbackFailed { .. } => "rollback_failed",
            TransferError::Storage(_) => "error",
        }
    }
}

impl AtomicError for TransferError {
    fn with_rollback_failure(self, rollback: StorageError) -> Self {
        TransferError::RollbackFailed {
            cause: Box::new(self),
            rollback,
        }
    }
}

/// Raised by whoever gave up on a transfer. Checked between the steps of the
/// unit of work and once more before commit.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), TransferError> {
        if self.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }
}

/// Moves money between two accounts as one atomic unit: a transfer row, a
/// debit and a credit entry, and both balance increments.
pub struct TransferExecutor {
    backend: Arc<dyn StorageBackend>,
}

impl TransferExecutor {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn execute(&self, request: &TransferRequest) -> Result<TransferResult, TransferError> {
        self.execute_cancellable(request, &CancelFlag::new())
    }

    pub fn execute_cancellable(
        &self,
        request: &TransferRequest,
        cancel: &CancelFlag,
    ) -> Result<TransferResult, TransferError> {
        let span = tracing::info_span!(
            "transfer",
            source = request.source_account_id,
            destination = request.destination_account_id,
            amount = request.amount,
        );
        let _enter = span.enter();
        let started = Instant::now();

        let result = validate(request)
            .and_then(|()| run_atomic(self.backend.as_ref(), |ops| transfer_tx(ops, request, cancel)));

        let outcome = match &result {
            Ok(res) => {
                tracing::info!(transfer_id = res.transfer.id, "Transfer committed");
                "ok"
            }
            Err(e) => {
                let outcome = e.outcome();
                match e {
                    TransferError::Storage(StorageError::Unavailable(_)) | TransferError::RollbackFailed { .. } => {
                        tracing::error!(error = %e, "Transfer failed")
                    }
                    _ => tracing::warn!(error = %e, "Transfer rejected"),
                }
                outcome
            }
        };
        metrics::counter!("ledgerd_transfers_total", 1, "outcome" => outcome);
        metrics::histogram!("ledgerd_transfer_duration_seconds", started.elapsed().as_secs_f64());

        result
    }
}

fn validate(request: &TransferRequest) -> Result<(), TransferError> {
    if request.amount <= 0 {
        return Err(TransferError::InvalidArgument(format!(
            "amount must be positive, got {}",
            request.amount
        )));
    }
    if request.source_account_id == request.destination_account_id {
        return Err(TransferError::InvalidArgument(format!(
            "source and destination are the same account ({})",
            request.source_account_id
        )));
    }
    Ok(())
}

fn transfer_tx(
    ops: &mut dyn LedgerOps,
    request: &TransferRequest,
    cancel: &CancelFlag,
) -> Result<TransferResult, TransferError> {
    let TransferRequest { source_account_id, destination_account_id, amount } = *request;

    cancel.check()?;
    require_same_currency(ops, source_account_id, destination_account_id)?;

    cancel.check()?;
    let transfer = ops.create_transfer(&NewTransfer { source_account_id, destination_account_id, amount })?;

    cancel.check()?;
    let from_entry = ops.create_entry(&NewEntry {
        account_id: source_account_id,
        amount: -amount,
        transfer_id: Some(transfer.id),
    })?;

    cancel.check()?;
    let to_entry = ops.create_entry(&NewEntry {
        account_id: destination_account_id,
        amount,
        transfer_id: Some(transfer.id),
    })?;

    // Lower account id is always locked first so two transfers over the same
    // pair can never wait on each other in a cycle.
    cancel.check()?;
    let (source_account, destination_account) = if source_account_id < destination_account_id {
        let source = ops.add_account_balance(source_account_id, -amount)?;
        cancel.check()?;
        let destination = ops.add_account_balance(destination_account_id, amount)?;
        (source, destination)
    } else {
        let destination = ops.add_account_balance(destination_account_id, amount)?;
        cancel.check()?;
        let source = ops.add_account_balance(source_account_id, -amount)?;
        (source, destination)
    };

    cancel.check()?;
    Ok(TransferResult {
        transfer,
        source_account,
        destination_account,
        from_entry,
        to_entry,
    })
}

/// Reads both accounts without locking them; a missing one is `NotFound`.
fn require_same_currency(ops: &mut dyn LedgerOps, source_id: i64, destination_id: i64) -> Result<(), TransferError> {
    let source = ops.get_account(source_id)?;
    let destination = ops.get_account(destination_id)?;
    if source.currency != destination.currency {
        return Err(TransferError::InvalidArgument(format!(
            "currency mismatch: account {} holds {}, account {} holds {}",
            source.id, source.currency, destination.id, destination.currency
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_core::{
        AccountFilter, AccountUpdate, EntryFilter, NewAccount, Page, TransactionId, TransactionScope,
        TransferFilter,
    };
    use ledgerd_memory::InMemoryStorage;
    use std::sync::atomic::AtomicUsize;

    fn seed(backend: &dyn StorageBackend, balances: &[i64]) -> Vec<Account> {
        run_atomic(backend, |s| {
            balances
                .iter()
                .enumerate()
                .map(|(i, balance)| {
                    let account = s.create_account(&NewAccount {
                        owner: format!("owner-{}", i),
                        currency: "USD".to_string(),
                    })?;
                    s.add_account_balance(account.id, *balance)
                })
                .collect::<Result<Vec<_>, StorageError>>()
        })
        .unwrap()
    }

    fn all_entries(backend: &dyn StorageBackend) -> Vec<Entry> {
        run_atomic(backend, |s| s.list_entries(&EntryFilter::default(), Page::all())).unwrap()
    }

    fn all_transfers(backend: &dyn StorageBackend) -> Vec<Transfer> {
        run_atomic(backend, |s| s.list_transfers(&TransferFilter::All, Page::all())).unwrap()
    }

    /// Wraps a backend, counting `begin` calls and optionally failing every
    /// rollback after performing it. `cancel_after_entry` is raised once an
    /// entry has been written, mimicking a caller that gives up mid-flight.
    struct Instrumented {
        inner: InMemoryStorage,
        begins: AtomicUsize,
        unavailable: bool,
        fail_rollback: bool,
        cancel_after_entry: Option<CancelFlag>,
    }

    impl Instrumented {
        fn new() -> Self {
            Self {
                inner: InMemoryStorage::new(),
                begins: AtomicUsize::new(0),
                unavailable: false,
                fail_rollback: false,
                cancel_after_entry: None,
            }
        }
    }

    struct InstrumentedScope<'a> {
        inner: Box<dyn TransactionScope + 'a>,
        fail_rollback: bool,
        cancel_after_entry: Option<CancelFlag>,
    }

    impl StorageBackend for Instrumented {
        fn name(&self) -> &'static str {
            "instrumented"
        }

        fn begin(&self) -> Result<Box<dyn TransactionScope + '_>, StorageError> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            if self.unavailable {
                return Err(StorageError::Unavailable("connection refused".to_string()));
            }
            Ok(Box::new(InstrumentedScope {
                inner: self.inner.begin()?,
                fail_rollback: self.fail_rollback,
                cancel_after_entry: self.cancel_after_entry.clone(),
            }))
        }
    }

    macro_rules! delegate {
        ($($name:ident($($arg:ident: $ty:ty),*) -> $ret:ty;)*) => {
            $(fn $name(&mut self, $($arg: $ty),*) -> Result<$ret, StorageError> {
                self.inner.$name($($arg),*)
            })*
        };
    }

    impl<'a> LedgerOps for InstrumentedScope<'a> {
        delegate! {
            get_account(id: i64) -> Account;
            create_account(account: &NewAccount) -> Account;
            update_account(id: i64, update: &AccountUpdate) -> Account;
            add_account_balance(id: i64, delta: i64) -> Account;
            delete_account(id: i64) -> ();
            list_accounts(filter: &AccountFilter, page: Page) -> Vec<Account>;
            get_entry(id: i64) -> Entry;
            update_entry(id: i64, amount: i64) -> Entry;
            delete_entry(id: i64) -> ();
            list_entries(filter: &EntryFilter, page: Page) -> Vec<Entry>;
            get_transfer(id: i64) -> Transfer;
            create_transfer(transfer: &NewTransfer) -> Transfer;
            update_transfer(id: i64, amount: i64) -> Transfer;
            delete_transfer(id: i64) -> ();
            list_transfers(filter: &TransferFilter, page: Page) -> Vec<Transfer>;
        }

        fn create_entry(&mut self, entry: &NewEntry) -> Result<Entry, StorageError> {
            let entry = self.inner.create_entry(entry)?;
            if let Some(cancel) = &self.cancel_after_entry {
                cancel.cancel();
            }
            Ok(entry)
        }
    }

    impl<'a> TransactionScope for InstrumentedScope<'a> {
        fn id(&self) -> TransactionId {
            self.inner.id()
        }

        fn ops(&mut self) -> &mut dyn LedgerOps {
            self
        }

        fn commit(self: Box<Self>) -> Result<(), StorageError> {
            self.inner.commit()
        }

        fn rollback(self: Box<Self>) -> Result<(), StorageError> {
            let fail = self.fail_rollback;
            self.inner.rollback()?;
            if fail {
                return Err(StorageError::Unavailable("connection lost during rollback".to_string()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_transfer_moves_funds() {
        let backend = InMemoryStorage::new();
        let accounts = seed(&backend, &[100, 50]);
        let executor = TransferExecutor::new(Arc::new(backend));

        let result = executor
            .execute(&TransferRequest {
                source_account_id: accounts[0].id,
                destination_account_id: accounts[1].id,
                amount: 30,
            })
            .unwrap();

        assert_eq!(result.transfer.amount, 30);
        assert_eq!(result.source_account.id, accounts[0].id);
        assert_eq!(result.source_account.balance, 70);
        assert_eq!(result.destination_account.id, accounts[1].id);
        assert_eq!(result.destination_account.balance, 80);
        assert_eq!(result.from_entry.amount, -30);
        assert_eq!(result.from_entry.account_id, accounts[0].id);
        assert_eq!(result.to_entry.amount, 30);
        assert_eq!(result.to_entry.account_id, accounts[1].id);
        assert_eq!(result.from_entry.transfer_id, Some(result.transfer.id));
        assert_eq!(result.to_entry.transfer_id, Some(result.transfer.id));
    }

    #[test]
    fn test_roles_survive_descending_lock_order() {
        let backend = InMemoryStorage::new();
        let accounts = seed(&backend, &[100, 50]);
        let executor = TransferExecutor::new(Arc::new(backend));

        // Destination has the lower id, so it is updated first.
        let result = executor
            .execute(&TransferRequest {
                source_account_id: accounts[1].id,
                destination_account_id: accounts[0].id,
                amount: 20,
            })
            .unwrap();

        assert_eq!(result.source_account.id, accounts[1].id);
        assert_eq!(result.source_account.balance, 30);
        assert_eq!(result.destination_account.id, accounts[0].id);
        assert_eq!(result.destination_account.balance, 120);
    }

    #[test]
    fn test_invalid_input_never_touches_storage() {
        let backend = Arc::new(Instrumented::new());
        let executor = TransferExecutor::new(backend.clone());

        for (source, destination, amount) in [(1, 2, 0), (1, 2, -5), (3, 3, 10)] {
            let err = executor
                .execute(&TransferRequest {
                    source_account_id: source,
                    destination_account_id: destination,
                    amount,
                })
                .unwrap_err();
            assert!(matches!(err, TransferError::InvalidArgument(_)), "got {:?}", err);
        }
        assert_eq!(backend.begins.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_destination_rolls_back() {
        let backend = Arc::new(InMemoryStorage::new());
        let accounts = seed(backend.as_ref(), &[100]);
        let executor = TransferExecutor::new(backend.clone());

        let err = executor
            .execute(&TransferRequest {
                source_account_id: accounts[0].id,
                destination_account_id: 9_999,
                amount: 10,
            })
            .unwrap_err();

        assert!(err.is_not_found());
        let source = run_atomic(backend.as_ref(), |s| s.get_account(accounts[0].id)).unwrap();
        assert_eq!(source.balance, 100);
        assert!(all_entries(backend.as_ref()).is_empty());
        assert!(all_transfers(backend.as_ref()).is_empty());
    }

    #[test]
    fn test_cancelled_transfer_leaves_no_trace() {
        let backend = Arc::new(InMemoryStorage::new());
        let accounts = seed(backend.as_ref(), &[100, 50]);
        let executor = TransferExecutor::new(backend.clone());

        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = executor
            .execute_cancellable(
                &TransferRequest {
                    source_account_id: accounts[0].id,
                    destination_account_id: accounts[1].id,
                    amount: 10,
                },
                &cancel,
            )
            .unwrap_err();

        assert!(matches!(err, TransferError::Cancelled));
        let balances = run_atomic(backend.as_ref(), |s| s.list_accounts(&AccountFilter::default(), Page::all()))
            .unwrap()
            .into_iter()
            .map(|a| a.balance)
            .collect::<Vec<_>>();
        assert_eq!(balances, vec![100, 50]);
        assert!(all_transfers(backend.as_ref()).is_empty());
    }

    #[test]
    fn test_cancel_after_writes_rolls_back_transfer_and_entries() {
        let cancel = CancelFlag::new();
        let mut backend = Instrumented::new();
        backend.cancel_after_entry = Some(cancel.clone());
        let backend = Arc::new(backend);
        let accounts = seed(&backend.inner, &[100, 50]);
        let executor = TransferExecutor::new(backend.clone());

        let err = executor
            .execute_cancellable(
                &TransferRequest {
                    source_account_id: accounts[0].id,
                    destination_account_id: accounts[1].id,
                    amount: 10,
                },
                &cancel,
            )
            .unwrap_err();

        assert!(matches!(err, TransferError::Cancelled), "got {:?}", err);
        assert!(cancel.is_cancelled());
        assert!(all_transfers(&backend.inner).is_empty(), "transfer row must be rolled back");
        assert!(all_entries(&backend.inner).is_empty(), "entry rows must be rolled back");
        let balances = run_atomic(&backend.inner, |s| s.list_accounts(&AccountFilter::default(), Page::all()))
            .unwrap()
            .into_iter()
            .map(|a| a.balance)
            .collect::<Vec<_>>();
        assert_eq!(balances, vec![100, 50]);
    }

    #[test]
    fn test_currency_mismatch_is_invalid_and_leaves_no_trace() {
        let backend = Arc::new(InMemoryStorage::new());
        let (dollars, euros) = run_atomic(backend.as_ref(), |s| {
            let dollars = s.create_account(&NewAccount { owner: "frank".to_string(), currency: "USD".to_string() })?;
            let euros = s.create_account(&NewAccount { owner: "frank".to_string(), currency: "EUR".to_string() })?;
            Ok::<_, StorageError>((s.add_account_balance(dollars.id, 100)?, euros))
        })
        .unwrap();
        let executor = TransferExecutor::new(backend.clone());

        let err = executor
            .execute(&TransferRequest {
                source_account_id: dollars.id,
                destination_account_id: euros.id,
                amount: 10,
            })
            .unwrap_err();

        match &err {
            TransferError::InvalidArgument(msg) => assert!(msg.contains("currency mismatch"), "got {}", msg),
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
        assert!(all_transfers(backend.as_ref()).is_empty());
        assert!(all_entries(backend.as_ref()).is_empty());
        assert_eq!(run_atomic(backend.as_ref(), |s| s.get_account(dollars.id)).unwrap().balance, 100);
    }

    #[test]
    fn test_unavailable_storage_is_surfaced_unchanged() {
        let mut backend = Instrumented::new();
        backend.unavailable = true;
        let executor = TransferExecutor::new(Arc::new(backend));

        let err = executor
            .execute(&TransferRequest {
                source_account_id: 1,
                destination_account_id: 2,
                amount: 10,
            })
            .unwrap_err();

        assert!(matches!(err, TransferError::Storage(StorageError::Unavailable(_))), "got {:?}", err);
    }

    #[test]
    fn test_rollback_failure_carries_both_errors() {
        let mut backend = Instrumented::new();
        backend.fail_rollback = true;
        let backend = Arc::new(backend);
        let accounts = seed(&backend.inner, &[100]);
        let executor = TransferExecutor::new(backend.clone());

        let err = executor
            .execute(&TransferRequest {
                source_account_id: accounts[0].id,
                destination_account_id: 4_242,
                amount: 10,
            })
            .unwrap_err();

        match &err {
            TransferError::RollbackFailed { cause, rollback } => {
                assert!(cause.is_not_found());
                assert!(rollback.is_unavailable());
            }
            other => panic!("expected RollbackFailed, got {:?}", other),
        }
        assert!(err.is_not_found());
        assert!(err.to_string().contains("rollback failed"));
    }
}
