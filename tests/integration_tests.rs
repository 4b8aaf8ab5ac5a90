use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{SystemTime, UNIX_EPOCH},
};

use ledgerd::{CancelFlag, LedgerStore, TransferError, TransferExecutor, TransferRequest};
use ledgerd_core::{
    Account, EntityKind, EntryFilter, NewAccount, NewEntry, NewTransfer, Page, StorageBackend, StorageError,
    TransferFilter,
};
use ledgerd_memory::InMemoryStorage;
use ledgerd_postgres::PostgresStorage;
use ledgerd_sqlite::SqliteStorage;

fn memory() -> Arc<dyn StorageBackend> {
    Arc::new(InMemoryStorage::new())
}

fn sqlite() -> Arc<dyn StorageBackend> {
    Arc::new(SqliteStorage::new(":memory:").expect("Failed to open SQLite"))
}

fn postgres() -> Arc<dyn StorageBackend> {
    let url = std::env::var("LEDGERD_TEST_POSTGRES_URL").expect("LEDGERD_TEST_POSTGRES_URL is not set");
    Arc::new(PostgresStorage::with_pool_size(&url, 16).expect("Failed to connect to PostgreSQL"))
}

/// Owner names stay unique across tests and runs sharing one database.
fn unique_owner(owner: &str) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    format!("{}-{}-{}", owner, nanos, SEQ.fetch_add(1, Ordering::SeqCst))
}

fn open_in(store: &LedgerStore, owner: &str, currency: &str, balance: i64) -> Account {
    let owner = unique_owner(owner);
    store
        .atomic(|s| {
            let account = s.create_account(&NewAccount { owner: owner.clone(), currency: currency.to_string() })?;
            s.add_account_balance(account.id, balance)
        })
        .expect("Failed to open account")
}

fn open(store: &LedgerStore, owner: &str, balance: i64) -> Account {
    open_in(store, owner, "USD", balance)
}

fn balance(store: &LedgerStore, id: i64) -> i64 {
    store.get_account(id).expect("Failed to read account").balance
}

fn request(source: &Account, destination: &Account, amount: i64) -> TransferRequest {
    TransferRequest {
        source_account_id: source.id,
        destination_account_id: destination.id,
        amount,
    }
}

fn example_scenario(backend: Arc<dyn StorageBackend>) {
    let store = LedgerStore::new(backend.clone());
    let executor = TransferExecutor::new(backend);
    let a = open(&store, "alice", 100);
    let b = open(&store, "bob", 50);

    let result = executor.execute(&request(&a, &b, 30)).unwrap();

    assert_eq!(result.transfer.amount, 30);
    assert_eq!(result.transfer.source_account_id, a.id);
    assert_eq!(result.transfer.destination_account_id, b.id);
    assert_eq!(result.source_account.balance, 70);
    assert_eq!(result.destination_account.balance, 80);
    assert_eq!(result.from_entry.amount, -30);
    assert_eq!(result.to_entry.amount, 30);

    assert_eq!(store.get_transfer(result.transfer.id).unwrap(), result.transfer);
    assert_eq!(store.get_entry(result.from_entry.id).unwrap(), result.from_entry);
    let linked = store.list_entries(&EntryFilter::transfer(result.transfer.id), Page::all()).unwrap();
    assert_eq!(linked.len(), 2);
}

fn balance_conservation(backend: Arc<dyn StorageBackend>) {
    let store = LedgerStore::new(backend.clone());
    let executor = TransferExecutor::new(backend);
    let a = open(&store, "a", 1_000);
    let b = open(&store, "b", 1_000);

    for (i, amount) in [1, 7, 250, 3].into_iter().enumerate() {
        let (source, destination) = if i % 2 == 0 { (&a, &b) } else { (&b, &a) };
        let source_before = balance(&store, source.id);
        let destination_before = balance(&store, destination.id);

        let result = executor.execute(&request(source, destination, amount)).unwrap();

        assert_eq!(result.source_account.balance, source_before - amount);
        assert_eq!(result.destination_account.balance, destination_before + amount);
        assert_eq!(result.from_entry.amount, -amount);
        assert_eq!(result.to_entry.amount, amount);
        assert_eq!(balance(&store, source.id), source_before - amount);
    }
    assert_eq!(balance(&store, a.id) + balance(&store, b.id), 2_000);
}

fn atomicity_on_failure(backend: Arc<dyn StorageBackend>) {
    let store = LedgerStore::new(backend.clone());
    let executor = TransferExecutor::new(backend);
    let a = open(&store, "a", 100);
    let missing = i64::MAX - 1;

    let err = executor
        .execute(&TransferRequest {
            source_account_id: a.id,
            destination_account_id: missing,
            amount: 10,
        })
        .unwrap_err();

    assert!(err.is_not_found(), "got {:?}", err);
    assert_eq!(balance(&store, a.id), 100);
    assert!(store.list_entries(&EntryFilter::account(a.id), Page::all()).unwrap().is_empty());
    assert!(store.list_transfers(&TransferFilter::Outbound(a.id), Page::all()).unwrap().is_empty());
}

fn not_found_propagation(backend: Arc<dyn StorageBackend>) {
    let store = LedgerStore::new(backend.clone());
    let executor = TransferExecutor::new(backend);
    let b = open(&store, "b", 40);
    let missing = i64::MAX - 2;

    let err = executor
        .execute(&TransferRequest {
            source_account_id: missing,
            destination_account_id: b.id,
            amount: 10,
        })
        .unwrap_err();

    match err {
        TransferError::Storage(StorageError::NotFound { kind, id }) => {
            assert_eq!(kind, EntityKind::Account);
            assert_eq!(id, missing);
        }
        other => panic!("expected NotFound, got {:?}", other),
    }
    assert_eq!(balance(&store, b.id), 40);
    assert!(store.list_transfers(&TransferFilter::Inbound(b.id), Page::all()).unwrap().is_empty());
}

fn invalid_input(backend: Arc<dyn StorageBackend>) {
    let store = LedgerStore::new(backend.clone());
    let executor = TransferExecutor::new(backend);
    let a = open(&store, "a", 100);
    let b = open(&store, "b", 100);

    for amount in [0, -1, i64::MIN] {
        let err = executor.execute(&request(&a, &b, amount)).unwrap_err();
        assert!(matches!(err, TransferError::InvalidArgument(_)), "got {:?}", err);
    }
    let err = executor.execute(&request(&a, &a, 10)).unwrap_err();
    assert!(matches!(err, TransferError::InvalidArgument(_)), "got {:?}", err);

    assert_eq!(balance(&store, a.id), 100);
    assert_eq!(balance(&store, b.id), 100);
}

fn concurrent_transfers_one_direction(backend: Arc<dyn StorageBackend>) {
    let store = LedgerStore::new(backend.clone());
    let executor = Arc::new(TransferExecutor::new(backend));
    let a = open(&store, "a", 1_000);
    let b = open(&store, "b", 1_000);
    let n = 10;
    let amount = 10;

    let handles = (0..n)
        .map(|_| {
            let executor = executor.clone();
            let req = request(&a, &b, amount);
            thread::spawn(move || executor.execute(&req))
        })
        .collect::<Vec<_>>();

    let mut seen = Vec::new();
    for handle in handles {
        let result = handle.join().unwrap().unwrap();
        let source_diff = a.balance - result.source_account.balance;
        let destination_diff = result.destination_account.balance - b.balance;
        assert_eq!(source_diff, destination_diff);
        assert!(source_diff > 0 && source_diff % amount == 0);

        let k = source_diff / amount;
        assert!((1..=n).contains(&k));
        assert!(!seen.contains(&k), "two transfers observed the same balance step {}", k);
        seen.push(k);
    }

    assert_eq!(balance(&store, a.id), a.balance - n * amount);
    assert_eq!(balance(&store, b.id), b.balance + n * amount);
}

fn concurrent_mixed_directions(backend: Arc<dyn StorageBackend>) {
    let store = LedgerStore::new(backend.clone());
    let executor = Arc::new(TransferExecutor::new(backend));
    let a = open(&store, "a", 500);
    let b = open(&store, "b", 500);
    let amount = 7;

    // Uneven mix: every third transfer runs b -> a.
    let directions = (0..15).map(|i| i % 3 == 0).collect::<Vec<_>>();
    let inbound = directions.iter().filter(|reverse| **reverse).count() as i64;
    let outbound = directions.len() as i64 - inbound;

    let handles = directions
        .into_iter()
        .map(|reverse| {
            let executor = executor.clone();
            let req = if reverse { request(&b, &a, amount) } else { request(&a, &b, amount) };
            thread::spawn(move || executor.execute(&req))
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(balance(&store, a.id), a.balance + amount * (inbound - outbound));
    assert_eq!(balance(&store, b.id), b.balance - amount * (inbound - outbound));
    assert_eq!(
        store.list_entries(&EntryFilter::account(a.id), Page::all()).unwrap().len() as i64,
        inbound + outbound
    );
}

fn deadlock_freedom(backend: Arc<dyn StorageBackend>) {
    let store = LedgerStore::new(backend.clone());
    let executor = Arc::new(TransferExecutor::new(backend));
    let a = open(&store, "a", 100);
    let b = open(&store, "b", 100);

    let handles = (0..20)
        .map(|i| {
            let executor = executor.clone();
            let req = if i % 2 == 0 { request(&a, &b, 10) } else { request(&b, &a, 10) };
            thread::spawn(move || executor.execute(&req))
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(balance(&store, a.id), 100);
    assert_eq!(balance(&store, b.id), 100);
}

fn cancellation_rolls_back(backend: Arc<dyn StorageBackend>) {
    let store = LedgerStore::new(backend.clone());
    let executor = TransferExecutor::new(backend);
    let a = open(&store, "a", 100);
    let b = open(&store, "b", 100);

    let cancel = CancelFlag::new();
    cancel.cancel();
    let err = executor.execute_cancellable(&request(&a, &b, 10), &cancel).unwrap_err();

    assert!(matches!(err, TransferError::Cancelled));
    assert_eq!(balance(&store, a.id), 100);
    assert!(store.list_transfers(&TransferFilter::Outbound(a.id), Page::all()).unwrap().is_empty());
}

fn currency_mismatch(backend: Arc<dyn StorageBackend>) {
    let store = LedgerStore::new(backend.clone());
    let executor = TransferExecutor::new(backend);
    let dollars = open_in(&store, "a", "USD", 100);
    let euros = open_in(&store, "b", "EUR", 100);

    let err = executor.execute(&request(&dollars, &euros, 10)).unwrap_err();

    assert!(matches!(err, TransferError::InvalidArgument(_)), "got {:?}", err);
    assert_eq!(balance(&store, dollars.id), 100);
    assert_eq!(balance(&store, euros.id), 100);
    assert!(store.list_transfers(&TransferFilter::Outbound(dollars.id), Page::all()).unwrap().is_empty());
    assert!(store.list_entries(&EntryFilter::account(dollars.id), Page::all()).unwrap().is_empty());
}

fn panic_in_work_rolls_back(backend: Arc<dyn StorageBackend>) {
    let store = LedgerStore::new(backend);
    let a = open(&store, "a", 100);

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        store.atomic(|s| -> Result<(), StorageError> {
            s.add_account_balance(a.id, 1_000)?;
            panic!("work failed half way");
        })
    }));

    assert!(outcome.is_err());
    assert_eq!(balance(&store, a.id), 100);
}

fn referential_rules(backend: Arc<dyn StorageBackend>) {
    let store = LedgerStore::new(backend.clone());
    let executor = TransferExecutor::new(backend);
    let a = open(&store, "a", 100);
    let b = open(&store, "b", 100);
    let missing = i64::MAX - 3;

    let err = store.create_entry(&NewEntry { account_id: missing, amount: 1, transfer_id: None }).unwrap_err();
    assert!(matches!(err, StorageError::NotFound { kind: EntityKind::Account, id } if id == missing));
    let err = store
        .create_transfer(&NewTransfer { source_account_id: a.id, destination_account_id: missing, amount: 1 })
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { kind: EntityKind::Account, id } if id == missing));

    let result = executor.execute(&request(&a, &b, 5)).unwrap();
    let err = store.delete_account(a.id).unwrap_err();
    assert!(matches!(err, StorageError::Constraint(_)), "got {:?}", err);

    store.delete_transfer(result.transfer.id).unwrap();
    assert!(store.get_transfer(result.transfer.id).unwrap_err().is_not_found());
    let entry = store.get_entry(result.from_entry.id).unwrap();
    assert_eq!(entry.transfer_id, None);
    assert_eq!(entry.amount, -5);
}

macro_rules! backend_tests {
    (@each $backend:ident, $($property:ident),* $(,)?) => {
        paste::paste! {
            $(
                #[test]
                fn [<test_ $backend _ $property>]() {
                    $property($backend());
                }
            )*
        }
    };
    (@each_ignored $reason:literal $backend:ident, $($property:ident),* $(,)?) => {
        paste::paste! {
            $(
                #[test]
                #[ignore = $reason]
                fn [<test_ $backend _ $property>]() {
                    $property($backend());
                }
            )*
        }
    };
    ($($head:tt)*) => {
        backend_tests!($($head)*,
            example_scenario,
            balance_conservation,
            atomicity_on_failure,
            not_found_propagation,
            invalid_input,
            currency_mismatch,
            concurrent_transfers_one_direction,
            concurrent_mixed_directions,
            deadlock_freedom,
            cancellation_rolls_back,
            panic_in_work_rolls_back,
            referential_rules,
        );
    };
}

backend_tests!(@each memory);
backend_tests!(@each sqlite);
backend_tests!(@each_ignored "requires LEDGERD_TEST_POSTGRES_URL" postgres);
