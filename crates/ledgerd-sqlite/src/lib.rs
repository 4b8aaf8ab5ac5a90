//! SQLite storage backend for ledgerd.
//!
//! One connection behind a mutex. A unit of work holds the connection for
//! its whole lifetime and runs inside `BEGIN IMMEDIATE`, so writers are
//! serialized and readers never observe uncommitted rows.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex, MutexGuard, PoisonError,
};

use rusqlite::{params, Connection, ErrorCode, Row};
use time::OffsetDateTime;

use ledgerd_core::{
    Account, AccountFilter, AccountUpdate, EntityKind, Entry, EntryFilter, LedgerOps, NewAccount,
    NewEntry, NewTransfer, Page, StorageBackend, StorageError, Transfer, TransactionId,
    TransactionScope, TransferFilter,
};

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, transfer_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, source_account_id, destination_account_id, amount, created_at";

pub struct SqliteStorage {
    conn: Mutex<Connection>,
    tx_counter: AtomicU64,
}

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|e| StorageError::Unavailable(format!("SQLite open failed: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")
            .map_err(map_err)?;

        let storage = Self {
            conn: Mutex::new(conn),
            tx_counter: AtomicU64::new(1),
        };
        storage.init_schema()?;
        tracing::info!(path, "SQLite storage ready");
        Ok(storage)
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.connection();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                balance INTEGER NOT NULL CHECK (typeof(balance) = 'integer'),
                currency TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (owner, currency)
            );

            CREATE TABLE IF NOT EXISTS transfers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_account_id INTEGER NOT NULL REFERENCES accounts(id),
                destination_account_id INTEGER NOT NULL REFERENCES accounts(id),
                amount INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts(id),
                transfer_id INTEGER REFERENCES transfers(id) ON DELETE SET NULL,
                amount INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_accounts_owner ON accounts(owner);
            CREATE INDEX IF NOT EXISTS idx_entries_account ON entries(account_id);
            CREATE INDEX IF NOT EXISTS idx_entries_transfer ON entries(transfer_id);
            CREATE INDEX IF NOT EXISTS idx_transfers_source ON transfers(source_account_id);
            CREATE INDEX IF NOT EXISTS idx_transfers_destination ON transfers(destination_account_id);
            ",
        )
        .map_err(map_err)?;
        Ok(())
    }
}

fn map_err(e: rusqlite::Error) -> StorageError {
    match &e {
        rusqlite::Error::SqliteFailure(err, msg) => match err.code {
            ErrorCode::ConstraintViolation => {
                StorageError::Constraint(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull
            | ErrorCode::ReadOnly => StorageError::Unavailable(e.to_string()),
            _ => StorageError::Other(e.to_string()),
        },
        _ => StorageError::Other(e.to_string()),
    }
}

fn is_foreign_key_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _)
        if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY)
}

fn account_from_row(row: &Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        owner: row.get(1)?,
        balance: row.get(2)?,
        currency: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn entry_from_row(row: &Row) -> rusqlite::Result<Entry> {
    Ok(Entry {
        id: row.get(0)?,
        account_id: row.get(1)?,
        transfer_id: row.get(2)?,
        amount: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn transfer_from_row(row: &Row) -> rusqlite::Result<Transfer> {
    Ok(Transfer {
        id: row.get(0)?,
        source_account_id: row.get(1)?,
        destination_account_id: row.get(2)?,
        amount: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl StorageBackend for SqliteStorage {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn begin(&self) -> Result<Box<dyn TransactionScope + '_>, StorageError> {
        let conn = self.connection();
        conn.execute_batch("BEGIN IMMEDIATE").map_err(map_err)?;
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, "SQLite transaction started");
        Ok(Box::new(SqliteScope {
            conn,
            tx_id,
            finished: false,
        }))
    }
}

pub struct SqliteScope<'a> {
    conn: MutexGuard<'a, Connection>,
    tx_id: TransactionId,
    finished: bool,
}

impl<'a> SqliteScope<'a> {
    fn exists(&self, table: &str, id: i64) -> Result<bool, StorageError> {
        self.conn
            .query_row(&format!("SELECT COUNT(*) > 0 FROM {} WHERE id = ?1", table), params![id], |row| row.get(0))
            .map_err(map_err)
    }

    /// Names the reference that made an insert fail its foreign key check.
    fn missing_reference(&self, accounts: &[i64], transfer: Option<i64>) -> StorageError {
        for id in accounts {
            match self.exists("accounts", *id) {
                Ok(false) => return StorageError::not_found(EntityKind::Account, *id),
                Err(e) => return e,
                Ok(true) => {}
            }
        }
        if let Some(id) = transfer {
            match self.exists("transfers", id) {
                Ok(false) => return StorageError::not_found(EntityKind::Transfer, id),
                Err(e) => return e,
                Ok(true) => {}
            }
        }
        StorageError::Constraint("foreign key violation".to_string())
    }

    fn delete(&self, table: &str, kind: EntityKind, id: i64) -> Result<(), StorageError> {
        let deleted = self.conn
            .execute(&format!("DELETE FROM {} WHERE id = ?1", table), params![id])
            .map_err(map_err)?;
        if deleted == 0 {
            return Err(StorageError::not_found(kind, id));
        }
        Ok(())
    }

    fn finish(&mut self, sql: &str) -> Result<(), StorageError> {
        self.finished = true;
        self.conn.execute_batch(sql).map_err(map_err)
    }
}

fn not_found(kind: EntityKind, id: i64) -> impl FnOnce(rusqlite::Error) -> StorageError {
    move |e| match e {
        rusqlite::Error::QueryReturnedNoRows => StorageError::not_found(kind, id),
        e => map_err(e),
    }
}

impl<'a> LedgerOps for SqliteScope<'a> {
    fn get_account(&mut self, id: i64) -> Result<Account, StorageError> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
                params![id],
                account_from_row,
            )
            .map_err(not_found(EntityKind::Account, id))
    }

    fn create_account(&mut self, account: &NewAccount) -> Result<Account, StorageError> {
        self.conn
            .query_row(
                &format!(
                    "INSERT INTO accounts (owner, balance, currency, created_at) VALUES (?1, 0, ?2, ?3) RETURNING {}",
                    ACCOUNT_COLUMNS
                ),
                params![account.owner, account.currency, OffsetDateTime::now_utc()],
                account_from_row,
            )
            .map_err(map_err)
    }

    fn update_account(&mut self, id: i64, update: &AccountUpdate) -> Result<Account, StorageError> {
        self.conn
            .query_row(
                &format!(
                    "UPDATE accounts SET owner = ?1, balance = ?2, currency = ?3 WHERE id = ?4 RETURNING {}",
                    ACCOUNT_COLUMNS
                ),
                params![update.owner, update.balance, update.currency, id],
                account_from_row,
            )
            .map_err(not_found(EntityKind::Account, id))
    }

    fn add_account_balance(&mut self, id: i64, delta: i64) -> Result<Account, StorageError> {
        self.conn
            .query_row(
                &format!("UPDATE accounts SET balance = balance + ?1 WHERE id = ?2 RETURNING {}", ACCOUNT_COLUMNS),
                params![delta, id],
                account_from_row,
            )
            .map_err(not_found(EntityKind::Account, id))
    }

    fn delete_account(&mut self, id: i64) -> Result<(), StorageError> {
        self.delete("accounts", EntityKind::Account, id)
    }

    fn list_accounts(&mut self, filter: &AccountFilter, page: Page) -> Result<Vec<Account>, StorageError> {
        let mut stmt = self.conn
            .prepare(&format!(
                "SELECT {} FROM accounts WHERE (?1 IS NULL OR owner = ?1) ORDER BY id LIMIT ?2 OFFSET ?3",
                ACCOUNT_COLUMNS
            ))
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![filter.owner, page.limit, page.offset], account_from_row)
            .map_err(map_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        Ok(rows)
    }

    fn get_entry(&mut self, id: i64) -> Result<Entry, StorageError> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM entries WHERE id = ?1", ENTRY_COLUMNS),
                params![id],
                entry_from_row,
            )
            .map_err(not_found(EntityKind::Entry, id))
    }

    fn create_entry(&mut self, entry: &NewEntry) -> Result<Entry, StorageError> {
        let result = self.conn.query_row(
            &format!(
                "INSERT INTO entries (account_id, transfer_id, amount, created_at) VALUES (?1, ?2, ?3, ?4) RETURNING {}",
                ENTRY_COLUMNS
            ),
            params![entry.account_id, entry.transfer_id, entry.amount, OffsetDateTime::now_utc()],
            entry_from_row,
        );
        match result {
            Ok(entry) => Ok(entry),
            Err(e) if is_foreign_key_violation(&e) => {
                Err(self.missing_reference(&[entry.account_id], entry.transfer_id))
            }
            Err(e) => Err(map_err(e)),
        }
    }

    fn update_entry(&mut self, id: i64, amount: i64) -> Result<Entry, StorageError> {
        self.conn
            .query_row(
                &format!("UPDATE entries SET amount = ?1 WHERE id = ?2 RETURNING {}", ENTRY_COLUMNS),
                params![amount, id],
                entry_from_row,
            )
            .map_err(not_found(EntityKind::Entry, id))
    }

    fn delete_entry(&mut self, id: i64) -> Result<(), StorageError> {
        self.delete("entries", EntityKind::Entry, id)
    }

    fn list_entries(&mut self, filter: &EntryFilter, page: Page) -> Result<Vec<Entry>, StorageError> {
        let mut stmt = self.conn
            .prepare(&format!(
                "SELECT {} FROM entries
                 WHERE (?1 IS NULL OR account_id = ?1) AND (?2 IS NULL OR transfer_id = ?2)
                 ORDER BY id LIMIT ?3 OFFSET ?4",
                ENTRY_COLUMNS
            ))
            .map_err(map_err)?;
        let rows = stmt
            .query_map(
                params![filter.account_id, filter.transfer_id, page.limit, page.offset],
                entry_from_row,
            )
            .map_err(map_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        Ok(rows)
    }

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StorageError> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM transfers WHERE id = ?1", TRANSFER_COLUMNS),
                params![id],
                transfer_from_row,
            )
            .map_err(not_found(EntityKind::Transfer, id))
    }

    fn create_transfer(&mut self, transfer: &NewTransfer) -> Result<Transfer, StorageError> {
        let result = self.conn.query_row(
            &format!(
                "INSERT INTO transfers (source_account_id, destination_account_id, amount, created_at)
                 VALUES (?1, ?2, ?3, ?4) RETURNING {}",
                TRANSFER_COLUMNS
            ),
            params![
                transfer.source_account_id,
                transfer.destination_account_id,
                transfer.amount,
                OffsetDateTime::now_utc()
            ],
            transfer_from_row,
        );
        match result {
            Ok(transfer) => Ok(transfer),
            Err(e) if is_foreign_key_violation(&e) => Err(self.missing_reference(
                &[transfer.source_account_id, transfer.destination_account_id],
                None,
            )),
            Err(e) => Err(map_err(e)),
        }
    }

    fn update_transfer(&mut self, id: i64, amount: i64) -> Result<Transfer, StorageError> {
        self.conn
            .query_row(
                &format!("UPDATE transfers SET amount = ?1 WHERE id = ?2 RETURNING {}", TRANSFER_COLUMNS),
                params![amount, id],
                transfer_from_row,
            )
            .map_err(not_found(EntityKind::Transfer, id))
    }

    fn delete_transfer(&mut self, id: i64) -> Result<(), StorageError> {
        self.delete("transfers", EntityKind::Transfer, id)
    }

    fn list_transfers(&mut self, filter: &TransferFilter, page: Page) -> Result<Vec<Transfer>, StorageError> {
        let (source, destination) = match filter {
            TransferFilter::All => (None, None),
            TransferFilter::Outbound(id) => (Some(*id), None),
            TransferFilter::Inbound(id) => (None, Some(*id)),
        };
        let mut stmt = self.conn
            .prepare(&format!(
                "SELECT {} FROM transfers
                 WHERE (?1 IS NULL OR source_account_id = ?1) AND (?2 IS NULL OR destination_account_id = ?2)
                 ORDER BY id LIMIT ?3 OFFSET ?4",
                TRANSFER_COLUMNS
            ))
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![source, destination, page.limit, page.offset], transfer_from_row)
            .map_err(map_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        Ok(rows)
    }
}

impl<'a> TransactionScope for SqliteScope<'a> {
    fn id(&self) -> TransactionId {
        self.tx_id
    }

    fn ops(&mut self) -> &mut dyn LedgerOps {
        self
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        if let Err(e) = self.finish("COMMIT") {
            // A failed COMMIT can leave the transaction open.
            if let Err(rb) = self.conn.execute_batch("ROLLBACK") {
                tracing::debug!(tx_id = self.tx_id, error = %rb, "Rollback after failed commit");
            }
            return Err(e);
        }
        tracing::debug!(tx_id = self.tx_id, "SQLite transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finish("ROLLBACK")?;
        tracing::debug!(tx_id = self.tx_id, "SQLite transaction rolled back");
        Ok(())
    }
}

impl<'a> Drop for SqliteScope<'a> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.conn.execute_batch("ROLLBACK") {
            Ok(()) => tracing::debug!(tx_id = self.tx_id, "Unfinished SQLite transaction rolled back"),
            Err(e) => tracing::error!(tx_id = self.tx_id, error = %e, "Rollback of unfinished SQLite transaction failed"),
        }
    }
}
