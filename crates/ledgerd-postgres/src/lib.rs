//! PostgreSQL storage backend for ledgerd.
//!
//! Each unit of work checks a connection out of an r2d2 pool and runs a
//! `READ COMMITTED` transaction on it. Balance changes are single
//! `UPDATE ... RETURNING` statements, so the row lock they take is held until
//! the transaction ends.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use postgres::{error::SqlState, Client, NoTls, Row};
use r2d2_postgres::{
    r2d2::{Pool, PooledConnection},
    PostgresConnectionManager,
};

use ledgerd_core::{
    Account, AccountFilter, AccountUpdate, EntityKind, Entry, EntryFilter, LedgerOps, NewAccount,
    NewEntry, NewTransfer, Page, StorageBackend, StorageError, Transfer, TransactionId,
    TransactionScope, TransferFilter,
};

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, transfer_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, source_account_id, destination_account_id, amount, created_at";

pub const DEFAULT_POOL_SIZE: usize = 8;
const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

type Manager = PostgresConnectionManager<NoTls>;
type Connection = PooledConnection<Manager>;

pub struct PostgresStorage {
    pool: Pool<Manager>,
    tx_counter: AtomicU64,
}

impl PostgresStorage {
    pub fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_pool_size(connection_string, DEFAULT_POOL_SIZE)
    }

    pub fn with_pool_size(connection_string: &str, pool_size: usize) -> Result<Self, StorageError> {
        Self::with_pool(connection_string, pool_size, DEFAULT_CHECKOUT_TIMEOUT)
    }

    /// Opens a pool of up to `pool_size` connections. Building the pool and
    /// every later checkout give up after `checkout_timeout`.
    pub fn with_pool(
        connection_string: &str,
        pool_size: usize,
        checkout_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let config: postgres::Config = connection_string
            .parse()
            .map_err(|e| StorageError::Other(format!("invalid PostgreSQL connection string: {}", e)))?;
        let pool = Pool::builder()
            .max_size(pool_size.max(1) as u32)
            .connection_timeout(checkout_timeout)
            .build(PostgresConnectionManager::new(config, NoTls))
            .map_err(pool_err)?;

        let storage = Self {
            pool,
            tx_counter: AtomicU64::new(1),
        };
        storage.init_schema()?;
        tracing::info!(pool_size, "PostgreSQL storage ready");
        Ok(storage)
    }

    fn checkout(&self) -> Result<Connection, StorageError> {
        self.pool.get().map_err(pool_err)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.checkout()?
            .batch_execute(
                "
            CREATE TABLE IF NOT EXISTS accounts (
                id BIGSERIAL PRIMARY KEY,
                owner TEXT NOT NULL,
                balance BIGINT NOT NULL,
                currency TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                CONSTRAINT accounts_owner_currency_key UNIQUE (owner, currency)
            );

            CREATE TABLE IF NOT EXISTS transfers (
                id BIGSERIAL PRIMARY KEY,
                source_account_id BIGINT NOT NULL,
                destination_account_id BIGINT NOT NULL,
                amount BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                CONSTRAINT transfers_source_account_fk
                    FOREIGN KEY (source_account_id) REFERENCES accounts(id),
                CONSTRAINT transfers_destination_account_fk
                    FOREIGN KEY (destination_account_id) REFERENCES accounts(id)
            );

            CREATE TABLE IF NOT EXISTS entries (
                id BIGSERIAL PRIMARY KEY,
                account_id BIGINT NOT NULL,
                transfer_id BIGINT,
                amount BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                CONSTRAINT entries_account_fk
                    FOREIGN KEY (account_id) REFERENCES accounts(id),
                CONSTRAINT entries_transfer_fk
                    FOREIGN KEY (transfer_id) REFERENCES transfers(id) ON DELETE SET NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pg_accounts_owner ON accounts(owner);
            CREATE INDEX IF NOT EXISTS idx_pg_entries_account ON entries(account_id);
            CREATE INDEX IF NOT EXISTS idx_pg_entries_transfer ON entries(transfer_id);
            CREATE INDEX IF NOT EXISTS idx_pg_transfers_source ON transfers(source_account_id);
            CREATE INDEX IF NOT EXISTS idx_pg_transfers_destination ON transfers(destination_account_id);
            ",
            )
            .map_err(map_err)
    }
}

fn pool_err(e: r2d2_postgres::r2d2::Error) -> StorageError {
    StorageError::Unavailable(format!("PostgreSQL connection unavailable: {}", e))
}

fn map_err(e: postgres::Error) -> StorageError {
    if e.is_closed() {
        return StorageError::Unavailable(e.to_string());
    }
    match e.code() {
        Some(code)
            if *code == SqlState::FOREIGN_KEY_VIOLATION
                || *code == SqlState::UNIQUE_VIOLATION
                || *code == SqlState::CHECK_VIOLATION
                || *code == SqlState::NOT_NULL_VIOLATION
                || *code == SqlState::NUMERIC_VALUE_OUT_OF_RANGE =>
        {
            StorageError::Constraint(e.to_string())
        }
        Some(code) if code.code().starts_with("08") || *code == SqlState::ADMIN_SHUTDOWN => {
            StorageError::Unavailable(e.to_string())
        }
        _ => StorageError::Other(e.to_string()),
    }
}

/// Maps a foreign key failure on insert to the missing row it names.
fn map_insert_err(e: postgres::Error, references: &[(&str, EntityKind, Option<i64>)]) -> StorageError {
    if e.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION) {
        let constraint = e.as_db_error().and_then(|db| db.constraint());
        for (name, kind, id) in references {
            if constraint == Some(*name) {
                if let Some(id) = id {
                    return StorageError::not_found(*kind, *id);
                }
            }
        }
    }
    map_err(e)
}

fn account_from_row(row: &Row) -> Result<Account, postgres::Error> {
    Ok(Account {
        id: row.try_get(0)?,
        owner: row.try_get(1)?,
        balance: row.try_get(2)?,
        currency: row.try_get(3)?,
        created_at: row.try_get(4)?,
    })
}

fn entry_from_row(row: &Row) -> Result<Entry, postgres::Error> {
    Ok(Entry {
        id: row.try_get(0)?,
        account_id: row.try_get(1)?,
        transfer_id: row.try_get(2)?,
        amount: row.try_get(3)?,
        created_at: row.try_get(4)?,
    })
}

fn transfer_from_row(row: &Row) -> Result<Transfer, postgres::Error> {
    Ok(Transfer {
        id: row.try_get(0)?,
        source_account_id: row.try_get(1)?,
        destination_account_id: row.try_get(2)?,
        amount: row.try_get(3)?,
        created_at: row.try_get(4)?,
    })
}

impl StorageBackend for PostgresStorage {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn begin(&self) -> Result<Box<dyn TransactionScope + '_>, StorageError> {
        let mut conn = self.checkout()?;
        conn.batch_execute("BEGIN").map_err(map_err)?;
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, "PostgreSQL transaction started");
        Ok(Box::new(PostgresScope { conn: Some(conn), tx_id }))
    }
}

pub struct PostgresScope {
    /// `None` once the transaction has been committed or rolled back.
    conn: Option<Connection>,
    tx_id: TransactionId,
}

impl PostgresScope {
    fn client(&mut self) -> Result<&mut Client, StorageError> {
        self.conn.as_deref_mut().ok_or(StorageError::NoActiveTransaction)
    }

    fn query_one_as<T>(
        &mut self,
        sql: &str,
        params: &[&(dyn postgres::types::ToSql + Sync)],
        kind: EntityKind,
        id: i64,
        convert: fn(&Row) -> Result<T, postgres::Error>,
    ) -> Result<T, StorageError> {
        let row = self.client()?
            .query_opt(sql, params)
            .map_err(map_err)?
            .ok_or_else(|| StorageError::not_found(kind, id))?;
        convert(&row).map_err(map_err)
    }

    fn query_all_as<T>(
        &mut self,
        sql: &str,
        params: &[&(dyn postgres::types::ToSql + Sync)],
        convert: fn(&Row) -> Result<T, postgres::Error>,
    ) -> Result<Vec<T>, StorageError> {
        let rows = self.client()?.query(sql, params).map_err(map_err)?;
        rows.iter().map(|row| convert(row).map_err(map_err)).collect()
    }

    fn delete(&mut self, table: &str, kind: EntityKind, id: i64) -> Result<(), StorageError> {
        let deleted = self.client()?
            .execute(&format!("DELETE FROM {} WHERE id = $1", table), &[&id])
            .map_err(map_err)?;
        if deleted == 0 {
            return Err(StorageError::not_found(kind, id));
        }
        Ok(())
    }

    /// Ends the transaction with `sql`. Dropping the pooled connection hands
    /// it back; the pool discards it if the server closed it.
    fn finish(&mut self, sql: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.take().ok_or(StorageError::NoActiveTransaction)?;
        conn.batch_execute(sql).map_err(map_err)
    }
}

impl LedgerOps for PostgresScope {
    fn get_account(&mut self, id: i64) -> Result<Account, StorageError> {
        self.query_one_as(
            &format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS),
            &[&id],
            EntityKind::Account,
            id,
            account_from_row,
        )
    }

    fn create_account(&mut self, account: &NewAccount) -> Result<Account, StorageError> {
        let row = self.client()?
            .query_one(
                &format!(
                    "INSERT INTO accounts (owner, balance, currency) VALUES ($1, 0, $2) RETURNING {}",
                    ACCOUNT_COLUMNS
                ),
                &[&account.owner, &account.currency],
            )
            .map_err(map_err)?;
        account_from_row(&row).map_err(map_err)
    }

    fn update_account(&mut self, id: i64, update: &AccountUpdate) -> Result<Account, StorageError> {
        self.query_one_as(
            &format!(
                "UPDATE accounts SET owner = $1, balance = $2, currency = $3 WHERE id = $4 RETURNING {}",
                ACCOUNT_COLUMNS
            ),
            &[&update.owner, &update.balance, &update.currency, &id],
            EntityKind::Account,
            id,
            account_from_row,
        )
    }

    fn add_account_balance(&mut self, id: i64, delta: i64) -> Result<Account, StorageError> {
        self.query_one_as(
            &format!("UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING {}", ACCOUNT_COLUMNS),
            &[&delta, &id],
            EntityKind::Account,
            id,
            account_from_row,
        )
    }

    fn delete_account(&mut self, id: i64) -> Result<(), StorageError> {
        self.delete("accounts", EntityKind::Account, id)
    }

    fn list_accounts(&mut self, filter: &AccountFilter, page: Page) -> Result<Vec<Account>, StorageError> {
        self.query_all_as(
            &format!(
                "SELECT {} FROM accounts WHERE ($1::TEXT IS NULL OR owner = $1) ORDER BY id LIMIT $2 OFFSET $3",
                ACCOUNT_COLUMNS
            ),
            &[&filter.owner, &page.limit, &page.offset],
            account_from_row,
        )
    }

    fn get_entry(&mut self, id: i64) -> Result<Entry, StorageError> {
        self.query_one_as(
            &format!("SELECT {} FROM entries WHERE id = $1", ENTRY_COLUMNS),
            &[&id],
            EntityKind::Entry,
            id,
            entry_from_row,
        )
    }

    fn create_entry(&mut self, entry: &NewEntry) -> Result<Entry, StorageError> {
        let row = self.client()?
            .query_one(
                &format!(
                    "INSERT INTO entries (account_id, transfer_id, amount) VALUES ($1, $2, $3) RETURNING {}",
                    ENTRY_COLUMNS
                ),
                &[&entry.account_id, &entry.transfer_id, &entry.amount],
            )
            .map_err(|e| {
                map_insert_err(e, &[
                    ("entries_account_fk", EntityKind::Account, Some(entry.account_id)),
                    ("entries_transfer_fk", EntityKind::Transfer, entry.transfer_id),
                ])
            })?;
        entry_from_row(&row).map_err(map_err)
    }

    fn update_entry(&mut self, id: i64, amount: i64) -> Result<Entry, StorageError> {
        self.query_one_as(
            &format!("UPDATE entries SET amount = $1 WHERE id = $2 RETURNING {}", ENTRY_COLUMNS),
            &[&amount, &id],
            EntityKind::Entry,
            id,
            entry_from_row,
        )
    }

    fn delete_entry(&mut self, id: i64) -> Result<(), StorageError> {
        self.delete("entries", EntityKind::Entry, id)
    }

    fn list_entries(&mut self, filter: &EntryFilter, page: Page) -> Result<Vec<Entry>, StorageError> {
        self.query_all_as(
            &format!(
                "SELECT {} FROM entries
                 WHERE ($1::BIGINT IS NULL OR account_id = $1) AND ($2::BIGINT IS NULL OR transfer_id = $2)
                 ORDER BY id LIMIT $3 OFFSET $4",
                ENTRY_COLUMNS
            ),
            &[&filter.account_id, &filter.transfer_id, &page.limit, &page.offset],
            entry_from_row,
        )
    }

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StorageError> {
        self.query_one_as(
            &format!("SELECT {} FROM transfers WHERE id = $1", TRANSFER_COLUMNS),
            &[&id],
            EntityKind::Transfer,
            id,
            transfer_from_row,
        )
    }

    fn create_transfer(&mut self, transfer: &NewTransfer) -> Result<Transfer, StorageError> {
        let row = self.client()?
            .query_one(
                &format!(
                    "INSERT INTO transfers (source_account_id, destination_account_id, amount)
                     VALUES ($1, $2, $3) RETURNING {}",
                    TRANSFER_COLUMNS
                ),
                &[&transfer.source_account_id, &transfer.destination_account_id, &transfer.amount],
            )
            .map_err(|e| {
                map_insert_err(e, &[
                    ("transfers_source_account_fk", EntityKind::Account, Some(transfer.source_account_id)),
                    ("transfers_destination_account_fk", EntityKind::Account, Some(transfer.destination_account_id)),
                ])
            })?;
        transfer_from_row(&row).map_err(map_err)
    }

    fn update_transfer(&mut self, id: i64, amount: i64) -> Result<Transfer, StorageError> {
        self.query_one_as(
            &format!("UPDATE transfers SET amount = $1 WHERE id = $2 RETURNING {}", TRANSFER_COLUMNS),
            &[&amount, &id],
            EntityKind::Transfer,
            id,
            transfer_from_row,
        )
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
        self.query_all_as(
            &format!(
                "SELECT {} FROM transfers
                 WHERE ($1::BIGINT IS NULL OR source_account_id = $1)
                   AND ($2::BIGINT IS NULL OR destination_account_id = $2)
                 ORDER BY id LIMIT $3 OFFSET $4",
                TRANSFER_COLUMNS
            ),
            &[&source, &destination, &page.limit, &page.offset],
            transfer_from_row,
        )
    }
}

impl TransactionScope for PostgresScope {
    fn id(&self) -> TransactionId {
        self.tx_id
    }

    fn ops(&mut self) -> &mut dyn LedgerOps {
        self
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finish("COMMIT")?;
        tracing::debug!(tx_id = self.tx_id, "PostgreSQL transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finish("ROLLBACK")?;
        tracing::debug!(tx_id = self.tx_id, "PostgreSQL transaction rolled back");
        Ok(())
    }
}

impl Drop for PostgresScope {
    fn drop(&mut self) {
        if self.conn.is_none() {
            return;
        }
        match self.finish("ROLLBACK") {
            Ok(()) => tracing::debug!(tx_id = self.tx_id, "Unfinished PostgreSQL transaction rolled back"),
            Err(e) => tracing::error!(tx_id = self.tx_id, error = %e, "Rollback of unfinished PostgreSQL transaction failed"),
        }
    }
}
