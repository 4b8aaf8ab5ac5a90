//! Core types and traits for ledgerd storage backends.
//!
//! This crate provides the `StorageBackend` trait, the scoped `LedgerOps`
//! surface every unit of work runs against, and the ledger data model,
//! enabling pluggable storage implementations in separate crates.

pub mod models;
pub mod storage;

// Re-export key types at crate root for convenience
pub use models::{Account, Entry, Transfer, EntityKind, Page};
pub use models::write::{NewAccount, AccountUpdate, NewEntry, NewTransfer};
pub use models::read::{AccountFilter, EntryFilter, TransferFilter};
pub use storage::{
    run_atomic, AtomicError, LedgerOps, StorageBackend, StorageError, TransactionId,
    TransactionScope,
};
