pub mod api;
pub mod config;
pub mod executor;
pub mod store;
pub mod telemetry;

pub use executor::{CancelFlag, TransferError, TransferExecutor, TransferRequest, TransferResult};
pub use store::{open_backend, LedgerStore};
