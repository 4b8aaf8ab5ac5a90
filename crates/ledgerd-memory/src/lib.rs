//! In-memory storage backend for ledgerd.
//!
//! Committed rows live in one table set behind an `RwLock`. Each unit of
//! work buffers its writes and holds exclusive row locks until it commits or
//! rolls back, so no other caller ever sees its intermediate state.

mod locks;
mod storage;

pub use storage::{InMemoryStorage, MemoryScope};
