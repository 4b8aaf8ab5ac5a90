use std::{
    collections::HashMap,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use ledgerd_core::{EntityKind, StorageError, TransactionId};

pub(crate) type RowKey = (EntityKind, i64);

/// Exclusive row locks owned by transactions, released all at once when the
/// owner finishes. Waiters block on a condvar; there is no deadlock detection,
/// callers avoid cycles by locking rows in a fixed order.
pub(crate) struct RowLocks {
    owners: Mutex<HashMap<RowKey, TransactionId>>,
    released: Condvar,
    timeout: Option<Duration>,
}

impl RowLocks {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            owners: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            timeout,
        }
    }

    fn owners(&self) -> MutexGuard<'_, HashMap<RowKey, TransactionId>> {
        self.owners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until `tx_id` owns `key`. Returns `true` if the lock was newly
    /// taken, `false` if `tx_id` already held it.
    pub fn acquire(&self, key: RowKey, tx_id: TransactionId) -> Result<bool, StorageError> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut owners = self.owners();
        loop {
            match owners.get(&key).copied() {
                None => {
                    owners.insert(key, tx_id);
                    return Ok(true);
                }
                Some(owner) if owner == tx_id => return Ok(false),
                Some(owner) => {
                    tracing::trace!(tx_id, owner, kind = %key.0, id = key.1, "Waiting for row lock");
                    owners = match deadline {
                        None => self.released.wait(owners).unwrap_or_else(PoisonError::into_inner),
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                return Err(StorageError::Other(format!(
                                    "lock wait timed out on {} {}",
                                    key.0, key.1
                                )));
                            }
                            self.released
                                .wait_timeout(owners, deadline - now)
                                .unwrap_or_else(PoisonError::into_inner)
                                .0
                        }
                    };
                }
            }
        }
    }

    pub fn release_all(&self, tx_id: TransactionId, keys: &[RowKey]) {
        if keys.is_empty() {
            return;
        }
        let mut owners = self.owners();
        for key in keys {
            if owners.get(key) == Some(&tx_id) {
                owners.remove(key);
            }
        }
        drop(owners);
        self.released.notify_all();
    }

    #[cfg(test)]
    pub fn held(&self) -> usize {
        self.owners().len()
    }
}
