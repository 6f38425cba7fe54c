//! Keyed lock table for per-entity critical sections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Lazily-populated map of named locks.
///
/// Entries are never removed, so a key's lock identity is stable for
/// the life of the process. Used to serialize heals per consumer and
/// bonus derivation per hypervisor without any cross-key contention.
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The lock for `key`, created on first use.
    pub(crate) fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}
