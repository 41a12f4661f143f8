//! In-process remote store.
//!
//! Implements [`RemoteStorePort`] over a shared map.  Used when no remote
//! is configured (offline runs keep replicating, so the durability state
//! machine still completes) and by tests, which inject failures and
//! inspect what reached the "remote".

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::app::ports::{RemoteError, RemoteStorePort};
use crate::storage::record::{Record, RecordKey, Table};

#[derive(Default)]
struct Inner {
    rows: HashMap<RecordKey, Record>,
    /// Upserts attempted, including failed ones.
    attempts: usize,
    fail_next: usize,
    offline: bool,
}

/// Clonable handle; every clone sees the same rows.
#[derive(Clone, Default)]
pub struct MemoryRemote(Arc<Mutex<Inner>>);

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut inner = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut inner)
    }

    /// Fail the next `n` upserts with [`RemoteError::Timeout`].
    pub fn fail_next(&self, n: usize) {
        self.with(|i| i.fail_next = n);
    }

    /// While offline every upsert fails with [`RemoteError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.with(|i| i.offline = offline);
    }

    pub fn get(&self, key: RecordKey) -> Option<Record> {
        self.with(|i| i.rows.get(&key).cloned())
    }

    pub fn len(&self) -> usize {
        self.with(|i| i.rows.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, table: Table) -> usize {
        self.with(|i| i.rows.values().filter(|r| r.table() == table).count())
    }

    pub fn attempts(&self) -> usize {
        self.with(|i| i.attempts)
    }
}

impl RemoteStorePort for MemoryRemote {
    fn upsert(&mut self, key: RecordKey, record: &Record) -> Result<(), RemoteError> {
        self.with(|i| {
            i.attempts += 1;
            if i.offline {
                return Err(RemoteError::Unavailable);
            }
            if i.fail_next > 0 {
                i.fail_next -= 1;
                return Err(RemoteError::Timeout);
            }
            i.rows.insert(key, record.clone());
            Ok(())
        })
    }
}
