//! Dual-write persistence layer.
//!
//! ```text
//!  producer ──write──▶ DualWriter ──append+fsync──▶ LocalStorePort   (must succeed)
//!                          │
//!                          └──enqueue(key)──▶ ReplicationQueue ──▶ Replicator ──▶ RemoteStorePort
//!                                                                         (best effort, retried)
//! ```
//!
//! [`DualWriter`] is cheap to clone; every producer thread holds its own
//! clone.  The local write completes before the key becomes visible to the
//! replicator, so the local store is always a superset of the remote.

pub mod journal;
pub mod query;
pub mod record;
pub mod replicator;

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error};

use crate::app::ports::{LocalStorePort, StorageError};
use crate::perception::emotion::{EmotionLabel, EmotionTrend};
use record::{DurabilityEvent, DurabilityState, Record, RecordKey, WriteRecord};
use replicator::{EnqueueOutcome, ReplicationQueue};

/// Where the pipeline hands finished records.  Implemented by
/// [`DualWriter`]; tests may substitute their own.
pub trait RecordSink {
    /// Durably store `record` and schedule it for replication.
    fn write(&self, record: Record) -> Result<RecordKey, StorageError>;

    /// Durably backfill a food event and schedule the new version for
    /// replication.
    fn backfill(
        &self,
        key: RecordKey,
        after: EmotionLabel,
        trend: EmotionTrend,
    ) -> Result<(), StorageError>;

    /// Durably clear the warning flag on a food event and schedule the new
    /// version for replication.
    fn retract_warning(&self, key: RecordKey) -> Result<(), StorageError>;
}

/// Local-first writer shared by all producers.
pub struct DualWriter<L> {
    local: Arc<Mutex<L>>,
    queue: Arc<ReplicationQueue>,
}

impl<L> Clone for DualWriter<L> {
    fn clone(&self) -> Self {
        Self {
            local: Arc::clone(&self.local),
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<L: LocalStorePort> DualWriter<L> {
    pub fn new(local: Arc<Mutex<L>>, queue: Arc<ReplicationQueue>) -> Self {
        Self { local, queue }
    }

    fn lock(&self) -> Result<MutexGuard<'_, L>, StorageError> {
        self.local.lock().map_err(|_| StorageError::Poisoned)
    }

    pub fn local(&self) -> &Arc<Mutex<L>> {
        &self.local
    }

    pub fn queue(&self) -> &Arc<ReplicationQueue> {
        &self.queue
    }

    /// Current durability state of `key`.  `None` if the key was never
    /// written locally.
    pub fn durability(&self, key: RecordKey) -> Option<DurabilityState> {
        if let Some(state) = self.queue.state_of(key) {
            return Some(state);
        }
        let stored = self.lock().ok()?.get(key)?;
        Some(if stored.is_replicated() {
            DurabilityState::RemoteCommitted
        } else {
            DurabilityState::PendingRemote
        })
    }

    fn hand_off(&self, write: &mut WriteRecord) {
        match self.queue.enqueue(write.key) {
            EnqueueOutcome::Queued | EnqueueOutcome::AlreadyQueued => {
                write.advance(DurabilityEvent::Enqueued);
            }
            EnqueueOutcome::Deferred => {
                write.advance(DurabilityEvent::Enqueued);
                debug!("Storage: retry queue full, {} deferred", write.key);
            }
            EnqueueOutcome::Closed => {
                debug!("Storage: replication closed, {} left for next run", write.key);
            }
        }
    }
}

impl<L: LocalStorePort> RecordSink for DualWriter<L> {
    fn write(&self, record: Record) -> Result<RecordKey, StorageError> {
        let mut write = WriteRecord::new(record);
        {
            let mut local = self.lock()?;
            if let Err(e) = local.append(write.key, &write.record) {
                error!(
                    "Storage: local write to {} failed: {}",
                    write.record.table().as_str(),
                    e
                );
                return Err(e);
            }
        }
        write.advance(DurabilityEvent::LocalWriteOk);
        self.hand_off(&mut write);
        debug!(
            "Storage: {} committed to {} ({:?})",
            write.key,
            write.record.table().as_str(),
            write.state
        );
        Ok(write.key)
    }

    fn backfill(
        &self,
        key: RecordKey,
        after: EmotionLabel,
        trend: EmotionTrend,
    ) -> Result<(), StorageError> {
        self.lock()?.backfill(key, after, trend)?;
        let _ = self.queue.enqueue(key);
        Ok(())
    }

    fn retract_warning(&self, key: RecordKey) -> Result<(), StorageError> {
        self.lock()?.retract_warning(key)?;
        let _ = self.queue.enqueue(key);
        Ok(())
    }
}
