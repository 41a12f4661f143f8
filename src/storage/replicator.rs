//! Remote replication: the bounded retry queue and its single consumer.
//!
//! ```text
//!  DualWriter ─┐ enqueue(key)
//!  DualWriter ─┼──────────────▶ ReplicationQueue ──take_due──▶ Replicator ──upsert──▶ remote
//!  DualWriter ─┘   (MPSC, bounded)      ▲                          │
//!                                        └──── requeue w/ backoff ──┘
//! ```
//!
//! The queue only carries keys.  The replicator reads the current version of
//! each record back from the local store, so nothing reaches the remote that
//! is not already local.  When the queue is full, keys are deferred: the
//! records stay unreplicated in the journal and are re-scanned once room
//! frees up.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_io_mini::Timer;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use futures_lite::future;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::Timestamp;
use crate::app::ports::{ClockPort, LocalStorePort, RemoteStorePort};
use crate::config::StorageConfig;
use crate::storage::record::{DurabilityEvent, DurabilityState, RecordKey};

/// Idle wait when nothing is scheduled.
const IDLE_WAIT: Duration = Duration::from_secs(1);

// ───────────────────────────────────────────────────────────────
// Retry policy
// ───────────────────────────────────────────────────────────────

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            base_ms: config.retry_base_ms,
            max_ms: config.retry_max_ms,
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay_ms(&self, failures: u32) -> u64 {
        if failures == 0 {
            return 0;
        }
        let shift = (failures - 1).min(32);
        self.base_ms.saturating_mul(1u64 << shift).min(self.max_ms)
    }
}

// ───────────────────────────────────────────────────────────────
// Queue
// ───────────────────────────────────────────────────────────────

/// One key awaiting replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEntry {
    pub key: RecordKey,
    /// Consecutive failed attempts.
    pub attempts: u32,
    pub next_attempt_at: Timestamp,
}

/// Result of [`ReplicationQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Key was already waiting; the replicator will read the latest version.
    AlreadyQueued,
    /// Queue full: the record stays unreplicated in the journal and is
    /// picked up by a later re-scan.
    Deferred,
    /// Replication has shut down: the record is left for the next run.
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<RetryEntry>,
    /// Keys between enqueue and remote commit.
    states: HashMap<RecordKey, DurabilityState>,
    deferred: bool,
    closed: bool,
}

impl QueueState {
    fn transition(&mut self, key: RecordKey, event: DurabilityEvent) {
        let current = self
            .states
            .get(&key)
            .copied()
            .unwrap_or(DurabilityState::LocalCommitted);
        match current.next(event) {
            Some(DurabilityState::RemoteCommitted) => {
                self.states.remove(&key);
            }
            Some(next) => {
                self.states.insert(key, next);
            }
            None => warn!(
                "Replication: ignoring {:?} for {} in {:?}",
                event, key, current
            ),
        }
    }
}

/// Bounded multi-producer / single-consumer queue of keys to replicate.
pub struct ReplicationQueue {
    state: Mutex<QueueState>,
    wake: Signal<CriticalSectionRawMutex, ()>,
    capacity: usize,
}

impl ReplicationQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            wake: Signal::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Queue state stays consistent across a panicking producer: every
        // mutation is a single insert/remove.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `key` for immediate replication.  Never blocks on the network.
    pub fn enqueue(&self, key: RecordKey) -> EnqueueOutcome {
        let outcome = {
            let mut st = self.lock();
            if st.closed {
                EnqueueOutcome::Closed
            } else if st.entries.iter().any(|e| e.key == key) {
                st.transition(key, DurabilityEvent::Enqueued);
                EnqueueOutcome::AlreadyQueued
            } else if st.entries.len() >= self.capacity {
                st.deferred = true;
                st.transition(key, DurabilityEvent::Enqueued);
                EnqueueOutcome::Deferred
            } else {
                st.entries.push_back(RetryEntry {
                    key,
                    attempts: 0,
                    next_attempt_at: 0,
                });
                st.transition(key, DurabilityEvent::Enqueued);
                EnqueueOutcome::Queued
            }
        };
        if outcome == EnqueueOutcome::Queued {
            self.wake.signal(());
        }
        outcome
    }

    /// Tracked state of a key still in flight.  `None` once committed or
    /// never seen.
    pub fn state_of(&self, key: RecordKey) -> Option<DurabilityState> {
        self.lock().states.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting keys and wake the consumer so it can wind down.
    pub fn close(&self) {
        self.lock().closed = true;
        self.wake.signal(());
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn take_due(&self, now: Timestamp) -> Vec<RetryEntry> {
        let mut st = self.lock();
        let mut due = Vec::new();
        let mut waiting = VecDeque::with_capacity(st.entries.len());
        while let Some(entry) = st.entries.pop_front() {
            if entry.next_attempt_at <= now {
                due.push(entry);
            } else {
                waiting.push_back(entry);
            }
        }
        st.entries = waiting;
        for entry in &due {
            if st.states.get(&entry.key) == Some(&DurabilityState::RemoteFailedQueued) {
                st.transition(entry.key, DurabilityEvent::RetryDue);
            }
        }
        due
    }

    /// Put a failed entry back with its backoff.  If a producer queued the
    /// key again while it was in flight, that entry takes the backoff
    /// instead of gaining a twin.
    fn requeue_failed(&self, entry: RetryEntry) {
        let mut st = self.lock();
        st.transition(entry.key, DurabilityEvent::RemoteWriteFailed);
        match st.entries.iter_mut().find(|e| e.key == entry.key) {
            Some(queued) => *queued = entry,
            None => st.entries.push_back(entry),
        }
    }

    /// Put a key straight back (newer local version appeared mid-flight).
    /// A no-op if a producer already queued it again.
    fn requeue_now(&self, key: RecordKey) {
        let mut st = self.lock();
        if st.entries.iter().any(|e| e.key == key) {
            return;
        }
        st.entries.push_back(RetryEntry {
            key,
            attempts: 0,
            next_attempt_at: 0,
        });
    }

    fn committed(&self, key: RecordKey) {
        self.lock().transition(key, DurabilityEvent::RemoteWriteOk);
    }

    fn forget(&self, key: RecordKey) {
        self.lock().states.remove(&key);
    }

    fn take_deferred(&self) -> bool {
        let mut st = self.lock();
        if st.deferred && st.entries.len() < self.capacity {
            st.deferred = false;
            true
        } else {
            false
        }
    }

    fn next_due(&self) -> Option<Timestamp> {
        self.lock().entries.iter().map(|e| e.next_attempt_at).min()
    }

    fn snapshot(&self) -> Vec<RetryEntry> {
        self.lock().entries.iter().copied().collect()
    }
}

// ───────────────────────────────────────────────────────────────
// Retry-state snapshot
// ───────────────────────────────────────────────────────────────

const SNAPSHOT_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RetrySnapshot {
    version: u8,
    entries: Vec<RetryEntry>,
}

fn load_snapshot(path: &Path) -> Vec<RetryEntry> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("Replication: cannot read {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    match postcard::from_bytes::<RetrySnapshot>(&bytes) {
        Ok(s) if s.version == SNAPSHOT_VERSION => s.entries,
        Ok(s) => {
            warn!("Replication: snapshot version {} unsupported", s.version);
            Vec::new()
        }
        Err(e) => {
            warn!("Replication: snapshot corrupted ({}), ignoring", e);
            Vec::new()
        }
    }
}

fn save_snapshot(path: &Path, entries: Vec<RetryEntry>) -> std::io::Result<()> {
    let snapshot = RetrySnapshot {
        version: SNAPSHOT_VERSION,
        entries,
    };
    let bytes = postcard::to_allocvec(&snapshot)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)
}

// ───────────────────────────────────────────────────────────────
// Replicator
// ───────────────────────────────────────────────────────────────

/// What one [`Replicator::step`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    pub attempted: usize,
    pub committed: usize,
    pub failed: usize,
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicatorStats {
    pub committed: u64,
    pub failures: u64,
    pub rescans: u64,
}

/// Single consumer of the [`ReplicationQueue`].
pub struct Replicator<L, R> {
    local: Arc<Mutex<L>>,
    remote: R,
    queue: Arc<ReplicationQueue>,
    policy: RetryPolicy,
    state_path: Option<PathBuf>,
    stats: ReplicatorStats,
}

impl<L: LocalStorePort, R: RemoteStorePort> Replicator<L, R> {
    pub fn new(
        local: Arc<Mutex<L>>,
        remote: R,
        queue: Arc<ReplicationQueue>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            local,
            remote,
            queue,
            policy,
            state_path: None,
            stats: ReplicatorStats::default(),
        }
    }

    /// Persist retry bookkeeping at `path` on close, and restore it on
    /// [`recover`](Self::recover).
    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    pub fn stats(&self) -> ReplicatorStats {
        self.stats
    }

    /// Re-queue everything the journal says is not on the remote yet,
    /// carrying attempt counts over from the last snapshot.  Returns the
    /// number of keys queued or deferred.
    pub fn recover(&mut self, now: Timestamp) -> usize {
        let previous: HashMap<RecordKey, RetryEntry> = self
            .state_path
            .as_deref()
            .map(load_snapshot)
            .unwrap_or_default()
            .into_iter()
            .map(|e| (e.key, e))
            .collect();

        let pending = lock_local(&self.local).unreplicated();
        let count = pending.len();
        for key in pending {
            if self.queue.enqueue(key) != EnqueueOutcome::Queued {
                continue;
            }
            if let Some(prev) = previous.get(&key).filter(|p| p.attempts > 0) {
                let mut st = self.queue.lock();
                if let Some(entry) = st.entries.iter_mut().find(|e| e.key == key) {
                    entry.attempts = prev.attempts;
                    entry.next_attempt_at = now;
                }
            }
        }
        if count > 0 {
            info!(
                "Replication: recovered {} unreplicated record(s) ({} with retry history)",
                count,
                previous.len()
            );
        }
        count
    }

    /// Attempt every due entry once.  Synchronous; drives the state machine
    /// for tests and for the threaded [`run`](Self::run) loop.
    pub fn step(&mut self, now: Timestamp) -> StepReport {
        let mut report = StepReport::default();

        if self.queue.take_deferred() {
            self.rescan();
        }

        for mut entry in self.queue.take_due(now) {
            let Some(stored) = lock_local(&self.local).get(entry.key) else {
                error!("Replication: {} queued but missing locally", entry.key);
                self.queue.forget(entry.key);
                continue;
            };
            if stored.is_replicated() {
                self.queue.forget(entry.key);
                continue;
            }

            report.attempted += 1;
            match self.remote.upsert(entry.key, &stored.record) {
                Ok(()) => {
                    report.committed += 1;
                    self.stats.committed += 1;
                    let newer = {
                        let mut local = lock_local(&self.local);
                        if let Err(e) = local.mark_replicated(entry.key, stored.version) {
                            // The remote write is idempotent; a lost mark
                            // only means a re-send on the next run.
                            error!("Replication: cannot mark {} replicated: {}", entry.key, e);
                        }
                        local
                            .get(entry.key)
                            .is_some_and(|s| s.version > stored.version)
                    };
                    if newer {
                        self.queue.requeue_now(entry.key);
                    } else {
                        self.queue.committed(entry.key);
                    }
                    debug!(
                        "Replication: {} v{} committed ({})",
                        entry.key,
                        stored.version,
                        stored.record.table().as_str()
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    self.stats.failures += 1;
                    entry.attempts = entry.attempts.saturating_add(1);
                    let delay = self.policy.delay_ms(entry.attempts);
                    entry.next_attempt_at = now.saturating_add(delay);
                    warn!(
                        "Replication: {} attempt {} failed ({}), retry in {} ms",
                        entry.key, entry.attempts, e, delay
                    );
                    self.queue.requeue_failed(entry);
                }
            }
        }
        report
    }

    /// Pull deferred keys back in from the journal.
    fn rescan(&mut self) {
        self.stats.rescans += 1;
        let pending = lock_local(&self.local).unreplicated();
        let mut queued = 0;
        for key in pending {
            match self.queue.enqueue(key) {
                EnqueueOutcome::Queued => queued += 1,
                EnqueueOutcome::AlreadyQueued => {}
                EnqueueOutcome::Deferred | EnqueueOutcome::Closed => break,
            }
        }
        info!("Replication: re-scan queued {} deferred record(s)", queued);
    }

    /// Consumer loop.  Runs until the queue is closed, then makes one last
    /// pass and persists the remaining retry state.
    pub fn run<C: ClockPort>(mut self, clock: &C) -> ReplicatorStats {
        info!("Replication: started (queue capacity {})", self.queue.capacity());
        future::block_on(async {
            while !self.queue.is_closed() {
                let now = clock.now();
                self.step(now);
                let wait = self
                    .queue
                    .next_due()
                    .map(|due| Duration::from_millis(due.saturating_sub(now)))
                    .map_or(IDLE_WAIT, |d| d.min(IDLE_WAIT));
                future::or(
                    async {
                        self.queue.wake.wait().await;
                    },
                    async {
                        Timer::after(wait).await;
                    },
                )
                .await;
            }
        });
        self.close(clock.now())
    }

    /// Final flush attempt, then snapshot whatever is still queued.
    pub fn close(mut self, now: Timestamp) -> ReplicatorStats {
        let report = self.step(now);
        let remaining = self.queue.snapshot();
        if let Some(path) = &self.state_path {
            match save_snapshot(path, remaining.clone()) {
                Ok(()) => debug!("Replication: retry state saved to {}", path.display()),
                Err(e) => warn!("Replication: cannot save retry state: {}", e),
            }
        }
        info!(
            "Replication: closed (final pass committed {}, {} left for next run)",
            report.committed,
            remaining.len()
        );
        self.stats
    }
}

fn lock_local<L>(local: &Mutex<L>) -> MutexGuard<'_, L> {
    local.lock().unwrap_or_else(PoisonError::into_inner)
}
