//! Mock adapters for integration tests.
//!
//! Records every actuator command and every emitted event so tests can
//! assert on the full history without a board, a camera or a network.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tempfile::TempDir;

use smartsnack::Timestamp;
use smartsnack::app::commands::PerceptionFrame;
use smartsnack::app::events::AppEvent;
use smartsnack::app::ports::{ActuatorCommand, ActuatorPort, ClockPort, EventSink, StorageError};
use smartsnack::error::ActuatorError;
use smartsnack::perception::emotion::{EmotionLabel, EmotionSample, EmotionTrend};
use smartsnack::perception::{BoundingBox, Detection, DetectionSource, FoodCategory};
use smartsnack::storage::journal::FileJournal;
use smartsnack::storage::record::{Record, RecordKey};
use smartsnack::storage::replicator::ReplicationQueue;
use smartsnack::storage::{DualWriter, RecordSink};

// ── MockBoard ─────────────────────────────────────────────────

/// Acknowledges every command unless told to go silent.
#[derive(Default)]
pub struct MockBoard {
    pub calls: Vec<ActuatorCommand>,
    pub silent: bool,
}

#[allow(dead_code)]
impl MockBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn silent() -> Self {
        Self {
            calls: Vec::new(),
            silent: true,
        }
    }

    pub fn count(&self, command: ActuatorCommand) -> usize {
        self.calls.iter().filter(|c| **c == command).count()
    }
}

impl ActuatorPort for MockBoard {
    fn send(&mut self, command: ActuatorCommand) -> Result<(), ActuatorError> {
        self.calls.push(command);
        if self.silent {
            Err(ActuatorError::NoAck)
        } else {
            Ok(())
        }
    }
}

// ── RecordingSink ─────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSink {
    pub events: Vec<AppEvent>,
}

#[allow(dead_code)]
impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed(&self) -> Vec<RecordKey> {
        self.events
            .iter()
            .filter_map(|e| match e {
                AppEvent::EventCommitted { key, .. } => Some(*key),
                _ => None,
            })
            .collect()
    }

    pub fn suppressed(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, AppEvent::DetectionSuppressed { .. }))
            .count()
    }

    pub fn backfilled(&self) -> Vec<(RecordKey, EmotionTrend)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                AppEvent::EmotionBackfilled { key, trend } => Some((*key, *trend)),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: &AppEvent) {
        self.events.push(event.clone());
    }
}

// ── FixedClock ────────────────────────────────────────────────

/// Manually advanced clock; clones share the same time.
#[derive(Clone, Default)]
pub struct FixedClock(Arc<AtomicU64>);

#[allow(dead_code)]
impl FixedClock {
    pub fn at(t: Timestamp) -> Self {
        Self(Arc::new(AtomicU64::new(t)))
    }

    pub fn set(&self, t: Timestamp) {
        self.0.store(t, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl ClockPort for FixedClock {
    fn now(&self) -> Timestamp {
        self.0.load(Ordering::SeqCst)
    }

    fn local_hour(&self, at: Timestamp) -> u8 {
        ((at / 3_600_000) % 24) as u8
    }
}

// ── Failing stores ────────────────────────────────────────────

fn disk_full() -> StorageError {
    StorageError::Io {
        op: "write",
        kind: std::io::ErrorKind::StorageFull,
    }
}

/// A record sink whose disk is gone.
pub struct BrokenDisk;

impl RecordSink for BrokenDisk {
    fn write(&self, _record: Record) -> Result<RecordKey, StorageError> {
        Err(disk_full())
    }

    fn backfill(
        &self,
        _key: RecordKey,
        _after: EmotionLabel,
        _trend: EmotionTrend,
    ) -> Result<(), StorageError> {
        Err(disk_full())
    }

    fn retract_warning(&self, _key: RecordKey) -> Result<(), StorageError> {
        Err(disk_full())
    }
}

/// Wraps a real sink; the next `n` writes fail as if the disk were full.
pub struct FlakyDisk<S> {
    pub inner: S,
    failing: AtomicUsize,
}

#[allow(dead_code)]
impl<S> FlakyDisk<S> {
    pub fn new(inner: S, failing: usize) -> Self {
        Self {
            inner,
            failing: AtomicUsize::new(failing),
        }
    }

    fn check(&self) -> Result<(), StorageError> {
        let left = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match left {
            Ok(_) => Err(disk_full()),
            Err(_) => Ok(()),
        }
    }
}

impl<S: RecordSink> RecordSink for FlakyDisk<S> {
    fn write(&self, record: Record) -> Result<RecordKey, StorageError> {
        self.check()?;
        self.inner.write(record)
    }

    fn backfill(
        &self,
        key: RecordKey,
        after: EmotionLabel,
        trend: EmotionTrend,
    ) -> Result<(), StorageError> {
        self.check()?;
        self.inner.backfill(key, after, trend)
    }

    fn retract_warning(&self, key: RecordKey) -> Result<(), StorageError> {
        self.check()?;
        self.inner.retract_warning(key)
    }
}

// ── Fixtures ──────────────────────────────────────────────────

/// A fresh journal-backed writer with a queue of `capacity`.  The journal
/// lives in the returned directory, which is removed when dropped.
pub fn fresh_writer(capacity: usize) -> (DualWriter<FileJournal>, TempDir) {
    let dir = tempfile::tempdir().expect("temp dir");
    let journal = FileJournal::open(dir.path().join("smartsnack.journal"), false).expect("open journal");
    let queue = Arc::new(ReplicationQueue::new(capacity));
    (DualWriter::new(Arc::new(Mutex::new(journal)), queue), dir)
}

pub fn det(category: FoodCategory, confidence: f32, source: DetectionSource, x: f32) -> Detection {
    Detection::new(
        category,
        BoundingBox::new(x, 0.0, x + 50.0, 50.0),
        confidence,
        source,
    )
}

pub fn mood(label: EmotionLabel, at: Timestamp) -> EmotionSample {
    EmotionSample {
        label,
        confidence: 0.8,
        timestamp: at,
    }
}

pub fn frame(
    seq: u64,
    at: Timestamp,
    narrow: Vec<Detection>,
    general: Vec<Detection>,
    emotion: Option<EmotionSample>,
) -> PerceptionFrame {
    PerceptionFrame {
        seq,
        captured_at: at,
        narrow,
        general,
        emotion,
    }
}
