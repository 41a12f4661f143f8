//! Outbound application events.
//!
//! The [`AppService`](super::service::AppService) emits these through the
//! [`EventSink`](super::ports::EventSink) port.  Adapters on the other
//! side decide what to do with them (log lines, a dashboard feed, test
//! recorders).

use crate::app::ports::{ActuatorCommand, StorageError};
use crate::diagnostics::SessionStats;
use crate::error::ActuatorError;
use crate::perception::emotion::{EmotionLabel, EmotionTrend};
use crate::perception::{FoodCategory, HealthTag};
use crate::storage::record::{RecordKey, Table};

/// Structured events emitted by the application core.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// The service has started.
    Started { categories: usize, backfill_delay_secs: u32 },

    /// One frame went through fusion.
    FrameFused { kept: usize, suppressed: usize, malformed: usize },

    /// The smoothed mood changed.
    EmotionChanged { from: EmotionLabel, to: EmotionLabel },

    /// A food event is durable locally and queued for replication.
    EventCommitted {
        key: RecordKey,
        category: FoodCategory,
        health: HealthTag,
        warning_triggered: bool,
    },

    /// The board never acknowledged the warning of a committed event; the
    /// stored flag was cleared.
    WarningRetracted { key: RecordKey },

    /// A kept detection fell inside its category's cooldown.
    DetectionSuppressed { category: FoodCategory, remaining_ms: u64 },

    /// A category returned to idle.
    CooldownExpired(FoodCategory),

    /// The feedback board did not acknowledge a command.
    ActuationFailed { command: ActuatorCommand, error: ActuatorError },

    /// `emotion_after` was written for a committed event.
    EmotionBackfilled { key: RecordKey, trend: EmotionTrend },

    /// Deferred reads dropped at shutdown.
    BackfillsAbandoned(usize),

    /// A periodic sample row was committed.
    SampleLogged { table: Table, key: RecordKey },

    /// A local write failed.  Retryable failures keep the record queued
    /// in memory until the journal accepts it.
    Degraded(StorageError),

    /// Final counters at shutdown.
    ShutdownSummary(SessionStats),
}
