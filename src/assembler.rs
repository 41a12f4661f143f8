//! Food event assembly and deferred emotion backfill.
//!
//! ```text
//!  Accepted ──assemble──▶ FoodEvent{emotion_before = mood now}
//!                              │ write → key
//!                              ▼
//!                  schedule_backfill(key, before, now + delay)
//!                              │
//!        due(now, mood) ◀──────┘   coordinator tick
//!              │
//!              ▼
//!   (key, emotion_after = mood then, trend by valence)
//! ```
//!
//! The assembler never touches storage; the coordinator persists the
//! event and the backfills it hands out.

use std::collections::VecDeque;

use log::{debug, info};

use crate::Timestamp;
use crate::config::FoodProfile;
use crate::perception::Detection;
use crate::perception::emotion::{EmotionLabel, EmotionTrend, SmoothedEmotion};
use crate::storage::record::{FoodEvent, RecordKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingBackfill {
    key: RecordKey,
    before: EmotionLabel,
    due_at: Timestamp,
}

/// A backfill ready to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueBackfill {
    pub key: RecordKey,
    pub after: EmotionLabel,
    pub trend: EmotionTrend,
}

pub struct EventAssembler {
    backfill_delay_ms: u64,
    /// Ordered by `due_at`: the delay is constant and events are
    /// scheduled in commit order.
    pending: VecDeque<PendingBackfill>,
}

impl EventAssembler {
    pub fn new(backfill_delay_secs: u32) -> Self {
        Self {
            backfill_delay_ms: u64::from(backfill_delay_secs) * 1_000,
            pending: VecDeque::new(),
        }
    }

    /// Build the event for an accepted detection.  `emotion_after` and
    /// `emotion_trend` start as unknown.
    pub fn assemble(
        &self,
        detection: &Detection,
        profile: &FoodProfile,
        at: Timestamp,
        mood: SmoothedEmotion,
        warning_triggered: bool,
    ) -> FoodEvent {
        FoodEvent {
            timestamp: at,
            category: detection.category,
            health: profile.health,
            calories: profile.calories,
            detection_confidence: detection.confidence,
            detection_source: detection.source,
            emotion_before: mood.label,
            emotion_after: EmotionLabel::Unknown,
            emotion_trend: EmotionTrend::Unknown,
            warning_triggered,
        }
    }

    /// Register the deferred read for a committed event.
    pub fn schedule_backfill(&mut self, key: RecordKey, event: &FoodEvent) {
        let due_at = event.timestamp.saturating_add(self.backfill_delay_ms);
        self.pending.push_back(PendingBackfill {
            key,
            before: event.emotion_before,
            due_at,
        });
        debug!("Assembler: backfill for {} due at {}", key, due_at);
    }

    /// Pop every backfill due at `now`, reading `emotion_after` from the
    /// current mood.
    pub fn due(&mut self, now: Timestamp, mood: SmoothedEmotion) -> Vec<DueBackfill> {
        let mut ready = Vec::new();
        while let Some(p) = self.pending.front().copied() {
            if p.due_at > now {
                break;
            }
            self.pending.pop_front();
            ready.push(DueBackfill {
                key: p.key,
                after: mood.label,
                trend: EmotionTrend::between(p.before, mood.label),
            });
        }
        ready
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop all pending backfills; those events keep unknown
    /// `emotion_after`.  Returns how many were dropped.
    pub fn abandon(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        if n > 0 {
            info!("Assembler: abandoned {} pending backfills", n);
        }
        n
    }
}
