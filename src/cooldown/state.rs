//! Per-category cooldown state machine.
//!
//! ```text
//!          accept(now)                until <= now
//!   Idle ──────────────▶ CoolingDown ──────────────▶ Idle
//!                          │    ▲
//!                          └────┘  same-category detection:
//!                                  discarded, timer untouched
//! ```

use crate::Timestamp;
use crate::perception::FoodCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownPhase {
    Idle,
    CoolingDown { until: Timestamp },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownState {
    pub category: FoodCategory,
    /// Acceptance time of the last committed event.
    pub last_committed_at: Option<Timestamp>,
    pub phase: CooldownPhase,
}

impl CooldownState {
    pub const fn new(category: FoodCategory) -> Self {
        Self {
            category,
            last_committed_at: None,
            phase: CooldownPhase::Idle,
        }
    }

    /// Milliseconds left in the window at `now`; 0 when idle or elapsed.
    pub fn remaining_ms(&self, now: Timestamp) -> u64 {
        match self.phase {
            CooldownPhase::Idle => 0,
            CooldownPhase::CoolingDown { until } => until.saturating_sub(now),
        }
    }

    pub fn is_cooling_down(&self, now: Timestamp) -> bool {
        self.remaining_ms(now) > 0
    }

    /// Start a cooldown window of `cooldown_ms` at `now`.
    pub fn commit(&mut self, now: Timestamp, cooldown_ms: u64) {
        self.last_committed_at = Some(now);
        self.phase = CooldownPhase::CoolingDown {
            until: now.saturating_add(cooldown_ms),
        };
    }

    /// Return to `Idle` if the window has elapsed.  Returns `true` on the
    /// transition.
    pub fn expire(&mut self, now: Timestamp) -> bool {
        match self.phase {
            CooldownPhase::CoolingDown { until } if until <= now => {
                self.phase = CooldownPhase::Idle;
                true
            }
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        self.phase = CooldownPhase::Idle;
    }
}
