//! Session statistics and crash diagnostics.
//!
//! [`SessionStats`] is owned by the coordinator and updated as frames are
//! fused and events committed.  It is emitted once at shutdown through
//! the event sink and printed by the binary.
//!
//! [`install_panic_handler`] routes panics through the `log` facade so a
//! crash in any producer thread lands in the same log stream as the rest
//! of the pipeline.

use serde::{Deserialize, Serialize};

use crate::Timestamp;
use crate::perception::HealthTag;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub started_at: Timestamp,
    /// Frames the coordinator fused.
    pub frames: u64,
    /// Frames dropped by the vision loop because the coordinator queue
    /// was full.
    pub dropped_frames: u64,
    /// Committed food events.
    pub total: u64,
    pub healthy: u64,
    pub unhealthy: u64,
    /// Warnings fully acknowledged by the board.
    pub warnings: u64,
    /// Kept detections discarded by an active cooldown.
    pub suppressed: u64,
    /// Detections dropped as malformed during fusion.
    pub malformed: u64,
    pub backfilled: u64,
    pub abandoned_backfills: u64,
    pub samples_logged: u64,
    /// Records still waiting for the local journal at shutdown.
    pub unwritten: u64,
}

impl SessionStats {
    pub fn new(started_at: Timestamp) -> Self {
        Self {
            started_at,
            ..Self::default()
        }
    }

    pub fn record_event(&mut self, health: HealthTag, warning_triggered: bool) {
        self.total += 1;
        match health {
            HealthTag::Healthy => self.healthy += 1,
            HealthTag::Unhealthy => self.unhealthy += 1,
        }
        if warning_triggered {
            self.warnings += 1;
        }
    }

    /// The board did not acknowledge a warning already counted.
    pub fn retract_warning(&mut self) {
        self.warnings = self.warnings.saturating_sub(1);
    }

    pub fn duration_secs(&self, now: Timestamp) -> u64 {
        now.saturating_sub(self.started_at) / 1_000
    }

    /// One-line summary, e.g. for the shutdown banner.
    pub fn summary(&self, now: Timestamp) -> String {
        format!(
            "duration={}s | events={} (healthy={} unhealthy={} warned={}) | \
             frames={} dropped={} | suppressed={} malformed={} | \
             backfilled={} abandoned={} | samples={} unwritten={}",
            self.duration_secs(now),
            self.total,
            self.healthy,
            self.unhealthy,
            self.warnings,
            self.frames,
            self.dropped_frames,
            self.suppressed,
            self.malformed,
            self.backfilled,
            self.abandoned_backfills,
            self.samples_logged,
            self.unwritten,
        )
    }
}

/// Install a panic hook that logs the panic message and location before
/// the default hook runs.
pub fn install_panic_handler() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let reason = if let Some(msg) = info.payload().downcast_ref::<&str>() {
            *msg
        } else if let Some(msg) = info.payload().downcast_ref::<String>() {
            msg.as_str()
        } else {
            "unknown panic"
        };
        let thread = std::thread::current();
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        log::error!(
            "PANIC in '{}' at {}: {}",
            thread.name().unwrap_or("unnamed"),
            location,
            reason
        );
        default_hook(info);
    }));
}
