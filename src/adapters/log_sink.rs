//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by writing structured application events to
//! the `log` facade (stderr via `env_logger` in production).  A dashboard
//! feed would implement the same trait.

use log::{debug, error, info, warn};

use crate::app::events::AppEvent;
use crate::app::ports::EventSink;

/// Adapter that logs every [`AppEvent`] as a `TAG | key=value` line.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LogEventSink {
    fn emit(&mut self, event: &AppEvent) {
        match event {
            AppEvent::Started {
                categories,
                backfill_delay_secs,
            } => {
                info!(
                    "START | categories={} backfill_delay={}s",
                    categories, backfill_delay_secs
                );
            }
            AppEvent::FrameFused {
                kept,
                suppressed,
                malformed,
            } => {
                // One line per frame is too chatty for info.
                debug!(
                    "FUSE  | kept={} suppressed={} malformed={}",
                    kept, suppressed, malformed
                );
            }
            AppEvent::EmotionChanged { from, to } => {
                info!("MOOD  | {} -> {}", from, to);
            }
            AppEvent::EventCommitted {
                key,
                category,
                health,
                warning_triggered,
            } => {
                info!(
                    "EVENT | key={} food={} health={} warning={}",
                    key,
                    category,
                    health.as_str(),
                    warning_triggered
                );
            }
            AppEvent::WarningRetracted { key } => {
                warn!("EVENT | key={} warning not acknowledged, flag cleared", key);
            }
            AppEvent::DetectionSuppressed {
                category,
                remaining_ms,
            } => {
                debug!("COOL  | {} suppressed, {}ms left", category, remaining_ms);
            }
            AppEvent::CooldownExpired(category) => {
                debug!("COOL  | {} idle", category);
            }
            AppEvent::ActuationFailed { command, error } => {
                warn!("ACT   | {} failed: {}", command.as_str(), error);
            }
            AppEvent::EmotionBackfilled { key, trend } => {
                info!("AFTER | key={} trend={}", key, trend.as_str());
            }
            AppEvent::BackfillsAbandoned(n) => {
                warn!("AFTER | {} pending backfill(s) abandoned", n);
            }
            AppEvent::SampleLogged { table, key } => {
                debug!("LOG   | table={} key={}", table.as_str(), key);
            }
            AppEvent::Degraded(e) => {
                error!("STORE | local write failed: {}", e);
            }
            AppEvent::ShutdownSummary(stats) => {
                info!(
                    "STOP  | events={} healthy={} unhealthy={} warnings={} suppressed={} \
                     backfilled={} frames={} dropped={} unwritten={}",
                    stats.total,
                    stats.healthy,
                    stats.unhealthy,
                    stats.warnings,
                    stats.suppressed,
                    stats.backfilled,
                    stats.frames,
                    stats.dropped_frames,
                    stats.unwritten,
                );
            }
        }
    }
}
