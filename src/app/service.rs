//! Application service: the hexagonal core.
//!
//! [`AppService`] owns the fusion engine, the mood smoother, the cooldown
//! controller and the event assembler.  It runs on the coordinator thread
//! only, so every piece of domain state has exactly one writer.  All I/O
//! flows through port traits injected at call sites.
//!
//! ```text
//!  AppCommand ──▶ ┌──────────────────────────────┐ ──▶ EventSink
//!                 │          AppService           │
//! ActuatorPort ◀──│ Fusion · Mood · Cooldown ·    │──▶ RecordSink
//!                 │ Assembler · Backlog           │    (local first)
//!                 └──────────────────────────────┘
//! ```
//!
//! An accepted detection is written before the board is driven.  A board
//! that never acknowledges a warning clears the flag on the stored event
//! afterwards.  Writes that fail with a retryable error stay in the
//! backlog, in order, and are retried on every tick.

use std::collections::VecDeque;

use log::{debug, error, info, warn};

use crate::Timestamp;
use crate::assembler::{DueBackfill, EventAssembler};
use crate::config::SystemConfig;
use crate::cooldown::{ActuationFailure, CooldownController, Feedback, Verdict};
use crate::diagnostics::SessionStats;
use crate::perception::FoodCategory;
use crate::perception::emotion::{EmotionSmoother, SmoothedEmotion};
use crate::perception::fusion::FusionEngine;
use crate::storage::RecordSink;
use crate::storage::record::{EmotionRow, Record, RecordKey};

use super::commands::{AppCommand, PerceptionFrame};
use super::events::AppEvent;
use super::ports::{ActuatorPort, EventSink, StorageError};

/// A write the journal has not accepted yet.
#[derive(Debug, Clone, PartialEq)]
enum Unwritten {
    Record(Record),
    Backfill(DueBackfill),
}

// ───────────────────────────────────────────────────────────────
// AppService
// ───────────────────────────────────────────────────────────────

/// The application service orchestrates all domain logic.
pub struct AppService {
    config: SystemConfig,
    fusion: FusionEngine,
    mood: EmotionSmoother,
    cooldown: CooldownController,
    assembler: EventAssembler,
    backlog: VecDeque<Unwritten>,
    stats: SessionStats,
}

impl AppService {
    /// Construct the service from a validated configuration.
    pub fn new(config: SystemConfig) -> Self {
        Self {
            fusion: FusionEngine::new(&config.fusion),
            mood: EmotionSmoother::new(),
            cooldown: CooldownController::new(&config),
            assembler: EventAssembler::new(config.emotion.backfill_delay_secs),
            backlog: VecDeque::new(),
            stats: SessionStats::default(),
            config,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────

    pub fn start(&mut self, now: Timestamp, sink: &mut impl EventSink) {
        self.stats = SessionStats::new(now);
        sink.emit(&AppEvent::Started {
            categories: self.config.foods.len(),
            backfill_delay_secs: self.config.emotion.backfill_delay_secs,
        });
        info!(
            "AppService started ({} food profiles)",
            self.config.foods.len()
        );
    }

    /// Abandon pending backfills and park the feedback board.  Returns the
    /// final session counters.  Call [`flush`](Self::flush) first so the
    /// backlog gets a last chance.
    pub fn shutdown(
        &mut self,
        actuator: &mut impl ActuatorPort,
        sink: &mut impl EventSink,
    ) -> SessionStats {
        let abandoned = self.assembler.abandon();
        if abandoned > 0 {
            self.stats.abandoned_backfills += abandoned as u64;
            sink.emit(&AppEvent::BackfillsAbandoned(abandoned));
        }
        if !self.backlog.is_empty() {
            error!(
                "AppService: {} write(s) never reached the journal",
                self.backlog.len()
            );
            self.stats.unwritten = self.backlog.len() as u64;
        }
        let failures = self.cooldown.rest(actuator);
        emit_failures(&failures, sink);
        sink.emit(&AppEvent::ShutdownSummary(self.stats));
        info!("AppService stopped");
        self.stats
    }

    // ── Command handling ──────────────────────────────────────

    /// Process one command from the coordinator inbox.
    ///
    /// `hour` is the local hour of the command's timestamp (warning
    /// window); `None` when the wall clock is unknown.
    ///
    /// Only local storage failures are returned.  A retryable one leaves
    /// the record in the backlog; the caller decides whether to go on.
    pub fn handle_command(
        &mut self,
        cmd: AppCommand,
        hour: Option<u8>,
        actuator: &mut impl ActuatorPort,
        store: &impl RecordSink,
        sink: &mut impl EventSink,
    ) -> Result<(), StorageError> {
        match cmd {
            AppCommand::Frame(frame) => self.process_frame(frame, hour, actuator, store, sink),
            AppCommand::LogEmotion { at } => self.log_emotion(at, store, sink),
            AppCommand::ResetCooldowns => {
                self.cooldown.reset_all();
                Ok(())
            }
            AppCommand::ResetEmotion => {
                self.mood.reset();
                info!("Mood smoothing window reset");
                Ok(())
            }
            AppCommand::Shutdown => {
                // Handled by the coordinator loop, not the service.
                Ok(())
            }
        }
    }

    /// Fuse one frame, update the mood cursor, and commit every accepted
    /// detection.
    pub fn process_frame(
        &mut self,
        frame: PerceptionFrame,
        hour: Option<u8>,
        actuator: &mut impl ActuatorPort,
        store: &impl RecordSink,
        sink: &mut impl EventSink,
    ) -> Result<(), StorageError> {
        let now = frame.captured_at;

        if let Some(sample) = frame.emotion {
            let from = self.mood.current().label;
            if self.mood.observe(sample) {
                sink.emit(&AppEvent::EmotionChanged {
                    from,
                    to: self.mood.current().label,
                });
            }
        }

        let outcome = self.fusion.fuse(&frame.narrow, &frame.general);
        self.stats.frames += 1;
        self.stats.malformed += outcome.malformed as u64;
        sink.emit(&AppEvent::FrameFused {
            kept: outcome.kept_count(),
            suppressed: outcome.suppressed_count(),
            malformed: outcome.malformed,
        });

        let kept: Vec<_> = outcome.kept().copied().collect();
        let mut first_error = None;
        for detection in kept {
            match self.cooldown.process(&detection, now, hour) {
                Verdict::Accepted {
                    detection,
                    profile,
                    feedback,
                } => {
                    let warned = feedback == Some(Feedback::Warning);
                    let event = self.assembler.assemble(
                        &detection,
                        &profile,
                        now,
                        self.mood.current(),
                        warned,
                    );
                    self.backlog.push_back(Unwritten::Record(Record::FoodEvent(event)));
                    let written = self.flush(store, sink);

                    if let Some(feedback) = feedback {
                        let acted = self.cooldown.actuate(feedback, now, actuator);
                        emit_failures(&acted.failures, sink);
                        if warned && !acted.warning_triggered {
                            let retracted = match written {
                                Ok(Some(key)) => self.retract_written(key, store, sink),
                                _ => {
                                    self.retract_unwritten(now, event.category);
                                    Ok(())
                                }
                            };
                            if let Err(e) = retracted {
                                first_error.get_or_insert(e);
                            }
                        }
                    }
                    if let Err(e) = written {
                        first_error.get_or_insert(e);
                    }
                }
                Verdict::Suppressed { remaining_ms } => {
                    self.stats.suppressed += 1;
                    sink.emit(&AppEvent::DetectionSuppressed {
                        category: detection.category,
                        remaining_ms,
                    });
                }
                Verdict::BelowThreshold | Verdict::Uncatalogued => {
                    debug!("Frame {}: {} not eligible", frame.seq, detection.category);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Persist the current smoothed emotion.  Nothing is written while the
    /// mood is still unknown.
    pub fn log_emotion(
        &mut self,
        at: Timestamp,
        store: &impl RecordSink,
        sink: &mut impl EventSink,
    ) -> Result<(), StorageError> {
        let mood = self.mood.current();
        if mood.label.valence().is_none() {
            debug!("Emotion log skipped: mood unknown");
            return Ok(());
        }
        self.backlog.push_back(Unwritten::Record(Record::Emotion(EmotionRow {
            timestamp: at,
            emotion_class: mood.label,
            confidence: mood.confidence,
        })));
        self.flush(store, sink).map(|_| ())
    }

    // ── Backlog ───────────────────────────────────────────────

    /// Write the backlog oldest first, stopping at the first retryable
    /// failure so per-record order is kept.  Returns the key of the last
    /// record written.
    ///
    /// A write that can never succeed is dropped and reported.
    pub fn flush(
        &mut self,
        store: &impl RecordSink,
        sink: &mut impl EventSink,
    ) -> Result<Option<RecordKey>, StorageError> {
        let mut last = None;
        while let Some(next) = self.backlog.front() {
            let result = match next {
                Unwritten::Record(record) => store.write(record.clone()).map(Some),
                Unwritten::Backfill(due) => store.backfill(due.key, due.after, due.trend).map(|()| None),
            };
            match result {
                Ok(key) => {
                    if let Some(done) = self.backlog.pop_front() {
                        self.written(done, key, sink);
                    }
                    if key.is_some() {
                        last = key;
                    }
                }
                Err(StorageError::NotBackfillable) => {
                    if let Some(Unwritten::Backfill(due)) = self.backlog.pop_front() {
                        warn!("Backfill for {} skipped: already backfilled", due.key);
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        "AppService: local write failed ({}), {} write(s) held",
                        e,
                        self.backlog.len()
                    );
                    sink.emit(&AppEvent::Degraded(e.clone()));
                    return Err(e);
                }
                Err(e) => {
                    let dropped = self.backlog.pop_front();
                    error!("AppService: dropping {:?}: {}", dropped, e);
                    sink.emit(&AppEvent::Degraded(e.clone()));
                    return Err(e);
                }
            }
        }
        Ok(last)
    }

    /// Writes still waiting for the journal.
    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }

    fn written(&mut self, done: Unwritten, key: Option<RecordKey>, sink: &mut impl EventSink) {
        match (done, key) {
            (Unwritten::Record(Record::FoodEvent(event)), Some(key)) => {
                self.assembler.schedule_backfill(key, &event);
                self.stats.record_event(event.health, event.warning_triggered);
                sink.emit(&AppEvent::EventCommitted {
                    key,
                    category: event.category,
                    health: event.health,
                    warning_triggered: event.warning_triggered,
                });
            }
            (Unwritten::Record(record), Some(key)) => {
                self.stats.samples_logged += 1;
                sink.emit(&AppEvent::SampleLogged {
                    table: record.table(),
                    key,
                });
            }
            (Unwritten::Backfill(due), _) => {
                self.stats.backfilled += 1;
                sink.emit(&AppEvent::EmotionBackfilled {
                    key: due.key,
                    trend: due.trend,
                });
            }
            (Unwritten::Record(_), None) => {}
        }
    }

    fn retract_written(
        &mut self,
        key: RecordKey,
        store: &impl RecordSink,
        sink: &mut impl EventSink,
    ) -> Result<(), StorageError> {
        if let Err(e) = store.retract_warning(key) {
            sink.emit(&AppEvent::Degraded(e.clone()));
            return Err(e);
        }
        self.stats.retract_warning();
        sink.emit(&AppEvent::WarningRetracted { key });
        Ok(())
    }

    /// Clear the warning on an event still in the backlog.
    fn retract_unwritten(&mut self, at: Timestamp, category: FoodCategory) {
        for item in &mut self.backlog {
            if let Unwritten::Record(Record::FoodEvent(event)) = item {
                if event.timestamp == at && event.category == category {
                    event.warning_triggered = false;
                    debug!("Warning cleared on held {} event", category);
                }
            }
        }
    }

    // ── Periodic housekeeping ─────────────────────────────────

    /// Expire cooldowns, release held actuator states, retry the backlog
    /// and write due emotion backfills.
    pub fn tick(
        &mut self,
        now: Timestamp,
        actuator: &mut impl ActuatorPort,
        store: &impl RecordSink,
        sink: &mut impl EventSink,
    ) -> Result<(), StorageError> {
        for category in self.cooldown.expire(now) {
            sink.emit(&AppEvent::CooldownExpired(category));
        }

        let failures = self.cooldown.tick_actuation(now, actuator);
        emit_failures(&failures, sink);

        let due = self.assembler.due(now, self.mood.current());
        self.backlog.extend(due.into_iter().map(Unwritten::Backfill));
        self.flush(store, sink).map(|_| ())
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn current_emotion(&self) -> SmoothedEmotion {
        self.mood.current()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Fold producer-side counters into the session stats.
    pub fn note_producer_stats(&mut self, dropped_frames: u64, samples_logged: u64) {
        self.stats.dropped_frames += dropped_frames;
        self.stats.samples_logged += samples_logged;
    }

    pub fn pending_backfills(&self) -> usize {
        self.assembler.pending()
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }
}

fn emit_failures(failures: &[ActuationFailure], sink: &mut impl EventSink) {
    for &(command, error) in failures {
        sink.emit(&AppEvent::ActuationFailed { command, error });
    }
}
