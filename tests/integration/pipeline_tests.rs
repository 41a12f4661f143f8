//! AppService → fusion → cooldown → assembler → dual writer, end to end.

use std::time::Duration;

use tempfile::TempDir;

use smartsnack::app::commands::AppCommand;
use smartsnack::app::events::AppEvent;
use smartsnack::app::ports::{ActuatorCommand, LocalStorePort};
use smartsnack::app::service::AppService;
use smartsnack::config::SystemConfig;
use smartsnack::perception::emotion::{EmotionLabel, EmotionTrend};
use smartsnack::perception::{DetectionSource, FoodCategory, HealthTag};
use smartsnack::scheduler::{Coordinator, Shutdown, new_inbox};
use smartsnack::storage::DualWriter;
use smartsnack::storage::journal::FileJournal;
use smartsnack::storage::record::{FoodEvent, RecordKey};

use crate::mock_hw::{
    BrokenDisk, FixedClock, FlakyDisk, MockBoard, RecordingSink, det, frame, fresh_writer, mood,
};

const T0: u64 = 1_700_000_000_000;
const NOON: Option<u8> = Some(12);

struct Rig {
    app: AppService,
    board: MockBoard,
    sink: RecordingSink,
    writer: DualWriter<FileJournal>,
    seq: u64,
    _dir: TempDir,
}

impl Rig {
    fn new() -> Self {
        let (writer, dir) = fresh_writer(256);
        let mut sink = RecordingSink::new();
        let mut app = AppService::new(SystemConfig::default());
        app.start(T0, &mut sink);
        Self {
            app,
            board: MockBoard::new(),
            sink,
            writer,
            seq: 0,
            _dir: dir,
        }
    }

    fn send(&mut self, cmd: AppCommand) {
        self.app
            .handle_command(cmd, NOON, &mut self.board, &self.writer, &mut self.sink)
            .expect("local write");
    }

    fn feel(&mut self, label: EmotionLabel, at: u64) {
        for i in 0..3 {
            self.seq += 1;
            let f = frame(self.seq, at + i, vec![], vec![], Some(mood(label, at + i)));
            self.send(AppCommand::Frame(f));
        }
    }

    fn see(&mut self, category: FoodCategory, confidence: f32, at: u64) {
        self.seq += 1;
        let f = frame(
            self.seq,
            at,
            vec![det(category, confidence, DetectionSource::Narrow, 10.0)],
            vec![],
            None,
        );
        self.send(AppCommand::Frame(f));
    }

    fn tick(&mut self, now: u64) {
        self.app
            .tick(now, &mut self.board, &self.writer, &mut self.sink)
            .expect("tick");
    }

    fn event(&self, key: RecordKey) -> FoodEvent {
        let stored = self.writer.local().lock().unwrap().get(key).expect("stored");
        *stored.record.as_food_event().expect("food event")
    }
}

#[test]
fn cookie_with_negative_mood_warns_once_per_cooldown() {
    let mut rig = Rig::new();
    rig.feel(EmotionLabel::NegativeLow, T0 - 1_000);

    rig.see(FoodCategory::Cookie, 0.9, T0);
    let committed = rig.sink.committed();
    assert_eq!(committed.len(), 1);

    let event = rig.event(committed[0]);
    assert_eq!(event.category, FoodCategory::Cookie);
    assert_eq!(event.health, HealthTag::Unhealthy);
    assert_eq!(event.emotion_before, EmotionLabel::NegativeLow);
    assert_eq!(event.emotion_after, EmotionLabel::Unknown);
    assert!(event.warning_triggered);
    assert_eq!(rig.board.count(ActuatorCommand::LedOn), 1);
    assert_eq!(rig.board.count(ActuatorCommand::Shake), 1);

    // Still inside the 30 s cookie cooldown.
    rig.see(FoodCategory::Cookie, 0.95, T0 + 10_000);
    rig.see(FoodCategory::Cookie, 0.95, T0 + 29_000);
    assert_eq!(rig.sink.committed().len(), 1);
    assert_eq!(rig.sink.suppressed(), 2);
    assert_eq!(rig.board.count(ActuatorCommand::Shake), 1);

    rig.see(FoodCategory::Cookie, 0.95, T0 + 31_000);
    assert_eq!(rig.sink.committed().len(), 2);
}

#[test]
fn chip_cooldown_counts_events() {
    let mut rig = Rig::new();
    rig.see(FoodCategory::Chip, 0.8, T0);
    rig.see(FoodCategory::Chip, 0.8, T0 + 10_000);
    assert_eq!(rig.sink.committed().len(), 1);

    let mut rig = Rig::new();
    rig.see(FoodCategory::Chip, 0.8, T0);
    rig.see(FoodCategory::Chip, 0.8, T0 + 25_000);
    assert_eq!(rig.sink.committed().len(), 2);
}

#[test]
fn categories_cool_down_independently() {
    let mut rig = Rig::new();
    rig.see(FoodCategory::Chip, 0.8, T0);
    rig.see(FoodCategory::Cookie, 0.8, T0 + 1_000);
    rig.see(FoodCategory::Chip, 0.8, T0 + 2_000);
    assert_eq!(rig.sink.committed().len(), 2);
    assert_eq!(rig.app.stats().unhealthy, 2);
}

#[test]
fn overlapping_detections_from_both_models_make_one_event() {
    let mut rig = Rig::new();
    let f = frame(
        1,
        T0,
        vec![det(FoodCategory::Banana, 0.85, DetectionSource::Narrow, 10.0)],
        vec![det(FoodCategory::Banana, 0.7, DetectionSource::General, 12.0)],
        None,
    );
    rig.send(AppCommand::Frame(f));
    assert_eq!(rig.sink.committed().len(), 1);
    let event = rig.event(rig.sink.committed()[0]);
    assert_eq!(event.health, HealthTag::Healthy);
    assert!(!event.warning_triggered);
}

#[test]
fn low_confidence_detection_is_not_an_event() {
    let mut rig = Rig::new();
    rig.see(FoodCategory::Donut, 0.3, T0);
    assert!(rig.sink.committed().is_empty());
}

#[test]
fn emotion_after_is_backfilled_after_the_delay() {
    let mut rig = Rig::new();
    rig.feel(EmotionLabel::NegativeHigh, T0 - 1_000);
    rig.see(FoodCategory::Cookie, 0.9, T0);
    let key = rig.sink.committed()[0];
    rig.feel(EmotionLabel::Positive, T0 + 60_000);

    let delay = u64::from(SystemConfig::default().emotion.backfill_delay_secs) * 1_000;
    rig.tick(T0 + delay - 1);
    assert!(rig.sink.backfilled().is_empty());
    assert_eq!(rig.app.pending_backfills(), 1);

    rig.tick(T0 + delay);
    assert_eq!(rig.sink.backfilled(), vec![(key, EmotionTrend::Improved)]);
    let event = rig.event(key);
    assert_eq!(event.emotion_after, EmotionLabel::Positive);
    assert_eq!(event.emotion_trend, EmotionTrend::Improved);

    // The backfilled version is queued for replication again.
    let stored = rig.writer.local().lock().unwrap().get(key).unwrap();
    assert_eq!(stored.version, 2);
    assert!(!stored.is_replicated());
}

#[test]
fn warning_led_is_released_after_hold() {
    let mut rig = Rig::new();
    rig.see(FoodCategory::Chip, 0.9, T0);
    let hold = u64::from(SystemConfig::default().actuation.led_hold_secs) * 1_000;
    rig.tick(T0 + hold - 1);
    assert_eq!(rig.board.count(ActuatorCommand::LedOff), 0);
    rig.tick(T0 + hold);
    assert_eq!(rig.board.count(ActuatorCommand::LedOff), 1);
    assert_eq!(rig.board.count(ActuatorCommand::Reset), 1);
}

#[test]
fn silent_board_records_no_warning_but_keeps_event() {
    let mut rig = Rig::new();
    rig.board = MockBoard::silent();
    rig.see(FoodCategory::Nutella, 0.9, T0);

    let committed = rig.sink.committed();
    assert_eq!(committed.len(), 1);
    assert!(!rig.event(committed[0]).warning_triggered);
    assert!(
        rig.sink
            .events
            .iter()
            .any(|e| matches!(e, AppEvent::ActuationFailed { .. }))
    );
    assert!(
        rig.sink
            .events
            .contains(&AppEvent::WarningRetracted { key: committed[0] })
    );
    assert_eq!(rig.app.stats().warnings, 0);
}

#[test]
fn emotion_log_waits_for_a_known_mood() {
    let mut rig = Rig::new();
    rig.send(AppCommand::LogEmotion { at: T0 });
    assert_eq!(rig.writer.local().lock().unwrap().len(), 0);

    rig.feel(EmotionLabel::Neutral, T0);
    rig.send(AppCommand::LogEmotion { at: T0 + 10 });
    assert_eq!(rig.writer.local().lock().unwrap().len(), 1);
    assert_eq!(rig.app.stats().samples_logged, 1);
}

#[test]
fn local_write_failure_is_surfaced() {
    let mut app = AppService::new(SystemConfig::default());
    let mut board = MockBoard::new();
    let mut sink = RecordingSink::new();
    app.start(T0, &mut sink);

    let f = frame(
        1,
        T0,
        vec![det(FoodCategory::Chip, 0.9, DetectionSource::Narrow, 0.0)],
        vec![],
        None,
    );
    let result = app.handle_command(AppCommand::Frame(f), NOON, &mut board, &BrokenDisk, &mut sink);
    assert!(result.is_err());
    assert!(sink.events.iter().any(|e| matches!(e, AppEvent::Degraded(_))));
    assert!(sink.committed().is_empty());
    assert_eq!(app.backlog(), 1);
}

#[test]
fn event_lands_in_the_journal_after_a_failed_first_write() {
    let (writer, _dir) = fresh_writer(64);
    let disk = FlakyDisk::new(writer, 1);
    let mut app = AppService::new(SystemConfig::default());
    let mut board = MockBoard::new();
    let mut sink = RecordingSink::new();
    app.start(T0, &mut sink);

    let f = frame(
        1,
        T0,
        vec![det(FoodCategory::Chip, 0.9, DetectionSource::Narrow, 0.0)],
        vec![],
        None,
    );
    assert!(
        app.handle_command(AppCommand::Frame(f), NOON, &mut board, &disk, &mut sink)
            .is_err()
    );
    assert_eq!(disk.inner.local().lock().unwrap().len(), 0);
    assert_eq!(app.backlog(), 1);

    app.tick(T0 + 1_000, &mut board, &disk, &mut sink).unwrap();
    assert_eq!(app.backlog(), 0);
    let committed = sink.committed();
    assert_eq!(committed.len(), 1);
    let stored = disk.inner.local().lock().unwrap().get(committed[0]).unwrap();
    assert_eq!(stored.record.as_food_event().unwrap().category, FoodCategory::Chip);
    assert_eq!(stored.record.as_food_event().unwrap().timestamp, T0);
}

#[test]
fn one_warning_covers_unhealthy_foods_seen_close_together() {
    let mut rig = Rig::new();
    rig.feel(EmotionLabel::NegativeLow, T0 - 1_000);
    rig.see(FoodCategory::Cookie, 0.9, T0);
    rig.see(FoodCategory::Nutella, 0.9, T0 + 5_000);

    let committed = rig.sink.committed();
    assert_eq!(committed.len(), 2);
    assert!(rig.event(committed[0]).warning_triggered);
    assert!(!rig.event(committed[1]).warning_triggered);
    assert_eq!(rig.board.count(ActuatorCommand::Shake), 1);

    let interval = u64::from(SystemConfig::default().actuation.warning_interval_secs) * 1_000;
    rig.see(FoodCategory::Chip, 0.9, T0 + interval);
    assert_eq!(rig.board.count(ActuatorCommand::Shake), 2);
}

#[test]
fn shutdown_abandons_backfills_and_rests_board() {
    let mut rig = Rig::new();
    rig.see(FoodCategory::Chip, 0.9, T0);
    let stats = rig.app.shutdown(&mut rig.board, &mut rig.sink);

    assert_eq!(stats.total, 1);
    assert_eq!(stats.abandoned_backfills, 1);
    assert_eq!(rig.board.calls.last(), Some(&ActuatorCommand::Reset));
    assert!(
        rig.sink
            .events
            .iter()
            .any(|e| matches!(e, AppEvent::BackfillsAbandoned(1)))
    );
}

#[test]
fn coordinator_serves_inbox_until_shutdown_command() {
    let (writer, _dir) = fresh_writer(64);
    let inbox = new_inbox();
    let shutdown = Shutdown::new();
    let clock = FixedClock::at(T0);

    for (i, at) in [T0, T0 + 5_000, T0 + 40_000].into_iter().enumerate() {
        let f = frame(
            i as u64,
            at,
            vec![det(FoodCategory::Cookie, 0.9, DetectionSource::Narrow, 0.0)],
            vec![],
            None,
        );
        inbox.try_send(AppCommand::Frame(f)).unwrap();
    }
    inbox.try_send(AppCommand::Shutdown).unwrap();

    let mut coordinator = Coordinator {
        app: AppService::new(SystemConfig::default()),
        actuator: MockBoard::new(),
        store: writer.clone(),
        sink: RecordingSink::new(),
        clock,
        tick: Duration::from_millis(50),
    };
    coordinator.run(&inbox, &shutdown).unwrap();
    assert!(shutdown.is_triggered());
    assert_eq!(coordinator.sink.committed().len(), 2);

    let stats = coordinator.finish();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.suppressed, 1);
    assert_eq!(writer.local().lock().unwrap().len(), 2);
}
