//! Recorded session → vision loop → coordinator → journal → remote.

use std::sync::Arc;
use std::time::Duration;

use smartsnack::adapters::memory_remote::MemoryRemote;
use smartsnack::adapters::replay::{ReplayCamera, ReplayClassifier, ReplayDetector, ReplaySession};
use smartsnack::app::commands::AppCommand;
use smartsnack::app::ports::{ActuatorCommand, LocalStorePort};
use smartsnack::app::service::AppService;
use smartsnack::config::SystemConfig;
use smartsnack::perception::emotion::EmotionLabel;
use smartsnack::perception::{DetectionSource, FoodCategory};
use smartsnack::scheduler::{Coordinator, Shutdown, VisionRig, new_inbox, vision_loop};
use smartsnack::storage::query;
use smartsnack::storage::record::Table;
use smartsnack::storage::replicator::{Replicator, RetryPolicy};

use crate::mock_hw::{FixedClock, MockBoard, RecordingSink, fresh_writer};

const ORIGIN: u64 = 1_700_000_000_000;

/// Sad face, a cookie, a duplicate cookie 5 s later, then an apple seen
/// by both models, then a smile.
const SESSION: &str = r#"
{"t":0,"emotion":{"label":"negative_low","confidence":0.8}}
{"t":100,"emotion":{"label":"negative_low","confidence":0.7}}
{"t":200,"narrow":[{"label":"cookie","confidence":0.92,"bbox":[10,10,60,60]}],"emotion":{"label":"negative_low","confidence":0.9}}
{"t":5200,"narrow":[{"label":"cookies","confidence":0.88,"bbox":[12,10,62,60]}]}
{"t":9000,"general":[{"label":"apple","confidence":0.81,"bbox":[100,100,160,170]}]}
{"t":9100,"emotion":{"label":"positive","confidence":0.9}}
{"t":9200,"emotion":{"label":"positive","confidence":0.9}}
{"t":9300,"emotion":{"label":"positive","confidence":0.9}}
"#;

#[test]
fn recorded_session_flows_to_both_stores() {
    let session = Arc::new(ReplaySession::parse(SESSION).unwrap());
    let inbox = new_inbox();
    let shutdown = Shutdown::new();

    let rig = VisionRig {
        camera: ReplayCamera::new(Arc::clone(&session), ORIGIN).unpaced(),
        narrow: ReplayDetector::new(Arc::clone(&session), DetectionSource::Narrow),
        general: ReplayDetector::new(Arc::clone(&session), DetectionSource::General),
        classifier: ReplayClassifier::new(Arc::clone(&session)),
    };
    // High rate so the test does not wait on frame pacing.
    let vision = vision_loop(rig, &inbox, 60, &shutdown);
    assert!(vision.stream_ended);
    assert_eq!(vision.frames, 8);
    assert_eq!(vision.dropped, 0);
    inbox.try_send(AppCommand::Shutdown).unwrap();

    let (writer, _dir) = fresh_writer(64);
    let mut coordinator = Coordinator {
        app: AppService::new(SystemConfig::default()),
        actuator: MockBoard::new(),
        store: writer.clone(),
        sink: RecordingSink::new(),
        clock: FixedClock::at(ORIGIN),
        tick: Duration::from_millis(20),
    };
    coordinator.run(&inbox, &Shutdown::new()).unwrap();

    let committed = coordinator.sink.committed();
    assert_eq!(committed.len(), 2, "cookie once, apple once");
    assert_eq!(coordinator.app.current_emotion().label, EmotionLabel::Positive);
    assert_eq!(coordinator.actuator.count(ActuatorCommand::Shake), 1);

    {
        let local = writer.local().lock().unwrap();
        let cookies = local.by_category(FoodCategory::Cookie);
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].1.emotion_before, EmotionLabel::NegativeLow);
        assert_eq!(cookies[0].1.timestamp, ORIGIN + 200);
        assert_eq!(local.by_category(FoodCategory::Apple).len(), 1);
        assert_eq!(local.range(Table::FoodEventLog, 0, u64::MAX).len(), 2);
    }

    // Deferred reads land once the delay has passed.
    let delay = u64::from(SystemConfig::default().emotion.backfill_delay_secs) * 1_000;
    let mut sink = RecordingSink::new();
    coordinator
        .app
        .tick(ORIGIN + 9_000 + delay, &mut coordinator.actuator, &writer, &mut sink)
        .unwrap();
    assert_eq!(sink.backfilled().len(), 2);
    let trends = query::trends_by_food(&*writer.local().lock().unwrap());
    assert_eq!(trends[&FoodCategory::Cookie].improved, 1);

    // Everything reaches the remote once.
    let remote = MemoryRemote::new();
    let mut replicator = Replicator::new(
        Arc::clone(writer.local()),
        remote.clone(),
        Arc::clone(writer.queue()),
        RetryPolicy {
            base_ms: 10,
            max_ms: 100,
        },
    );
    replicator.step(ORIGIN);
    assert_eq!(remote.count(Table::FoodEventLog), 2);
    assert!(writer.local().lock().unwrap().unreplicated().is_empty());
}
