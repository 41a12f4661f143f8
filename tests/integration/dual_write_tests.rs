//! DualWriter → journal → ReplicationQueue → Replicator → remote.

use std::sync::{Arc, Mutex};

use smartsnack::adapters::memory_remote::MemoryRemote;
use smartsnack::app::ports::LocalStorePort;
use smartsnack::perception::emotion::{EmotionLabel, EmotionTrend};
use smartsnack::perception::{DetectionSource, FoodCategory, HealthTag};
use smartsnack::storage::journal::FileJournal;
use smartsnack::storage::record::{DurabilityState, FoodEvent, LightRow, Record, Table};
use smartsnack::storage::replicator::{ReplicationQueue, Replicator, RetryPolicy};
use smartsnack::storage::{DualWriter, RecordSink};

use crate::mock_hw::fresh_writer;

const POLICY: RetryPolicy = RetryPolicy {
    base_ms: 100,
    max_ms: 1_000,
};

fn chip(at: u64) -> Record {
    Record::FoodEvent(FoodEvent {
        timestamp: at,
        category: FoodCategory::Chip,
        health: HealthTag::Unhealthy,
        calories: 15,
        detection_confidence: 0.8,
        detection_source: DetectionSource::Narrow,
        emotion_before: EmotionLabel::Neutral,
        emotion_after: EmotionLabel::Unknown,
        emotion_trend: EmotionTrend::Unknown,
        warning_triggered: false,
    })
}

fn light(at: u64) -> Record {
    Record::Light(LightRow {
        timestamp: at,
        lux: 250.0,
        sensor_type: "BH1750".into(),
    })
}

fn replicator_for(
    writer: &DualWriter<FileJournal>,
    remote: &MemoryRemote,
) -> Replicator<FileJournal, MemoryRemote> {
    Replicator::new(
        Arc::clone(writer.local()),
        remote.clone(),
        Arc::clone(writer.queue()),
        POLICY,
    )
}

#[test]
fn remote_failures_end_in_remote_committed() {
    let (writer, _dir) = fresh_writer(16);
    let remote = MemoryRemote::new();
    remote.fail_next(3);
    let mut replicator = replicator_for(&writer, &remote);

    let key = writer.write(chip(1_000)).unwrap();
    let mut now = 0;
    for _ in 0..20 {
        // Visible locally at every step of the retry cycle.
        assert!(writer.local().lock().unwrap().get(key).is_some());
        replicator.step(now);
        if writer.durability(key) == Some(DurabilityState::RemoteCommitted) {
            break;
        }
        assert_eq!(writer.durability(key), Some(DurabilityState::RemoteFailedQueued));
        now += POLICY.max_ms;
    }

    assert_eq!(writer.durability(key), Some(DurabilityState::RemoteCommitted));
    assert_eq!(remote.attempts(), 4);
    assert_eq!(remote.get(key), Some(chip(1_000)));
    assert!(writer.local().lock().unwrap().unreplicated().is_empty());
}

#[test]
fn repeated_upsert_never_duplicates_remote_row() {
    let (writer, _dir) = fresh_writer(16);
    let remote = MemoryRemote::new();
    let mut replicator = replicator_for(&writer, &remote);

    let key = writer.write(chip(1_000)).unwrap();
    replicator.step(0);
    assert_eq!(remote.len(), 1);

    // The backfill produces a new version; the remote row is replaced.
    writer
        .backfill(key, EmotionLabel::Positive, EmotionTrend::Improved)
        .unwrap();
    replicator.step(1);
    assert_eq!(remote.len(), 1);
    assert_eq!(remote.count(Table::FoodEventLog), 1);
    let row = remote.get(key).unwrap();
    assert_eq!(
        row.as_food_event().unwrap().emotion_trend,
        EmotionTrend::Improved
    );
    assert_eq!(writer.local().lock().unwrap().get(key).unwrap().replicated_version, 2);
}

#[test]
fn full_queue_defers_without_losing_records() {
    let (writer, _dir) = fresh_writer(1);
    let remote = MemoryRemote::new();
    let mut replicator = replicator_for(&writer, &remote);

    let keys: Vec<_> = (0..5).map(|i| writer.write(light(i)).unwrap()).collect();
    assert_eq!(writer.queue().len(), 1);
    assert_eq!(writer.local().lock().unwrap().len(), 5);

    for now in 0..20 {
        replicator.step(now);
    }
    assert_eq!(remote.len(), 5);
    for key in keys {
        assert_eq!(writer.durability(key), Some(DurabilityState::RemoteCommitted));
    }
}

#[test]
fn unreplicated_records_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("restart.journal");
    let state = dir.path().join("restart.state");
    let remote = MemoryRemote::new();
    remote.set_offline(true);

    let keys = {
        let journal = FileJournal::open(&path, true).unwrap();
        let queue = Arc::new(ReplicationQueue::new(16));
        let writer = DualWriter::new(Arc::new(Mutex::new(journal)), queue);
        let keys: Vec<_> = (0..3).map(|i| writer.write(chip(i * 1_000)).unwrap()).collect();

        let replicator = replicator_for(&writer, &remote).with_state_path(&state);
        writer.queue().close();
        replicator.close(0);
        keys
    };
    assert!(remote.is_empty());

    // Next run: journal replay plus the retry snapshot.
    remote.set_offline(false);
    let journal = FileJournal::open(&path, true).unwrap();
    assert_eq!(journal.unreplicated().len(), 3);
    let queue = Arc::new(ReplicationQueue::new(16));
    let writer = DualWriter::new(Arc::new(Mutex::new(journal)), queue);
    let mut replicator = replicator_for(&writer, &remote).with_state_path(&state);

    assert_eq!(replicator.recover(0), 3);
    replicator.step(0);
    assert_eq!(remote.len(), 3);
    for key in keys {
        assert!(remote.get(key).is_some());
    }
}

#[test]
fn constraint_violation_never_reaches_either_store() {
    let (writer, _dir) = fresh_writer(16);
    let bad = Record::Light(LightRow {
        timestamp: 0,
        lux: -3.0,
        sensor_type: "BH1750".into(),
    });
    assert!(writer.write(bad).is_err());
    assert!(writer.local().lock().unwrap().is_empty());
    assert!(writer.queue().is_empty());
}

#[test]
fn concurrent_writers_share_one_journal() {
    let (writer, _dir) = fresh_writer(1_024);
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let w = writer.clone();
            std::thread::spawn(move || {
                for i in 0..25 {
                    w.write(light(t * 100 + i)).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let local = writer.local().lock().unwrap();
    assert_eq!(local.len(), 100);
    assert_eq!(local.range(Table::EnvironmentLightLog, 0, u64::MAX).len(), 100);
    assert_eq!(local.unreplicated().len(), 100);
}
