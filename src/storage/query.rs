//! Time-window analysis over the local store.
//!
//! Used offline (and at startup) to recover `emotion_after` for food events
//! whose deferred read never ran, and to summarise logged emotions, snacking
//! habits and light exposure.  Hour buckets use the caller's clock for the
//! local hour.

use std::collections::BTreeMap;

use log::{info, warn};

use crate::Timestamp;
use crate::app::ports::{ClockPort, LocalStorePort, StorageError};
use crate::perception::FoodCategory;
use crate::perception::emotion::{EmotionLabel, EmotionTrend};
use crate::storage::record::{Record, Table};
use crate::storage::{DualWriter, RecordSink};

/// Emotions logged around one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct EmotionWindow {
    pub at: Timestamp,
    pub before: Vec<EmotionLabel>,
    pub after: Vec<EmotionLabel>,
    pub dominant_before: EmotionLabel,
    pub dominant_after: EmotionLabel,
    pub trend: EmotionTrend,
    /// Mean confidence of the rows before `at` (0 when empty).
    pub confidence_before: f32,
    pub confidence_after: f32,
}

/// Most frequent label; ties go to the one logged last.  `Unknown` for an
/// empty slice.
pub fn dominant(labels: &[EmotionLabel]) -> EmotionLabel {
    let mut best = EmotionLabel::Unknown;
    let mut best_count = 0;
    let mut best_last = 0;
    for label in EmotionLabel::CLASSES {
        let count = labels.iter().filter(|l| **l == label).count();
        let last = labels.iter().rposition(|l| *l == label).unwrap_or(0);
        if count > best_count || (count == best_count && count > 0 && last > best_last) {
            best = label;
            best_count = count;
            best_last = last;
        }
    }
    best
}

fn emotion_rows<L: LocalStorePort>(
    store: &L,
    from: Timestamp,
    to: Timestamp,
) -> (Vec<EmotionLabel>, f32) {
    let mut labels = Vec::new();
    let mut sum = 0.0;
    for (_, record) in store.range(Table::EmotionLog, from, to) {
        if let Record::Emotion(row) = record {
            labels.push(row.emotion_class);
            sum += row.confidence;
        }
    }
    let mean = if labels.is_empty() {
        0.0
    } else {
        sum / labels.len() as f32
    };
    (labels, mean)
}

/// Emotion rows in `[at - before_ms, at)` and `[at, at + after_ms)`.
pub fn emotion_window<L: LocalStorePort>(
    store: &L,
    at: Timestamp,
    before_ms: u64,
    after_ms: u64,
) -> EmotionWindow {
    let (before, confidence_before) = emotion_rows(store, at.saturating_sub(before_ms), at);
    let (after, confidence_after) = emotion_rows(store, at, at.saturating_add(after_ms));
    let dominant_before = dominant(&before);
    let dominant_after = dominant(&after);
    EmotionWindow {
        at,
        before,
        after,
        dominant_before,
        dominant_after,
        trend: EmotionTrend::between(dominant_before, dominant_after),
        confidence_before,
        confidence_after,
    }
}

/// Count of each emotion class logged in `[from, to)`.  Every class is
/// present in the result.
pub fn emotion_distribution<L: LocalStorePort>(
    store: &L,
    from: Timestamp,
    to: Timestamp,
) -> BTreeMap<EmotionLabel, usize> {
    let mut counts: BTreeMap<EmotionLabel, usize> =
        EmotionLabel::CLASSES.iter().map(|l| (*l, 0)).collect();
    for label in emotion_rows(store, from, to).0 {
        *counts.entry(label).or_default() += 1;
    }
    counts
}

/// Backfilled trend counts for one food category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrendCounts {
    pub improved: usize,
    pub worsened: usize,
    pub stable: usize,
}

impl TrendCounts {
    pub fn total(&self) -> usize {
        self.improved + self.worsened + self.stable
    }

    /// Share of events after which mood improved; 0 with no data.
    pub fn improvement_rate(&self) -> f32 {
        match self.total() {
            0 => 0.0,
            n => self.improved as f32 / n as f32,
        }
    }
}

/// Trend counts per category over every food event with a known trend.
/// Categories without such events are omitted.
pub fn trends_by_food<L: LocalStorePort>(store: &L) -> BTreeMap<FoodCategory, TrendCounts> {
    let mut out = BTreeMap::new();
    for category in FoodCategory::ALL {
        let mut counts = TrendCounts::default();
        for (_, event) in store.by_category(category) {
            match event.emotion_trend {
                EmotionTrend::Improved => counts.improved += 1,
                EmotionTrend::Worsened => counts.worsened += 1,
                EmotionTrend::Stable => counts.stable += 1,
                EmotionTrend::Unknown => {}
            }
        }
        if counts.total() > 0 {
            out.insert(category, counts);
        }
    }
    out
}

const HOUR_MS: u64 = 3_600_000;

/// Mean valence of the emotions logged in `[from, to)`, from 1
/// (negative_high) to 4 (positive).  `None` when nothing was logged.
pub fn average_emotion_score<L: LocalStorePort>(
    store: &L,
    from: Timestamp,
    to: Timestamp,
) -> Option<f32> {
    let scores: Vec<u8> = emotion_rows(store, from, to)
        .0
        .into_iter()
        .filter_map(EmotionLabel::valence)
        .collect();
    if scores.is_empty() {
        return None;
    }
    let sum: u32 = scores.iter().map(|&s| u32::from(s)).sum();
    Some(sum as f32 / scores.len() as f32)
}

/// Food events counted by the mood they were eaten in.  Events with an
/// unknown `emotion_before` are left out.
pub fn food_emotion_matrix<L: LocalStorePort>(
    store: &L,
) -> BTreeMap<EmotionLabel, BTreeMap<FoodCategory, usize>> {
    let mut matrix: BTreeMap<EmotionLabel, BTreeMap<FoodCategory, usize>> = BTreeMap::new();
    for (_, record) in store.range(Table::FoodEventLog, 0, Timestamp::MAX) {
        let Record::FoodEvent(event) = record else {
            continue;
        };
        if event.emotion_before == EmotionLabel::Unknown {
            continue;
        }
        *matrix
            .entry(event.emotion_before)
            .or_default()
            .entry(event.category)
            .or_default() += 1;
    }
    matrix
}

/// Emotion counts per local hour over `[from, to)`.  All 24 hours are
/// present, each with every class.
pub fn hourly_emotion_pattern<L: LocalStorePort>(
    store: &L,
    clock: &impl ClockPort,
    from: Timestamp,
    to: Timestamp,
) -> Vec<BTreeMap<EmotionLabel, usize>> {
    let mut pattern: Vec<BTreeMap<EmotionLabel, usize>> = (0..24)
        .map(|_| EmotionLabel::CLASSES.iter().map(|l| (*l, 0)).collect())
        .collect();
    for (_, record) in store.range(Table::EmotionLog, from, to) {
        if let Record::Emotion(row) = record {
            let hour = usize::from(clock.local_hour(row.timestamp) % 24);
            *pattern[hour].entry(row.emotion_class).or_default() += 1;
        }
    }
    pattern
}

/// Food events per local hour of the day, over the whole store.
pub fn snacking_frequency_by_hour<L: LocalStorePort>(
    store: &L,
    clock: &impl ClockPort,
) -> [usize; 24] {
    let mut frequency = [0; 24];
    for (_, record) in store.range(Table::FoodEventLog, 0, Timestamp::MAX) {
        let hour = usize::from(clock.local_hour(record.timestamp()) % 24);
        frequency[hour] += 1;
    }
    frequency
}

/// Light level and prevailing mood for one hour.
#[derive(Debug, Clone, PartialEq)]
pub struct LightHour {
    /// Local hour of day.
    pub hour: u8,
    pub avg_lux: f32,
    /// Most logged emotion in the same hour; `Unknown` with none.
    pub dominant: EmotionLabel,
    /// Rows logged with the dominant emotion.
    pub emotion_count: usize,
}

/// Pair each hour of light readings in `[from, to)` with the emotions
/// logged in that same hour.  Hours without a light reading are skipped.
pub fn light_emotion_correlation<L: LocalStorePort>(
    store: &L,
    clock: &impl ClockPort,
    from: Timestamp,
    to: Timestamp,
) -> Vec<LightHour> {
    let mut lux: BTreeMap<u64, (f32, usize)> = BTreeMap::new();
    for (_, record) in store.range(Table::EnvironmentLightLog, from, to) {
        if let Record::Light(row) = record {
            let slot = lux.entry(row.timestamp / HOUR_MS).or_default();
            slot.0 += row.lux;
            slot.1 += 1;
        }
    }

    lux.into_iter()
        .map(|(bucket, (sum, n))| {
            let start = bucket * HOUR_MS;
            let (labels, _) = emotion_rows(store, start, start + HOUR_MS);
            let dominant = dominant(&labels);
            LightHour {
                hour: clock.local_hour(start),
                avg_lux: sum / n as f32,
                dominant,
                emotion_count: labels.iter().filter(|l| **l == dominant).count(),
            }
        })
        .collect()
}

/// Outcome of [`reanalyze_pending`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReanalysisReport {
    pub examined: usize,
    pub updated: usize,
    /// No emotion rows logged after the event.
    pub no_data: usize,
}

/// Backfill `emotion_after` from the emotion log for every food event in
/// `[from, to)` that never got its deferred read.  Events that already have
/// `emotion_after` are left alone.
pub fn reanalyze_pending<L: LocalStorePort>(
    writer: &DualWriter<L>,
    from: Timestamp,
    to: Timestamp,
    window_ms: u64,
) -> Result<ReanalysisReport, StorageError> {
    let candidates: Vec<_> = {
        let store = writer.local().lock().map_err(|_| StorageError::Poisoned)?;
        store
            .range(Table::FoodEventLog, from, to)
            .into_iter()
            .filter_map(|(key, record)| match record {
                Record::FoodEvent(e) if e.awaiting_backfill() => {
                    let window = emotion_window(&*store, e.timestamp, window_ms, window_ms);
                    Some((key, e.emotion_before, window.dominant_after))
                }
                _ => None,
            })
            .collect()
    };

    let mut report = ReanalysisReport {
        examined: candidates.len(),
        ..ReanalysisReport::default()
    };
    for (key, before, after) in candidates {
        if after == EmotionLabel::Unknown {
            report.no_data += 1;
            continue;
        }
        match writer.backfill(key, after, EmotionTrend::between(before, after)) {
            Ok(()) => report.updated += 1,
            Err(StorageError::NotBackfillable) => {
                warn!("Query: {} was backfilled concurrently, skipped", key);
            }
            Err(e) => return Err(e),
        }
    }
    info!(
        "Query: re-analysis updated {}/{} food events ({} without emotion data)",
        report.updated, report.examined, report.no_data
    );
    Ok(report)
}
