//! Persistent record types, keys and the per-record durability state machine.
//!
//! ```text
//!  PendingLocal ──local ok──▶ LocalCommitted ──enqueue──▶ PendingRemote
//!                                                          │        ▲
//!                                              remote ok   │        │ retry
//!                                                          ▼        │
//!                               RemoteCommitted ◀──── PendingRemote ──fail──▶ RemoteFailedQueued
//! ```
//!
//! A backfilled record that already reached the remote re-enters
//! `PendingRemote` so the updated version is replicated.

use core::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Timestamp;
use crate::app::ports::{StorageError, WeatherReading};
use crate::perception::emotion::{EmotionLabel, EmotionTrend};
use crate::perception::{DetectionSource, FoodCategory, HealthTag};

// ───────────────────────────────────────────────────────────────
// Keys and tables
// ───────────────────────────────────────────────────────────────

/// Synthetic unique key assigned at local write time.  Also the remote
/// idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(Uuid);

impl RecordKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Logical tables shared by the local and remote stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    EmotionLog,
    EnvironmentLightLog,
    WeatherLog,
    FoodEventLog,
}

impl Table {
    pub const ALL: [Self; 4] = [
        Self::EmotionLog,
        Self::EnvironmentLightLog,
        Self::WeatherLog,
        Self::FoodEventLog,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EmotionLog => "emotion_log",
            Self::EnvironmentLightLog => "environment_light_log",
            Self::WeatherLog => "weather_log",
            Self::FoodEventLog => "food_event_log",
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Rows
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionRow {
    pub timestamp: Timestamp,
    pub emotion_class: EmotionLabel,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightRow {
    pub timestamp: Timestamp,
    pub lux: f32,
    pub sensor_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRow {
    pub timestamp: Timestamp,
    pub condition: String,
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub sunrise: Option<Timestamp>,
    pub sunset: Option<Timestamp>,
    /// Hours between sunrise and sunset, one decimal.
    pub daylight_hours: Option<f32>,
}

impl WeatherRow {
    pub fn from_reading(timestamp: Timestamp, reading: WeatherReading) -> Self {
        let daylight_hours = match (reading.sunrise, reading.sunset) {
            (Some(rise), Some(set)) if set > rise => {
                let hours = (set - rise) as f64 / 3_600_000.0;
                Some(((hours * 10.0).round() / 10.0) as f32)
            }
            _ => None,
        };
        Self {
            timestamp,
            condition: reading.condition,
            temperature_c: reading.temperature_c,
            humidity_pct: reading.humidity_pct,
            sunrise: reading.sunrise,
            sunset: reading.sunset,
            daylight_hours,
        }
    }
}

/// The durable unit of record for one eating act.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FoodEvent {
    pub timestamp: Timestamp,
    pub category: FoodCategory,
    pub health: HealthTag,
    pub calories: u32,
    pub detection_confidence: f32,
    pub detection_source: DetectionSource,
    pub emotion_before: EmotionLabel,
    pub emotion_after: EmotionLabel,
    pub emotion_trend: EmotionTrend,
    pub warning_triggered: bool,
}

impl FoodEvent {
    /// Whether `emotion_after` is still open for the one-time backfill.
    pub fn awaiting_backfill(&self) -> bool {
        self.emotion_after == EmotionLabel::Unknown && self.emotion_trend == EmotionTrend::Unknown
    }
}

// ───────────────────────────────────────────────────────────────
// Record union
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum Record {
    #[serde(rename = "emotion_log")]
    Emotion(EmotionRow),
    #[serde(rename = "environment_light_log")]
    Light(LightRow),
    #[serde(rename = "weather_log")]
    Weather(WeatherRow),
    #[serde(rename = "food_event_log")]
    FoodEvent(FoodEvent),
}

impl Record {
    pub const fn table(&self) -> Table {
        match self {
            Self::Emotion(_) => Table::EmotionLog,
            Self::Light(_) => Table::EnvironmentLightLog,
            Self::Weather(_) => Table::WeatherLog,
            Self::FoodEvent(_) => Table::FoodEventLog,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            Self::Emotion(r) => r.timestamp,
            Self::Light(r) => r.timestamp,
            Self::Weather(r) => r.timestamp,
            Self::FoodEvent(r) => r.timestamp,
        }
    }

    pub fn as_food_event(&self) -> Option<&FoodEvent> {
        match self {
            Self::FoodEvent(e) => Some(e),
            _ => None,
        }
    }

    /// Check constraints enforced on every local write.
    pub fn validate(&self) -> Result<(), StorageError> {
        match self {
            Self::Emotion(r) => {
                if r.emotion_class == EmotionLabel::Unknown {
                    return Err(StorageError::ConstraintViolation(
                        "emotion_class must be a known class",
                    ));
                }
                unit_interval(r.confidence, "emotion confidence must be 0.0–1.0")
            }
            Self::Light(r) => {
                if !r.lux.is_finite() || r.lux < 0.0 {
                    return Err(StorageError::ConstraintViolation("lux must be >= 0"));
                }
                if r.sensor_type.is_empty() {
                    return Err(StorageError::ConstraintViolation(
                        "sensor_type must not be empty",
                    ));
                }
                Ok(())
            }
            Self::Weather(r) => {
                if r.condition.trim().is_empty() {
                    return Err(StorageError::ConstraintViolation(
                        "weather condition must not be empty",
                    ));
                }
                if !r.temperature_c.is_finite() || !(-90.0..=60.0).contains(&r.temperature_c) {
                    return Err(StorageError::ConstraintViolation(
                        "temperature_c must be -90–60",
                    ));
                }
                if !r.humidity_pct.is_finite() || !(0.0..=100.0).contains(&r.humidity_pct) {
                    return Err(StorageError::ConstraintViolation(
                        "humidity_pct must be 0–100",
                    ));
                }
                if let Some(h) = r.daylight_hours {
                    if !h.is_finite() || !(0.0..=24.0).contains(&h) {
                        return Err(StorageError::ConstraintViolation(
                            "daylight_hours must be 0–24",
                        ));
                    }
                }
                Ok(())
            }
            Self::FoodEvent(e) => {
                unit_interval(e.detection_confidence, "detection_confidence must be 0.0–1.0")?;
                if !e.detection_source.covers(e.category) {
                    return Err(StorageError::ConstraintViolation(
                        "category not covered by detection_source",
                    ));
                }
                if e.emotion_after == EmotionLabel::Unknown
                    && e.emotion_trend != EmotionTrend::Unknown
                {
                    return Err(StorageError::ConstraintViolation(
                        "emotion_trend requires emotion_after",
                    ));
                }
                Ok(())
            }
        }
    }
}

fn unit_interval(v: f32, msg: &'static str) -> Result<(), StorageError> {
    if v.is_finite() && (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(StorageError::ConstraintViolation(msg))
    }
}

/// A record as held by the local store.  `version` starts at 1 and is
/// bumped by each backfill; `replicated_version` is the newest version the
/// remote acknowledged (0 = never).
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record: Record,
    pub version: u32,
    pub replicated_version: u32,
}

impl StoredRecord {
    pub fn is_replicated(&self) -> bool {
        self.replicated_version >= self.version
    }
}

// ───────────────────────────────────────────────────────────────
// Durability state machine
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DurabilityState {
    PendingLocal,
    LocalCommitted,
    PendingRemote,
    RemoteCommitted,
    RemoteFailedQueued,
}

/// Inputs that drive [`DurabilityState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityEvent {
    LocalWriteOk,
    Enqueued,
    RemoteWriteOk,
    RemoteWriteFailed,
    RetryDue,
}

impl DurabilityState {
    /// Apply `event`.  `None` for transitions the state machine forbids.
    pub const fn next(self, event: DurabilityEvent) -> Option<Self> {
        use DurabilityEvent as E;
        match (self, event) {
            (Self::PendingLocal, E::LocalWriteOk) => Some(Self::LocalCommitted),
            (Self::LocalCommitted | Self::RemoteCommitted, E::Enqueued) => {
                Some(Self::PendingRemote)
            }
            (Self::PendingRemote | Self::RemoteFailedQueued, E::Enqueued) => Some(self),
            (Self::PendingRemote, E::RemoteWriteOk) => Some(Self::RemoteCommitted),
            (Self::PendingRemote, E::RemoteWriteFailed) => Some(Self::RemoteFailedQueued),
            (Self::RemoteFailedQueued, E::RetryDue) => Some(Self::PendingRemote),
            _ => None,
        }
    }

    /// Whether the record is guaranteed to exist locally in this state.
    pub const fn is_local(self) -> bool {
        !matches!(self, Self::PendingLocal)
    }
}

/// Envelope tracking one record through the dual write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub key: RecordKey,
    pub record: Record,
    pub state: DurabilityState,
}

impl WriteRecord {
    pub fn new(record: Record) -> Self {
        Self {
            key: RecordKey::generate(),
            record,
            state: DurabilityState::PendingLocal,
        }
    }

    /// Advance the state, leaving it unchanged on a forbidden transition.
    pub fn advance(&mut self, event: DurabilityEvent) -> bool {
        match self.state.next(event) {
            Some(next) => {
                self.state = next;
                true
            }
            None => false,
        }
    }
}
