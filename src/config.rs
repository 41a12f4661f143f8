//! System configuration parameters
//!
//! All tunable parameters for the SmartSnack pipeline.  Loaded from a JSON
//! file through [`ConfigPort`](crate::app::ports::ConfigPort); every section
//! falls back to its defaults when omitted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::app::ports::ConfigError;
use crate::perception::{FoodCategory, HealthTag};

/// Core system configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub fusion: FusionConfig,
    /// Static per-category metadata.  Categories missing here are treated
    /// as unknown and never become events.
    pub foods: BTreeMap<FoodCategory, FoodProfile>,
    pub emotion: EmotionConfig,
    pub actuation: ActuationConfig,
    pub timing: TimingConfig,
    pub storage: StorageConfig,
    pub remote: Option<RemoteConfig>,
    pub weather: Option<WeatherConfig>,
    pub serial: Option<SerialConfig>,
}

// ── Fusion ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// IoU above which two boxes are the same physical object.
    pub overlap_iou_threshold: f32,
    /// Minimum confidence for a detection to win a cross-source conflict.
    pub min_acceptance_confidence: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            overlap_iou_threshold: 0.5,
            min_acceptance_confidence: 0.5,
        }
    }
}

// ── Food profiles ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FoodProfile {
    pub health: HealthTag,
    /// Calorie estimate per eating act (kcal).
    pub calories: u32,
    /// Debounce window after an accepted detection.
    pub cooldown_secs: u32,
    /// Minimum fused confidence for a detection to become an event.
    pub detection_threshold: f32,
}

impl FoodProfile {
    pub const fn new(health: HealthTag, calories: u32, cooldown_secs: u32) -> Self {
        Self {
            health,
            calories,
            cooldown_secs,
            detection_threshold: 0.5,
        }
    }
}

/// Default catalog: snack-sized categories get short cooldowns, jar foods
/// the longest.
pub fn default_foods() -> BTreeMap<FoodCategory, FoodProfile> {
    use FoodCategory::{Apple, Banana, Chip, Cookie, Donut, Nutella, Orange};
    use HealthTag::{Healthy, Unhealthy};

    BTreeMap::from([
        (Chip, FoodProfile::new(Unhealthy, 15, 20)),
        (Cookie, FoodProfile::new(Unhealthy, 50, 30)),
        (Nutella, FoodProfile::new(Unhealthy, 100, 300)),
        (Donut, FoodProfile::new(Unhealthy, 250, 60)),
        (Banana, FoodProfile::new(Healthy, 90, 60)),
        (Apple, FoodProfile::new(Healthy, 95, 60)),
        (Orange, FoodProfile::new(Healthy, 60, 60)),
    ])
}

// ── Emotion ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmotionConfig {
    /// Delay before `emotion_after` is read back for a food event.
    pub backfill_delay_secs: u32,
}

impl Default for EmotionConfig {
    fn default() -> Self {
        Self {
            backfill_delay_secs: 600,
        }
    }
}

// ── Actuation ───────────────────────────────────────────────────

/// Hour range during which warnings are issued.  `start > end` wraps
/// midnight (e.g. 19..4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourWindow {
    /// Start hour (0-23 inclusive).
    pub start_hour: u8,
    /// End hour (0-23 exclusive).
    pub end_hour: u8,
}

impl HourWindow {
    pub fn contains(&self, hour: u8) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuationConfig {
    /// LED + shake on accepted unhealthy detections.
    pub warn_unhealthy: bool,
    /// Nod on accepted healthy detections.
    pub encourage_healthy: bool,
    /// How long the warning LED stays on before the release sequence.
    pub led_hold_secs: u32,
    /// Restrict warnings to these local hours.  `None` = always.
    pub warning_hours: Option<HourWindow>,
    /// Minimum gap between two warnings, across all categories.
    /// 0 disables the limit.
    pub warning_interval_secs: u32,
}

impl Default for ActuationConfig {
    fn default() -> Self {
        Self {
            warn_unhealthy: true,
            encourage_healthy: false,
            led_hold_secs: 5,
            warning_hours: None,
            warning_interval_secs: 30,
        }
    }
}

// ── Timing ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Vision loop target rate.
    pub vision_fps: u32,
    /// Interval between emotion log rows.
    pub emotion_log_interval_secs: u32,
    /// Interval between light sensor reads.
    pub light_interval_secs: u32,
    /// Interval between weather fetches.  The first fetch is immediate.
    pub weather_interval_secs: u32,
    /// Coordinator housekeeping tick (cooldown expiry, backfills).
    pub coordinator_tick_ms: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            vision_fps: 20,
            emotion_log_interval_secs: 120,  // 2 min
            light_interval_secs: 300,        // 5 min
            weather_interval_secs: 3600,     // 1 h
            coordinator_tick_ms: 250,
        }
    }
}

// ── Storage ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Append-only local journal (JSON lines).
    pub journal_path: String,
    /// Retry bookkeeping snapshot written on shutdown.
    pub retry_state_path: String,
    /// fsync after every append.
    pub fsync: bool,
    /// Maximum records held in the in-memory retry queue.
    pub retry_queue_capacity: usize,
    /// First retry delay.
    pub retry_base_ms: u64,
    /// Backoff ceiling.
    pub retry_max_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            journal_path: "data/smartsnack.journal".into(),
            retry_state_path: "data/replication.state".into(),
            fsync: true,
            retry_queue_capacity: 1024,
            retry_base_ms: 500,
            retry_max_ms: 60_000,
        }
    }
}

// ── External services ───────────────────────────────────────────

/// REST remote store.  The API key is read from `api_key_env` at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub timeout_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timeout_secs: u32,
}

/// Actuator board link (line protocol over a serial device).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub device: String,
    /// Light sensor model stored with each light row.
    pub light_sensor_type: String,
    /// How long to wait for the board's reply to one command.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u32,
}

const fn default_reply_timeout_ms() -> u32 {
    2_000
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            fusion: FusionConfig::default(),
            foods: default_foods(),
            emotion: EmotionConfig::default(),
            actuation: ActuationConfig::default(),
            timing: TimingConfig::default(),
            storage: StorageConfig::default(),
            remote: None,
            weather: None,
            serial: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Validation
// ═══════════════════════════════════════════════════════════════

impl SystemConfig {
    /// Range-check every field.  Invalid values are rejected, never clamped.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.05..=0.95).contains(&self.fusion.overlap_iou_threshold) {
            return Err(ConfigError::ValidationFailed(
                "fusion.overlap_iou_threshold must be 0.05–0.95",
            ));
        }
        if !(0.0..=1.0).contains(&self.fusion.min_acceptance_confidence) {
            return Err(ConfigError::ValidationFailed(
                "fusion.min_acceptance_confidence must be 0.0–1.0",
            ));
        }
        for profile in self.foods.values() {
            if !(0.0..=1.0).contains(&profile.detection_threshold) {
                return Err(ConfigError::ValidationFailed(
                    "foods.*.detection_threshold must be 0.0–1.0",
                ));
            }
            if profile.cooldown_secs == 0 || profile.cooldown_secs > 3600 {
                return Err(ConfigError::ValidationFailed(
                    "foods.*.cooldown_secs must be 1–3600",
                ));
            }
            if profile.calories > 5000 {
                return Err(ConfigError::ValidationFailed(
                    "foods.*.calories must be 0–5000",
                ));
            }
        }
        if !(10..=86_400).contains(&self.emotion.backfill_delay_secs) {
            return Err(ConfigError::ValidationFailed(
                "emotion.backfill_delay_secs must be 10–86400",
            ));
        }
        if !(1..=60).contains(&self.actuation.led_hold_secs) {
            return Err(ConfigError::ValidationFailed(
                "actuation.led_hold_secs must be 1–60",
            ));
        }
        if self.actuation.warning_interval_secs > 3_600 {
            return Err(ConfigError::ValidationFailed(
                "actuation.warning_interval_secs must be 0–3600",
            ));
        }
        if let Some(w) = self.actuation.warning_hours {
            if w.start_hour > 23 || w.end_hour > 23 {
                return Err(ConfigError::ValidationFailed(
                    "actuation.warning_hours must be 0–23",
                ));
            }
        }
        if !(1..=60).contains(&self.timing.vision_fps) {
            return Err(ConfigError::ValidationFailed("timing.vision_fps must be 1–60"));
        }
        if !(5..=3600).contains(&self.timing.emotion_log_interval_secs) {
            return Err(ConfigError::ValidationFailed(
                "timing.emotion_log_interval_secs must be 5–3600",
            ));
        }
        if !(5..=86_400).contains(&self.timing.light_interval_secs) {
            return Err(ConfigError::ValidationFailed(
                "timing.light_interval_secs must be 5–86400",
            ));
        }
        if !(60..=86_400).contains(&self.timing.weather_interval_secs) {
            return Err(ConfigError::ValidationFailed(
                "timing.weather_interval_secs must be 60–86400",
            ));
        }
        if !(10..=5000).contains(&self.timing.coordinator_tick_ms) {
            return Err(ConfigError::ValidationFailed(
                "timing.coordinator_tick_ms must be 10–5000",
            ));
        }
        if let Some(serial) = &self.serial {
            if !(50..=30_000).contains(&serial.reply_timeout_ms) {
                return Err(ConfigError::ValidationFailed(
                    "serial.reply_timeout_ms must be 50–30000",
                ));
            }
        }
        if self.storage.journal_path.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "storage.journal_path must not be empty",
            ));
        }
        if !(1..=1_000_000).contains(&self.storage.retry_queue_capacity) {
            return Err(ConfigError::ValidationFailed(
                "storage.retry_queue_capacity must be 1–1000000",
            ));
        }
        if self.storage.retry_base_ms == 0 || self.storage.retry_base_ms > self.storage.retry_max_ms
        {
            return Err(ConfigError::ValidationFailed(
                "storage.retry_base_ms must be > 0 and <= retry_max_ms",
            ));
        }
        Ok(())
    }

    /// Profile for a category, if it is catalogued.
    pub fn profile(&self, category: FoodCategory) -> Option<&FoodProfile> {
        self.foods.get(&category)
    }
}
