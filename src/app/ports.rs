//! Port traits: the hexagonal boundary between domain logic and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ AppService (domain)
//! ```
//!
//! Driven adapters (camera, models, actuator board, stores, event sinks)
//! implement these traits.  The [`AppService`](super::service::AppService)
//! and the scheduling layer consume them via generics, so the domain core
//! never touches devices or the network directly.
//!
//! ## Contract notes
//!
//! - **LocalStorePort** implementations MUST be durable when `append`
//!   returns `Ok` and MUST enforce record check constraints.
//! - **RemoteStorePort** writes MUST be idempotent by [`RecordKey`].
//! - **ConfigPort** implementations MUST validate before persisting.

use crate::Timestamp;
use crate::config::SystemConfig;
use crate::error::{ActuatorError, ModelError, SensorError};
use crate::perception::emotion::{EmotionLabel, EmotionSample, EmotionTrend};
use crate::perception::{Detection, DetectionSource, FoodCategory, Frame};
use crate::storage::record::{FoodEvent, Record, RecordKey, StoredRecord, Table};

// ───────────────────────────────────────────────────────────────
// Perception ports (driven adapters: camera / models → domain)
// ───────────────────────────────────────────────────────────────

/// Frame acquisition.  May block for at most one frame.
pub trait CameraPort {
    fn capture(&mut self) -> Result<Frame, SensorError>;
}

/// An object detector.  Two implementations run per frame: narrow and general.
pub trait DetectorPort {
    /// Which model this is.  Detections are expected to carry the same tag.
    fn source(&self) -> DetectionSource;

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, ModelError>;
}

/// Facial emotion classifier.
pub trait EmotionClassifierPort {
    /// `Ok(None)` when no face is visible in the frame.
    fn classify(&mut self, frame: &Frame) -> Result<Option<EmotionSample>, ModelError>;
}

// ───────────────────────────────────────────────────────────────
// Environment ports
// ───────────────────────────────────────────────────────────────

/// Ambient light sensor.
pub trait LightSensorPort {
    fn read_lux(&mut self) -> Result<f32, SensorError>;

    /// Sensor model stored alongside each reading.
    fn sensor_type(&self) -> &str;
}

/// One weather observation as returned by the weather collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherReading {
    pub condition: String,
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub sunrise: Option<Timestamp>,
    pub sunset: Option<Timestamp>,
}

/// Weather collaborator, polled on its own timer.
pub trait WeatherPort {
    fn fetch(&mut self) -> Result<WeatherReading, SensorError>;
}

// ───────────────────────────────────────────────────────────────
// Actuator port (driven adapter: domain → feedback hardware)
// ───────────────────────────────────────────────────────────────

/// Discrete commands understood by the feedback board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActuatorCommand {
    Shake,
    Nod,
    Reset,
    LedOn,
    LedOff,
}

impl ActuatorCommand {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Shake => "shake",
            Self::Nod => "nod",
            Self::Reset => "reset",
            Self::LedOn => "led_on",
            Self::LedOff => "led_off",
        }
    }
}

/// Write-side port: the domain calls this to command the feedback board.
/// `Ok` means the board acknowledged the command.
pub trait ActuatorPort {
    fn send(&mut self, command: ActuatorCommand) -> Result<(), ActuatorError>;
}

// ───────────────────────────────────────────────────────────────
// Event sink port (driven adapter: domain → logging / telemetry)
// ───────────────────────────────────────────────────────────────

/// The domain emits structured [`AppEvent`](super::events::AppEvent)s
/// through this port.  Adapters decide where they go.
pub trait EventSink {
    fn emit(&mut self, event: &super::events::AppEvent);
}

// ───────────────────────────────────────────────────────────────
// Configuration port
// ───────────────────────────────────────────────────────────────

/// Loads and persists system configuration.
///
/// Implementations MUST validate config values before persisting.
/// Invalid ranges are rejected with [`ConfigError::ValidationFailed`],
/// not silently clamped.
pub trait ConfigPort {
    /// Load configuration.  Returns [`SystemConfig::default()`] if no stored
    /// config exists.
    fn load(&self) -> Result<SystemConfig, ConfigError>;

    /// Validate and persist configuration.
    fn save(&self, config: &SystemConfig) -> Result<(), ConfigError>;
}

// ───────────────────────────────────────────────────────────────
// Clock port
// ───────────────────────────────────────────────────────────────

pub trait ClockPort {
    /// Milliseconds since the Unix epoch.
    fn now(&self) -> Timestamp;

    /// Local wall-clock hour (0-23) of `at`.
    fn local_hour(&self, at: Timestamp) -> u8;
}

// ───────────────────────────────────────────────────────────────
// Storage ports
// ───────────────────────────────────────────────────────────────

/// Durable local record store with timestamp and category indices.
pub trait LocalStorePort {
    /// Validate and durably append a new record.
    fn append(&mut self, key: RecordKey, record: &Record) -> Result<(), StorageError>;

    /// Durably set `emotion_after` / `emotion_trend` on a food event.
    /// Only the first backfill of a record is accepted.
    fn backfill(
        &mut self,
        key: RecordKey,
        after: EmotionLabel,
        trend: EmotionTrend,
    ) -> Result<(), StorageError>;

    /// Durably clear `warning_triggered` on a food event whose warning the
    /// board never acknowledged.  A no-op if the flag is already clear.
    fn retract_warning(&mut self, key: RecordKey) -> Result<(), StorageError>;

    /// Durably record that `version` of `key` is on the remote.  Older
    /// versions than the one already marked are ignored.
    fn mark_replicated(&mut self, key: RecordKey, version: u32) -> Result<(), StorageError>;

    fn get(&self, key: RecordKey) -> Option<StoredRecord>;

    /// Keys whose current version has not reached the remote, in write order.
    fn unreplicated(&self) -> Vec<RecordKey>;

    /// Records of `table` with `from <= timestamp < to`, oldest first.
    fn range(&self, table: Table, from: Timestamp, to: Timestamp) -> Vec<(RecordKey, Record)>;

    /// Food events of one category, oldest first.
    fn by_category(&self, category: FoodCategory) -> Vec<(RecordKey, FoodEvent)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Eventually consistent remote copy of the local store.
pub trait RemoteStorePort {
    /// Insert or replace the row for `key`.  Safe to repeat.
    fn upsert(&mut self, key: RecordKey, record: &Record) -> Result<(), RemoteError>;
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from [`ConfigPort`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No config found in storage (first run).
    NotFound,
    /// Stored config failed to deserialize.
    Corrupted,
    /// A config field failed range validation.
    /// The `&'static str` describes which field and why.
    ValidationFailed(&'static str),
    /// A secret named by the config is missing from the environment.
    MissingSecret(String),
    /// Generic I/O error from the storage backend.
    IoError,
}

/// Errors from [`LocalStorePort`] operations.  All of them are
/// local-durability failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Filesystem operation failed.
    Io {
        op: &'static str,
        kind: std::io::ErrorKind,
    },
    /// Record violates a check constraint.
    ConstraintViolation(&'static str),
    /// Requested key does not exist.
    NotFound,
    /// Backfill targeted a record that is not a food event or was already
    /// backfilled.
    NotBackfillable,
    /// Record could not be encoded.
    Encode,
    /// Journal line could not be decoded.
    Corrupted { line: usize },
    /// Store lock poisoned by a panicking writer.
    Poisoned,
}

impl StorageError {
    pub fn io(op: &'static str, e: &std::io::Error) -> Self {
        Self::Io { op, kind: e.kind() }
    }

    /// Whether the same write may succeed later.  Only filesystem failures
    /// qualify; everything else is a property of the record or the store.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

/// Errors from [`RemoteStorePort`] operations.  Always transient from the
/// pipeline's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Connection failed.
    Unreachable(String),
    /// Request timed out.
    Timeout,
    /// Server rejected the write.
    Rejected { status: u16 },
    /// Remote store is not available (not configured, injected failure).
    Unavailable,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "config not found"),
            Self::Corrupted => write!(f, "config corrupted"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {}", msg),
            Self::MissingSecret(var) => write!(f, "environment variable {} not set", var),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl core::fmt::Display for StorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Io { op, kind } => write!(f, "{} failed: {}", op, kind),
            Self::ConstraintViolation(msg) => write!(f, "constraint violated: {}", msg),
            Self::NotFound => write!(f, "record not found"),
            Self::NotBackfillable => write!(f, "record cannot be backfilled"),
            Self::Encode => write!(f, "encode failed"),
            Self::Corrupted { line } => write!(f, "journal corrupted at line {}", line),
            Self::Poisoned => write!(f, "store lock poisoned"),
        }
    }
}

impl core::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Unreachable(why) => write!(f, "unreachable: {}", why),
            Self::Timeout => write!(f, "timed out"),
            Self::Rejected { status } => write!(f, "rejected with HTTP {}", status),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

impl std::error::Error for ConfigError {}
impl std::error::Error for StorageError {}
impl std::error::Error for RemoteError {}
