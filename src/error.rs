//! Unified error types for the SmartSnack pipeline.
//!
//! A single `Error` enum that every subsystem can convert into, keeping the
//! coordinator's error handling uniform.  The variants map onto the four
//! failure classes the pipeline distinguishes:
//!
//! | Class                  | Variants                         | Policy                 |
//! |------------------------|----------------------------------|------------------------|
//! | transient-recoverable  | `Remote`, `Sensor` (weather)     | log, retry or skip     |
//! | local durability       | `Storage`                        | hold and retry or halt |
//! | sensor / model         | `Sensor`, `Model`                | drop frame, continue   |
//! | actuation              | `Actuator`                       | flag on the event      |
//!
//! Port-specific errors (`StorageError`, `RemoteError`, `ConfigError`) live
//! next to their traits in [`crate::app::ports`].

use core::fmt;

pub use crate::app::ports::{ConfigError, RemoteError, StorageError};

// ---------------------------------------------------------------------------
// Top-level pipeline error
// ---------------------------------------------------------------------------

/// Every fallible operation in the pipeline funnels into this type.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A camera, light sensor or weather source could not be read.
    Sensor(SensorError),
    /// A detector or classifier failed or returned malformed output.
    Model(ModelError),
    /// An actuator command was not acknowledged.
    Actuator(ActuatorError),
    /// Local durable storage failed.  Retryable failures hold the record.
    Storage(StorageError),
    /// Remote replication failed. Always retried.
    Remote(RemoteError),
    /// Configuration is invalid or could not be loaded.
    Config(ConfigError),
    /// Pipeline wiring failed at startup.
    Init(&'static str),
}

impl Error {
    /// Whether this error threatens the no-data-loss guarantee and must stop
    /// the pipeline.  A retryable storage failure is not fatal: the record
    /// is held and written once the journal recovers.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Storage(e) => !e.is_retryable(),
            Self::Init(_) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sensor(e) => write!(f, "sensor: {e}"),
            Self::Model(e) => write!(f, "model: {e}"),
            Self::Actuator(e) => write!(f, "actuator: {e}"),
            Self::Storage(e) => write!(f, "storage: {e}"),
            Self::Remote(e) => write!(f, "remote: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Init(msg) => write!(f, "init: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Sensor errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    /// Device is not connected or could not be opened.
    Unavailable,
    /// A read returned an error or timed out.
    ReadFailed,
    /// Reading is outside the physically plausible range.
    OutOfRange,
    /// The source has no more frames (recorded sessions).
    StreamEnded,
    /// Response could not be parsed.
    Malformed,
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "device unavailable"),
            Self::ReadFailed => write!(f, "read failed"),
            Self::OutOfRange => write!(f, "reading out of range"),
            Self::StreamEnded => write!(f, "stream ended"),
            Self::Malformed => write!(f, "malformed response"),
        }
    }
}

impl std::error::Error for SensorError {}

impl From<SensorError> for Error {
    fn from(e: SensorError) -> Self {
        Self::Sensor(e)
    }
}

// ---------------------------------------------------------------------------
// Model errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelError {
    /// Inference call failed. The tag names the model.
    InferenceFailed(&'static str),
    /// Output did not decode into detections / labels.
    MalformedOutput,
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InferenceFailed(model) => write!(f, "{model} inference failed"),
            Self::MalformedOutput => write!(f, "malformed model output"),
        }
    }
}

impl std::error::Error for ModelError {}

impl From<ModelError> for Error {
    fn from(e: ModelError) -> Self {
        Self::Model(e)
    }
}

// ---------------------------------------------------------------------------
// Actuator errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorError {
    /// Link closed or returned nothing before the reply terminator.
    NoAck,
    /// Board answered with something other than the expected ack.
    UnexpectedReply,
    /// Writing the command to the link failed.
    WriteFailed,
    /// No actuator link is configured.
    Disconnected,
}

impl fmt::Display for ActuatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAck => write!(f, "no acknowledgement"),
            Self::UnexpectedReply => write!(f, "unexpected reply"),
            Self::WriteFailed => write!(f, "link write failed"),
            Self::Disconnected => write!(f, "actuator disconnected"),
        }
    }
}

impl std::error::Error for ActuatorError {}

impl From<ActuatorError> for Error {
    fn from(e: ActuatorError) -> Self {
        Self::Actuator(e)
    }
}

// ---------------------------------------------------------------------------
// Port error conversions
// ---------------------------------------------------------------------------

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        Self::Remote(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Pipeline-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
