//! Inbound commands to the application service.
//!
//! Producers (vision loop, emotion log timer, operator console) send
//! these through the coordinator inbox; the
//! [`AppService`](super::service::AppService) interprets them one at a
//! time.

use crate::Timestamp;
use crate::perception::Detection;
use crate::perception::emotion::EmotionSample;

/// Everything the vision loop extracted from one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PerceptionFrame {
    pub seq: u64,
    pub captured_at: Timestamp,
    pub narrow: Vec<Detection>,
    pub general: Vec<Detection>,
    /// `None` when no face was visible or the classifier failed.
    pub emotion: Option<EmotionSample>,
}

/// Commands that producers can send into the application core.
#[derive(Debug, Clone, PartialEq)]
pub enum AppCommand {
    /// Fuse, gate and commit one frame's detections.
    Frame(PerceptionFrame),

    /// Persist the current smoothed emotion (periodic emotion log).
    LogEmotion { at: Timestamp },

    /// Clear every cooldown window.
    ResetCooldowns,

    /// Clear the smoothing window.
    ResetEmotion,

    /// Stop the coordinator loop.
    Shutdown,
}
