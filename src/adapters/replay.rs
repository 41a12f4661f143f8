//! Recorded-session adapters.
//!
//! A recording is a JSON-lines file, one camera frame per line, holding
//! what the two detectors and the emotion classifier produced for it:
//!
//! ```text
//! {"t":1700000000000,"narrow":[{"label":"chips","confidence":0.91,"bbox":[10,10,80,90]}],
//!  "general":[],"emotion":{"label":"neutral","confidence":0.7}}
//! ```
//!
//! [`ReplayCamera`], [`ReplayDetector`] and [`ReplayClassifier`] share one
//! [`ReplaySession`] and implement the perception ports, so the whole
//! pipeline downstream of the models runs unchanged.  The camera rebases
//! recorded times onto the wall clock and, when paced, waits out the
//! recorded gaps so cooldowns and backfill delays play out as recorded.
//! Labels no catalogue category matches are dropped while loading.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Deserialize;

use crate::Timestamp;
use crate::app::ports::{CameraPort, DetectorPort, EmotionClassifierPort};
use crate::error::{ModelError, SensorError};
use crate::perception::emotion::{EmotionLabel, EmotionSample};
use crate::perception::{BoundingBox, Detection, DetectionSource, FoodCategory, Frame};

// ───────────────────────────────────────────────────────────────
// Recording format
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawDetection {
    label: String,
    confidence: f32,
    bbox: [f32; 4],
}

#[derive(Debug, Deserialize)]
struct RawEmotion {
    label: String,
    confidence: f32,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    t: Timestamp,
    #[serde(default)]
    narrow: Vec<RawDetection>,
    #[serde(default)]
    general: Vec<RawDetection>,
    #[serde(default)]
    emotion: Option<RawEmotion>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct RecordedDetection {
    category: FoodCategory,
    bbox: BoundingBox,
    confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
struct RecordedFrame {
    at: Timestamp,
    narrow: Vec<RecordedDetection>,
    general: Vec<RecordedDetection>,
    emotion: Option<(EmotionLabel, f32)>,
}

fn convert(raw: Vec<RawDetection>) -> Vec<RecordedDetection> {
    raw.into_iter()
        .filter_map(|d| {
            let Some(category) = FoodCategory::from_label(&d.label) else {
                debug!("Replay: ignoring label {:?}", d.label);
                return None;
            };
            let [x1, y1, x2, y2] = d.bbox;
            Some(RecordedDetection {
                category,
                bbox: BoundingBox::new(x1, y1, x2, y2),
                confidence: d.confidence,
            })
        })
        .collect()
}

/// A loaded recording.  Immutable; shared by the replay adapters.
#[derive(Debug)]
pub struct ReplaySession {
    frames: Vec<RecordedFrame>,
}

impl ReplaySession {
    /// Parse a recording.  Blank lines and `#` comments are skipped.
    /// Frame times must not go backwards.
    pub fn parse(text: &str) -> Result<Self, SensorError> {
        let mut frames: Vec<RecordedFrame> = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let raw: RawFrame = serde_json::from_str(line).map_err(|e| {
                warn!("Replay: line {} does not parse: {}", idx + 1, e);
                SensorError::Malformed
            })?;
            if frames.last().is_some_and(|prev| raw.t < prev.at) {
                warn!("Replay: line {} goes back in time", idx + 1);
                return Err(SensorError::Malformed);
            }
            let emotion = match raw.emotion {
                Some(e) => {
                    let label = EmotionLabel::from_label(&e.label).ok_or_else(|| {
                        warn!("Replay: line {} has unknown emotion {:?}", idx + 1, e.label);
                        SensorError::Malformed
                    })?;
                    Some((label, e.confidence))
                }
                None => None,
            };
            frames.push(RecordedFrame {
                at: raw.t,
                narrow: convert(raw.narrow),
                general: convert(raw.general),
                emotion,
            });
        }
        Ok(Self { frames })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SensorError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            warn!("Replay: cannot read {}: {}", path.display(), e);
            SensorError::Unavailable
        })?;
        let session = Self::parse(&text)?;
        info!("Replay: {} frame(s) from {}", session.len(), path.display());
        Ok(session)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Recorded span, first to last frame.
    pub fn duration_ms(&self) -> u64 {
        match (self.frames.first(), self.frames.last()) {
            (Some(a), Some(b)) => b.at - a.at,
            _ => 0,
        }
    }

    fn frame(&self, seq: u64) -> Option<&RecordedFrame> {
        usize::try_from(seq).ok().and_then(|i| self.frames.get(i))
    }
}

// ───────────────────────────────────────────────────────────────
// Camera
// ───────────────────────────────────────────────────────────────

/// Emits one [`Frame`] per recorded line; `seq` is the line's index into
/// the session.  Ends with [`SensorError::StreamEnded`].
pub struct ReplayCamera {
    session: Arc<ReplaySession>,
    next: usize,
    /// Wall-clock time the first frame maps to.
    origin: Timestamp,
    started: Instant,
    paced: bool,
}

impl ReplayCamera {
    pub fn new(session: Arc<ReplaySession>, origin: Timestamp) -> Self {
        Self {
            session,
            next: 0,
            origin,
            started: Instant::now(),
            paced: true,
        }
    }

    /// Disable waiting out recorded gaps (tests, batch re-analysis).
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }
}

impl CameraPort for ReplayCamera {
    fn capture(&mut self) -> Result<Frame, SensorError> {
        let first = self.session.frames.first().map_or(0, |f| f.at);
        let Some(frame) = self.session.frames.get(self.next) else {
            return Err(SensorError::StreamEnded);
        };
        let offset = frame.at - first;

        if self.paced {
            let due = self.started + Duration::from_millis(offset);
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }

        let seq = self.next as u64;
        self.next += 1;
        Ok(Frame::empty(seq, self.origin + offset))
    }
}

// ───────────────────────────────────────────────────────────────
// Models
// ───────────────────────────────────────────────────────────────

/// Returns the recorded detections of one model for the frame's `seq`.
pub struct ReplayDetector {
    session: Arc<ReplaySession>,
    source: DetectionSource,
}

impl ReplayDetector {
    pub fn new(session: Arc<ReplaySession>, source: DetectionSource) -> Self {
        Self { session, source }
    }
}

impl DetectorPort for ReplayDetector {
    fn source(&self) -> DetectionSource {
        self.source
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, ModelError> {
        let recorded = self
            .session
            .frame(frame.seq)
            .ok_or(ModelError::InferenceFailed("replay"))?;
        let list = match self.source {
            DetectionSource::Narrow => &recorded.narrow,
            DetectionSource::General => &recorded.general,
        };
        Ok(list
            .iter()
            .map(|d| Detection::new(d.category, d.bbox, d.confidence, self.source))
            .collect())
    }
}

/// Returns the recorded emotion for the frame, stamped with its capture
/// time.
pub struct ReplayClassifier {
    session: Arc<ReplaySession>,
}

impl ReplayClassifier {
    pub fn new(session: Arc<ReplaySession>) -> Self {
        Self { session }
    }
}

impl EmotionClassifierPort for ReplayClassifier {
    fn classify(&mut self, frame: &Frame) -> Result<Option<EmotionSample>, ModelError> {
        let recorded = self
            .session
            .frame(frame.seq)
            .ok_or(ModelError::InferenceFailed("replay"))?;
        Ok(recorded.emotion.map(|(label, confidence)| EmotionSample {
            label,
            confidence,
            timestamp: frame.captured_at,
        }))
    }
}
