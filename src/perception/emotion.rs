//! Emotion labels, valence ranking and the rolling majority-vote smoother.
//!
//! The smoother owns the only mutable mood state in the pipeline.  Readers
//! get a [`SmoothedEmotion`] by value, so every read is a complete snapshot.

use core::fmt;

use heapless::Deque;
use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// Number of raw samples the majority vote is taken over.
pub const SMOOTHING_WINDOW: usize = 5;

// ───────────────────────────────────────────────────────────────
// Labels
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmotionLabel {
    Positive,
    Neutral,
    NegativeLow,
    NegativeHigh,
    /// No sample observed yet, or the value is missing.
    #[default]
    Unknown,
}

impl EmotionLabel {
    pub const CLASSES: [Self; 4] = [
        Self::Positive,
        Self::Neutral,
        Self::NegativeLow,
        Self::NegativeHigh,
    ];

    /// Valence rank, higher is better.  `None` for [`Unknown`](Self::Unknown).
    pub const fn valence(self) -> Option<u8> {
        match self {
            Self::Positive => Some(4),
            Self::Neutral => Some(3),
            Self::NegativeLow => Some(2),
            Self::NegativeHigh => Some(1),
            Self::Unknown => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::NegativeLow => "negative_low",
            Self::NegativeHigh => "negative_high",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "positive" => Some(Self::Positive),
            "neutral" => Some(Self::Neutral),
            "negative_low" => Some(Self::NegativeLow),
            "negative_high" => Some(Self::NegativeHigh),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of mood change between two labels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmotionTrend {
    Improved,
    Worsened,
    Stable,
    #[default]
    Unknown,
}

impl EmotionTrend {
    /// Compare valence ranks.  Any unknown side makes the trend unknown.
    pub fn between(before: EmotionLabel, after: EmotionLabel) -> Self {
        match (before.valence(), after.valence()) {
            (Some(b), Some(a)) if a > b => Self::Improved,
            (Some(b), Some(a)) if a < b => Self::Worsened,
            (Some(_), Some(_)) => Self::Stable,
            _ => Self::Unknown,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Improved => "Improved",
            Self::Worsened => "Worsened",
            Self::Stable => "Stable",
            Self::Unknown => "Unknown",
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Samples
// ───────────────────────────────────────────────────────────────

/// One raw classifier output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionSample {
    pub label: EmotionLabel,
    pub confidence: f32,
    pub timestamp: Timestamp,
}

impl EmotionSample {
    pub fn is_well_formed(&self) -> bool {
        self.label != EmotionLabel::Unknown
            && self.confidence.is_finite()
            && (0.0..=1.0).contains(&self.confidence)
    }
}

/// Snapshot of the smoothed mood cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SmoothedEmotion {
    pub label: EmotionLabel,
    /// Mean confidence of the window samples carrying `label`.
    pub confidence: f32,
    /// Timestamp of the sample that made `label` the majority.
    pub updated_at: Option<Timestamp>,
}

// ───────────────────────────────────────────────────────────────
// Smoother
// ───────────────────────────────────────────────────────────────

/// Fixed-window majority vote over the last [`SMOOTHING_WINDOW`] samples.
pub struct EmotionSmoother {
    window: Deque<EmotionSample, SMOOTHING_WINDOW>,
    current: SmoothedEmotion,
}

impl EmotionSmoother {
    pub fn new() -> Self {
        Self {
            window: Deque::new(),
            current: SmoothedEmotion::default(),
        }
    }

    /// Push a sample (evicting the oldest once full) and recompute the
    /// majority.  Returns `true` when the smoothed label changed.
    ///
    /// Malformed samples are ignored.
    pub fn observe(&mut self, sample: EmotionSample) -> bool {
        if !sample.is_well_formed() {
            return false;
        }
        if self.window.is_full() {
            self.window.pop_front();
        }
        // Cannot fail: a slot was freed above.
        let _ = self.window.push_back(sample);

        let previous = self.current;
        self.current = self.vote(sample.timestamp);
        let changed = previous.label != self.current.label;
        if !changed {
            // Same majority: confidence refreshes, the change time stays.
            self.current.updated_at = previous.updated_at;
        }
        changed
    }

    pub fn current(&self) -> SmoothedEmotion {
        self.current
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Drop all history; the cursor returns to unknown.
    pub fn reset(&mut self) {
        self.window.clear();
        self.current = SmoothedEmotion::default();
    }

    /// Majority label; ties go to the label seen most recently.  `at` is
    /// stamped as `updated_at`.
    fn vote(&self, at: Timestamp) -> SmoothedEmotion {
        let mut best: Option<(EmotionLabel, usize, usize)> = None; // (label, count, last index)

        for label in EmotionLabel::CLASSES {
            let mut count = 0;
            let mut last = 0;
            for (i, s) in self.window.iter().enumerate() {
                if s.label == label {
                    count += 1;
                    last = i;
                }
            }
            if count == 0 {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, c, l)) => count > c || (count == c && last > l),
            };
            if better {
                best = Some((label, count, last));
            }
        }

        match best {
            Some((label, count, _)) => {
                let sum: f32 = self
                    .window
                    .iter()
                    .filter(|s| s.label == label)
                    .map(|s| s.confidence)
                    .sum();
                SmoothedEmotion {
                    label,
                    confidence: sum / count as f32,
                    updated_at: Some(at),
                }
            }
            None => SmoothedEmotion::default(),
        }
    }
}

impl Default for EmotionSmoother {
    fn default() -> Self {
        Self::new()
    }
}
