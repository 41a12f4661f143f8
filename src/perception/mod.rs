//! Perception subsystem: detection types, dual-model fusion and emotion
//! smoothing.
//!
//! ```text
//!  narrow model ──┐
//!                 ├──▶ fusion::fuse ──▶ kept FusedDetections ──▶ cooldown
//!  general model ─┘
//!
//!  classifier ──▶ emotion::EmotionSmoother ──▶ SmoothedEmotion (cursor)
//! ```
//!
//! Everything here is pure: no I/O, no clocks.  Frames and timestamps are
//! supplied by the scheduling layer.

pub mod emotion;
pub mod fusion;

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::Timestamp;

// ───────────────────────────────────────────────────────────────
// Food categories
// ───────────────────────────────────────────────────────────────

/// Every food label the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoodCategory {
    Chip,
    Cookie,
    Nutella,
    Banana,
    Donut,
    Apple,
    Orange,
}

impl FoodCategory {
    pub const ALL: [Self; 7] = [
        Self::Chip,
        Self::Cookie,
        Self::Nutella,
        Self::Banana,
        Self::Donut,
        Self::Apple,
        Self::Orange,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chip => "chip",
            Self::Cookie => "cookie",
            Self::Nutella => "nutella",
            Self::Banana => "banana",
            Self::Donut => "donut",
            Self::Apple => "apple",
            Self::Orange => "orange",
        }
    }

    /// Map a raw model label onto a category.  Case-insensitive; accepts the
    /// plural forms the detectors emit for a few classes.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().to_ascii_lowercase();
        let found = match label.as_str() {
            "chip" | "chips" => Self::Chip,
            "cookie" | "cookies" => Self::Cookie,
            "nutella" => Self::Nutella,
            "banana" | "bananas" => Self::Banana,
            "donut" | "doughnut" | "donuts" => Self::Donut,
            "apple" | "apples" => Self::Apple,
            "orange" | "oranges" => Self::Orange,
            _ => return None,
        };
        Some(found)
    }
}

impl fmt::Display for FoodCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static health classification of a food category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTag {
    Healthy,
    Unhealthy,
}

impl HealthTag {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Detection sources
// ───────────────────────────────────────────────────────────────

/// Which detector produced a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    /// Custom, class-specific, high-precision model.
    Narrow,
    /// Broad COCO-style model, lower precision.
    General,
}

impl DetectionSource {
    /// Categories this source's model is trained on.
    pub const fn categories(self) -> &'static [FoodCategory] {
        match self {
            Self::Narrow => &[
                FoodCategory::Chip,
                FoodCategory::Cookie,
                FoodCategory::Nutella,
                FoodCategory::Banana,
                FoodCategory::Donut,
            ],
            Self::General => &[
                FoodCategory::Banana,
                FoodCategory::Donut,
                FoodCategory::Apple,
                FoodCategory::Orange,
            ],
        }
    }

    pub fn covers(self, category: FoodCategory) -> bool {
        self.categories().contains(&category)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Narrow => "narrow",
            Self::General => "general",
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Geometry
// ───────────────────────────────────────────────────────────────

/// Axis-aligned box in pixel coordinates, `(x1, y1)` top-left,
/// `(x2, y2)` bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub const fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Finite coordinates with strictly positive extent on both axes.
    pub fn is_well_formed(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite())
            && self.x2 > self.x1
            && self.y2 > self.y1
    }

    /// Intersection-over-Union.  Returns 0.0 for disjoint or degenerate
    /// boxes, never NaN.
    pub fn iou(&self, other: &Self) -> f32 {
        let x_min = self.x1.max(other.x1);
        let y_min = self.y1.max(other.y1);
        let x_max = self.x2.min(other.x2);
        let y_max = self.y2.min(other.y2);

        if x_max <= x_min || y_max <= y_min {
            return 0.0;
        }

        let intersection = (x_max - x_min) * (y_max - y_min);
        let union = self.area() + other.area() - intersection;

        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Detections
// ───────────────────────────────────────────────────────────────

/// One detector output for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub category: FoodCategory,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub source: DetectionSource,
}

impl Detection {
    pub const fn new(
        category: FoodCategory,
        bbox: BoundingBox,
        confidence: f32,
        source: DetectionSource,
    ) -> Self {
        Self {
            category,
            bbox,
            confidence,
            source,
        }
    }

    /// Confidence in `[0, 1]`, a well-formed box, and a category the
    /// producing model actually covers.
    pub fn is_well_formed(&self) -> bool {
        self.confidence.is_finite()
            && (0.0..=1.0).contains(&self.confidence)
            && self.bbox.is_well_formed()
            && self.source.covers(self.category)
    }
}

// ───────────────────────────────────────────────────────────────
// Frames
// ───────────────────────────────────────────────────────────────

/// A captured camera frame.  Pixel layout is opaque to the pipeline and
/// only interpreted by the model adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u64,
    pub captured_at: Timestamp,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Frame {
    /// A frame with no pixel payload (recorded sessions, tests).
    pub fn empty(seq: u64, captured_at: Timestamp) -> Self {
        Self {
            seq,
            captured_at,
            width: 0,
            height: 0,
            pixels: Vec::new(),
        }
    }
}
