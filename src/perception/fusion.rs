//! Dual-model detection fusion.
//!
//! Merges the narrow (class-specific) and general (COCO-style) detector
//! outputs for one frame into a set where no two kept entries claim the same
//! physical object.
//!
//! ```text
//!  narrow ──▶ sanitize ──▶ NMS ──┐
//!                                ├──▶ cross-source resolution ──▶ sort
//!  general ─▶ sanitize ──▶ NMS ──┘
//! ```
//!
//! Cross-source precedence for a general detection `g` and the narrow
//! detections `N(g)` overlapping it above the threshold:
//!
//! | condition                               | outcome                          |
//! |-----------------------------------------|----------------------------------|
//! | `N(g)` empty                            | `g` kept                         |
//! | some `n ∈ N(g)` ≥ acceptance            | `g` and weak members suppressed  |
//! | `g` ≥ acceptance                        | `g` kept, all of `N(g)` suppressed|
//! | otherwise                               | `g` and `N(g)` discarded         |
//!
//! Each rule only ever demotes detections and depends on static confidences,
//! so the kept set does not depend on the order in which pairs are visited.

use core::cmp::Ordering;

use log::{debug, warn};

use super::{Detection, DetectionSource};
use crate::config::FusionConfig;

/// Why a detection is or is not part of the fused output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Part of the fused output.
    Kept,
    /// Lost to a higher-precedence detection of the same object.
    SuppressedByOverlap,
    /// Part of an overlapping pair where nothing met the acceptance threshold.
    BelowAcceptance,
}

/// A detection annotated with its fusion outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusedDetection {
    pub detection: Detection,
    pub resolution: Resolution,
}

impl FusedDetection {
    pub fn is_kept(&self) -> bool {
        self.resolution == Resolution::Kept
    }
}

/// Result of fusing one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FusionOutcome {
    /// Every well-formed input, each with its resolution, in deterministic
    /// order.
    pub fused: Vec<FusedDetection>,
    /// Inputs dropped by sanitization.
    pub malformed: usize,
}

impl FusionOutcome {
    /// The fused output proper: only detections that survived.
    pub fn kept(&self) -> impl Iterator<Item = &Detection> {
        self.fused
            .iter()
            .filter(|f| f.is_kept())
            .map(|f| &f.detection)
    }

    pub fn kept_count(&self) -> usize {
        self.kept().count()
    }

    pub fn suppressed_count(&self) -> usize {
        self.fused.len() - self.kept_count()
    }
}

/// Stateless fusion engine parameterised by thresholds.
#[derive(Debug, Clone, Copy)]
pub struct FusionEngine {
    overlap_threshold: f32,
    min_acceptance: f32,
}

impl FusionEngine {
    pub fn new(config: &FusionConfig) -> Self {
        Self {
            overlap_threshold: config.overlap_iou_threshold,
            min_acceptance: config.min_acceptance_confidence,
        }
    }

    /// Fuse the two detector outputs of one frame.  Never fails: malformed
    /// inputs are dropped and counted, empty inputs give empty output.
    pub fn fuse(&self, narrow: &[Detection], general: &[Detection]) -> FusionOutcome {
        let mut malformed = 0;
        let narrow = sanitize(narrow, DetectionSource::Narrow, &mut malformed);
        let general = sanitize(general, DetectionSource::General, &mut malformed);

        let (mut narrow, narrow_dups) = self.suppress_duplicates(narrow);
        let (mut general, general_dups) = self.suppress_duplicates(general);

        self.resolve_cross_source(&mut narrow, &mut general);

        let mut fused: Vec<FusedDetection> = narrow
            .into_iter()
            .chain(general)
            .chain(narrow_dups)
            .chain(general_dups)
            .collect();
        fused.sort_by(|a, b| precedence(&a.detection, &b.detection));

        debug!(
            "FUSION: kept={} suppressed={} malformed={}",
            fused.iter().filter(|f| f.is_kept()).count(),
            fused.iter().filter(|f| !f.is_kept()).count(),
            malformed
        );

        FusionOutcome { fused, malformed }
    }

    fn overlaps(&self, a: &Detection, b: &Detection) -> bool {
        a.bbox.iou(&b.bbox) > self.overlap_threshold
    }

    /// Greedy single-source NMS: visit in precedence order, keep a detection
    /// only if it overlaps nothing kept so far.  Category-agnostic, since two
    /// labels on one box from one model are still one object.
    ///
    /// Returns `(survivors, duplicates)`.
    fn suppress_duplicates(
        &self,
        mut detections: Vec<Detection>,
    ) -> (Vec<FusedDetection>, Vec<FusedDetection>) {
        detections.sort_by(precedence);

        let mut survivors: Vec<FusedDetection> = Vec::with_capacity(detections.len());
        let mut duplicates = Vec::new();
        for detection in detections {
            let fused = FusedDetection {
                detection,
                resolution: Resolution::Kept,
            };
            if survivors
                .iter()
                .any(|kept| self.overlaps(&kept.detection, &detection))
            {
                duplicates.push(FusedDetection {
                    resolution: Resolution::SuppressedByOverlap,
                    ..fused
                });
            } else {
                survivors.push(fused);
            }
        }
        (survivors, duplicates)
    }

    fn resolve_cross_source(
        &self,
        narrow: &mut [FusedDetection],
        general: &mut [FusedDetection],
    ) {
        // Every NMS survivor takes part, demoted or not, so the matching sets
        // are fixed before any rule runs.
        for g in general.iter_mut() {
            let matched: Vec<usize> = narrow
                .iter()
                .enumerate()
                .filter(|(_, n)| self.overlaps(&n.detection, &g.detection))
                .map(|(i, _)| i)
                .collect();

            if matched.is_empty() {
                continue;
            }

            let narrow_accepted = matched
                .iter()
                .any(|&i| narrow[i].detection.confidence >= self.min_acceptance);

            if narrow_accepted {
                g.resolution = Resolution::SuppressedByOverlap;
                for &i in &matched {
                    if narrow[i].detection.confidence < self.min_acceptance {
                        demote(&mut narrow[i], Resolution::SuppressedByOverlap);
                    }
                }
            } else if g.detection.confidence >= self.min_acceptance {
                for &i in &matched {
                    demote(&mut narrow[i], Resolution::SuppressedByOverlap);
                }
            } else {
                g.resolution = Resolution::BelowAcceptance;
                for &i in &matched {
                    demote(&mut narrow[i], Resolution::BelowAcceptance);
                }
            }
        }
    }
}

/// First demotion wins so the recorded reason is stable.
fn demote(fused: &mut FusedDetection, to: Resolution) {
    if fused.is_kept() {
        fused.resolution = to;
    }
}

fn sanitize(input: &[Detection], source: DetectionSource, malformed: &mut usize) -> Vec<Detection> {
    let mut out = Vec::with_capacity(input.len());
    for d in input {
        if d.source == source && d.is_well_formed() {
            out.push(*d);
        } else {
            *malformed += 1;
            warn!(
                "FUSION: dropping malformed {} detection ({} conf={})",
                source.as_str(),
                d.category,
                d.confidence
            );
        }
    }
    out
}

/// Total order used for NMS and for the output: confidence descending,
/// narrow before general on ties, then category and box coordinates.
fn precedence(a: &Detection, b: &Detection) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| a.source.cmp(&b.source))
        .then_with(|| a.category.cmp(&b.category))
        .then_with(|| a.bbox.x1.total_cmp(&b.bbox.x1))
        .then_with(|| a.bbox.y1.total_cmp(&b.bbox.y1))
        .then_with(|| a.bbox.x2.total_cmp(&b.bbox.x2))
        .then_with(|| a.bbox.y2.total_cmp(&b.bbox.y2))
}
