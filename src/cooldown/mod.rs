//! Cooldown controller.
//!
//! Decides which fused detections become food events.  Each category has
//! its own [`CooldownState`]; a kept detection at or above the category's
//! detection threshold that arrives while the category is idle is
//! accepted and starts the category's cooldown window.  The controller
//! also owns the [`ActuationPolicy`]: acceptance plans the board feedback,
//! and the caller drives it with [`CooldownController::actuate`] once the
//! event is logged.
//!
//! ```text
//!   kept detection ──▶ profile? ──▶ threshold? ──▶ idle? ──▶ Accepted { feedback }
//!                        │             │             │               │
//!                   Uncatalogued  BelowThreshold  Suppressed   (log event)
//!                                                                    ▼
//!                                                         ActuationPolicy::actuate
//! ```

pub mod actuation;
pub mod state;

use std::collections::BTreeMap;

use log::{debug, info};

use crate::Timestamp;
use crate::app::ports::ActuatorPort;
use crate::config::{FoodProfile, SystemConfig};
use crate::perception::{Detection, FoodCategory};

pub use actuation::{ActuationFailure, ActuationOutcome, ActuationPolicy, Feedback};
pub use state::{CooldownPhase, CooldownState};

/// What happened to one kept detection.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted {
        detection: Detection,
        profile: FoodProfile,
        /// Board feedback to drive once the event is logged.
        feedback: Option<Feedback>,
    },
    /// Category is cooling down.  The window was not extended.
    Suppressed { remaining_ms: u64 },
    BelowThreshold,
    /// No profile configured for the category.
    Uncatalogued,
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    /// Whether the accepted event carries a warning.
    pub fn plans_warning(&self) -> bool {
        matches!(
            self,
            Self::Accepted {
                feedback: Some(Feedback::Warning),
                ..
            }
        )
    }
}

pub struct CooldownController {
    profiles: BTreeMap<FoodCategory, FoodProfile>,
    states: BTreeMap<FoodCategory, CooldownState>,
    actuation: ActuationPolicy,
}

impl CooldownController {
    pub fn new(config: &SystemConfig) -> Self {
        Self {
            profiles: config.foods.clone(),
            states: FoodCategory::ALL
                .iter()
                .map(|&c| (c, CooldownState::new(c)))
                .collect(),
            actuation: ActuationPolicy::new(config.actuation),
        }
    }

    /// Classify one kept detection and, if accepted, start its cooldown
    /// and plan the board feedback.  Never touches the board.
    pub fn process(&mut self, detection: &Detection, now: Timestamp, hour: Option<u8>) -> Verdict {
        let Some(profile) = self.profiles.get(&detection.category).copied() else {
            return Verdict::Uncatalogued;
        };
        if detection.confidence < profile.detection_threshold {
            return Verdict::BelowThreshold;
        }

        let state = self
            .states
            .entry(detection.category)
            .or_insert_with(|| CooldownState::new(detection.category));
        state.expire(now);
        let remaining_ms = state.remaining_ms(now);
        if remaining_ms > 0 {
            debug!(
                "Cooldown: {} suppressed, {}ms left",
                detection.category, remaining_ms
            );
            return Verdict::Suppressed { remaining_ms };
        }

        let cooldown_ms = u64::from(profile.cooldown_secs) * 1_000;
        state.commit(now, cooldown_ms);
        info!(
            "Cooldown: {} accepted (conf={:.2}), cooling down {}s",
            detection.category, detection.confidence, profile.cooldown_secs
        );

        Verdict::Accepted {
            detection: *detection,
            profile,
            feedback: self.actuation.plan(profile.health, now, hour),
        }
    }

    /// Drive the board for the feedback of an accepted detection.
    pub fn actuate(
        &mut self,
        feedback: Feedback,
        now: Timestamp,
        actuator: &mut impl ActuatorPort,
    ) -> ActuationOutcome {
        self.actuation.actuate(feedback, now, actuator)
    }

    /// Return every elapsed category to idle.  Returns the categories
    /// that transitioned.
    pub fn expire(&mut self, now: Timestamp) -> Vec<FoodCategory> {
        self.states
            .values_mut()
            .filter_map(|s| s.expire(now).then_some(s.category))
            .collect()
    }

    /// Send due actuator releases.
    pub fn tick_actuation(
        &mut self,
        now: Timestamp,
        actuator: &mut impl ActuatorPort,
    ) -> Vec<ActuationFailure> {
        self.actuation.tick(now, actuator)
    }

    /// Clear every cooldown window.
    pub fn reset_all(&mut self) {
        for state in self.states.values_mut() {
            state.reset();
        }
        info!("Cooldown: all categories reset");
    }

    /// Put the feedback board at rest.
    pub fn rest(&mut self, actuator: &mut impl ActuatorPort) -> Vec<ActuationFailure> {
        self.actuation.rest(actuator)
    }

    pub fn state(&self, category: FoodCategory) -> Option<&CooldownState> {
        self.states.get(&category)
    }
}
