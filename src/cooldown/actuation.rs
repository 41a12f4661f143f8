//! Feedback actuation for accepted detections.
//!
//! ```text
//!   unhealthy ──▶ LED_ON, SHAKE ──(led_hold)──▶ LED_OFF, RESET
//!   healthy   ──▶ NOD           ──(1 s)──────▶ RESET
//! ```
//!
//! Feedback is decided in two steps.  [`ActuationPolicy::plan`] picks the
//! feedback when a detection is accepted, so the event can be logged with
//! its warning flag first.  [`ActuationPolicy::actuate`] then drives the
//! board.  Warnings are rate limited across all categories.
//!
//! Releases are scheduled, never slept on: the coordinator calls
//! [`ActuationPolicy::tick`] and due releases are sent from there.
//! A failed command is reported to the caller and otherwise ignored; it
//! never blocks or rolls back event logging.

use log::{debug, info, warn};

use crate::Timestamp;
use crate::app::ports::{ActuatorCommand, ActuatorPort};
use crate::config::ActuationConfig;
use crate::error::ActuatorError;
use crate::perception::HealthTag;

const WARNING: [ActuatorCommand; 2] = [ActuatorCommand::LedOn, ActuatorCommand::Shake];
const WARNING_RELEASE: [ActuatorCommand; 2] = [ActuatorCommand::LedOff, ActuatorCommand::Reset];
const ENCOURAGE: [ActuatorCommand; 1] = [ActuatorCommand::Nod];
const ENCOURAGE_RELEASE: [ActuatorCommand; 1] = [ActuatorCommand::Reset];
const REST: [ActuatorCommand; 2] = [ActuatorCommand::LedOff, ActuatorCommand::Reset];

/// Hold time of the nod before the servo returns to rest.
const NOD_HOLD_MS: u64 = 1_000;

/// A command the board did not acknowledge.
pub type ActuationFailure = (ActuatorCommand, ActuatorError);

/// Board feedback chosen for one accepted detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    /// LED on and shake, released after the hold.
    Warning,
    /// Nod, released after one second.
    Encourage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRelease {
    due_at: Timestamp,
    commands: &'static [ActuatorCommand],
}

/// Result of driving the board for one accepted detection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActuationOutcome {
    /// Warning sequence issued and every command acknowledged.
    pub warning_triggered: bool,
    pub failures: Vec<ActuationFailure>,
}

pub struct ActuationPolicy {
    config: ActuationConfig,
    pending: Vec<PendingRelease>,
    last_warning_at: Option<Timestamp>,
}

impl ActuationPolicy {
    pub fn new(config: ActuationConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
            last_warning_at: None,
        }
    }

    /// Whether an unhealthy detection at local `hour` gets a warning.
    /// An unknown hour counts as inside the window.
    pub fn warns_at(&self, hour: Option<u8>) -> bool {
        if !self.config.warn_unhealthy {
            return false;
        }
        match (self.config.warning_hours, hour) {
            (Some(window), Some(h)) => window.contains(h),
            _ => true,
        }
    }

    /// Milliseconds until another warning is allowed.  0 when allowed now.
    pub fn warning_wait_ms(&self, now: Timestamp) -> u64 {
        let interval_ms = u64::from(self.config.warning_interval_secs) * 1_000;
        match self.last_warning_at {
            Some(last) => (last.saturating_add(interval_ms)).saturating_sub(now),
            None => 0,
        }
    }

    /// Choose the feedback for one accepted detection.  A planned warning
    /// starts the rate-limit interval.
    pub fn plan(&mut self, health: HealthTag, now: Timestamp, hour: Option<u8>) -> Option<Feedback> {
        match health {
            HealthTag::Unhealthy if !self.warns_at(hour) => {
                debug!("Actuation: outside warning hours, no warning");
                None
            }
            HealthTag::Unhealthy => {
                let wait_ms = self.warning_wait_ms(now);
                if wait_ms > 0 {
                    debug!("Actuation: warning rate limited, {}ms left", wait_ms);
                    return None;
                }
                self.last_warning_at = Some(now);
                Some(Feedback::Warning)
            }
            HealthTag::Healthy if self.config.encourage_healthy => Some(Feedback::Encourage),
            HealthTag::Healthy => None,
        }
    }

    /// Drive the board for a planned feedback.
    pub fn actuate(
        &mut self,
        feedback: Feedback,
        now: Timestamp,
        actuator: &mut impl ActuatorPort,
    ) -> ActuationOutcome {
        let mut outcome = ActuationOutcome::default();
        match feedback {
            Feedback::Warning => {
                outcome.failures = send_all(actuator, &WARNING);
                outcome.warning_triggered = outcome.failures.is_empty();
                let hold_ms = u64::from(self.config.led_hold_secs) * 1_000;
                self.schedule(now.saturating_add(hold_ms), &WARNING_RELEASE);
                info!(
                    "Actuation: warning issued (acked={}), release in {}s",
                    outcome.warning_triggered, self.config.led_hold_secs
                );
            }
            Feedback::Encourage => {
                outcome.failures = send_all(actuator, &ENCOURAGE);
                self.schedule(now.saturating_add(NOD_HOLD_MS), &ENCOURAGE_RELEASE);
            }
        }
        outcome
    }

    /// Replace any pending release of the same sequence so a repeated
    /// warning extends the hold instead of cutting it short.
    fn schedule(&mut self, due_at: Timestamp, commands: &'static [ActuatorCommand]) {
        self.pending.retain(|p| p.commands != commands);
        self.pending.push(PendingRelease { due_at, commands });
    }

    /// Send every release that is due at `now`.
    pub fn tick(&mut self, now: Timestamp, actuator: &mut impl ActuatorPort) -> Vec<ActuationFailure> {
        let mut failures = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].due_at <= now {
                let release = self.pending.remove(i);
                failures.extend(send_all(actuator, release.commands));
            } else {
                i += 1;
            }
        }
        failures
    }

    pub fn pending_releases(&self) -> usize {
        self.pending.len()
    }

    /// Drop pending releases and put the board at rest (LED off, servo
    /// centred).
    pub fn rest(&mut self, actuator: &mut impl ActuatorPort) -> Vec<ActuationFailure> {
        self.pending.clear();
        send_all(actuator, &REST)
    }
}

fn send_all(actuator: &mut impl ActuatorPort, commands: &[ActuatorCommand]) -> Vec<ActuationFailure> {
    let mut failures = Vec::new();
    for &cmd in commands {
        if let Err(e) = actuator.send(cmd) {
            warn!("Actuation: {} failed: {}", cmd.as_str(), e);
            failures.push((cmd, e));
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HourWindow;

    #[derive(Default)]
    struct Board {
        sent: Vec<ActuatorCommand>,
        fail_on: Option<ActuatorCommand>,
    }

    impl ActuatorPort for Board {
        fn send(&mut self, command: ActuatorCommand) -> Result<(), ActuatorError> {
            if self.fail_on == Some(command) {
                return Err(ActuatorError::NoAck);
            }
            self.sent.push(command);
            Ok(())
        }
    }

    fn accept(
        policy: &mut ActuationPolicy,
        health: HealthTag,
        now: Timestamp,
        hour: Option<u8>,
        board: &mut Board,
    ) -> ActuationOutcome {
        match policy.plan(health, now, hour) {
            Some(feedback) => policy.actuate(feedback, now, board),
            None => ActuationOutcome::default(),
        }
    }

    fn unlimited() -> ActuationConfig {
        ActuationConfig {
            warning_interval_secs: 0,
            ..ActuationConfig::default()
        }
    }

    #[test]
    fn unhealthy_warns_then_releases_after_hold() {
        let mut policy = ActuationPolicy::new(ActuationConfig::default());
        let mut board = Board::default();
        let out = accept(&mut policy, HealthTag::Unhealthy, 0, Some(12), &mut board);
        assert!(out.warning_triggered);
        assert_eq!(board.sent, WARNING.to_vec());

        assert!(policy.tick(4_999, &mut board).is_empty());
        assert_eq!(board.sent.len(), 2);
        policy.tick(5_000, &mut board);
        assert_eq!(&board.sent[2..], &WARNING_RELEASE);
        assert_eq!(policy.pending_releases(), 0);
    }

    #[test]
    fn plan_does_not_touch_the_board() {
        let mut policy = ActuationPolicy::new(ActuationConfig::default());
        assert_eq!(
            policy.plan(HealthTag::Unhealthy, 0, None),
            Some(Feedback::Warning)
        );
        assert_eq!(policy.plan(HealthTag::Healthy, 0, None), None);
        assert_eq!(policy.pending_releases(), 0);
    }

    #[test]
    fn unacked_command_clears_warning_flag() {
        let mut policy = ActuationPolicy::new(ActuationConfig::default());
        let mut board = Board {
            fail_on: Some(ActuatorCommand::Shake),
            ..Board::default()
        };
        let out = accept(&mut policy, HealthTag::Unhealthy, 0, None, &mut board);
        assert!(!out.warning_triggered);
        assert_eq!(out.failures, vec![(ActuatorCommand::Shake, ActuatorError::NoAck)]);
    }

    #[test]
    fn warning_hours_gate_the_warning() {
        let config = ActuationConfig {
            warning_hours: Some(HourWindow {
                start_hour: 19,
                end_hour: 4,
            }),
            ..ActuationConfig::default()
        };
        let mut policy = ActuationPolicy::new(config);
        let mut board = Board::default();
        let out = accept(&mut policy, HealthTag::Unhealthy, 0, Some(12), &mut board);
        assert!(!out.warning_triggered);
        assert!(board.sent.is_empty());
        assert!(accept(&mut policy, HealthTag::Unhealthy, 0, Some(2), &mut board).warning_triggered);
    }

    #[test]
    fn warnings_are_rate_limited_across_categories() {
        let mut policy = ActuationPolicy::new(ActuationConfig::default());
        let mut board = Board::default();
        // Chip, then a cookie 10 s later: one shake only.
        assert!(accept(&mut policy, HealthTag::Unhealthy, 0, None, &mut board).warning_triggered);
        assert_eq!(policy.warning_wait_ms(10_000), 20_000);
        assert!(!accept(&mut policy, HealthTag::Unhealthy, 10_000, None, &mut board).warning_triggered);
        assert_eq!(board.sent, WARNING.to_vec());
        // The limited detection did not restart the interval.
        assert!(accept(&mut policy, HealthTag::Unhealthy, 30_000, None, &mut board).warning_triggered);
        assert_eq!(board.sent.len(), 4);
    }

    #[test]
    fn zero_interval_disables_rate_limit() {
        let mut policy = ActuationPolicy::new(unlimited());
        let mut board = Board::default();
        for t in [0, 1, 2] {
            assert!(accept(&mut policy, HealthTag::Unhealthy, t, None, &mut board).warning_triggered);
        }
        assert_eq!(policy.warning_wait_ms(2), 0);
    }

    #[test]
    fn healthy_nod_only_when_enabled() {
        let mut board = Board::default();
        let mut off = ActuationPolicy::new(ActuationConfig::default());
        accept(&mut off, HealthTag::Healthy, 0, None, &mut board);
        assert!(board.sent.is_empty());

        let mut on = ActuationPolicy::new(ActuationConfig {
            encourage_healthy: true,
            ..ActuationConfig::default()
        });
        let out = accept(&mut on, HealthTag::Healthy, 0, None, &mut board);
        assert!(!out.warning_triggered);
        on.tick(1_000, &mut board);
        assert_eq!(board.sent, vec![ActuatorCommand::Nod, ActuatorCommand::Reset]);
    }

    #[test]
    fn repeated_warning_extends_hold() {
        let mut policy = ActuationPolicy::new(unlimited());
        let mut board = Board::default();
        accept(&mut policy, HealthTag::Unhealthy, 0, None, &mut board);
        accept(&mut policy, HealthTag::Unhealthy, 3_000, None, &mut board);
        assert_eq!(policy.pending_releases(), 1);
        policy.tick(5_000, &mut board);
        assert!(!board.sent.contains(&ActuatorCommand::LedOff));
        policy.tick(8_000, &mut board);
        assert!(board.sent.contains(&ActuatorCommand::LedOff));
    }

    #[test]
    fn rest_clears_pending_and_parks_board() {
        let mut policy = ActuationPolicy::new(ActuationConfig::default());
        let mut board = Board::default();
        accept(&mut policy, HealthTag::Unhealthy, 0, None, &mut board);
        board.sent.clear();
        assert!(policy.rest(&mut board).is_empty());
        assert_eq!(board.sent, REST.to_vec());
        assert_eq!(policy.pending_releases(), 0);
    }
}
