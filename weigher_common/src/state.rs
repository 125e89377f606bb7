//! Per-(hopper, stage) state, shaped like a `MachineStateMachine`: a
//! struct that owns its fields privately and only mutates them through
//! guarded setters, so an invalid transition is a compile-time-reachable
//! bug rather than a runtime one nobody checks for.

use crate::params::ControlParameters;
use crate::stage::StageStatus;

/// The state of a single hopper working through a single stage:
/// attempt/round counters, the measurement the stage is built around,
/// and the terminal outcome once one is reached.
#[derive(Debug, Clone)]
pub struct BucketStageState {
    status: StageStatus,
    attempt_count: u32,
    max_attempts: u32,
    round: u32,
    max_rounds: u32,
    current_speed: Option<u16>,
    last_measurement: Option<f64>,
    target_weight: f64,
    error_message: Option<String>,
    params: ControlParameters,
    /// Cross-round consecutive-compliant-trial counter, used only by
    /// adaptive learning. Stored as a plain counter, reset only by
    /// explicit calls below. Unused by the other three stages.
    consecutive_successes: u32,
}

impl BucketStageState {
    /// A fresh state for a stage that has not yet been attempted.
    pub fn new(max_attempts: u32, max_rounds: u32, target_weight: f64) -> Self {
        Self {
            status: StageStatus::NotStarted,
            attempt_count: 0,
            max_attempts,
            round: 0,
            max_rounds,
            current_speed: None,
            last_measurement: None,
            target_weight,
            error_message: None,
            params: ControlParameters::zeroed(),
            consecutive_successes: 0,
        }
    }

    pub const fn status(&self) -> StageStatus {
        self.status
    }

    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub const fn round(&self) -> u32 {
        self.round
    }

    /// The speed trialed by the most recent `start_attempt` call, or
    /// `None` if no attempt has started yet.
    pub const fn current_speed(&self) -> Option<u16> {
        self.current_speed
    }

    pub const fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    /// Record a compliant trial and return the new consecutive count.
    /// Resets only via [`Self::record_non_compliant_trial`] or a
    /// session reset — never inferred from round boundaries.
    pub fn record_compliant_trial(&mut self) -> u32 {
        self.consecutive_successes += 1;
        self.consecutive_successes
    }

    /// Any non-compliant verdict breaks the consecutive-success streak.
    pub fn record_non_compliant_trial(&mut self) {
        self.consecutive_successes = 0;
    }

    pub const fn target_weight(&self) -> f64 {
        self.target_weight
    }

    pub const fn last_measurement(&self) -> Option<f64> {
        self.last_measurement
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub const fn params(&self) -> ControlParameters {
        self.params
    }

    /// Attempts remaining in the current round, saturating at zero.
    pub const fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }

    /// Begin a new attempt. Only valid from `NotStarted` or `InProgress`;
    /// a terminal state must be reset before retrying.
    ///
    /// Returns `false` without mutating anything if the attempt budget
    /// for the current round is already exhausted, or the state is
    /// already terminal.
    #[must_use]
    pub fn start_attempt(&mut self, speed: u16) -> bool {
        if self.status.is_terminal() || self.attempt_count >= self.max_attempts {
            return false;
        }
        self.status = StageStatus::InProgress;
        self.attempt_count += 1;
        self.current_speed = Some(speed);
        true
    }

    /// Advance to the next round (used by adaptive learning, which
    /// retries the whole stage up to `max_rounds` times). Resets the
    /// per-round attempt counter but keeps the stage status.
    ///
    /// Returns `false` if the round budget is already exhausted.
    #[must_use]
    pub fn start_round(&mut self) -> bool {
        if self.round >= self.max_rounds {
            return false;
        }
        self.round += 1;
        self.attempt_count = 0;
        true
    }

    /// Record a measurement from the most recent attempt without
    /// resolving the stage yet (used for progress reporting mid-attempt).
    pub fn record_measurement(&mut self, value: f64) {
        self.last_measurement = Some(value);
    }

    /// Mark the stage as successfully completed with its final parameters.
    ///
    /// Idempotent guard: once terminal, further calls are ignored — the
    /// first terminal transition wins, matching the "fire exactly once"
    /// rule used at the aggregator level.
    pub fn complete_successfully(&mut self, params: ControlParameters) {
        if self.status.is_terminal() {
            return;
        }
        self.status = StageStatus::CompletedSuccess;
        self.params = params;
        self.error_message = None;
    }

    /// Mark the stage as failed with a user-visible message. The message
    /// is expected to already have technical prefixes stripped by the
    /// caller (see [`crate::error::strip_technical_prefixes`]).
    pub fn fail_with_error(&mut self, message: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = StageStatus::CompletedFailure;
        self.error_message = Some(message.into());
    }

    /// Reset to `NotStarted` for a fresh test run on the same hopper,
    /// keeping the configured budgets but clearing all progress.
    pub fn reset_for_new_test(&mut self, target_weight: f64) {
        self.status = StageStatus::NotStarted;
        self.attempt_count = 0;
        self.round = 0;
        self.current_speed = None;
        self.last_measurement = None;
        self.target_weight = target_weight;
        self.error_message = None;
        self.params = ControlParameters::zeroed();
        self.consecutive_successes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_is_not_started() {
        let state = BucketStageState::new(15, 1, 500.0);
        assert_eq!(state.status(), StageStatus::NotStarted);
        assert_eq!(state.attempt_count(), 0);
    }

    #[test]
    fn start_attempt_transitions_to_in_progress() {
        let mut state = BucketStageState::new(15, 1, 500.0);
        assert!(state.start_attempt(40));
        assert_eq!(state.status(), StageStatus::InProgress);
        assert_eq!(state.attempt_count(), 1);
    }

    #[test]
    fn start_attempt_refuses_past_budget() {
        let mut state = BucketStageState::new(2, 1, 500.0);
        assert!(state.start_attempt(40));
        assert!(state.start_attempt(41));
        assert!(!state.start_attempt(42));
        assert_eq!(state.attempt_count(), 2);
    }

    #[test]
    fn complete_successfully_is_terminal_and_idempotent() {
        let mut state = BucketStageState::new(15, 1, 500.0);
        state.start_attempt(40);
        let params = ControlParameters {
            coarse_speed: 40,
            fine_speed: 0,
            coarse_advance: 12.5,
            fall_value: 0.0,
        };
        state.complete_successfully(params);
        assert_eq!(state.status(), StageStatus::CompletedSuccess);
        assert_eq!(state.params(), params);

        // Second call must not overwrite the recorded params.
        state.complete_successfully(ControlParameters::zeroed());
        assert_eq!(state.params(), params);
    }

    #[test]
    fn fail_after_terminal_is_ignored() {
        let mut state = BucketStageState::new(15, 1, 500.0);
        state.start_attempt(40);
        state.fail_with_error("first failure");
        state.fail_with_error("second failure");
        assert_eq!(state.error_message(), Some("first failure"));
    }

    #[test]
    fn start_attempt_refused_once_terminal() {
        let mut state = BucketStageState::new(15, 1, 500.0);
        state.start_attempt(40);
        state.fail_with_error("done");
        assert!(!state.start_attempt(41));
    }

    #[test]
    fn start_round_resets_attempt_counter() {
        let mut state = BucketStageState::new(15, 3, 500.0);
        state.start_attempt(40);
        state.start_attempt(41);
        assert_eq!(state.attempt_count(), 2);
        assert!(state.start_round());
        assert_eq!(state.attempt_count(), 0);
        assert_eq!(state.round(), 1);
    }

    #[test]
    fn start_round_refuses_past_round_budget() {
        let mut state = BucketStageState::new(15, 1, 500.0);
        assert!(state.start_round());
        assert!(!state.start_round());
    }

    #[test]
    fn reset_clears_progress_but_keeps_budgets() {
        let mut state = BucketStageState::new(15, 1, 500.0);
        state.start_attempt(40);
        state.fail_with_error("bad run");
        state.reset_for_new_test(600.0);
        assert_eq!(state.status(), StageStatus::NotStarted);
        assert_eq!(state.attempt_count(), 0);
        assert_eq!(state.target_weight(), 600.0);
        assert_eq!(state.error_message(), None);
    }

    #[test]
    fn attempts_remaining_saturates() {
        let mut state = BucketStageState::new(1, 1, 500.0);
        state.start_attempt(40);
        assert_eq!(state.attempts_remaining(), 0);
    }

    #[test]
    fn current_speed_tracks_most_recent_attempt() {
        let mut state = BucketStageState::new(15, 1, 500.0);
        assert_eq!(state.current_speed(), None);
        state.start_attempt(40);
        assert_eq!(state.current_speed(), Some(40));
        state.start_attempt(55);
        assert_eq!(state.current_speed(), Some(55));
    }

    #[test]
    fn consecutive_successes_accumulate_and_reset() {
        let mut state = BucketStageState::new(15, 3, 500.0);
        assert_eq!(state.record_compliant_trial(), 1);
        assert_eq!(state.record_compliant_trial(), 2);
        state.record_non_compliant_trial();
        assert_eq!(state.consecutive_successes(), 0);
        assert_eq!(state.record_compliant_trial(), 1);
    }

    #[test]
    fn reset_clears_consecutive_successes() {
        let mut state = BucketStageState::new(15, 3, 500.0);
        state.record_compliant_trial();
        state.record_compliant_trial();
        state.reset_for_new_test(600.0);
        assert_eq!(state.consecutive_successes(), 0);
    }
}
