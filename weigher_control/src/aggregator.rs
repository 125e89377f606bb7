//! The learning-state aggregator. Every stage controller reports its
//! transitions here instead of poking the `LearningMatrix` directly, so
//! the ordering invariant (a hopper may not be in-progress on stage N+1
//! until stage N is `CompletedSuccess`) and the "fire `AllCompleted`
//! exactly once" rule are enforced in one place.
//!
//! Uses `DriverRegistry`-style constructor injection — controllers hold
//! an `Arc` to this, never a bare `LearningMatrix`.

use std::sync::mpsc::Sender;
use std::sync::Arc;

use weigher_common::events::CoreEvent;
use weigher_common::hopper::{HopperId, HOPPER_COUNT};
use weigher_common::matrix::LearningMatrix;
use weigher_common::params::ControlParameters;
use weigher_common::stage::{Stage, StageStatus};
use weigher_common::state::BucketStageState;

use crate::error::ControlError;

/// Wraps a [`LearningMatrix`] with a pub/sub surface: `start_stage`,
/// `complete_stage`, `counts`, `is_all_completed`, plus the
/// `on_all_completed` latch. In-process, "publishing" is a direct call
/// rather than a channel hop — there is no GUI thread here to decouple
/// from.
pub struct LearningStateAggregator {
    matrix: Arc<LearningMatrix>,
    events: Sender<CoreEvent>,
}

impl LearningStateAggregator {
    pub fn new(matrix: Arc<LearningMatrix>, events: Sender<CoreEvent>) -> Self {
        Self { matrix, events }
    }

    pub fn matrix(&self) -> &LearningMatrix {
        &self.matrix
    }

    /// Run `f` against `(hopper, stage)`'s state under a write lock.
    pub fn with_cell_mut<R>(&self, hopper: HopperId, stage: Stage, f: impl FnOnce(&mut BucketStageState) -> R) -> R {
        self.matrix.with_cell_mut(hopper, stage, f)
    }

    /// Run `f` against `(hopper, stage)`'s state under a read lock.
    pub fn with_cell<R>(&self, hopper: HopperId, stage: Stage, f: impl FnOnce(&BucketStageState) -> R) -> R {
        self.matrix.with_cell(hopper, stage, f)
    }

    /// Enforce the stage-ordering invariant before a controller begins a
    /// stage: the predecessor stage (if any) must already be
    /// `CompletedSuccess`.
    pub fn start_stage(&self, hopper: HopperId, stage: Stage) -> Result<(), ControlError> {
        if let Some(predecessor) = stage.predecessor() {
            let predecessor_done =
                self.matrix.with_cell(hopper, predecessor, |c| c.status() == StageStatus::CompletedSuccess);
            if !predecessor_done {
                return Err(ControlError::Integrity(format!(
                    "{hopper} cannot start {stage} before {predecessor} has completed successfully"
                )));
            }
        }
        let _ = self.events.send(CoreEvent::LogMessage {
            hopper: Some(hopper),
            message: format!("{hopper} starting stage {stage}"),
        });
        Ok(())
    }

    /// Terminal success: records the cell, fires `BucketCompleted`, and
    /// checks the all-complete latch.
    pub fn complete_stage_success(&self, hopper: HopperId, stage: Stage, params: ControlParameters) {
        self.matrix.with_cell_mut(hopper, stage, |cell| cell.complete_successfully(params));
        let _ = self.events.send(CoreEvent::BucketCompleted { hopper, stage, params });
        let _ = self.events.send(CoreEvent::BucketStateChanged { hopper, active: false });
        self.maybe_fire_all_completed();
    }

    /// Terminal failure: records the cell, fires `BucketFailed`, and
    /// checks the all-complete latch.
    pub fn complete_stage_failure(&self, hopper: HopperId, stage: Stage, reason: impl Into<String>) {
        let reason = reason.into();
        self.matrix.with_cell_mut(hopper, stage, |cell| cell.fail_with_error(reason.clone()));
        let _ = self.events.send(CoreEvent::BucketFailed { hopper, stage, message: reason });
        let _ = self.events.send(CoreEvent::BucketStateChanged { hopper, active: false });
        self.maybe_fire_all_completed();
    }

    /// Forward an event a controller constructed directly — progress
    /// updates and starvation notices, which don't carry a terminal
    /// status and so don't go through `complete_stage_*`.
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.events.send(event);
    }

    fn maybe_fire_all_completed(&self) {
        if self.matrix.take_all_completed() {
            let _ = self.events.send(CoreEvent::AllCompleted);
        }
    }

    /// (successes, failures, total) across every (hopper, stage) cell.
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut successes = 0;
        let mut failures = 0;
        for hopper in HopperId::all() {
            for status in self.matrix.hopper_statuses(hopper) {
                match status {
                    StageStatus::CompletedSuccess => successes += 1,
                    StageStatus::CompletedFailure => failures += 1,
                    _ => {}
                }
            }
        }
        (successes, failures, HOPPER_COUNT * Stage::ORDER.len())
    }

    pub fn is_all_completed(&self) -> bool {
        self.matrix.is_all_completed()
    }

    /// Clear the matrix and the completion latch for a new session.
    pub fn reset(&self, target_weight: f64) {
        self.matrix.reset_all(target_weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn make_aggregator() -> (LearningStateAggregator, mpsc::Receiver<CoreEvent>) {
        let matrix = Arc::new(LearningMatrix::new(15, 3, 500.0));
        let (tx, rx) = mpsc::channel();
        (LearningStateAggregator::new(matrix, tx), rx)
    }

    #[test]
    fn start_stage_rejects_out_of_order() {
        let (aggregator, _rx) = make_aggregator();
        let hopper = HopperId::new(1).unwrap();
        assert!(aggregator.start_stage(hopper, Stage::CoarseTime).is_ok());
        assert!(aggregator.start_stage(hopper, Stage::FineTime).is_err());
    }

    #[test]
    fn start_stage_allows_first_stage_with_no_predecessor() {
        let (aggregator, _rx) = make_aggregator();
        let hopper = HopperId::new(1).unwrap();
        assert!(aggregator.start_stage(hopper, Stage::CoarseTime).is_ok());
    }

    #[test]
    fn start_stage_allows_successor_once_predecessor_succeeds() {
        let (aggregator, _rx) = make_aggregator();
        let hopper = HopperId::new(1).unwrap();
        aggregator.complete_stage_success(hopper, Stage::CoarseTime, ControlParameters::zeroed());
        assert!(aggregator.start_stage(hopper, Stage::FlightMaterial).is_ok());
    }

    #[test]
    fn complete_stage_success_emits_completed_event() {
        let (aggregator, rx) = make_aggregator();
        let hopper = HopperId::new(2).unwrap();
        aggregator.complete_stage_success(hopper, Stage::CoarseTime, ControlParameters::zeroed());
        let event = rx.try_recv().expect("event sent");
        assert!(matches!(event, CoreEvent::BucketCompleted { hopper: h, stage: Stage::CoarseTime, .. } if h == hopper));
    }

    #[test]
    fn all_completed_fires_once_when_every_cell_terminal() {
        let (aggregator, rx) = make_aggregator();
        for hopper in HopperId::all() {
            for stage in Stage::ORDER {
                aggregator.complete_stage_failure(hopper, stage, "no material loaded");
            }
        }
        let all_completed_count = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, CoreEvent::AllCompleted))
            .count();
        assert_eq!(all_completed_count, 1);
    }

    #[test]
    fn counts_tracks_successes_and_failures() {
        let (aggregator, _rx) = make_aggregator();
        let h1 = HopperId::new(1).unwrap();
        let h2 = HopperId::new(2).unwrap();
        aggregator.complete_stage_success(h1, Stage::CoarseTime, ControlParameters::zeroed());
        aggregator.complete_stage_failure(h2, Stage::CoarseTime, "starved");
        let (successes, failures, total) = aggregator.counts();
        assert_eq!(successes, 1);
        assert_eq!(failures, 1);
        assert_eq!(total, 24);
    }

    #[test]
    fn reset_clears_latch_and_matrix() {
        let (aggregator, _rx) = make_aggregator();
        for hopper in HopperId::all() {
            for stage in Stage::ORDER {
                aggregator.complete_stage_failure(hopper, stage, "no material loaded");
            }
        }
        assert!(aggregator.is_all_completed());
        aggregator.reset(600.0);
        assert!(!aggregator.is_all_completed());
    }
}
