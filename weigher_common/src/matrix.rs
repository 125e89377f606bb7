//! `LearningMatrix`: the six-by-four grid of `BucketStageState` the
//! whole session is driven against, plus the "every cell terminal"
//! completion latch.
//!
//! Shaped like a `DriverRegistry`: a constructor-injected owner of
//! per-key state behind a lock, no hidden globals, and no legacy
//! global-`LazyLock` fallback carried forward.

use parking_lot::RwLock;

use crate::hopper::{HopperId, HOPPER_COUNT};
use crate::stage::{Stage, StageStatus};
use crate::state::BucketStageState;

const STAGE_COUNT: usize = 4;

struct MatrixInner {
    cells: [[BucketStageState; STAGE_COUNT]; HOPPER_COUNT],
    /// Set once `is_all_completed` has returned `true` and the caller has
    /// claimed the completion event, so `take_all_completed` fires at
    /// most once per session.
    all_completed_claimed: bool,
}

/// Shared, lock-guarded state for every (hopper, stage) pair in the
/// session.
pub struct LearningMatrix {
    inner: RwLock<MatrixInner>,
}

impl LearningMatrix {
    /// Build a fresh matrix with every cell `NotStarted`, all hoppers
    /// targeting the same `target_weight` and the same per-stage budgets.
    pub fn new(max_attempts: u32, max_rounds: u32, target_weight: f64) -> Self {
        let cells = std::array::from_fn(|_hopper| {
            std::array::from_fn(|_stage| BucketStageState::new(max_attempts, max_rounds, target_weight))
        });
        Self {
            inner: RwLock::new(MatrixInner {
                cells,
                all_completed_claimed: false,
            }),
        }
    }

    /// Run `f` against the state for `(hopper, stage)` under a write lock.
    pub fn with_cell_mut<R>(&self, hopper: HopperId, stage: Stage, f: impl FnOnce(&mut BucketStageState) -> R) -> R {
        let mut guard = self.inner.write();
        f(&mut guard.cells[hopper.index()][stage.index()])
    }

    /// Run `f` against the state for `(hopper, stage)` under a read lock.
    pub fn with_cell<R>(&self, hopper: HopperId, stage: Stage, f: impl FnOnce(&BucketStageState) -> R) -> R {
        let guard = self.inner.read();
        f(&guard.cells[hopper.index()][stage.index()])
    }

    /// Snapshot the status of every cell for `hopper`, in stage order.
    pub fn hopper_statuses(&self, hopper: HopperId) -> [StageStatus; STAGE_COUNT] {
        let guard = self.inner.read();
        std::array::from_fn(|i| guard.cells[hopper.index()][i].status())
    }

    /// `true` once every (hopper, stage) cell holds a terminal status.
    pub fn is_all_completed(&self) -> bool {
        let guard = self.inner.read();
        guard
            .cells
            .iter()
            .all(|row| row.iter().all(|cell| cell.status().is_terminal()))
    }

    /// If every cell is terminal and this is the first caller to observe
    /// it, claim the completion and return `true`. Every later caller
    /// (including further completions in the same session, which cannot
    /// happen once every cell is terminal but are guarded against
    /// anyway) gets `false` — the "fire exactly once" rule for
    /// [`crate::events::CoreEvent::AllCompleted`].
    pub fn take_all_completed(&self) -> bool {
        let mut guard = self.inner.write();
        if guard.all_completed_claimed {
            return false;
        }
        let all_terminal = guard
            .cells
            .iter()
            .all(|row| row.iter().all(|cell| cell.status().is_terminal()));
        if all_terminal {
            guard.all_completed_claimed = true;
        }
        all_terminal
    }

    /// Count of hoppers whose stage cell reached `CompletedSuccess`.
    pub fn success_count(&self, stage: Stage) -> usize {
        let guard = self.inner.read();
        guard
            .cells
            .iter()
            .filter(|row| row[stage.index()].status() == StageStatus::CompletedSuccess)
            .count()
    }

    /// Reset every cell for a new session run with a new target weight.
    pub fn reset_all(&self, target_weight: f64) {
        let mut guard = self.inner.write();
        guard.all_completed_claimed = false;
        for row in guard.cells.iter_mut() {
            for cell in row.iter_mut() {
                cell.reset_for_new_test(target_weight);
            }
        }
    }
}
