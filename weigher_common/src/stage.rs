//! The four calibration stages and their terminal/non-terminal statuses.

use std::fmt;

/// One of the four linear, non-repeating calibration stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    CoarseTime,
    FlightMaterial,
    FineTime,
    AdaptiveLearning,
}

impl Stage {
    /// Stages in their required completion order.
    pub const ORDER: [Stage; 4] = [
        Stage::CoarseTime,
        Stage::FlightMaterial,
        Stage::FineTime,
        Stage::AdaptiveLearning,
    ];

    /// Position in the fixed completion order (0-based).
    pub const fn index(self) -> usize {
        match self {
            Stage::CoarseTime => 0,
            Stage::FlightMaterial => 1,
            Stage::FineTime => 2,
            Stage::AdaptiveLearning => 3,
        }
    }

    /// The stage that must be `CompletedSuccess` before this one may start,
    /// or `None` for the first stage.
    pub const fn predecessor(self) -> Option<Stage> {
        match self {
            Stage::CoarseTime => None,
            Stage::FlightMaterial => Some(Stage::CoarseTime),
            Stage::FineTime => Some(Stage::FlightMaterial),
            Stage::AdaptiveLearning => Some(Stage::FineTime),
        }
    }

    /// The stage that follows this one, or `None` for the last stage.
    pub const fn successor(self) -> Option<Stage> {
        match self {
            Stage::CoarseTime => Some(Stage::FlightMaterial),
            Stage::FlightMaterial => Some(Stage::FineTime),
            Stage::FineTime => Some(Stage::AdaptiveLearning),
            Stage::AdaptiveLearning => None,
        }
    }

    /// Stable identifier used in analysis-service `analysis_type` fields
    /// and in log messages.
    pub const fn wire_name(self) -> &'static str {
        match self {
            Stage::CoarseTime => "coarse_time",
            Stage::FlightMaterial => "flight_material",
            Stage::FineTime => "fine_time",
            Stage::AdaptiveLearning => "adaptive_learning",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Status of a single (hopper, stage) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    NotStarted,
    InProgress,
    CompletedSuccess,
    CompletedFailure,
}

impl StageStatus {
    /// `true` for `CompletedSuccess` or `CompletedFailure`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, StageStatus::CompletedSuccess | StageStatus::CompletedFailure)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::NotStarted => "not-started",
            StageStatus::InProgress => "in-progress",
            StageStatus::CompletedSuccess => "completed-success",
            StageStatus::CompletedFailure => "completed-failure",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_matches_predecessor_chain() {
        let mut prev = None;
        for stage in Stage::ORDER {
            assert_eq!(stage.predecessor(), prev);
            prev = Some(stage);
        }
    }

    #[test]
    fn successor_is_inverse_of_predecessor() {
        for stage in Stage::ORDER {
            if let Some(next) = stage.successor() {
                assert_eq!(next.predecessor(), Some(stage));
            }
        }
    }

    #[test]
    fn first_stage_has_no_predecessor() {
        assert_eq!(Stage::CoarseTime.predecessor(), None);
    }

    #[test]
    fn last_stage_has_no_successor() {
        assert_eq!(Stage::AdaptiveLearning.successor(), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!StageStatus::NotStarted.is_terminal());
        assert!(!StageStatus::InProgress.is_terminal());
        assert!(StageStatus::CompletedSuccess.is_terminal());
        assert!(StageStatus::CompletedFailure.is_terminal());
    }

    #[test]
    fn wire_names() {
        assert_eq!(Stage::CoarseTime.wire_name(), "coarse_time");
        assert_eq!(Stage::AdaptiveLearning.wire_name(), "adaptive_learning");
    }
}
