//! Events flowing out of the monitoring engine and stage controllers,
//! destined for the session's logging sink and the `LearningMatrix`
//! aggregator. Shaped like a `MachineEvent` enum driving a state
//! machine, but used here purely as an observation channel: the
//! control-flow decisions live in the stage controllers themselves.

use crate::hopper::HopperId;
use crate::params::ControlParameters;
use crate::stage::Stage;

/// Something a stage controller, the monitoring engine, or the session
/// driver wants recorded or acted on elsewhere.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A hopper finished a stage successfully.
    BucketCompleted {
        hopper: HopperId,
        stage: Stage,
        params: ControlParameters,
    },
    /// A hopper finished a stage with a terminal failure.
    BucketFailed {
        hopper: HopperId,
        stage: Stage,
        message: String,
    },
    /// A hopper's stage advanced partway (a new measurement, a new
    /// attempt starting) without reaching a terminal status.
    ProgressUpdate {
        hopper: HopperId,
        stage: Stage,
        attempt: u32,
        measurement: Option<f64>,
    },
    /// A free-form log line, for conditions that don't fit the other
    /// variants but are still worth surfacing to the session log.
    LogMessage { hopper: Option<HopperId>, message: String },
    /// The monitoring engine observed a hopper stalled below the fall
    /// threshold for longer than the starvation window. `is_production`
    /// distinguishes a production-run monitoring screen's use of this
    /// same signal from a calibration stage's; this core only ever
    /// drives calibration stages, so it is always `false` here.
    StarvationDetected {
        hopper: HopperId,
        stage: Stage,
        is_production: bool,
    },
    /// A hopper's status register changed in a way the monitoring
    /// engine's edge detector recognized (independent of stage outcome).
    BucketStateChanged { hopper: HopperId, active: bool },
    /// Every hopper has reached a terminal status for every stage. Fired
    /// exactly once per session by the `LearningMatrix`'s completion latch.
    AllCompleted,
}

impl CoreEvent {
    /// The hopper this event concerns, if any (`AllCompleted` and
    /// hopper-less `LogMessage`s have none).
    pub const fn hopper(&self) -> Option<HopperId> {
        match self {
            CoreEvent::BucketCompleted { hopper, .. }
            | CoreEvent::BucketFailed { hopper, .. }
            | CoreEvent::ProgressUpdate { hopper, .. }
            | CoreEvent::StarvationDetected { hopper, .. }
            | CoreEvent::BucketStateChanged { hopper, .. } => Some(*hopper),
            CoreEvent::LogMessage { hopper, .. } => *hopper,
            CoreEvent::AllCompleted => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hopper_extracted_from_completed() {
        let hopper = HopperId::new(2).unwrap();
        let event = CoreEvent::BucketCompleted {
            hopper,
            stage: Stage::CoarseTime,
            params: ControlParameters::zeroed(),
        };
        assert_eq!(event.hopper(), Some(hopper));
    }

    #[test]
    fn all_completed_has_no_hopper() {
        assert_eq!(CoreEvent::AllCompleted.hopper(), None);
    }

    #[test]
    fn log_message_hopper_is_optional() {
        let event = CoreEvent::LogMessage {
            hopper: None,
            message: "session started".to_string(),
        };
        assert_eq!(event.hopper(), None);
    }
}
