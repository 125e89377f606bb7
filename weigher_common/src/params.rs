//! The control parameters a calibration run produces for one hopper.

use serde::{Deserialize, Serialize};

/// Final control parameters for a hopper, assembled once every stage
/// reaches a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlParameters {
    pub coarse_speed: u16,
    pub fine_speed: u16,
    pub coarse_advance: f64,
    pub fall_value: f64,
}

impl ControlParameters {
    /// All-zero parameters, used as the initial in-flight value before a
    /// stage has trialed anything.
    pub const fn zeroed() -> Self {
        Self {
            coarse_speed: 0,
            fine_speed: 0,
            coarse_advance: 0.0,
            fall_value: 0.0,
        }
    }
}

impl Default for ControlParameters {
    fn default() -> Self {
        Self::zeroed()
    }
}
