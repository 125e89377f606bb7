//! # Weigher Common
//!
//! Shared types for the six-hopper weighing calibration core: the hopper
//! identifier, stage taxonomy, per-hopper per-stage state, the learning
//! matrix that aggregates progress across all hoppers, the upward event
//! enum the core publishes, and the crate-wide error/config building
//! blocks every other `weigher_*` crate builds on.
//!
//! No rendering, no persistence, no network I/O lives here — just the
//! data model described by the core's specification.

pub mod config;
pub mod error;
pub mod events;
pub mod hopper;
pub mod matrix;
pub mod params;
pub mod stage;
pub mod state;

pub mod prelude {
    //! Common re-exports for downstream crates.
    pub use crate::config::{CoreConfig, SharedConfig};
    pub use crate::error::{CoreError, ErrorKind};
    pub use crate::events::CoreEvent;
    pub use crate::hopper::{HopperId, HOPPER_COUNT};
    pub use crate::matrix::LearningMatrix;
    pub use crate::params::ControlParameters;
    pub use crate::stage::{Stage, StageStatus};
    pub use crate::state::BucketStageState;
}
