//! # Weigher Control
//!
//! The four per-hopper calibration stage controllers and the
//! learning-state aggregator they report to. This is the bulk of the
//! orchestration core: everything here decides *when* to talk to the
//! PLC and the analysis service, never *how* — those mechanics live in
//! `weigher_plc` and `weigher_analysis`.
//!
//! Each controller owns a shared [`context::StageContext`] and runs one
//! worker thread per hopper. Hand-off between stages never calls the
//! next controller synchronously from inside an edge callback: it
//! always spawns a fresh `std::thread`.

pub mod adaptive_learning;
pub mod aggregator;
pub mod coarse_time;
pub mod context;
pub mod error;
pub mod fine_time;
pub mod flight_material;

pub mod prelude {
    pub use crate::adaptive_learning::AdaptiveLearningController;
    pub use crate::aggregator::LearningStateAggregator;
    pub use crate::coarse_time::{CoarseTimeController, RestartMode};
    pub use crate::context::StageContext;
    pub use crate::error::ControlError;
    pub use crate::fine_time::FineTimeController;
    pub use crate::flight_material::FlightMaterialController;
}
