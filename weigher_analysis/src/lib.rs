//! # Weigher Analysis
//!
//! Blocking HTTP client for the remote calibration analysis service: one
//! method per stage endpoint, the JSON request/response shapes of its
//! contract, and a flow-rate regex fallback for when the response omits
//! a structured field.
//!
//! No stage logic lives here — this crate only knows how to ask the
//! analysis service a question and classify the answer; the decision of
//! what to do with a `NotCompliant` verdict belongs to `weigher_control`.

pub mod client;
pub mod error;
pub mod flow_rate;
pub mod types;

pub mod prelude {
    pub use crate::client::{AnalysisClient, AnalysisOutcome};
    pub use crate::error::AnalysisError;
    pub use crate::flow_rate::extract_flow_rate;
    pub use crate::types::*;
}
