//! Request/response shapes for the four stage endpoints, per the
//! analysis service's JSON contract. Field names on the wire are
//! `snake_case`; the client always stamps `analysis_type` and
//! `client_version`.

use serde::{Deserialize, Serialize};

/// Stable version string stamped onto every request.
pub const CLIENT_VERSION: &str = "1.5.1";

#[derive(Debug, Clone, Serialize)]
pub struct CoarseTimeRequest {
    pub analysis_type: &'static str,
    pub client_version: &'static str,
    pub target_weight: f64,
    pub coarse_time_ms: u64,
    pub current_coarse_speed: u16,
}

impl CoarseTimeRequest {
    pub fn new(target_weight: f64, coarse_time_ms: u64, current_coarse_speed: u16) -> Self {
        Self {
            analysis_type: "coarse_time",
            client_version: CLIENT_VERSION,
            target_weight,
            coarse_time_ms,
            current_coarse_speed,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoarseTimeResponse {
    pub success: bool,
    pub is_compliant: bool,
    pub new_coarse_speed: Option<u16>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlightMaterialRequest {
    pub analysis_type: &'static str,
    pub client_version: &'static str,
    pub target_weight: f64,
    pub recorded_weights: [f64; 3],
}

impl FlightMaterialRequest {
    pub fn new(target_weight: f64, recorded_weights: [f64; 3]) -> Self {
        Self {
            analysis_type: "flight_material",
            client_version: CLIENT_VERSION,
            target_weight,
            recorded_weights,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlightMaterialResponse {
    pub success: bool,
    pub avg_flight_material: Option<f64>,
    pub flight_material_details: Option<[f64; 3]>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FineTimeRequest {
    pub analysis_type: &'static str,
    pub client_version: &'static str,
    pub target_weight: f64,
    pub fine_time_ms: u64,
    pub current_fine_speed: u16,
    pub original_target_weight: f64,
    pub flight_material_value: f64,
}

impl FineTimeRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fine_time_ms: u64,
        current_fine_speed: u16,
        original_target_weight: f64,
        flight_material_value: f64,
    ) -> Self {
        Self {
            analysis_type: "fine_time",
            client_version: CLIENT_VERSION,
            target_weight: 6.0,
            fine_time_ms,
            current_fine_speed,
            original_target_weight,
            flight_material_value,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FineTimeResponse {
    pub success: bool,
    pub is_compliant: bool,
    pub new_fine_speed: Option<u16>,
    pub coarse_advance: Option<f64>,
    pub fine_flow_rate: Option<f64>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdaptiveLearningRequest {
    pub analysis_type: &'static str,
    pub client_version: &'static str,
    pub target_weight: f64,
    pub actual_total_cycle_ms: u64,
    pub actual_coarse_time_ms: u64,
    pub error_value: f64,
    pub current_coarse_advance: f64,
    pub current_fall_value: f64,
    pub fine_flow_rate: Option<f64>,
}

impl AdaptiveLearningRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        target_weight: f64,
        actual_total_cycle_ms: u64,
        actual_coarse_time_ms: u64,
        error_value: f64,
        current_coarse_advance: f64,
        current_fall_value: f64,
        fine_flow_rate: Option<f64>,
    ) -> Self {
        Self {
            analysis_type: "adaptive_learning",
            client_version: CLIENT_VERSION,
            target_weight,
            actual_total_cycle_ms,
            actual_coarse_time_ms,
            error_value,
            current_coarse_advance,
            current_fall_value,
            fine_flow_rate,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AdaptiveLearningParams {
    pub coarse_advance: Option<f64>,
    pub fall_value: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdaptiveLearningResponse {
    pub success: bool,
    pub is_compliant: bool,
    #[serde(default)]
    pub new_params: AdaptiveLearningParams,
    pub message: String,
}

/// Body of a non-200/422 failure — not strictly part of the contract
/// but kept here so `client.rs` has one place to look for a message.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationErrorBody {
    pub error: String,
    pub field: Option<String>,
}
