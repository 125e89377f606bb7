//! Blocking HTTP client for the four analysis endpoints plus health.
//!
//! Grounded on `sem_os_client::http::HttpClient`'s shape (base URL,
//! inner `reqwest::Client`, one function mapping HTTP status to a
//! typed error) but using the blocking `reqwest` client, since the rest
//! of this core is thread-based rather than async (see DESIGN.md).

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use tracing::{debug, warn};

use weigher_common::error::strip_technical_prefixes;

use crate::error::AnalysisError;
use crate::types::*;

/// Outcome of a successful (HTTP 200) analysis call. `NotCompliant` is
/// not itself an error — the caller decides whether to retry using the
/// adjustment embedded in the response.
#[derive(Debug, Clone)]
pub enum AnalysisOutcome<T> {
    Compliant(T),
    NotCompliant(T),
}

/// Map a snake_case field name to a human-readable one for display in
/// validation error messages. Falls back to replacing underscores with
/// spaces for anything not in the table.
fn display_field_name(field: &str) -> String {
    const TABLE: &[(&str, &str)] = &[
        ("target_weight", "target weight"),
        ("coarse_time_ms", "coarse fill time"),
        ("current_coarse_speed", "coarse speed"),
        ("recorded_weights", "recorded weights"),
        ("fine_time_ms", "fine fill time"),
        ("current_fine_speed", "fine speed"),
        ("original_target_weight", "original target weight"),
        ("flight_material_value", "flight material value"),
        ("actual_total_cycle_ms", "total cycle time"),
        ("actual_coarse_time_ms", "coarse fill time"),
        ("error_value", "weight error"),
        ("current_coarse_advance", "coarse advance"),
        ("current_fall_value", "fall value"),
    ];
    TABLE
        .iter()
        .find(|(key, _)| *key == field)
        .map(|(_, label)| label.to_string())
        .unwrap_or_else(|| field.replace('_', " "))
}

pub struct AnalysisClient {
    base_url: String,
    client: Client,
}

impl AnalysisClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AnalysisError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AnalysisError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn health(&self) -> Result<bool, AnalysisError> {
        let resp = self
            .client
            .get(self.url("/api/health"))
            .send()
            .map_err(|e| AnalysisError::Transport(e.to_string()))?;
        Ok(resp.status().is_success())
    }

    fn post<Req: serde::Serialize, Resp: serde::de::DeserializeOwned + HasSuccess>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<AnalysisOutcome<Resp>, AnalysisError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .map_err(|e| AnalysisError::Transport(e.to_string()))?;

        match resp.status() {
            StatusCode::OK => {
                let parsed: Resp = resp.json().map_err(|e| AnalysisError::Integrity(e.to_string()))?;
                if parsed.success() {
                    Ok(AnalysisOutcome::Compliant(parsed))
                } else {
                    Ok(AnalysisOutcome::NotCompliant(parsed))
                }
            }
            StatusCode::UNPROCESSABLE_ENTITY => {
                let body: ValidationErrorBody = resp.json().map_err(|e| AnalysisError::Integrity(e.to_string()))?;
                let message = strip_technical_prefixes(&body.error);
                let field = body.field.as_deref().map(display_field_name);
                warn!(path, message, ?field, "analysis service rejected request shape");
                Err(AnalysisError::Validation { message, field })
            }
            status => {
                debug!(path, %status, "analysis service returned unexpected status");
                Err(AnalysisError::Transport(format!("unexpected status {status}")))
            }
        }
    }

    pub fn analyze_coarse_time(
        &self,
        request: &CoarseTimeRequest,
    ) -> Result<AnalysisOutcome<CoarseTimeResponse>, AnalysisError> {
        self.post("/api/coarse_time/analyze", request)
    }

    pub fn analyze_flight_material(
        &self,
        request: &FlightMaterialRequest,
    ) -> Result<AnalysisOutcome<FlightMaterialResponse>, AnalysisError> {
        self.post("/api/flight_material/analyze", request)
    }

    pub fn analyze_fine_time(
        &self,
        request: &FineTimeRequest,
    ) -> Result<AnalysisOutcome<FineTimeResponse>, AnalysisError> {
        self.post("/api/fine_time/analyze", request)
    }

    pub fn analyze_adaptive_learning(
        &self,
        request: &AdaptiveLearningRequest,
    ) -> Result<AnalysisOutcome<AdaptiveLearningResponse>, AnalysisError> {
        self.post("/api/adaptive_learning/analyze", request)
    }
}

/// Lets `post` branch on `success` generically across the four response
/// types without duplicating the status-handling logic per stage.
trait HasSuccess {
    fn success(&self) -> bool;
}

impl HasSuccess for CoarseTimeResponse {
    fn success(&self) -> bool {
        self.success && self.is_compliant
    }
}

impl HasSuccess for FlightMaterialResponse {
    fn success(&self) -> bool {
        self.success
    }
}

impl HasSuccess for FineTimeResponse {
    fn success(&self) -> bool {
        self.success && self.is_compliant
    }
}

impl HasSuccess for AdaptiveLearningResponse {
    fn success(&self) -> bool {
        self.success && self.is_compliant
    }
}
