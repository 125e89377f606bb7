//! Errors the analysis-service HTTP client can surface.

use thiserror::Error;

/// An error talking to, or interpreting a response from, the analysis
/// service.
#[derive(Debug, Clone, Error)]
pub enum AnalysisError {
    /// HTTP 422: the request shape was rejected. `message` has had
    /// technical prefixes stripped; `field` names the offending field
    /// in display form, if the server named one.
    #[error("validation failed{}: {message}", field.as_ref().map(|f| format!(" ({f})")).unwrap_or_default())]
    Validation { message: String, field: Option<String> },

    /// Connection failure, timeout, or any non-200/422 status.
    #[error("transport error: {0}")]
    Transport(String),

    /// A 200 response was missing a field the caller cannot proceed
    /// without.
    #[error("integrity error: {0}")]
    Integrity(String),
}
