//! Shared error taxonomy.
//!
//! Each `weigher_*` crate defines its own leaf error enum for the errors
//! it can actually produce (`weigher_plc::PlcError`,
//! `weigher_analysis::AnalysisError`, `weigher_control::ControlError`);
//! this module defines the classification all of them map into, plus the
//! top-level `CoreError` the `weigher` binary ultimately reports.

use std::fmt;
use thiserror::Error;

/// What went wrong, independent of which crate observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network, timeout, or device-unreachable condition.
    Transport,
    /// The PLC responded with a Modbus exception.
    Protocol,
    /// The analysis service rejected the request shape (HTTP 422).
    Validation,
    /// The analysis service said "not compliant" without an adjustment.
    AnalysisDisagreement,
    /// Attempt or round budget ran out.
    BudgetExhausted,
    /// Insufficient material detected under the hopper.
    Starvation,
    /// A required field was missing or malformed in an otherwise-200 response.
    Integrity,
    /// The operator cancelled the session.
    OperatorCancel,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Validation => "validation",
            ErrorKind::AnalysisDisagreement => "analysis-disagreement",
            ErrorKind::BudgetExhausted => "budget-exhausted",
            ErrorKind::Starvation => "starvation",
            ErrorKind::Integrity => "integrity",
            ErrorKind::OperatorCancel => "operator-cancel",
        };
        f.write_str(s)
    }
}

/// Top-level error surfaced by the `weigher` binary.
///
/// Most errors are handled within a stage controller and surfaced as a
/// `BucketFailed` event rather than reaching here. `CoreError` is
/// reserved for session-fatal conditions — a transport failure on the
/// global start/stop sequence, for instance — the session cannot
/// continue with a non-responsive PLC.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("fatal: {kind}: {message}")]
    Fatal { kind: ErrorKind, message: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    pub fn fatal(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Fatal {
            kind,
            message: message.into(),
        }
    }
}

/// Strip a fixed set of technical prefixes from an analysis-service
/// error message so user-visible failure text reads cleanly.
pub fn strip_technical_prefixes(message: &str) -> String {
    const PREFIXES: &[&str] = &[
        "ValidationError: ",
        "ValidationError:",
        "Error: ",
        "Error:",
        "pydantic.ValidationError: ",
        "AssertionError: ",
    ];
    let mut s = message.trim();
    for prefix in PREFIXES {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest.trim();
            break;
        }
    }
    if s.is_empty() {
        "the analysis service rejected the request".to_string()
    } else {
        s.to_string()
    }
}
