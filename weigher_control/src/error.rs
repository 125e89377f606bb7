//! Errors a stage controller can surface. Every variant maps to a
//! [`weigher_common::error::ErrorKind`] so the shared propagation policy
//! can be applied mechanically rather than re-derived per crate.

use thiserror::Error;

use weigher_analysis::error::AnalysisError;
use weigher_common::error::ErrorKind;
use weigher_plc::address_map::AddressMapError;
use weigher_plc::transport::PlcError;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("validation failed{}: {message}", field.as_ref().map(|f| format!(" ({f})")).unwrap_or_default())]
    Validation { message: String, field: Option<String> },

    #[error("analysis service disagreed without a usable adjustment: {0}")]
    AnalysisDisagreement(String),

    #[error("{0}")]
    BudgetExhausted(String),

    #[error("{0}")]
    Starvation(String),

    #[error("{0}")]
    Integrity(String),

    #[error("operator cancelled the session")]
    OperatorCancel,
}

impl ControlError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            ControlError::Transport(_) => ErrorKind::Transport,
            ControlError::Protocol(_) => ErrorKind::Protocol,
            ControlError::Validation { .. } => ErrorKind::Validation,
            ControlError::AnalysisDisagreement(_) => ErrorKind::AnalysisDisagreement,
            ControlError::BudgetExhausted(_) => ErrorKind::BudgetExhausted,
            ControlError::Starvation(_) => ErrorKind::Starvation,
            ControlError::Integrity(_) => ErrorKind::Integrity,
            ControlError::OperatorCancel => ErrorKind::OperatorCancel,
        }
    }
}

impl From<PlcError> for ControlError {
    fn from(e: PlcError) -> Self {
        match e {
            PlcError::NotConnected | PlcError::Transport(_) => ControlError::Transport(e.to_string()),
            PlcError::Protocol(_) | PlcError::DeviceError(_) => ControlError::Protocol(e.to_string()),
        }
    }
}

impl From<AddressMapError> for ControlError {
    fn from(e: AddressMapError) -> Self {
        ControlError::Protocol(e.to_string())
    }
}

impl From<AnalysisError> for ControlError {
    fn from(e: AnalysisError) -> Self {
        match e {
            AnalysisError::Validation { message, field } => ControlError::Validation { message, field },
            AnalysisError::Transport(s) => ControlError::Transport(s),
            AnalysisError::Integrity(s) => ControlError::Integrity(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_each_variant() {
        assert_eq!(ControlError::Transport("x".into()).kind(), ErrorKind::Transport);
        assert_eq!(ControlError::OperatorCancel.kind(), ErrorKind::OperatorCancel);
        assert_eq!(
            ControlError::Validation { message: "m".into(), field: None }.kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn plc_not_connected_maps_to_transport() {
        let e: ControlError = PlcError::NotConnected.into();
        assert!(matches!(e, ControlError::Transport(_)));
    }

    #[test]
    fn plc_protocol_error_maps_to_protocol() {
        let e: ControlError = PlcError::Protocol("exception 2".into()).into();
        assert!(matches!(e, ControlError::Protocol(_)));
    }

    #[test]
    fn analysis_validation_round_trips_field() {
        let e: ControlError = AnalysisError::Validation {
            message: "bad input".into(),
            field: Some("target weight".into()),
        }
        .into();
        match e {
            ControlError::Validation { message, field } => {
                assert_eq!(message, "bad input");
                assert_eq!(field.as_deref(), Some("target weight"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
