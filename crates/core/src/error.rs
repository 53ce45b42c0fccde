use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::FlowStep;

/// Failure talking to an agent endpoint.
///
/// Non-2xx replies carry the server supplied `detail` when the body was JSON;
/// transport failures and malformed bodies degrade to the same kind with no detail.
#[derive(Error, Debug, Clone, PartialEq, Default)]
#[error("Service error{}", describe_service_error(.status, .detail))]
pub struct ServiceError {
    pub status: Option<u16>,
    pub detail: Option<String>,
}

impl ServiceError {
    pub fn new(status: Option<u16>, detail: Option<String>) -> Self {
        Self { status, detail }
    }

    pub fn without_detail() -> Self {
        Self::default()
    }

    pub fn with_detail(detail: impl Into<String>) -> Self {
        Self {
            status: None,
            detail: Some(detail.into()),
        }
    }
}

fn describe_service_error(status: &Option<u16>, detail: &Option<String>) -> String {
    let mut out = String::new();
    if let Some(status) = status {
        out.push_str(&format!(" ({})", status));
    }
    if let Some(detail) = detail {
        out.push_str(&format!(": {}", detail));
    }
    out
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStepErrorKind {
    #[error("MissingSelector")]
    MissingSelector,
    #[error("MissingElement")]
    MissingElement,
    #[error("UnexpectedAction")]
    UnexpectedAction,
    #[error("UnexpectedError")]
    UnexpectedError,
}

impl FlowStepErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingSelector => "MissingSelector",
            Self::MissingElement => "MissingElement",
            Self::UnexpectedAction => "UnexpectedAction",
            Self::UnexpectedError => "UnexpectedError",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Flow step '{}' failed: {kind}", .step.action)]
pub struct FlowStepError {
    pub step: FlowStep,
    pub kind: FlowStepErrorKind,
}

impl FlowStepError {
    pub fn new(step: FlowStep, kind: FlowStepErrorKind) -> Self {
        Self { step, kind }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    FlowStep(#[from] FlowStepError),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Host error: {0}")]
    Host(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FlowAction;

    #[test]
    fn test_service_error_display() {
        assert_eq!(ServiceError::without_detail().to_string(), "Service error");
        assert_eq!(
            ServiceError::new(Some(502), Some("upstream down".into())).to_string(),
            "Service error (502): upstream down"
        );
        assert_eq!(ServiceError::with_detail("nope").to_string(), "Service error: nope");
    }

    #[test]
    fn test_kind_display_matches_code() {
        for kind in [
            FlowStepErrorKind::MissingSelector,
            FlowStepErrorKind::MissingElement,
            FlowStepErrorKind::UnexpectedAction,
            FlowStepErrorKind::UnexpectedError,
        ] {
            assert_eq!(kind.to_string(), kind.code());
        }
    }

    #[test]
    fn test_flow_step_error_display_uses_code() {
        let step = FlowStep::new(FlowAction::Click, Some("#go".into()), None);
        let err = FlowStepError::new(step, FlowStepErrorKind::MissingElement);
        assert_eq!(err.to_string(), "Flow step 'click' failed: MissingElement");
    }
}
