//! API Error Taxonomy
//!
//! Every failure surfaced by a controller is reported as a category plus a
//! code from a closed set, rendered as the uniform envelope
//! `{"code": ..., "message": ..., "category": ...}` with the matching HTTP
//! status.

use crate::error::Error;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

// =============================================================================
// Categories and Codes
// =============================================================================

/// Kind of error: expected client mistakes vs. system failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    ClientError,
    InternalError,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::ClientError => write!(f, "ClientError"),
            ErrorCategory::InternalError => write!(f, "InternalError"),
        }
    }
}

/// Closed set of error codes reported by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    Conflict,
    InternalOperationError,
    /// A provider plugin call exceeded its deadline
    OperationTimeout,
    /// An in-flight operation was abandoned (e.g. the process restarted)
    OperationPreempted,
}

impl ErrorCode {
    /// Category this code belongs to
    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorCode::BadRequest | ErrorCode::NotFound | ErrorCode::Conflict => {
                ErrorCategory::ClientError
            }
            ErrorCode::InternalOperationError
            | ErrorCode::OperationTimeout
            | ErrorCode::OperationPreempted => ErrorCategory::InternalError,
        }
    }

    /// HTTP status this code is written with
    pub fn status(self) -> StatusCode {
        match self {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::InternalOperationError
            | ErrorCode::OperationTimeout
            | ErrorCode::OperationPreempted => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire name of the code
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BadRequest",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::Conflict => "Conflict",
            ErrorCode::InternalOperationError => "InternalOperationError",
            ErrorCode::OperationTimeout => "OperationTimeout",
            ErrorCode::OperationPreempted => "OperationPreempted",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// Uniform JSON error body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: ErrorCode,
    pub message: String,
    pub category: ErrorCategory,
}

/// An error ready to be written to an HTTP response
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub envelope: ErrorEnvelope,
}

impl ApiError {
    /// Build an error from a code and message; status and category follow the code
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status(),
            envelope: ErrorEnvelope {
                code,
                message: message.into(),
                category: code.category(),
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalOperationError, message)
    }

    pub fn code(&self) -> ErrorCode {
        self.envelope.code
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let code = err.code();
        match code.category() {
            ErrorCategory::InternalError => error!("Request failed: {}", err),
            ErrorCategory::ClientError => debug!("Request rejected: {}", err),
        }
        Self::new(code, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let err = ApiError::new(ErrorCode::Conflict, "busy");
        let json = serde_json::to_value(&err.envelope).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"code": "Conflict", "message": "busy", "category": "ClientError"})
        );
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[test]
    fn test_code_mapping() {
        assert_eq!(ErrorCode::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ErrorCode::OperationTimeout.category(),
            ErrorCategory::InternalError
        );
        assert_eq!(ErrorCode::BadRequest.to_string(), "BadRequest");
    }

    #[test]
    fn test_from_crate_error() {
        let err: ApiError = Error::Store("disk full".into()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code(), ErrorCode::InternalOperationError);
        assert_eq!(err.envelope.category, ErrorCategory::InternalError);
        assert!(err.envelope.message.contains("disk full"));
    }
}
