//! Error types for the declarative control plane
//!
//! Provides structured error types for all control plane components including
//! provider registrations, the resource orchestrator, provider plugins and the
//! document store. Every variant maps onto the API error taxonomy in
//! [`crate::apierror`].

use crate::apierror::{ErrorCategory, ErrorCode};
use axum::http::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Request Validation Errors
    // =========================================================================
    #[error("{0}")]
    Validation(String),

    #[error("The provider type {provider_type} is not supported. Supported providers are [{supported}].")]
    UnsupportedProviderType {
        provider_type: String,
        supported: String,
    },

    #[error("Failed to normalize {provider_type} provider credentials: {reason}")]
    CredentialNormalization {
        provider_type: String,
        reason: String,
    },

    #[error("The provider registration {id} was not found.")]
    MissingProviderRegistration { id: String },

    // =========================================================================
    // Entity Errors
    // =========================================================================
    #[error("{kind} with id '{id}' was not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Cannot {action} resource with id '{id}' as it is {state}")]
    OperationInProgress {
        action: &'static str,
        id: String,
        state: String,
    },

    #[error("Resource with id '{id}' was modified concurrently")]
    ConcurrentModification { id: String },

    // =========================================================================
    // Provider Plugin Errors
    // =========================================================================
    #[error("Provider {provider_type} failed to {operation}: {reason}")]
    Provider {
        provider_type: String,
        operation: &'static str,
        reason: String,
    },

    #[error("Provider {provider_type} did not complete {operation} within {timeout:?}")]
    PluginTimeout {
        provider_type: String,
        operation: &'static str,
        timeout: Duration,
    },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    #[error("Document '{key}' not found in collection {collection}")]
    DocumentNotFound { collection: String, key: String },

    #[error("Document store error: {0}")]
    Store(String),

    #[error("Operation queue is closed")]
    QueueClosed,

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a provider plugin failure
    pub fn provider(
        provider_type: impl Into<String>,
        operation: &'static str,
        reason: impl std::fmt::Display,
    ) -> Self {
        Error::Provider {
            provider_type: provider_type.into(),
            operation,
            reason: reason.to_string(),
        }
    }

    /// API error code this error is reported with
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Validation(_)
            | Error::UnsupportedProviderType { .. }
            | Error::CredentialNormalization { .. }
            | Error::MissingProviderRegistration { .. }
            | Error::Provider { .. } => ErrorCode::BadRequest,

            Error::NotFound { .. } | Error::DocumentNotFound { .. } => ErrorCode::NotFound,

            Error::OperationInProgress { .. } | Error::ConcurrentModification { .. } => {
                ErrorCode::Conflict
            }

            Error::PluginTimeout { .. } => ErrorCode::OperationTimeout,

            Error::Internal(_)
            | Error::Configuration(_)
            | Error::Store(_)
            | Error::QueueClosed
            | Error::JsonParse(_)
            | Error::YamlParse(_)
            | Error::Io(_) => ErrorCode::InternalOperationError,
        }
    }

    /// API error category this error is reported with
    pub fn category(&self) -> ErrorCategory {
        self.code().category()
    }

    /// HTTP status this error is written with
    pub fn status(&self) -> StatusCode {
        self.code().status()
    }

    /// Check if this error is transient
    ///
    /// Transient errors are worth retrying when nobody is waiting on the
    /// result, i.e. terminal writes from the operation worker pool.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store(_) | Error::Io(_))
    }

    /// Check if this error means the entity does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. } | Error::DocumentNotFound { .. })
    }
}

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = Error::Validation("Request content is missing properties.".into());
        assert_eq!(err.code(), ErrorCode::BadRequest);
        assert_eq!(err.category(), ErrorCategory::ClientError);

        let err = Error::OperationInProgress {
            action: "create",
            id: "/subscriptions/s/resourceGroups/rg".into(),
            state: "being provisioned".into(),
        };
        assert_eq!(err.code(), ErrorCode::Conflict);

        let err = Error::Store("connection reset".into());
        assert_eq!(err.code(), ErrorCode::InternalOperationError);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.category(), ErrorCategory::InternalError);
    }

    #[test]
    fn test_plugin_failures_are_client_errors() {
        let err = Error::provider("kubernetes", "apply", "namespace already exists");
        assert_eq!(err.code(), ErrorCode::BadRequest);
        assert_eq!(
            err.to_string(),
            "Provider kubernetes failed to apply: namespace already exists"
        );
    }

    #[test]
    fn test_error_transient() {
        assert!(Error::Store("timeout".into()).is_transient());
        assert!(!Error::Validation("bad".into()).is_transient());
        assert!(!Error::ConcurrentModification { id: "x".into() }.is_transient());
    }

    #[test]
    fn test_not_found() {
        let err = Error::DocumentNotFound {
            collection: "resources".into(),
            key: "k".into(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.code(), ErrorCode::NotFound);
    }
}
