//! Entities and DTOs
//!
//! Stored packages (what the document store holds) and the client-facing
//! projections derived from them. Secrets and the rendered plugin
//! configuration only ever live in the stored packages.

use crate::apierror::ErrorCode;
use crate::domain::identity::{ResourceId, ResourceKind};
use crate::domain::ports::{InstanceState, ResourceTypeInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Provisioning State
// =============================================================================

/// Provisioning state of a resource package
///
/// Absence of a package is the implicit terminal "not exists" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisioningState {
    /// An apply is in flight
    Accepted,
    /// A destroy is in flight
    Deleting,
    Succeeded,
    Failed,
}

impl ProvisioningState {
    /// Whether an operation is currently running against the package
    pub fn is_in_flight(self) -> bool {
        matches!(self, ProvisioningState::Accepted | ProvisioningState::Deleting)
    }

    /// Describes the in-flight operation for conflict messages
    pub fn describe(self) -> &'static str {
        match self {
            ProvisioningState::Accepted => "being provisioned",
            ProvisioningState::Deleting => "being deleted",
            ProvisioningState::Succeeded => "provisioned",
            ProvisioningState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisioningState::Accepted => write!(f, "Accepted"),
            ProvisioningState::Deleting => write!(f, "Deleting"),
            ProvisioningState::Succeeded => write!(f, "Succeeded"),
            ProvisioningState::Failed => write!(f, "Failed"),
        }
    }
}

/// Kind of operation dispatched to the worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Apply,
    Destroy,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Apply => write!(f, "apply"),
            OperationKind::Destroy => write!(f, "destroy"),
        }
    }
}

// =============================================================================
// Provider Registrations
// =============================================================================

/// Provider registration request body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRegistrationDefinition {
    #[serde(default, alias = "Location")]
    pub location: Option<String>,
    #[serde(default, alias = "Properties")]
    pub properties: Option<ProviderRegistrationProperties>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRegistrationProperties {
    #[serde(default, alias = "ProviderType")]
    pub provider_type: Option<String>,
    /// Provider-defined credentials and settings
    #[serde(default, alias = "Settings")]
    pub settings: Value,
}

/// Stored provider registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRegistrationPackage {
    pub resource_id: ResourceId,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    /// Canonical (lower-case) provider type
    pub provider_type: String,
    /// Normalized settings; may contain secrets
    pub settings: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderRegistrationPackage {
    /// Redacted projection returned by get/register
    pub fn to_view(&self) -> ProviderRegistrationView {
        ProviderRegistrationView {
            id: self.resource_id.clone(),
            name: self.name.clone(),
            resource_type: ResourceKind::ProviderRegistrations.type_name(),
            location: self.location.clone(),
            properties: ProviderRegistrationViewProperties {
                provider_type: self.provider_type.clone(),
            },
        }
    }
}

/// Redacted provider registration; never carries settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRegistrationView {
    pub id: ResourceId,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub properties: ProviderRegistrationViewProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRegistrationViewProperties {
    pub provider_type: String,
}

// =============================================================================
// Resources
// =============================================================================

/// Resource request body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    #[serde(default, alias = "Location")]
    pub location: Option<String>,
    #[serde(default, alias = "Properties")]
    pub properties: Option<ResourceDefinitionProperties>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinitionProperties {
    /// Registration id, or a bare registration name in the same resource group
    #[serde(default, alias = "ProviderID", alias = "ProviderId")]
    pub provider_id: Option<String>,
    #[serde(default, alias = "ResourceType")]
    pub resource_type: Option<String>,
    #[serde(default, alias = "Settings")]
    pub settings: Value,
}

/// Stored resource package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePackage {
    pub resource_id: ResourceId,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    pub provider_id: ResourceId,
    pub provider_type: String,
    pub resource_type: String,
    /// Desired settings as supplied by the client
    pub settings: Value,
    /// Rendered plugin configuration of the last apply; internal only
    pub config: Value,
    #[serde(default)]
    pub state: Option<InstanceState>,
    pub provisioning_state: ProvisioningState,
    #[serde(default)]
    pub provisioning_error_code: Option<ErrorCode>,
    #[serde(default)]
    pub provisioning_error_message: Option<String>,
    /// Operation in flight while `Accepted` or `Deleting`
    #[serde(default)]
    pub operation: Option<OperationKind>,
    pub updated_at: DateTime<Utc>,
}

impl ResourcePackage {
    pub fn info(&self) -> ResourceTypeInfo {
        ResourceTypeInfo::new(self.resource_type.clone(), self.name.clone())
    }

    /// Transition into an in-flight state for `operation`
    pub fn begin(&mut self, operation: OperationKind) {
        self.provisioning_state = match operation {
            OperationKind::Apply => ProvisioningState::Accepted,
            OperationKind::Destroy => ProvisioningState::Deleting,
        };
        self.operation = Some(operation);
        self.provisioning_error_code = None;
        self.provisioning_error_message = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_succeeded(&mut self, state: Option<InstanceState>) {
        self.state = state;
        self.provisioning_state = ProvisioningState::Succeeded;
        self.provisioning_error_code = None;
        self.provisioning_error_message = None;
        self.operation = None;
        self.updated_at = Utc::now();
    }

    /// Record a failure; state, config and types are left as they were
    pub fn mark_failed(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.provisioning_state = ProvisioningState::Failed;
        self.provisioning_error_code = Some(code);
        self.provisioning_error_message = Some(message.into());
        self.operation = None;
        self.updated_at = Utc::now();
    }

    /// Client-facing projection; never includes the rendered config
    pub fn to_view(&self) -> ResourceView {
        ResourceView {
            id: self.resource_id.clone(),
            name: self.name.clone(),
            resource_type: ResourceKind::Resources.type_name(),
            location: self.location.clone(),
            properties: ResourceViewProperties {
                provider_id: self.provider_id.clone(),
                resource_type: self.resource_type.clone(),
                settings: self.settings.clone(),
                provisioning_state: self.provisioning_state,
                state: self.state.clone(),
                error: self.error_info(),
            },
        }
    }

    /// Long-running-operation projection
    pub fn to_async_operation_result(&self, operation_id: ResourceId) -> AsyncOperationResult {
        AsyncOperationResult {
            id: operation_id,
            name: self.name.clone(),
            status: self.provisioning_state,
            error: self.error_info(),
        }
    }

    fn error_info(&self) -> Option<ExtendedErrorInfo> {
        if self.provisioning_state != ProvisioningState::Failed {
            return None;
        }
        Some(ExtendedErrorInfo {
            code: self
                .provisioning_error_code
                .unwrap_or(ErrorCode::InternalOperationError),
            message: self.provisioning_error_message.clone().unwrap_or_default(),
        })
    }
}

/// Client-facing resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceView {
    pub id: ResourceId,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub properties: ResourceViewProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceViewProperties {
    pub provider_id: ResourceId,
    pub resource_type: String,
    pub settings: Value,
    pub provisioning_state: ProvisioningState,
    pub state: Option<InstanceState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExtendedErrorInfo>,
}

// =============================================================================
// Long-Running Operations
// =============================================================================

/// Result returned when polling the operation-status URL
///
/// Always derived from the resource package; never stored on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncOperationResult {
    pub id: ResourceId,
    pub name: String,
    pub status: ProvisioningState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExtendedErrorInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}
