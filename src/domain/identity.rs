//! Resource Identity Scheme
//!
//! Pure functions mapping request path parameters onto canonical resource
//! identifiers. Identifiers are always recomputed from the live request and
//! are the only primary key the document store knows about.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Namespace every route and identifier of this control plane lives under
pub const RESOURCE_PROVIDER_NAMESPACE: &str = "Declarative.ResourceProvider";

/// API version appended to operation-status callback URLs
pub const OPERATION_STATUS_API_VERSION: &str = "2018-05-01-preview";

/// Query parameter carrying the API version
pub const API_VERSION_PARAMETER: &str = "api-version";

// =============================================================================
// Resource Kinds
// =============================================================================

/// Kinds of entities addressable under the provider namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    ProviderRegistrations,
    Resources,
    OperationStatus,
}

impl ResourceKind {
    /// Canonical path segment
    pub fn segment(self) -> &'static str {
        match self {
            ResourceKind::ProviderRegistrations => "providerregistrations",
            ResourceKind::Resources => "resources",
            ResourceKind::OperationStatus => "operationstatus",
        }
    }

    /// Parse a path segment, ignoring ASCII case
    pub fn from_segment(segment: &str) -> Option<Self> {
        [
            ResourceKind::ProviderRegistrations,
            ResourceKind::Resources,
            ResourceKind::OperationStatus,
        ]
        .into_iter()
        .find(|kind| kind.segment().eq_ignore_ascii_case(segment))
    }

    /// Fully qualified type name, e.g. `Declarative.ResourceProvider/resources`
    pub fn type_name(self) -> String {
        format!("{}/{}", RESOURCE_PROVIDER_NAMESPACE, self.segment())
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.segment())
    }
}

// =============================================================================
// Scope and Identifier
// =============================================================================

/// Path parameters identifying one named entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceScope {
    pub subscription_id: String,
    pub resource_group: String,
    pub name: String,
}

impl ResourceScope {
    pub fn new(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
            name: name.into(),
        }
    }

    /// Same subscription and resource group, different name
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self {
            subscription_id: self.subscription_id.clone(),
            resource_group: self.resource_group.clone(),
            name: name.into(),
        }
    }
}

/// Canonical hierarchical identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Wrap an identifier received from a client (e.g. a `providerId` reference)
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Derivations
// =============================================================================

/// `/subscriptions/{sub}/resourceGroups/{rg}/providers/{ns}/{kind}/{name}`
pub fn resource_id(kind: ResourceKind, scope: &ResourceScope) -> ResourceId {
    ResourceId(format!(
        "/subscriptions/{}/resourceGroups/{}/providers/{}/{}/{}",
        scope.subscription_id,
        scope.resource_group,
        RESOURCE_PROVIDER_NAMESPACE,
        kind.segment(),
        scope.name
    ))
}

/// Identifier of the operation-status entity tracking a resource's operation
pub fn operation_status_id(scope: &ResourceScope) -> ResourceId {
    resource_id(ResourceKind::OperationStatus, scope)
}

/// Absolute callback URL a client polls for the operation on `scope`
pub fn async_operation_url(base_url: &str, scope: &ResourceScope) -> String {
    format!(
        "{}{}?{}={}",
        base_url.trim_end_matches('/'),
        operation_status_id(scope),
        API_VERSION_PARAMETER,
        OPERATION_STATUS_API_VERSION
    )
}

/// Resolve a resource's `providerId` reference to a registration identifier
///
/// Bare names refer to a registration in the same subscription and resource
/// group. Absolute references must name a provider registration in the
/// request's own subscription; their literal segments match in any case and
/// come back in canonical form.
pub fn provider_registration_ref(reference: &str, scope: &ResourceScope) -> Result<ResourceId> {
    let Some(path) = reference.strip_prefix('/') else {
        return Ok(resource_id(
            ResourceKind::ProviderRegistrations,
            &scope.sibling(reference),
        ));
    };

    let invalid = || {
        Error::Validation(format!(
            "The providerId '{}' is not a provider registration reference.",
            reference
        ))
    };
    let segments: Vec<&str> = path.split('/').collect();
    let [subscriptions, subscription_id, resource_groups, resource_group, providers, namespace, kind, name] =
        segments.as_slice()
    else {
        return Err(invalid());
    };
    if !subscriptions.eq_ignore_ascii_case("subscriptions")
        || !resource_groups.eq_ignore_ascii_case("resourceGroups")
        || !providers.eq_ignore_ascii_case("providers")
        || !namespace.eq_ignore_ascii_case(RESOURCE_PROVIDER_NAMESPACE)
        || ResourceKind::from_segment(kind) != Some(ResourceKind::ProviderRegistrations)
        || resource_group.is_empty()
        || name.is_empty()
    {
        return Err(invalid());
    }
    if !subscription_id.eq_ignore_ascii_case(&scope.subscription_id) {
        return Err(Error::Validation(format!(
            "The providerId '{}' refers to a registration outside subscription '{}'.",
            reference, scope.subscription_id
        )));
    }

    Ok(resource_id(
        ResourceKind::ProviderRegistrations,
        &ResourceScope::new(scope.subscription_id.as_str(), *resource_group, *name),
    ))
}
