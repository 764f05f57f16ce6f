//! Domain Ports - Core trait definitions for the control plane
//!
//! These traits define the boundaries between the orchestration logic and
//! external systems: provider plugins that do the actual provisioning work,
//! and the document store that holds registrations and resource packages.
//! Adapters implement these traits to provide concrete functionality.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Plugin Data Types
// =============================================================================

/// What a plugin needs to know about the resource it is working on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTypeInfo {
    /// Plugin-defined resource type, e.g. `kubernetes_namespace`
    pub resource_type: String,
    /// Client-chosen resource name
    pub name: String,
}

impl ResourceTypeInfo {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }
}

/// Opaque plugin-defined instance state
///
/// The orchestrator never looks inside; it only persists the value and hands
/// it back to the plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceState(pub Value);

impl InstanceState {
    pub fn into_inner(self) -> Value {
        self.0
    }
}

/// Change of a single attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDiff {
    /// Value before the change (`None` if the attribute is being added)
    pub old: Option<Value>,
    /// Value after the change (`None` if the attribute is being removed)
    pub new: Option<Value>,
}

/// Plugin-computed delta between desired configuration and prior state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceDiff {
    /// Attribute-level changes
    pub attributes: BTreeMap<String, AttributeDiff>,
    /// The instance must be (re)created
    pub requires_new: bool,
    /// The instance must be destroyed
    pub destroy: bool,
}

impl InstanceDiff {
    /// A diff that destroys the instance
    pub fn destroy() -> Self {
        Self {
            destroy: true,
            ..Default::default()
        }
    }

    /// Empty diff means no change is needed
    pub fn is_empty(&self) -> bool {
        !self.destroy && !self.requires_new && self.attributes.is_empty()
    }
}

/// Outcome of validating a resource configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

// =============================================================================
// Provider Capability Port
// =============================================================================

/// Contract every provider plugin satisfies
///
/// One instance serves a single request or operation: it is configured with
/// the registration's credentials and then dropped, so credentials never
/// outlive the work they were read for.
#[async_trait]
pub trait ProviderCapability: Send + Sync {
    /// Provider type this plugin serves
    fn provider_type(&self) -> &str;

    /// Configure the plugin with the provider block of the rendered configuration
    async fn configure(&self, provider_config: &Value) -> Result<()>;

    /// Validate a resource configuration
    async fn validate_resource(&self, resource_type: &str, resource_config: &Value)
        -> ValidationReport;

    /// Compute what needs to change to reach `resource_config` from `prior_state`
    async fn diff(
        &self,
        info: &ResourceTypeInfo,
        prior_state: Option<&InstanceState>,
        resource_config: &Value,
    ) -> Result<InstanceDiff>;

    /// Realise a diff; `None` after a destroy diff confirms deletion
    async fn apply(
        &self,
        info: &ResourceTypeInfo,
        prior_state: Option<&InstanceState>,
        diff: &InstanceDiff,
    ) -> Result<Option<InstanceState>>;

    /// Reconcile stored state with reality; `None` means the instance is gone
    async fn refresh(
        &self,
        info: &ResourceTypeInfo,
        prior_state: &InstanceState,
    ) -> Result<Option<InstanceState>>;
}

/// Creates fresh plugin instances for one provider type
pub trait ProviderFactory: Send + Sync {
    /// Provider type served by the instances this factory creates
    fn provider_type(&self) -> &str;

    /// Create an unconfigured plugin instance
    fn create(&self) -> Box<dyn ProviderCapability>;
}

// =============================================================================
// Document Store Port
// =============================================================================

/// Logical collections of the document store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Collection {
    ProviderRegistrations,
    Resources,
}

impl Collection {
    pub fn name(self) -> &'static str {
        match self {
            Collection::ProviderRegistrations => "providerRegistrations",
            Collection::Resources => "resources",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Monotonic per-document counter bumped by every write
pub type Revision = u64;

/// A document together with the revision it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub document: Value,
    pub revision: Revision,
}

/// Port for the keyed document store
///
/// Exactly one document exists per key. Every write bumps the document's
/// revision; [`DocumentStore::put_if_revision`] is the atomic conditional
/// write used to serialise state transitions.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or replace the document stored under `key`
    async fn upsert(&self, collection: Collection, key: &str, document: Value)
        -> Result<Revision>;

    /// Find the document under `key`; `Error::DocumentNotFound` if absent
    async fn find_one(&self, collection: Collection, key: &str) -> Result<StoredDocument>;

    /// Remove the document under `key`; `Error::DocumentNotFound` if absent
    async fn remove(&self, collection: Collection, key: &str) -> Result<()>;

    /// Write only if the current revision equals `expected`
    ///
    /// `expected == None` means insert-if-absent. Returns the new revision, or
    /// `None` if the condition did not hold and nothing was written.
    async fn put_if_revision(
        &self,
        collection: Collection,
        key: &str,
        document: Value,
        expected: Option<Revision>,
    ) -> Result<Option<Revision>>;

    /// Remove only if the current revision equals `expected`
    async fn remove_if_revision(
        &self,
        collection: Collection,
        key: &str,
        expected: Revision,
    ) -> Result<bool>;

    /// All documents of a collection
    async fn list(&self, collection: Collection) -> Result<Vec<(String, StoredDocument)>>;

    /// Check if the store is reachable
    async fn health_check(&self) -> Result<bool>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ProviderFactoryRef = Arc<dyn ProviderFactory>;
pub type DocumentStoreRef = Arc<dyn DocumentStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_diff_emptiness() {
        assert!(InstanceDiff::default().is_empty());
        assert!(!InstanceDiff::destroy().is_empty());

        let mut diff = InstanceDiff::default();
        diff.attributes.insert(
            "replicas".into(),
            AttributeDiff {
                old: Some(json!(1)),
                new: Some(json!(3)),
            },
        );
        assert!(!diff.is_empty());
    }

    #[test]
    fn test_instance_state_is_transparent() {
        let state = InstanceState(json!({"id": "ns-1"}));
        assert_eq!(serde_json::to_value(&state).unwrap(), json!({"id": "ns-1"}));
    }

    #[test]
    fn test_collection_names() {
        assert_eq!(Collection::ProviderRegistrations.to_string(), "providerRegistrations");
        assert_eq!(Collection::Resources.to_string(), "resources");
    }
}
