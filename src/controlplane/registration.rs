//! Provider Registration Manager
//!
//! Validates, normalizes and persists provider registrations. The manager is
//! the only writer of the provider-registration collection; the orchestrator
//! reads credentials through [`ProviderRegistrationManager::registration`].

use crate::controlplane::providers::ProviderRegistry;
use crate::domain::{
    resource_id, Collection, DocumentStoreRef, ProviderRegistrationDefinition,
    ProviderRegistrationPackage, ProviderRegistrationView, ResourceId, ResourceKind,
    ResourceScope,
};
use crate::error::{Error, Result};
use crate::storage::Repository;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Credential Normalizers
// =============================================================================

/// Provider-specific rewrite of registration settings before they are stored
pub trait CredentialNormalizer: Send + Sync {
    fn normalize(&self, settings: Value) -> std::result::Result<Value, String>;
}

/// Decodes a base64 `inline_config` field into its plain-text form
#[derive(Debug, Clone, Default)]
pub struct InlineConfigDecoder;

impl InlineConfigDecoder {
    pub const FIELD: &'static str = "inline_config";
}

impl CredentialNormalizer for InlineConfigDecoder {
    fn normalize(&self, mut settings: Value) -> std::result::Result<Value, String> {
        let Some(fields) = settings.as_object_mut() else {
            return Ok(settings);
        };
        let Some(encoded) = fields.get(Self::FIELD) else {
            return Ok(settings);
        };
        let encoded = encoded
            .as_str()
            .ok_or_else(|| format!("{} must be a string", Self::FIELD))?;

        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| format!("{} is not valid base64: {}", Self::FIELD, e))?;
        let decoded = String::from_utf8(bytes)
            .map_err(|_| format!("{} does not decode to UTF-8 text", Self::FIELD))?;

        fields.insert(Self::FIELD.to_string(), Value::String(decoded));
        Ok(settings)
    }
}

/// Strategy table: canonical provider type to normalizer
#[derive(Clone, Default)]
pub struct CredentialNormalizers {
    table: HashMap<String, Arc<dyn CredentialNormalizer>>,
}

impl CredentialNormalizers {
    /// Table with the built-in normalizers
    pub fn with_defaults() -> Self {
        let mut normalizers = Self::default();
        normalizers.register("kubernetes", Arc::new(InlineConfigDecoder));
        normalizers
    }

    pub fn register(&mut self, provider_type: &str, normalizer: Arc<dyn CredentialNormalizer>) {
        self.table.insert(provider_type.to_lowercase(), normalizer);
    }

    /// Apply the normalizer for `provider_type`; settings pass through if none is registered
    pub fn normalize(&self, provider_type: &str, settings: Value) -> Result<Value> {
        match self.table.get(provider_type) {
            Some(normalizer) => {
                normalizer
                    .normalize(settings)
                    .map_err(|reason| Error::CredentialNormalization {
                        provider_type: provider_type.to_string(),
                        reason,
                    })
            }
            None => Ok(settings),
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

pub struct ProviderRegistrationManager {
    registrations: Repository<ProviderRegistrationPackage>,
    providers: Arc<ProviderRegistry>,
    normalizers: CredentialNormalizers,
}

impl ProviderRegistrationManager {
    pub fn new(store: DocumentStoreRef, providers: Arc<ProviderRegistry>) -> Self {
        Self {
            registrations: Repository::new(store, Collection::ProviderRegistrations),
            providers,
            normalizers: CredentialNormalizers::with_defaults(),
        }
    }

    /// Replace the credential normalizer table
    pub fn with_normalizers(mut self, normalizers: CredentialNormalizers) -> Self {
        self.normalizers = normalizers;
        self
    }

    /// Create or replace a registration
    pub async fn register(
        &self,
        scope: &ResourceScope,
        definition: ProviderRegistrationDefinition,
    ) -> Result<ProviderRegistrationView> {
        let id = resource_id(ResourceKind::ProviderRegistrations, scope);
        let properties = definition
            .properties
            .ok_or_else(|| Error::Validation("Request content is missing properties.".into()))?;
        let requested_type = properties
            .provider_type
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                Error::Validation("Request content is missing property 'providerType'.".into())
            })?;

        let provider_type = self.providers.canonical_type(&requested_type)?;
        let settings = self.normalizers.normalize(&provider_type, properties.settings)?;

        let now = Utc::now();
        let created_at = self
            .registrations
            .find(&id)
            .await?
            .map(|existing| existing.value.created_at)
            .unwrap_or(now);

        let package = ProviderRegistrationPackage {
            resource_id: id.clone(),
            name: scope.name.clone(),
            location: definition.location,
            provider_type,
            settings,
            created_at,
            updated_at: now,
        };
        self.registrations.upsert(&id, &package).await?;

        info!("Registered provider: {} ({})", id, package.provider_type);
        Ok(package.to_view())
    }

    /// Redacted registration
    pub async fn get(&self, scope: &ResourceScope) -> Result<ProviderRegistrationView> {
        let id = resource_id(ResourceKind::ProviderRegistrations, scope);
        Ok(self.load(&id).await?.to_view())
    }

    /// Full settings blob, secrets included
    pub async fn list_settings(&self, scope: &ResourceScope) -> Result<Value> {
        let id = resource_id(ResourceKind::ProviderRegistrations, scope);
        debug!("Listing provider settings: {}", id);
        Ok(self.load(&id).await?.settings)
    }

    pub async fn delete(&self, scope: &ResourceScope) -> Result<()> {
        let id = resource_id(ResourceKind::ProviderRegistrations, scope);
        if !self.registrations.remove(&id).await? {
            return Err(not_found(&id));
        }
        info!("Deleted provider registration: {}", id);
        Ok(())
    }

    /// Registration referenced by a resource, credentials included
    ///
    /// A missing registration is the client's mistake, so it is reported as
    /// `MissingProviderRegistration` rather than `NotFound`.
    pub async fn registration(&self, id: &ResourceId) -> Result<ProviderRegistrationPackage> {
        self.registrations
            .find(id)
            .await?
            .map(|found| found.value)
            .ok_or_else(|| Error::MissingProviderRegistration { id: id.to_string() })
    }

    async fn load(&self, id: &ResourceId) -> Result<ProviderRegistrationPackage> {
        self.registrations
            .find(id)
            .await?
            .map(|found| found.value)
            .ok_or_else(|| not_found(id))
    }
}

fn not_found(id: &ResourceId) -> Error {
    Error::NotFound {
        kind: "Provider registration",
        id: id.to_string(),
    }
}
