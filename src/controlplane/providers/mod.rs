//! Provider Plugin Registry
//!
//! Maps provider types onto factories producing fresh plugin instances.
//! The registry is built once at startup and injected into the registration
//! manager and the orchestrator.

pub mod simulated;

pub use simulated::{SimulatedProvider, SimulatedProviderFactory, SimulatedWorld};

use crate::config::{ProviderConfig, ProviderDriver};
use crate::domain::{ProviderCapability, ProviderFactoryRef};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Registry of provider plugin factories keyed by canonical provider type
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactoryRef>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry described by configuration
    pub fn from_config(providers: &[ProviderConfig]) -> Result<Self> {
        if providers.is_empty() {
            return Err(Error::Configuration(
                "at least one provider type must be configured".into(),
            ));
        }

        let mut registry = Self::new();
        for provider in providers {
            let canonical = provider.provider_type.to_lowercase();
            if registry.factories.contains_key(&canonical) {
                return Err(Error::Configuration(format!(
                    "provider type {} configured twice",
                    canonical
                )));
            }
            let factory: ProviderFactoryRef = match provider.driver {
                ProviderDriver::Simulated => Arc::new(SimulatedProviderFactory::new(
                    canonical.clone(),
                    Arc::new(SimulatedWorld::new()),
                )),
            };
            info!("Registering provider type: {} ({:?})", canonical, provider.driver);
            registry.register(factory);
        }
        Ok(registry)
    }

    /// Add a factory; replaces any factory already serving the same type
    pub fn register(&mut self, factory: ProviderFactoryRef) -> &mut Self {
        self.factories
            .insert(factory.provider_type().to_lowercase(), factory);
        self
    }

    /// Builder-style [`ProviderRegistry::register`]
    pub fn with_factory(mut self, factory: ProviderFactoryRef) -> Self {
        self.register(factory);
        self
    }

    /// Supported provider types in canonical form, sorted
    pub fn supported_types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Resolve a client-supplied provider type (any case) to its canonical form
    pub fn canonical_type(&self, provider_type: &str) -> Result<String> {
        let canonical = provider_type.to_lowercase();
        if self.factories.contains_key(&canonical) {
            Ok(canonical)
        } else {
            Err(Error::UnsupportedProviderType {
                provider_type: provider_type.to_string(),
                supported: self.supported_types().join(", "),
            })
        }
    }

    /// Create a fresh, unconfigured plugin instance
    pub fn create(&self, provider_type: &str) -> Result<Box<dyn ProviderCapability>> {
        let canonical = self.canonical_type(provider_type)?;
        self.factories
            .get(&canonical)
            .map(|factory| factory.create())
            .ok_or_else(|| Error::Internal(format!("no factory for {}", canonical)))
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("provider_types", &self.supported_types())
            .finish()
    }
}
