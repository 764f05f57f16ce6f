//! Plugin Configuration and Sessions
//!
//! [`PluginConfig`] is the declarative document handed to a provider plugin:
//!
//! ```json
//! {
//!   "provider": { "<provider type>": { ...registration settings... } },
//!   "resource": { "<resource type>": { "<name>": { ...client settings... } } }
//! }
//! ```
//!
//! A [`PluginSession`] is one freshly created, configured plugin instance.
//! Every call through it runs under the plugin deadline and is timed.

use crate::controlplane::metrics::ControlPlaneMetrics;
use crate::controlplane::providers::ProviderRegistry;
use crate::domain::{
    InstanceDiff, InstanceState, ProviderCapability, ProviderRegistrationPackage,
    ResourceTypeInfo,
};
use crate::error::{Error, Result};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// =============================================================================
// Plugin Configuration Document
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct PluginConfig(Value);

impl PluginConfig {
    /// Render the document for one resource
    pub fn render(
        registration: &ProviderRegistrationPackage,
        resource_type: &str,
        name: &str,
        settings: &Value,
    ) -> Self {
        Self(json!({
            "provider": { registration.provider_type.as_str(): registration.settings },
            "resource": { resource_type: { name: settings } },
        }))
    }

    /// Wrap a document previously rendered and stored on a package
    pub fn from_value(document: Value) -> Self {
        Self(document)
    }

    /// Provider block for `provider_type`
    pub fn provider(&self, provider_type: &str) -> Option<&Value> {
        self.0.get("provider").and_then(|p| p.get(provider_type))
    }

    /// Resource block for `resource_type`/`name`
    pub fn resource(&self, resource_type: &str, name: &str) -> Option<&Value> {
        self.0
            .get("resource")
            .and_then(|r| r.get(resource_type))
            .and_then(|r| r.get(name))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

// =============================================================================
// Plugin Session
// =============================================================================

pub struct PluginSession {
    plugin: Box<dyn ProviderCapability>,
    timeout: Duration,
    metrics: Arc<ControlPlaneMetrics>,
}

impl PluginSession {
    /// Create a fresh plugin instance and configure it from `config`
    pub async fn open(
        providers: &ProviderRegistry,
        provider_type: &str,
        config: &PluginConfig,
        timeout: Duration,
        metrics: Arc<ControlPlaneMetrics>,
    ) -> Result<Self> {
        let session = Self {
            plugin: providers.create(provider_type)?,
            timeout,
            metrics,
        };
        let provider_config = config.provider(provider_type).cloned().unwrap_or(Value::Null);
        session
            .call("configure", session.plugin.configure(&provider_config))
            .await?;
        Ok(session)
    }

    pub fn provider_type(&self) -> &str {
        self.plugin.provider_type()
    }

    /// Validate resource settings; warnings are logged, errors rejected
    pub async fn validate(&self, resource_type: &str, settings: &Value) -> Result<()> {
        let report = self
            .call("validate", async {
                Ok(self.plugin.validate_resource(resource_type, settings).await)
            })
            .await?;

        for warning in &report.warnings {
            warn!("Validation warning for {}: {}", resource_type, warning);
        }
        if report.is_valid() {
            Ok(())
        } else {
            Err(Error::provider(
                self.provider_type(),
                "validate",
                report.errors.join("; "),
            ))
        }
    }

    pub async fn diff(
        &self,
        info: &ResourceTypeInfo,
        prior_state: Option<&InstanceState>,
        settings: &Value,
    ) -> Result<InstanceDiff> {
        self.call("diff", self.plugin.diff(info, prior_state, settings))
            .await
    }

    pub async fn apply(
        &self,
        info: &ResourceTypeInfo,
        prior_state: Option<&InstanceState>,
        diff: &InstanceDiff,
    ) -> Result<Option<InstanceState>> {
        self.call("apply", self.plugin.apply(info, prior_state, diff))
            .await
    }

    pub async fn refresh(
        &self,
        info: &ResourceTypeInfo,
        prior_state: &InstanceState,
    ) -> Result<Option<InstanceState>> {
        self.call("refresh", self.plugin.refresh(info, prior_state))
            .await
    }

    /// Run one plugin call under the deadline
    ///
    /// Whatever the plugin reports is surfaced as a provider failure; only the
    /// deadline produces a timeout.
    async fn call<T>(
        &self,
        call: &'static str,
        future: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, future).await;
        let elapsed = started.elapsed();
        self.metrics
            .observe_plugin_call(self.provider_type(), call, elapsed);
        debug!("Plugin {} {} took {:?}", self.provider_type(), call, elapsed);

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e @ Error::Provider { .. })) => Err(e),
            Ok(Err(e)) => Err(Error::provider(self.provider_type(), call, e)),
            Err(_) => Err(Error::PluginTimeout {
                provider_type: self.provider_type().to_string(),
                operation: call,
                timeout: self.timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::providers::{SimulatedProviderFactory, SimulatedWorld};
    use crate::domain::ResourceId;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use prometheus::Registry;

    fn registration() -> ProviderRegistrationPackage {
        ProviderRegistrationPackage {
            resource_id: ResourceId::from_raw("/p1"),
            name: "p1".into(),
            location: None,
            provider_type: "kubernetes".into(),
            settings: json!({"token": "abc"}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn setup() -> (Arc<SimulatedWorld>, ProviderRegistry, Arc<ControlPlaneMetrics>) {
        let world = Arc::new(SimulatedWorld::new());
        let registry = ProviderRegistry::new().with_factory(Arc::new(
            SimulatedProviderFactory::new("kubernetes", world.clone()),
        ));
        let metrics = Arc::new(ControlPlaneMetrics::new(&Registry::new()).unwrap());
        (world, registry, metrics)
    }

    #[test]
    fn test_render_document() {
        let config = PluginConfig::render(
            &registration(),
            "kubernetes_namespace",
            "team-a",
            &json!({"labels": {}}),
        );
        assert_eq!(config.provider("kubernetes"), Some(&json!({"token": "abc"})));
        assert_eq!(
            config.resource("kubernetes_namespace", "team-a"),
            Some(&json!({"labels": {}}))
        );
        assert_eq!(config.resource("kubernetes_namespace", "other"), None);
    }

    #[tokio::test]
    async fn test_open_configures_with_provider_block() {
        let (world, registry, metrics) = setup();
        let config = PluginConfig::render(&registration(), "kubernetes_namespace", "a", &json!({}));
        PluginSession::open(&registry, "kubernetes", &config, Duration::from_secs(5), metrics)
            .await
            .unwrap();
        assert_eq!(world.last_provider_config(), Some(json!({"token": "abc"})));
    }

    #[tokio::test]
    async fn test_validation_errors_are_provider_failures() {
        let (_, registry, metrics) = setup();
        let config = PluginConfig::render(&registration(), "kubernetes_namespace", "a", &json!(1));
        let session =
            PluginSession::open(&registry, "kubernetes", &config, Duration::from_secs(5), metrics)
                .await
                .unwrap();
        let err = session
            .validate("kubernetes_namespace", &json!(1))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Provider { operation: "validate", .. });
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let (world, registry, metrics) = setup();
        let config = PluginConfig::render(&registration(), "kubernetes_namespace", "a", &json!({}));
        let session = PluginSession::open(
            &registry,
            "kubernetes",
            &config,
            Duration::from_millis(20),
            metrics,
        )
        .await
        .unwrap();

        world.pause_applies();
        let info = ResourceTypeInfo::new("kubernetes_namespace", "a");
        let err = session
            .apply(&info, None, &InstanceDiff::default())
            .await
            .unwrap_err();
        assert_matches!(err, Error::PluginTimeout { operation: "apply", .. });
        assert_eq!(err.code(), crate::apierror::ErrorCode::OperationTimeout);
    }
}
