//! Shared fixtures for control plane tests

use crate::config::ControlPlaneConfig;
use crate::controlplane::metrics::ControlPlaneMetrics;
use crate::controlplane::providers::{ProviderRegistry, SimulatedProviderFactory, SimulatedWorld};
use crate::controlplane::{ControlPlane, ProviderRegistrationManager, ResourceOrchestrator};
use crate::domain::{
    resource_id, Collection, ProviderRegistrationDefinition, ProviderRegistrationProperties,
    ProvisioningState, ResourceKind, ResourcePackage, ResourceScope,
};
use crate::storage::{MemoryDocumentStore, Repository};
use prometheus::Registry;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A control plane over an in-memory store and a simulated `kubernetes`
/// provider, with registration `p1` already present in `sub`/`rg`
pub(crate) struct TestControlPlane {
    pub world: Arc<SimulatedWorld>,
    pub store: Arc<MemoryDocumentStore>,
    pub control_plane: Arc<ControlPlane>,
    pub registrations: Arc<ProviderRegistrationManager>,
    pub orchestrator: Arc<ResourceOrchestrator>,
    pub metrics: Arc<ControlPlaneMetrics>,
    shutdown: CancellationToken,
}

impl TestControlPlane {
    pub async fn start() -> Self {
        Self::with_plugin_timeout(10).await
    }

    /// Same as [`TestControlPlane::start`], with plugin calls cut off after
    /// `secs` seconds
    pub async fn with_plugin_timeout(secs: u64) -> Self {
        let world = Arc::new(SimulatedWorld::new());
        let providers = Arc::new(ProviderRegistry::new().with_factory(Arc::new(
            SimulatedProviderFactory::new("kubernetes", world.clone()),
        )));
        let store = Arc::new(MemoryDocumentStore::new());
        let metrics = Arc::new(ControlPlaneMetrics::new(&Registry::new()).unwrap());
        let shutdown = CancellationToken::new();

        let mut config = ControlPlaneConfig::default();
        config.orchestrator.plugin_timeout_secs = secs;
        config.server.public_base_url = "https://cp.example.com".into();

        let control_plane = Arc::new(ControlPlane::start(
            &config,
            store.clone(),
            providers,
            metrics.clone(),
            shutdown.clone(),
        ));

        let registrations = control_plane.registrations().clone();
        registrations
            .register(
                &ResourceScope::new("sub", "rg", "p1"),
                ProviderRegistrationDefinition {
                    location: None,
                    properties: Some(ProviderRegistrationProperties {
                        provider_type: Some("kubernetes".into()),
                        settings: json!({"token": "abc"}),
                    }),
                },
            )
            .await
            .unwrap();

        Self {
            world,
            store,
            orchestrator: control_plane.orchestrator().clone(),
            registrations,
            control_plane,
            metrics,
            shutdown,
        }
    }

    /// Stored package, bypassing the orchestrator
    pub async fn package(&self, scope: &ResourceScope) -> Option<ResourcePackage> {
        let repo: Repository<ResourcePackage> =
            Repository::new(self.store.clone(), Collection::Resources);
        repo.find(&resource_id(ResourceKind::Resources, scope))
            .await
            .unwrap()
            .map(|found| found.value)
    }

    pub async fn wait_for_state(&self, scope: &ResourceScope, state: ProvisioningState) {
        for _ in 0..500 {
            if let Some(package) = self.package(scope).await {
                if package.provisioning_state == state {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("resource {} never reached {}", scope.name, state);
    }

    pub async fn wait_for_absent(&self, scope: &ResourceScope) {
        for _ in 0..500 {
            if self.package(scope).await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("resource {} was never removed", scope.name);
    }
}

impl Drop for TestControlPlane {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
