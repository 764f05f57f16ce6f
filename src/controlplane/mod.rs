//! Declarative Control Plane
//!
//! Wires the registration manager, the resource orchestrator and the
//! operation worker pool around one document store and one provider
//! registry.

pub mod api;
pub mod metrics;
pub mod orchestrator;
pub mod plugin;
pub mod providers;
pub mod registration;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use api::*;
pub use metrics::{ControlPlaneMetrics, OperationOutcome};
pub use orchestrator::{DeleteOutcome, PutOutcome, ResourceOrchestrator};
pub use plugin::{PluginConfig, PluginSession};
pub use providers::ProviderRegistry;
pub use registration::{
    CredentialNormalizer, CredentialNormalizers, InlineConfigDecoder, ProviderRegistrationManager,
};
pub use worker::{OperationExecutor, OperationJob, OperationQueue, WorkerPool};

use crate::config::ControlPlaneConfig;
use crate::domain::{Collection, DocumentStoreRef};
use crate::storage::Repository;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A running control plane
pub struct ControlPlane {
    registrations: Arc<ProviderRegistrationManager>,
    orchestrator: Arc<ResourceOrchestrator>,
    store: DocumentStoreRef,
    workers: WorkerPool,
}

impl ControlPlane {
    /// Build the components and start the worker pool
    ///
    /// Background tasks stop when `shutdown` is cancelled.
    pub fn start(
        config: &ControlPlaneConfig,
        store: DocumentStoreRef,
        providers: Arc<ProviderRegistry>,
        metrics: Arc<ControlPlaneMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        let resources = Repository::new(store.clone(), Collection::Resources);
        let registrations = Arc::new(ProviderRegistrationManager::new(
            store.clone(),
            providers.clone(),
        ));

        let executor = Arc::new(OperationExecutor::new(
            resources.clone(),
            providers.clone(),
            config.orchestrator.plugin_timeout(),
            metrics.clone(),
        ));
        let workers = WorkerPool::start(executor, &config.orchestrator, metrics.clone(), shutdown);

        let orchestrator = Arc::new(ResourceOrchestrator::new(
            resources,
            registrations.clone(),
            providers.clone(),
            workers.queue(),
            &config.orchestrator,
            config.server.public_base_url.clone(),
            metrics,
        ));

        info!(
            "Control plane started with provider types: {}",
            providers.supported_types().join(", ")
        );
        Self {
            registrations,
            orchestrator,
            store,
            workers,
        }
    }

    pub fn registrations(&self) -> &Arc<ProviderRegistrationManager> {
        &self.registrations
    }

    pub fn orchestrator(&self) -> &Arc<ResourceOrchestrator> {
        &self.orchestrator
    }

    pub fn store(&self) -> &DocumentStoreRef {
        &self.store
    }

    /// Whether the control plane can serve requests
    pub async fn ready(&self) -> bool {
        crate::storage::store_ready(self.store.as_ref()).await
    }

    /// Number of operations queued or running in this process
    pub fn operations_in_flight(&self) -> usize {
        self.workers.queue().in_flight()
    }

    /// Wait for the background tasks to stop after shutdown
    pub async fn join(self) {
        self.workers.join().await;
        info!("Control plane stopped");
    }
}
