//! Resource Orchestrator
//!
//! Drives the lifecycle of resource packages:
//!
//! ```text
//!            PUT (non-empty diff)            apply ok
//!   absent ───────────────────────▶ Accepted ─────────▶ Succeeded
//!     ▲                               │   apply err        │
//!     │                               └──────────▶ Failed ◀┘ (later PUT/DELETE)
//!     │      destroy ok                            ▲
//!     └──────────────── Deleting ──────────────────┘ destroy err
//! ```
//!
//! The synchronous half (validation, refresh, diff, admission) runs in the
//! request; the apply or destroy itself runs on the worker pool. Admission is
//! a conditional write, so at most one operation per resource is in flight.

use crate::apierror::ErrorCode;
use crate::config::OrchestratorConfig;
use crate::controlplane::metrics::ControlPlaneMetrics;
use crate::controlplane::plugin::{PluginConfig, PluginSession};
use crate::controlplane::providers::ProviderRegistry;
use crate::controlplane::registration::ProviderRegistrationManager;
use crate::controlplane::worker::{OperationJob, OperationQueue};
use crate::domain::{
    async_operation_url, operation_status_id, provider_registration_ref, resource_id,
    AsyncOperationResult, InstanceDiff, InstanceState, OperationKind, ProvisioningState,
    ResourceDefinition, ResourceId, ResourceKind, ResourcePackage, ResourceScope,
    ResourceTypeInfo, ResourceView, Revision,
};
use crate::error::{Error, Result};
use crate::storage::{Repository, Versioned};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Outcomes
// =============================================================================

/// Result of a create/update
#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    /// Nothing to apply; a stale stored package may have been reconciled
    Unchanged(ResourceView),
    /// Apply admitted; poll `operation_url` for completion
    Accepted {
        view: ResourceView,
        operation_url: String,
    },
}

/// Result of a delete
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    /// Nothing existed in the plugin; the package was removed immediately
    Deleted,
    /// Destroy admitted; poll `operation_url` for completion
    Accepted { operation_url: String },
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct ResourceOrchestrator {
    resources: Repository<ResourcePackage>,
    registrations: Arc<ProviderRegistrationManager>,
    providers: Arc<ProviderRegistry>,
    queue: OperationQueue,
    plugin_timeout: Duration,
    public_base_url: String,
    metrics: Arc<ControlPlaneMetrics>,
}

impl ResourceOrchestrator {
    pub fn new(
        resources: Repository<ResourcePackage>,
        registrations: Arc<ProviderRegistrationManager>,
        providers: Arc<ProviderRegistry>,
        queue: OperationQueue,
        config: &OrchestratorConfig,
        public_base_url: impl Into<String>,
        metrics: Arc<ControlPlaneMetrics>,
    ) -> Self {
        Self {
            resources,
            registrations,
            providers,
            queue,
            plugin_timeout: config.plugin_timeout(),
            public_base_url: public_base_url.into(),
            metrics,
        }
    }

    /// Create or update a resource
    pub async fn create_or_update(
        &self,
        scope: &ResourceScope,
        definition: ResourceDefinition,
    ) -> Result<PutOutcome> {
        let id = resource_id(ResourceKind::Resources, scope);
        let properties = definition
            .properties
            .ok_or_else(|| Error::Validation("Request content is missing properties.".into()))?;
        let resource_type = required(properties.resource_type, "resourceType")?;
        let provider_ref = required(properties.provider_id, "providerId")?;
        let settings = properties.settings;

        let provider_id = provider_registration_ref(&provider_ref, scope)?;
        let registration = self.registrations.registration(&provider_id).await?;
        let config = PluginConfig::render(&registration, &resource_type, &scope.name, &settings);

        let session = self.open_session(&registration.provider_type, &config).await?;
        session.validate(&resource_type, &settings).await?;

        let existing = self.resources.find(&id).await?;
        if let Some(existing) = &existing {
            ensure_idle(&existing.value, "create", &id)?;
        }

        let info = ResourceTypeInfo::new(resource_type.clone(), scope.name.clone());
        let prior_state = match existing.as_ref().and_then(|e| e.value.state.as_ref()) {
            Some(state) => {
                let refreshed = session.refresh(&info, state).await?;
                if refreshed.is_none() {
                    info!("Resource no longer exists in provider, recreating: {}", id);
                }
                refreshed
            }
            None => None,
        };

        let diff = session.diff(&info, prior_state.as_ref(), &settings).await?;
        let mut package = self.package(
            &id,
            scope,
            &definition.location,
            &registration.resource_id,
            &registration.provider_type,
            &resource_type,
            settings,
            config,
            prior_state,
        );
        if diff.is_empty() {
            return self.reconcile(existing, package).await.map(PutOutcome::Unchanged);
        }

        package.begin(OperationKind::Apply);

        let revision = self
            .admit(&package, existing.as_ref().map(|e| e.revision))
            .await?;
        self.dispatch(&package, OperationKind::Apply, revision, diff)
            .await?;

        info!("Accepted resource: {} ({})", id, package.resource_type);
        Ok(PutOutcome::Accepted {
            view: package.to_view(),
            operation_url: self.operation_url(scope),
        })
    }

    /// Read a resource, reconciling its state with the provider
    pub async fn get(&self, scope: &ResourceScope) -> Result<ResourceView> {
        let id = resource_id(ResourceKind::Resources, scope);
        let found = self.resources.find(&id).await?.ok_or_else(|| not_found(&id))?;
        let mut package = found.value;

        let Some(state) = package.state.clone() else {
            return Ok(package.to_view());
        };
        if package.provisioning_state.is_in_flight() {
            return Ok(package.to_view());
        }

        let config = PluginConfig::from_value(package.config.clone());
        let session = self.open_session(&package.provider_type, &config).await?;
        match session.refresh(&package.info(), &state).await? {
            None => {
                info!("Resource disappeared from provider, removing: {}", id);
                if !self.resources.remove_if_revision(&id, found.revision).await? {
                    warn!("Resource changed while removing drifted package: {}", id);
                }
                Err(not_found(&id))
            }
            Some(refreshed) => {
                if refreshed != state {
                    package.state = Some(refreshed);
                    package.updated_at = Utc::now();
                    if self
                        .resources
                        .put_if_revision(&id, &package, Some(found.revision))
                        .await?
                        .is_none()
                    {
                        debug!("Skipped refreshed state write, resource changed: {}", id);
                    }
                }
                Ok(package.to_view())
            }
        }
    }

    /// Delete a resource
    pub async fn delete(&self, scope: &ResourceScope) -> Result<DeleteOutcome> {
        let id = resource_id(ResourceKind::Resources, scope);
        let found = self.resources.find(&id).await?.ok_or_else(|| not_found(&id))?;
        let mut package = found.value;
        ensure_idle(&package, "delete", &id)?;

        if package.state.is_none() {
            if !self.resources.remove_if_revision(&id, found.revision).await? {
                return Err(Error::ConcurrentModification { id: id.to_string() });
            }
            info!("Deleted resource without provider state: {}", id);
            return Ok(DeleteOutcome::Deleted);
        }

        package.begin(OperationKind::Destroy);
        let revision = self.admit(&package, Some(found.revision)).await?;
        self.dispatch(&package, OperationKind::Destroy, revision, InstanceDiff::destroy())
            .await?;

        info!("Deleting resource: {}", id);
        Ok(DeleteOutcome::Accepted {
            operation_url: self.operation_url(scope),
        })
    }

    /// Poll the operation running, or last run, on a resource
    pub async fn operation_status(&self, scope: &ResourceScope) -> Result<AsyncOperationResult> {
        let id = resource_id(ResourceKind::Resources, scope);
        let found = self.resources.find(&id).await?.ok_or_else(|| not_found(&id))?;
        Ok(found
            .value
            .to_async_operation_result(operation_status_id(scope)))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn open_session(&self, provider_type: &str, config: &PluginConfig) -> Result<PluginSession> {
        PluginSession::open(
            &self.providers,
            provider_type,
            config,
            self.plugin_timeout,
            self.metrics.clone(),
        )
        .await
    }

    /// Settle a PUT whose diff is empty without calling apply
    ///
    /// A stored package that already matches the request is returned as is.
    /// One left `Failed` or holding other settings is rewritten as `Succeeded`
    /// with the request's settings and the refreshed state. With nothing
    /// stored, nothing is written.
    async fn reconcile(
        &self,
        existing: Option<Versioned<ResourcePackage>>,
        mut package: ResourcePackage,
    ) -> Result<ResourceView> {
        let state = package.state.take();
        package.mark_succeeded(state);

        let Some(existing) = existing else {
            debug!("No changes for new resource: {}", package.resource_id);
            return Ok(package.to_view());
        };
        let current = &existing.value;
        if current.provisioning_state == ProvisioningState::Succeeded
            && current.settings == package.settings
            && current.config == package.config
            && current.location == package.location
        {
            debug!("No changes for resource: {}", package.resource_id);
            return Ok(current.to_view());
        }

        self.resources
            .put_if_revision(&package.resource_id, &package, Some(existing.revision))
            .await?
            .ok_or_else(|| Error::ConcurrentModification {
                id: package.resource_id.to_string(),
            })?;
        info!(
            "Reconciled resource without provider changes: {}",
            package.resource_id
        );
        Ok(package.to_view())
    }

    /// Conditionally write the in-flight package; a lost race is a conflict
    async fn admit(&self, package: &ResourcePackage, expected: Option<Revision>) -> Result<Revision> {
        self.resources
            .put_if_revision(&package.resource_id, package, expected)
            .await?
            .ok_or_else(|| Error::ConcurrentModification {
                id: package.resource_id.to_string(),
            })
    }

    /// Hand an admitted package to the worker pool
    ///
    /// If the queue is gone the package is failed right away instead of being
    /// left in flight.
    async fn dispatch(
        &self,
        package: &ResourcePackage,
        kind: OperationKind,
        revision: Revision,
        diff: InstanceDiff,
    ) -> Result<()> {
        let job = OperationJob {
            resource_id: package.resource_id.clone(),
            kind,
            revision,
            diff,
        };
        if let Err(e) = self.queue.enqueue(job).await {
            let mut failed = package.clone();
            failed.mark_failed(ErrorCode::InternalOperationError, e.to_string());
            self.resources
                .put_if_revision(&package.resource_id, &failed, Some(revision))
                .await?;
            return Err(e);
        }
        Ok(())
    }

    fn operation_url(&self, scope: &ResourceScope) -> String {
        async_operation_url(&self.public_base_url, scope)
    }

    #[allow(clippy::too_many_arguments)]
    fn package(
        &self,
        id: &ResourceId,
        scope: &ResourceScope,
        location: &Option<String>,
        provider_id: &ResourceId,
        provider_type: &str,
        resource_type: &str,
        settings: Value,
        config: PluginConfig,
        state: Option<InstanceState>,
    ) -> ResourcePackage {
        ResourcePackage {
            resource_id: id.clone(),
            name: scope.name.clone(),
            location: location.clone(),
            provider_id: provider_id.clone(),
            provider_type: provider_type.to_string(),
            resource_type: resource_type.to_string(),
            settings,
            config: config.into_value(),
            state,
            provisioning_state: ProvisioningState::Succeeded,
            provisioning_error_code: None,
            provisioning_error_message: None,
            operation: None,
            updated_at: Utc::now(),
        }
    }
}

fn required(value: Option<String>, property: &str) -> Result<String> {
    value.filter(|v| !v.trim().is_empty()).ok_or_else(|| {
        Error::Validation(format!(
            "Request content is missing property '{}'.",
            property
        ))
    })
}

fn ensure_idle(package: &ResourcePackage, action: &'static str, id: &ResourceId) -> Result<()> {
    if package.provisioning_state.is_in_flight() {
        return Err(Error::OperationInProgress {
            action,
            id: id.to_string(),
            state: package.provisioning_state.describe().to_string(),
        });
    }
    Ok(())
}

fn not_found(id: &ResourceId) -> Error {
    Error::NotFound {
        kind: "Resource",
        id: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::testing::TestControlPlane;
    use crate::domain::{Collection, ResourceDefinitionProperties};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn definition(settings: Value) -> ResourceDefinition {
        ResourceDefinition {
            location: Some("westus".into()),
            properties: Some(ResourceDefinitionProperties {
                provider_id: Some("p1".into()),
                resource_type: Some("kubernetes_namespace".into()),
                settings,
            }),
        }
    }

    fn scope() -> ResourceScope {
        ResourceScope::new("sub", "rg", "r1")
    }

    #[tokio::test]
    async fn test_create_poll_get() {
        let cp = TestControlPlane::start().await;
        let outcome = cp
            .orchestrator
            .create_or_update(&scope(), definition(json!({"labels": {"team": "a"}})))
            .await
            .unwrap();
        let PutOutcome::Accepted { view, operation_url } = outcome else {
            panic!("expected an accepted operation");
        };
        assert_eq!(view.properties.provisioning_state, ProvisioningState::Accepted);
        assert!(operation_url.ends_with(
            "/operationstatus/r1?api-version=2018-05-01-preview"
        ));

        cp.wait_for_state(&scope(), ProvisioningState::Succeeded).await;
        let view = cp.orchestrator.get(&scope()).await.unwrap();
        assert!(view.properties.state.is_some());
        assert_eq!(view.properties.settings, json!({"labels": {"team": "a"}}));
    }

    #[tokio::test]
    async fn test_identical_put_is_idempotent() {
        let cp = TestControlPlane::start().await;
        cp.orchestrator
            .create_or_update(&scope(), definition(json!({"a": 1})))
            .await
            .unwrap();
        cp.wait_for_state(&scope(), ProvisioningState::Succeeded).await;
        let state_before = cp.orchestrator.get(&scope()).await.unwrap().properties.state;

        let outcome = cp
            .orchestrator
            .create_or_update(&scope(), definition(json!({"a": 1})))
            .await
            .unwrap();
        assert_matches!(outcome, PutOutcome::Unchanged(_));
        assert_eq!(cp.world.apply_calls(), 1);
        assert_eq!(
            cp.orchestrator.get(&scope()).await.unwrap().properties.state,
            state_before
        );
    }

    #[tokio::test]
    async fn test_conflicts_while_provisioning() {
        let cp = TestControlPlane::start().await;
        cp.world.pause_applies();
        cp.orchestrator
            .create_or_update(&scope(), definition(json!({})))
            .await
            .unwrap();

        let err = cp
            .orchestrator
            .create_or_update(&scope(), definition(json!({"b": 2})))
            .await
            .unwrap_err();
        assert_matches!(err, Error::OperationInProgress { action: "create", .. });
        assert_eq!(err.code(), ErrorCode::Conflict);

        let err = cp.orchestrator.delete(&scope()).await.unwrap_err();
        assert_matches!(err, Error::OperationInProgress { action: "delete", .. });

        cp.world.resume_applies();
        cp.wait_for_state(&scope(), ProvisioningState::Succeeded).await;
    }

    #[tokio::test]
    async fn test_drift_removes_package() {
        let cp = TestControlPlane::start().await;
        cp.orchestrator
            .create_or_update(&scope(), definition(json!({})))
            .await
            .unwrap();
        cp.wait_for_state(&scope(), ProvisioningState::Succeeded).await;

        assert!(cp.world.forget_instance("kubernetes_namespace", "r1"));
        assert_matches!(
            cp.orchestrator.get(&scope()).await,
            Err(Error::NotFound { .. })
        );
        assert!(cp.store.is_empty(Collection::Resources));
    }

    #[tokio::test]
    async fn test_delete_async_then_gone() {
        let cp = TestControlPlane::start().await;
        cp.orchestrator
            .create_or_update(&scope(), definition(json!({})))
            .await
            .unwrap();
        cp.wait_for_state(&scope(), ProvisioningState::Succeeded).await;

        let outcome = cp.orchestrator.delete(&scope()).await.unwrap();
        assert_matches!(outcome, DeleteOutcome::Accepted { .. });

        cp.wait_for_absent(&scope()).await;
        assert_matches!(
            cp.orchestrator.get(&scope()).await,
            Err(Error::NotFound { .. })
        );
        assert!(cp.world.instance("kubernetes_namespace", "r1").is_none());
    }

    #[tokio::test]
    async fn test_delete_without_state_is_synchronous() {
        let cp = TestControlPlane::start().await;
        cp.world.fail_next_apply("bad namespace");
        cp.orchestrator
            .create_or_update(&scope(), definition(json!({})))
            .await
            .unwrap();
        cp.wait_for_state(&scope(), ProvisioningState::Failed).await;

        let status = cp.orchestrator.operation_status(&scope()).await.unwrap();
        let error = status.error.unwrap();
        assert_eq!(error.code, ErrorCode::BadRequest);
        assert!(error.message.contains("bad namespace"));

        assert_eq!(
            cp.orchestrator.delete(&scope()).await.unwrap(),
            DeleteOutcome::Deleted
        );
        assert_matches!(
            cp.orchestrator.operation_status(&scope()).await,
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_missing_registration_is_bad_request() {
        let cp = TestControlPlane::start().await;
        let mut def = definition(json!({}));
        def.properties.as_mut().unwrap().provider_id = Some("nope".into());
        let err = cp
            .orchestrator
            .create_or_update(&scope(), def)
            .await
            .unwrap_err();
        assert_matches!(err, Error::MissingProviderRegistration { .. });
        assert_eq!(err.code(), ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn test_registration_in_other_subscription_is_rejected() {
        let cp = TestControlPlane::start().await;
        cp.registrations
            .register(
                &ResourceScope::new("other", "rg", "p1"),
                crate::domain::ProviderRegistrationDefinition {
                    location: None,
                    properties: Some(crate::domain::ProviderRegistrationProperties {
                        provider_type: Some("kubernetes".into()),
                        settings: json!({"token": "other"}),
                    }),
                },
            )
            .await
            .unwrap();

        let mut def = definition(json!({}));
        def.properties.as_mut().unwrap().provider_id = Some(
            "/subscriptions/other/resourceGroups/rg/providers/Declarative.ResourceProvider/providerregistrations/p1".into(),
        );
        let err = cp
            .orchestrator
            .create_or_update(&scope(), def)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Validation(_));
        assert_eq!(err.code(), ErrorCode::BadRequest);
        assert!(cp.store.is_empty(Collection::Resources));
        assert!(cp.world.last_provider_config().is_none());
    }

    #[tokio::test]
    async fn test_definition_validation() {
        let cp = TestControlPlane::start().await;
        let err = cp
            .orchestrator
            .create_or_update(&scope(), ResourceDefinition::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Request content is missing properties.");

        let mut def = definition(json!({}));
        def.properties.as_mut().unwrap().resource_type = Some("  ".into());
        let err = cp
            .orchestrator
            .create_or_update(&scope(), def)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Request content is missing property 'resourceType'."
        );

        let err = cp
            .orchestrator
            .create_or_update(&scope(), definition(json!("not an object")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
        assert!(cp.store.is_empty(Collection::Resources));
    }

    #[tokio::test]
    async fn test_concurrent_creates_single_winner() {
        let cp = TestControlPlane::start().await;
        cp.world.pause_applies();

        let (scope_a, scope_b) = (scope(), scope());
        let (a, b) = tokio::join!(
            cp.orchestrator
                .create_or_update(&scope_a, definition(json!({"writer": "a"}))),
            cp.orchestrator
                .create_or_update(&scope_b, definition(json!({"writer": "b"}))),
        );
        let results = [a, b];
        let accepted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(accepted, 1);
        let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(loser.code(), ErrorCode::Conflict);

        cp.world.resume_applies();
        cp.wait_for_state(&scope(), ProvisioningState::Succeeded).await;
        assert_eq!(cp.world.apply_calls(), 1);
    }

    #[tokio::test]
    async fn test_update_failure_keeps_prior_state() {
        let cp = TestControlPlane::start().await;
        cp.orchestrator
            .create_or_update(&scope(), definition(json!({"a": 1})))
            .await
            .unwrap();
        cp.wait_for_state(&scope(), ProvisioningState::Succeeded).await;
        let before = cp.orchestrator.get(&scope()).await.unwrap().properties.state;

        cp.world.fail_next_apply("immutable field");
        cp.orchestrator
            .create_or_update(&scope(), definition(json!({"a": 2})))
            .await
            .unwrap();
        cp.wait_for_state(&scope(), ProvisioningState::Failed).await;

        let stored = cp.package(&scope()).await.unwrap();
        assert_eq!(stored.state, before);
        assert_eq!(stored.settings, json!({"a": 2}));
    }

    #[tokio::test]
    async fn test_unchanged_put_reconciles_failed_update() {
        let cp = TestControlPlane::start().await;
        cp.orchestrator
            .create_or_update(&scope(), definition(json!({"a": 1})))
            .await
            .unwrap();
        cp.wait_for_state(&scope(), ProvisioningState::Succeeded).await;

        cp.world.fail_next_apply("immutable field");
        cp.orchestrator
            .create_or_update(&scope(), definition(json!({"a": 2})))
            .await
            .unwrap();
        cp.wait_for_state(&scope(), ProvisioningState::Failed).await;

        // Live instance still matches the original settings
        let outcome = cp
            .orchestrator
            .create_or_update(&scope(), definition(json!({"a": 1})))
            .await
            .unwrap();
        let PutOutcome::Unchanged(view) = outcome else {
            panic!("expected no apply");
        };
        assert_eq!(view.properties.provisioning_state, ProvisioningState::Succeeded);
        assert_eq!(view.properties.settings, json!({"a": 1}));
        assert!(view.properties.error.is_none());
        assert_eq!(cp.world.apply_calls(), 2);

        let stored = cp.package(&scope()).await.unwrap();
        assert_eq!(stored.provisioning_state, ProvisioningState::Succeeded);
        assert_eq!(stored.settings, json!({"a": 1}));
        assert!(stored.provisioning_error_code.is_none());
        assert_eq!(
            cp.orchestrator.get(&scope()).await.unwrap().properties.provisioning_state,
            ProvisioningState::Succeeded
        );
    }

    #[tokio::test]
    async fn test_get_in_flight_skips_refresh() {
        let cp = TestControlPlane::start().await;
        cp.world.pause_applies();
        cp.orchestrator
            .create_or_update(&scope(), definition(json!({"a": 1})))
            .await
            .unwrap();

        let view = cp.orchestrator.get(&scope()).await.unwrap();
        assert_eq!(view.properties.provisioning_state, ProvisioningState::Accepted);
        assert_eq!(cp.world.refresh_calls(), 0);

        cp.world.resume_applies();
        cp.wait_for_state(&scope(), ProvisioningState::Succeeded).await;
    }

    #[tokio::test]
    async fn test_unchanged_create_writes_nothing() {
        let cp = TestControlPlane::start().await;
        cp.world.report_no_changes();

        let outcome = cp
            .orchestrator
            .create_or_update(&scope(), definition(json!({"a": 1})))
            .await
            .unwrap();
        let PutOutcome::Unchanged(view) = outcome else {
            panic!("expected no apply");
        };
        assert_eq!(view.properties.provisioning_state, ProvisioningState::Succeeded);
        assert!(view.properties.state.is_none());
        assert_eq!(cp.world.apply_calls(), 0);
        assert!(cp.store.is_empty(Collection::Resources));
    }
}
