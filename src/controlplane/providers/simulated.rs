//! Simulated Provider Driver
//!
//! Keeps provisioned instances in process memory. Used for local development
//! and tests; it follows the full plugin contract so the orchestrator cannot
//! tell it apart from a real plugin.
//!
//! Instance state has the shape `{"id": ..., "attributes": {...}}`, where the
//! attributes mirror the client settings of the last apply.

use crate::domain::{
    AttributeDiff, InstanceDiff, InstanceState, ProviderCapability, ProviderFactory,
    ResourceTypeInfo, ValidationReport,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

// =============================================================================
// Simulated World
// =============================================================================

/// The "reality" shared by every instance a factory creates
pub struct SimulatedWorld {
    instances: DashMap<String, Value>,
    apply_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    last_provider_config: Mutex<Option<Value>>,
    fail_next_apply: Mutex<Option<String>>,
    panic_next_apply: AtomicBool,
    unchanging: AtomicBool,
    diff_delay: Mutex<Option<Duration>>,
    /// `true` while applies are held back
    paused: watch::Sender<bool>,
}

impl SimulatedWorld {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            instances: DashMap::new(),
            apply_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            last_provider_config: Mutex::new(None),
            fail_next_apply: Mutex::new(None),
            panic_next_apply: AtomicBool::new(false),
            unchanging: AtomicBool::new(false),
            diff_delay: Mutex::new(None),
            paused,
        }
    }

    fn instance_key(resource_type: &str, name: &str) -> String {
        format!("{}/{}", resource_type, name)
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Provider block the most recent instance was configured with
    pub fn last_provider_config(&self) -> Option<Value> {
        self.last_provider_config.lock().clone()
    }

    /// Live instance, if one exists
    pub fn instance(&self, resource_type: &str, name: &str) -> Option<Value> {
        self.instances
            .get(&Self::instance_key(resource_type, name))
            .map(|r| r.value().clone())
    }

    /// Delete an instance behind the control plane's back (drift)
    pub fn forget_instance(&self, resource_type: &str, name: &str) -> bool {
        self.instances
            .remove(&Self::instance_key(resource_type, name))
            .is_some()
    }

    /// Hold every apply until [`SimulatedWorld::resume_applies`]
    pub fn pause_applies(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume_applies(&self) {
        self.paused.send_replace(false);
    }

    /// Make the next apply fail with `reason`
    pub fn fail_next_apply(&self, reason: impl Into<String>) {
        *self.fail_next_apply.lock() = Some(reason.into());
    }

    /// Make the next apply panic
    pub fn panic_next_apply(&self) {
        self.panic_next_apply.store(true, Ordering::SeqCst);
    }

    /// Report an empty diff for every request, as a plugin does for
    /// resources that already match
    pub fn report_no_changes(&self) {
        self.unchanging.store(true, Ordering::SeqCst);
    }

    /// Make every diff take `delay` before answering
    pub fn delay_diffs(&self, delay: Duration) {
        *self.diff_delay.lock() = Some(delay);
    }

    async fn wait_until_resumed(&self) {
        let mut rx = self.paused.subscribe();
        // Err only if the sender is gone, which cannot outlive `self`
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

impl Default for SimulatedWorld {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Plugin
// =============================================================================

/// One simulated plugin instance
pub struct SimulatedProvider {
    provider_type: String,
    world: Arc<SimulatedWorld>,
}

impl SimulatedProvider {
    fn attributes(state: Option<&InstanceState>) -> Map<String, Value> {
        state
            .and_then(|s| s.0.get("attributes"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    fn desired(resource_config: &Value) -> Result<Map<String, Value>> {
        match resource_config {
            Value::Null => Ok(Map::new()),
            Value::Object(map) => Ok(map.clone()),
            _ => Err(Error::Validation(
                "resource configuration must be an object".into(),
            )),
        }
    }
}

#[async_trait]
impl ProviderCapability for SimulatedProvider {
    fn provider_type(&self) -> &str {
        &self.provider_type
    }

    async fn configure(&self, provider_config: &Value) -> Result<()> {
        if !provider_config.is_object() {
            return Err(Error::provider(
                &self.provider_type,
                "configure",
                "provider configuration must be an object",
            ));
        }
        *self.world.last_provider_config.lock() = Some(provider_config.clone());
        Ok(())
    }

    async fn validate_resource(
        &self,
        resource_type: &str,
        resource_config: &Value,
    ) -> ValidationReport {
        let mut report = ValidationReport::default();
        if !(resource_config.is_object() || resource_config.is_null()) {
            report
                .errors
                .push(format!("{}: settings must be an object", resource_type));
        }
        if !resource_type.starts_with(&format!("{}_", self.provider_type)) {
            report.warnings.push(format!(
                "resource type {} is not prefixed with {}_",
                resource_type, self.provider_type
            ));
        }
        report
    }

    async fn diff(
        &self,
        info: &ResourceTypeInfo,
        prior_state: Option<&InstanceState>,
        resource_config: &Value,
    ) -> Result<InstanceDiff> {
        let delay = *self.world.diff_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.world.unchanging.load(Ordering::SeqCst) {
            return Ok(InstanceDiff::default());
        }

        let desired = Self::desired(resource_config)
            .map_err(|e| Error::provider(&self.provider_type, "diff", e))?;
        let current = Self::attributes(prior_state);

        let mut diff = InstanceDiff {
            requires_new: prior_state.is_none(),
            ..Default::default()
        };
        let keys: BTreeSet<&String> = desired.keys().chain(current.keys()).collect();
        for key in keys {
            let old = current.get(key);
            let new = desired.get(key);
            if old != new {
                diff.attributes.insert(
                    key.clone(),
                    AttributeDiff {
                        old: old.cloned(),
                        new: new.cloned(),
                    },
                );
            }
        }

        debug!(
            "Computed simulated diff for {}/{}: {} attribute(s), requires_new={}",
            info.resource_type,
            info.name,
            diff.attributes.len(),
            diff.requires_new
        );
        Ok(diff)
    }

    async fn apply(
        &self,
        info: &ResourceTypeInfo,
        prior_state: Option<&InstanceState>,
        diff: &InstanceDiff,
    ) -> Result<Option<InstanceState>> {
        self.world.wait_until_resumed().await;
        self.world.apply_calls.fetch_add(1, Ordering::SeqCst);

        if self.world.panic_next_apply.swap(false, Ordering::SeqCst) {
            panic!("simulated provider panicked applying {}", info.name);
        }
        if let Some(reason) = self.world.fail_next_apply.lock().take() {
            return Err(Error::provider(&self.provider_type, "apply", reason));
        }

        let key = SimulatedWorld::instance_key(&info.resource_type, &info.name);
        if diff.destroy {
            self.world.instances.remove(&key);
            return Ok(None);
        }

        let mut attributes = Self::attributes(prior_state);
        for (name, change) in &diff.attributes {
            match &change.new {
                Some(value) => {
                    attributes.insert(name.clone(), value.clone());
                }
                None => {
                    attributes.remove(name);
                }
            }
        }

        let id = prior_state
            .and_then(|s| s.0.get("id"))
            .cloned()
            .unwrap_or_else(|| Value::String(format!("{}-{}", self.provider_type, key)));
        let state = json!({ "id": id, "attributes": attributes });
        self.world.instances.insert(key, state.clone());
        Ok(Some(InstanceState(state)))
    }

    async fn refresh(
        &self,
        info: &ResourceTypeInfo,
        _prior_state: &InstanceState,
    ) -> Result<Option<InstanceState>> {
        self.world.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .world
            .instance(&info.resource_type, &info.name)
            .map(InstanceState))
    }
}

// =============================================================================
// Factory
// =============================================================================

pub struct SimulatedProviderFactory {
    provider_type: String,
    world: Arc<SimulatedWorld>,
}

impl SimulatedProviderFactory {
    pub fn new(provider_type: impl Into<String>, world: Arc<SimulatedWorld>) -> Self {
        Self {
            provider_type: provider_type.into(),
            world,
        }
    }

    pub fn world(&self) -> &Arc<SimulatedWorld> {
        &self.world
    }
}

impl ProviderFactory for SimulatedProviderFactory {
    fn provider_type(&self) -> &str {
        &self.provider_type
    }

    fn create(&self) -> Box<dyn ProviderCapability> {
        Box::new(SimulatedProvider {
            provider_type: self.provider_type.clone(),
            world: self.world.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin() -> (Arc<SimulatedWorld>, Box<dyn ProviderCapability>) {
        let world = Arc::new(SimulatedWorld::new());
        let factory = SimulatedProviderFactory::new("kubernetes", world.clone());
        (world, factory.create())
    }

    fn info() -> ResourceTypeInfo {
        ResourceTypeInfo::new("kubernetes_namespace", "team-a")
    }

    #[tokio::test]
    async fn test_create_then_converged() {
        let (world, plugin) = plugin();
        let settings = json!({"labels": {"team": "a"}});

        let diff = plugin.diff(&info(), None, &settings).await.unwrap();
        assert!(diff.requires_new);
        let state = plugin.apply(&info(), None, &diff).await.unwrap().unwrap();
        assert_eq!(state.0["attributes"], settings);
        assert_eq!(world.apply_calls(), 1);

        let refreshed = plugin.refresh(&info(), &state).await.unwrap().unwrap();
        let diff = plugin.diff(&info(), Some(&refreshed), &settings).await.unwrap();
        assert!(diff.is_empty());
    }

    #[tokio::test]
    async fn test_update_keeps_id() {
        let (_, plugin) = plugin();
        let diff = plugin.diff(&info(), None, &json!({"a": 1})).await.unwrap();
        let first = plugin.apply(&info(), None, &diff).await.unwrap().unwrap();

        let diff = plugin
            .diff(&info(), Some(&first), &json!({"b": 2}))
            .await
            .unwrap();
        assert_eq!(diff.attributes.len(), 2);
        let second = plugin.apply(&info(), Some(&first), &diff).await.unwrap().unwrap();
        assert_eq!(second.0["id"], first.0["id"]);
        assert_eq!(second.0["attributes"], json!({"b": 2}));
    }

    #[tokio::test]
    async fn test_destroy_and_drift() {
        let (world, plugin) = plugin();
        let diff = plugin.diff(&info(), None, &json!({})).await.unwrap();
        let state = plugin.apply(&info(), None, &diff).await.unwrap().unwrap();

        assert!(world.forget_instance("kubernetes_namespace", "team-a"));
        assert!(plugin.refresh(&info(), &state).await.unwrap().is_none());

        let gone = plugin
            .apply(&info(), Some(&state), &InstanceDiff::destroy())
            .await
            .unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_validation() {
        let (_, plugin) = plugin();
        let report = plugin.validate_resource("datadog_monitor", &json!([1])).await;
        assert!(!report.is_valid());
        assert_eq!(report.warnings.len(), 1);

        let report = plugin
            .validate_resource("kubernetes_namespace", &json!({}))
            .await;
        assert!(report.is_valid());
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_configure_records_credentials() {
        let (world, plugin) = plugin();
        assert!(plugin.configure(&json!("nope")).await.is_err());
        plugin.configure(&json!({"token": "abc"})).await.unwrap();
        assert_eq!(world.last_provider_config(), Some(json!({"token": "abc"})));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let (world, plugin) = plugin();
        world.fail_next_apply("quota exceeded");
        let diff = plugin.diff(&info(), None, &json!({})).await.unwrap();
        let err = plugin.apply(&info(), None, &diff).await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));

        // Only the next apply fails
        assert!(plugin.apply(&info(), None, &diff).await.is_ok());
    }

    #[tokio::test]
    async fn test_pause_holds_applies() {
        let (world, plugin) = plugin();
        world.pause_applies();
        let diff = plugin.diff(&info(), None, &json!({})).await.unwrap();

        let held = tokio::time::timeout(
            Duration::from_millis(50),
            plugin.apply(&info(), None, &diff),
        )
        .await;
        assert!(held.is_err());
        assert_eq!(world.apply_calls(), 0);

        world.resume_applies();
        assert!(plugin.apply(&info(), None, &diff).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unchanging_world_reports_empty_diff() {
        let (world, plugin) = plugin();
        world.report_no_changes();
        let diff = plugin.diff(&info(), None, &json!({"a": 1})).await.unwrap();
        assert!(diff.is_empty());
    }
}
