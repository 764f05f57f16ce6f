//! Operation Worker Pool
//!
//! Apply and destroy operations accepted by the orchestrator run here, on a
//! bounded pool fed by a bounded queue. A job outlives the request that
//! enqueued it and is never cancelled once running; each plugin call carries
//! its own deadline instead.
//!
//! Every terminal write is conditional on the revision the job was dispatched
//! with, so a stale job can never overwrite a newer transition. The recovery
//! sweep fails packages left in flight by a previous process.

use crate::apierror::ErrorCode;
use crate::config::OrchestratorConfig;
use crate::controlplane::metrics::{ControlPlaneMetrics, OperationOutcome};
use crate::controlplane::plugin::{PluginConfig, PluginSession};
use crate::controlplane::providers::ProviderRegistry;
use crate::domain::{
    InstanceDiff, InstanceState, OperationKind, ResourceId, ResourcePackage, Revision,
};
use crate::error::{Error, Result};
use crate::storage::Repository;
use backoff::ExponentialBackoff;
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Longest time a terminal write is retried before it is given up
const STORE_RETRY_WINDOW: Duration = Duration::from_secs(60);

// =============================================================================
// Jobs
// =============================================================================

/// An accepted operation waiting for a worker
#[derive(Debug, Clone)]
pub struct OperationJob {
    pub resource_id: ResourceId,
    pub kind: OperationKind,
    /// Revision of the `Accepted`/`Deleting` write that admitted the job
    pub revision: Revision,
    /// Diff computed when the operation was accepted
    pub diff: InstanceDiff,
}

/// Sending half of the job queue
///
/// Also tracks which packages this process is currently responsible for,
/// so the recovery sweep leaves them alone.
#[derive(Clone)]
pub struct OperationQueue {
    sender: mpsc::Sender<OperationJob>,
    in_flight: Arc<DashMap<ResourceId, Revision>>,
    metrics: Arc<ControlPlaneMetrics>,
}

impl OperationQueue {
    /// Enqueue a job, waiting for queue capacity
    pub async fn enqueue(&self, job: OperationJob) -> Result<()> {
        let (resource_id, revision, kind) = (job.resource_id.clone(), job.revision, job.kind);
        self.in_flight.insert(resource_id.clone(), revision);

        if self.sender.send(job).await.is_err() {
            self.in_flight
                .remove_if(&resource_id, |_, tracked| *tracked == revision);
            return Err(Error::QueueClosed);
        }
        self.metrics.record_dispatched(kind);
        debug!("Queued {} operation: {} (revision {})", kind, resource_id, revision);
        Ok(())
    }

    /// Whether this process owns the in-flight operation on `resource_id`
    pub fn is_tracked(&self, resource_id: &ResourceId) -> bool {
        self.in_flight.contains_key(resource_id)
    }

    /// Number of operations queued or running
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Runs operations against plugins and writes their terminal transitions
pub struct OperationExecutor {
    resources: Repository<ResourcePackage>,
    providers: Arc<ProviderRegistry>,
    plugin_timeout: Duration,
    metrics: Arc<ControlPlaneMetrics>,
}

impl OperationExecutor {
    pub fn new(
        resources: Repository<ResourcePackage>,
        providers: Arc<ProviderRegistry>,
        plugin_timeout: Duration,
        metrics: Arc<ControlPlaneMetrics>,
    ) -> Self {
        Self {
            resources,
            providers,
            plugin_timeout,
            metrics,
        }
    }

    /// Run a job to its terminal transition; panics are recorded as failures
    pub async fn execute(&self, job: &OperationJob) -> OperationOutcome {
        self.metrics.record_started();
        let outcome = match AssertUnwindSafe(self.run(job)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "unknown panic".to_string());
                drop(panic);
                error!("Operation panicked: {} ({})", job.resource_id, reason);
                self.fail(
                    job,
                    ErrorCode::InternalOperationError,
                    format!("The operation failed unexpectedly: {}", reason),
                )
                .await;
                OperationOutcome::Panicked
            }
        };
        self.metrics.record_completed(job.kind, outcome);
        outcome
    }

    async fn run(&self, job: &OperationJob) -> OperationOutcome {
        let current = match self.load(job).await {
            Some(current) => current,
            None => return OperationOutcome::Superseded,
        };
        let mut package = current;

        info!("Running {} operation: {}", job.kind, job.resource_id);
        let result = self.invoke(&package, job).await;

        match (job.kind, result) {
            (OperationKind::Apply, Ok(state)) => {
                package.mark_succeeded(state);
                self.finish(job, &package, OperationOutcome::Succeeded).await
            }
            (OperationKind::Destroy, Ok(None)) => {
                let repo = &self.resources;
                let (id, revision) = (&job.resource_id, job.revision);
                match with_retry("package removal", move || repo.remove_if_revision(id, revision))
                    .await
                {
                    Ok(true) => {
                        info!("Destroyed resource: {}", job.resource_id);
                        OperationOutcome::Succeeded
                    }
                    Ok(false) => {
                        warn!("Destroyed resource was modified concurrently: {}", job.resource_id);
                        OperationOutcome::Superseded
                    }
                    Err(e) => {
                        error!("Failed to remove destroyed resource {}: {}", job.resource_id, e);
                        OperationOutcome::Failed
                    }
                }
            }
            (OperationKind::Destroy, Ok(Some(remaining))) => {
                package.state = Some(remaining);
                let err = Error::provider(
                    package.provider_type.clone(),
                    "destroy",
                    "the instance still exists after destroy",
                );
                package.mark_failed(err.code(), err.to_string());
                self.finish(job, &package, OperationOutcome::Failed).await
            }
            (_, Err(e)) => {
                warn!("{} operation failed: {}: {}", job.kind, job.resource_id, e);
                let outcome = match e {
                    Error::PluginTimeout { .. } => OperationOutcome::TimedOut,
                    _ => OperationOutcome::Failed,
                };
                package.mark_failed(e.code(), e.to_string());
                self.finish(job, &package, outcome).await
            }
        }
    }

    /// Load the package the job was admitted with
    async fn load(&self, job: &OperationJob) -> Option<ResourcePackage> {
        let repo = &self.resources;
        let id = &job.resource_id;
        match with_retry("package load", move || repo.find(id)).await {
            Ok(Some(found)) if found.revision == job.revision => Some(found.value),
            Ok(_) => {
                warn!("Skipping superseded operation: {}", job.resource_id);
                None
            }
            Err(e) => {
                error!("Failed to load package {}: {}", job.resource_id, e);
                None
            }
        }
    }

    async fn invoke(
        &self,
        package: &ResourcePackage,
        job: &OperationJob,
    ) -> Result<Option<InstanceState>> {
        let config = PluginConfig::from_value(package.config.clone());
        let session = PluginSession::open(
            &self.providers,
            &package.provider_type,
            &config,
            self.plugin_timeout,
            self.metrics.clone(),
        )
        .await?;
        let diff = match job.kind {
            OperationKind::Apply => job.diff.clone(),
            OperationKind::Destroy => InstanceDiff::destroy(),
        };
        session
            .apply(&package.info(), package.state.as_ref(), &diff)
            .await
    }

    /// Conditional terminal write
    async fn finish(
        &self,
        job: &OperationJob,
        package: &ResourcePackage,
        outcome: OperationOutcome,
    ) -> OperationOutcome {
        let repo = &self.resources;
        let (id, revision) = (&job.resource_id, job.revision);
        match with_retry("terminal write", move || {
            repo.put_if_revision(id, package, Some(revision))
        })
        .await
        {
            Ok(Some(_)) => {
                info!(
                    "Finished {} operation: {} ({})",
                    job.kind, job.resource_id, package.provisioning_state
                );
                outcome
            }
            Ok(None) => {
                warn!("Dropping stale result for {}", job.resource_id);
                OperationOutcome::Superseded
            }
            Err(e) => {
                error!("Failed to record result for {}: {}", job.resource_id, e);
                outcome
            }
        }
    }

    /// Mark the job's package failed if it is still at the dispatched revision
    async fn fail(&self, job: &OperationJob, code: ErrorCode, message: String) {
        if let Some(mut package) = self.load(job).await {
            package.mark_failed(code, message);
            self.finish(job, &package, OperationOutcome::Failed).await;
        }
    }

    /// Fail in-flight packages older than `stale_after` that `queue` does not track
    pub async fn sweep(&self, queue: &OperationQueue, stale_after: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after)
                .map_err(|e| Error::Configuration(format!("stale operation window: {}", e)))?;

        let mut preempted = 0;
        for (id, found) in self.resources.list().await? {
            let mut package = found.value;
            if !package.provisioning_state.is_in_flight()
                || package.updated_at > cutoff
                || queue.is_tracked(&id)
            {
                continue;
            }

            package.mark_failed(
                ErrorCode::OperationPreempted,
                "The operation was abandoned before it completed.",
            );
            if self
                .resources
                .put_if_revision(&id, &package, Some(found.revision))
                .await?
                .is_some()
            {
                warn!("Preempted abandoned operation: {}", id);
                self.metrics.record_preempted();
                preempted += 1;
            }
        }
        Ok(preempted)
    }
}

/// Retry transient store failures with exponential backoff
async fn with_retry<T, F, Fut>(what: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let policy = ExponentialBackoff {
        max_elapsed_time: Some(STORE_RETRY_WINDOW),
        ..ExponentialBackoff::default()
    };
    backoff::future::retry(policy, || {
        let attempt = op();
        async move {
            attempt.await.map_err(|e| {
                if e.is_transient() {
                    warn!("Retrying {}: {}", what, e);
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}

// =============================================================================
// Pool
// =============================================================================

/// Handles of the running pool
pub struct WorkerPool {
    queue: OperationQueue,
    dispatcher: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl WorkerPool {
    /// Spawn the dispatcher and the recovery sweep
    pub fn start(
        executor: Arc<OperationExecutor>,
        config: &OrchestratorConfig,
        metrics: Arc<ControlPlaneMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let queue = OperationQueue {
            sender,
            in_flight: Arc::new(DashMap::new()),
            metrics,
        };

        info!(
            "Starting operation worker pool ({} workers, queue capacity {})",
            config.worker_count, config.queue_capacity
        );
        let dispatcher = tokio::spawn(dispatch_loop(
            receiver,
            executor.clone(),
            queue.in_flight.clone(),
            Arc::new(Semaphore::new(config.worker_count)),
            shutdown.clone(),
        ));
        let sweeper = tokio::spawn(sweep_loop(
            executor,
            queue.clone(),
            config.sweep_interval(),
            config.stale_operation_after(),
            shutdown,
        ));

        Self {
            queue,
            dispatcher,
            sweeper,
        }
    }

    pub fn queue(&self) -> OperationQueue {
        self.queue.clone()
    }

    /// Wait for the background tasks after shutdown was signalled
    pub async fn join(self) {
        let _ = self.dispatcher.await;
        let _ = self.sweeper.await;
    }
}

async fn dispatch_loop(
    mut receiver: mpsc::Receiver<OperationJob>,
    executor: Arc<OperationExecutor>,
    in_flight: Arc<DashMap<ResourceId, Revision>>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let executor = executor.clone();
        let in_flight = in_flight.clone();
        tokio::spawn(async move {
            let _permit = permit;
            executor.execute(&job).await;
            in_flight.remove_if(&job.resource_id, |_, tracked| *tracked == job.revision);
        });
    }
    info!("Operation dispatcher stopped");
}

async fn sweep_loop(
    executor: Arc<OperationExecutor>,
    queue: OperationQueue,
    every: Duration,
    stale_after: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                match executor.sweep(&queue, stale_after).await {
                    Ok(0) => {}
                    Ok(count) => warn!("Recovery sweep preempted {} operation(s)", count),
                    Err(e) => error!("Recovery sweep failed: {}", e),
                }
            }
        }
    }
    debug!("Recovery sweep stopped");
}
