use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::stability::{StabilityDetector, StateListener, ThreadMetadata};
use crate::store::ClusterStore;
use crate::types::{
    ApplyOutcome, ApplyReport, PublishedAssignment, TaskRole, WorkerId, WorkerLifecycle,
    WorkerStatus, WorkerTasks,
};

/// Application-side hook that actually starts and stops processing units.
///
/// This is the extension point for the execution engine: after the call
/// returns `Ok`, exactly `tasks` must be running locally. Anything the worker
/// held before and that is missing from `tasks` has been revoked.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn apply_assignment(&self, tasks: &WorkerTasks) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    pub application_id: String,
    /// Upper bound on a single `apply_assignment` call.
    pub apply_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::from("worker-0"),
            application_id: "streams-app".to_string(),
            apply_timeout: Duration::from_secs(30),
        }
    }
}

pub struct WorkerHandle {
    store: Arc<ClusterStore>,
    config: WorkerConfig,
    handler: Arc<dyn TaskHandler>,
    detector: Arc<StabilityDetector>,
}

impl WorkerHandle {
    pub fn new(
        store: Arc<ClusterStore>,
        config: WorkerConfig,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        let detector = Arc::new(StabilityDetector::new(config.worker_id.clone()));
        Self {
            store,
            config,
            handler,
            detector,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    /// Shared handle to this worker's detector, for pollers that outlive the
    /// moved `WorkerHandle`.
    pub fn detector(&self) -> Arc<StabilityDetector> {
        Arc::clone(&self.detector)
    }

    pub async fn set_state_listener(&self, listener: Arc<dyn StateListener>) {
        self.detector.set_state_listener(listener).await;
    }

    pub async fn local_threads_metadata(&self) -> Vec<ThreadMetadata> {
        self.detector.local_threads_metadata().await
    }

    /// Run the worker. Blocks until cancelled.
    ///
    /// 1. Register with the cluster store
    /// 2. Apply every new assignment epoch as it is published
    /// 3. On cancellation, stop all tasks and unregister
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut assignments = self.store.watch_assignments();

        let prior = self.held_tasks().await;
        self.store.register_worker(self.worker_id(), prior).await;
        self.detector.transition(WorkerLifecycle::Rebalancing).await?;

        tracing::info!(worker = %self.worker_id(), application = %self.config.application_id, "registered with cluster");

        let result = self.follow_assignments(&mut assignments, cancel).await;

        self.shutdown().await;
        result
    }

    async fn follow_assignments(
        &self,
        assignments: &mut watch::Receiver<Option<PublishedAssignment>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            // Always act on the newest value; intermediate epochs are skipped.
            let latest = assignments.borrow_and_update().clone();
            if let Some(published) = latest {
                self.handle_assignment(&published).await?;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                changed = assignments.changed() => {
                    changed.map_err(|_| Error::ChannelClosed("assignment watch"))?;
                }
            }
        }
    }

    async fn handle_assignment(&self, published: &PublishedAssignment) -> Result<()> {
        let worker = self.worker_id();
        let epoch = published.epoch();

        if published.application_id != self.config.application_id {
            tracing::debug!(worker = %worker, application = %published.application_id, "ignoring assignment for another application");
            return Ok(());
        }

        let state = self.detector.state().await;
        if state.epoch.is_some_and(|last| epoch <= last) {
            tracing::debug!(worker = %worker, epoch, last_applied = ?state.epoch, "discarding stale assignment");
            return Ok(());
        }

        self.detector.record_expected(published).await;
        if state.phase != WorkerLifecycle::Rebalancing {
            self.detector.transition(WorkerLifecycle::Rebalancing).await?;
        }

        let member = published.assignment.for_worker(worker).is_some();
        let tasks = published
            .assignment
            .for_worker(worker)
            .cloned()
            .unwrap_or_default();

        let revoked = state
            .active_tasks
            .iter()
            .chain(state.standby_tasks.iter())
            .filter(|t| tasks.role_of(t).is_none())
            .count();
        tracing::info!(
            worker = %worker,
            epoch,
            active = tasks.active.len(),
            standby = tasks.standby.len(),
            revoked,
            "applying assignment"
        );

        let outcome = match tokio::time::timeout(
            self.config.apply_timeout,
            self.handler.apply_assignment(&tasks),
        )
        .await
        {
            Ok(Ok(())) => {
                self.detector.record_applied(epoch, &tasks).await;
                self.detector.transition(WorkerLifecycle::Running).await?;
                record_task_gauges(worker, &tasks);
                tracing::info!(worker = %worker, epoch, "assignment applied, running");
                ApplyOutcome::Applied
            }
            Ok(Err(e)) => {
                tracing::warn!(worker = %worker, epoch, error = %e, "failed to apply assignment");
                ApplyOutcome::Failed(e.to_string())
            }
            Err(_) => {
                tracing::warn!(worker = %worker, epoch, timeout = ?self.config.apply_timeout, "apply timed out");
                ApplyOutcome::Failed(format!(
                    "apply timed out after {:?}",
                    self.config.apply_timeout
                ))
            }
        };

        let applied = outcome == ApplyOutcome::Applied;
        self.store
            .report_apply(ApplyReport {
                worker_id: worker.clone(),
                epoch,
                outcome,
            })
            .await;

        // Excluded after an earlier failure and healthy again: rejoin.
        if applied && !member {
            let suspect = self
                .store
                .get_worker(worker)
                .await
                .is_some_and(|w| w.status == WorkerStatus::Suspect);
            if suspect {
                tracing::info!(worker = %worker, "rejoining after exclusion");
                self.store
                    .register_worker(worker, WorkerTasks::default())
                    .await;
            }
        }

        Ok(())
    }

    async fn held_tasks(&self) -> WorkerTasks {
        let state = self.detector.state().await;
        WorkerTasks {
            active: state.active_tasks,
            standby: state.standby_tasks,
        }
    }

    async fn shutdown(&self) {
        let worker = self.worker_id();

        // Leave the next snapshot before tasks stop.
        if let Err(e) = self
            .store
            .update_worker_status(worker, WorkerStatus::Draining)
            .await
        {
            tracing::debug!(worker = %worker, error = %e, "could not mark worker draining");
        }

        let nothing = WorkerTasks::default();
        let stop = self.handler.apply_assignment(&nothing);
        match tokio::time::timeout(self.config.apply_timeout, stop).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(worker = %worker, error = %e, "failed to stop tasks on shutdown")
            }
            Err(_) => tracing::warn!(worker = %worker, "timed out stopping tasks on shutdown"),
        }
        self.detector.clear_tasks().await;
        record_task_gauges(worker, &nothing);

        if let Err(e) = self.detector.transition(WorkerLifecycle::Shutdown).await {
            tracing::debug!(worker = %worker, error = %e, "already shut down");
        }

        // Best-effort: the coordinator treats a missing worker the same way.
        match self.store.unregister_worker(worker).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => tracing::warn!(worker = %worker, error = %e, "failed to unregister"),
        }

        tracing::info!(worker = %worker, "worker shut down");
    }
}

fn record_task_gauges(worker: &WorkerId, tasks: &WorkerTasks) {
    for (role, held) in [
        (TaskRole::Active, &tasks.active),
        (TaskRole::Standby, &tasks.standby),
    ] {
        metrics::gauge!("streams_worker_tasks", "worker" => worker.to_string(), "role" => role.as_str())
            .set(held.len() as f64);
    }
}
