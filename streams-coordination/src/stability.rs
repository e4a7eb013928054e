use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::topology::TopologyDescriptor;
use crate::types::{PublishedAssignment, TaskId, WorkerId, WorkerLifecycle, WorkerTasks};
use crate::util;

/// Notified on every lifecycle transition of a worker.
pub trait StateListener: Send + Sync {
    fn on_change(&self, new_state: WorkerLifecycle, old_state: WorkerLifecycle);
}

/// What a worker currently runs, as reported by its detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalState {
    pub worker_id: WorkerId,
    pub phase: WorkerLifecycle,
    /// Last epoch the worker applied successfully.
    pub epoch: Option<u64>,
    pub active_tasks: BTreeSet<TaskId>,
    pub standby_tasks: BTreeSet<TaskId>,
}

/// Per-thread view of the tasks a worker runs. Workers run a single
/// processing thread, so there is exactly one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadMetadata {
    pub thread_name: String,
    pub active_tasks: BTreeSet<TaskId>,
    pub standby_tasks: BTreeSet<TaskId>,
}

/// The slice of the newest assignment this worker has seen.
struct Expected {
    epoch: u64,
    tasks: WorkerTasks,
    topology: Arc<TopologyDescriptor>,
}

struct Inner {
    state: LocalState,
    expected: Option<Expected>,
}

/// Reports local facts about one worker: lifecycle phase, held tasks, and
/// whether those match the newest assignment it has seen.
///
/// It never looks at other workers. Cluster stability is decided by the
/// caller through [`cluster_converged`] or [`wait_for_stable`].
pub struct StabilityDetector {
    worker_id: WorkerId,
    inner: RwLock<Inner>,
    listener: RwLock<Option<Arc<dyn StateListener>>>,
}

impl StabilityDetector {
    pub fn new(worker_id: WorkerId) -> Self {
        let state = LocalState {
            worker_id: worker_id.clone(),
            phase: WorkerLifecycle::Created,
            epoch: None,
            active_tasks: BTreeSet::new(),
            standby_tasks: BTreeSet::new(),
        };
        Self {
            worker_id,
            inner: RwLock::new(Inner {
                state,
                expected: None,
            }),
            listener: RwLock::new(None),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub async fn set_state_listener(&self, listener: Arc<dyn StateListener>) {
        *self.listener.write().await = Some(listener);
    }

    pub async fn state(&self) -> LocalState {
        self.inner.read().await.state.clone()
    }

    pub async fn phase(&self) -> WorkerLifecycle {
        self.inner.read().await.state.phase
    }

    pub async fn local_threads_metadata(&self) -> Vec<ThreadMetadata> {
        let inner = self.inner.read().await;
        vec![ThreadMetadata {
            thread_name: format!("{}-StreamThread-1", self.worker_id),
            active_tasks: inner.state.active_tasks.clone(),
            standby_tasks: inner.state.standby_tasks.clone(),
        }]
    }

    /// Running, holding exactly the newest assignment's slice, and no standby
    /// for a task that cannot be replicated.
    pub async fn is_locally_converged(&self) -> bool {
        let inner = self.inner.read().await;
        let state = &inner.state;
        let Some(expected) = &inner.expected else {
            return false;
        };

        state.phase == WorkerLifecycle::Running
            && state.epoch == Some(expected.epoch)
            && state.active_tasks == expected.tasks.active
            && state.standby_tasks == expected.tasks.standby
            && state
                .standby_tasks
                .iter()
                .all(|task| expected.topology.is_replicable(task))
    }

    // ── Updates from the owning worker ──────────────────────────

    pub(crate) async fn transition(&self, next: WorkerLifecycle) -> Result<()> {
        let previous = {
            let mut inner = self.inner.write().await;
            let previous = inner.state.phase;
            if !previous.can_transition_to(next) {
                return Err(Error::invalid_state(format!(
                    "worker {} cannot go from {previous:?} to {next:?}",
                    self.worker_id
                )));
            }
            inner.state.phase = next;
            previous
        };

        tracing::debug!(worker = %self.worker_id, from = ?previous, to = ?next, "lifecycle transition");

        let listener = self.listener.read().await.clone();
        if let Some(listener) = listener {
            listener.on_change(next, previous);
        }
        Ok(())
    }

    pub(crate) async fn record_expected(&self, published: &PublishedAssignment) {
        let tasks = published
            .assignment
            .for_worker(&self.worker_id)
            .cloned()
            .unwrap_or_default();
        self.inner.write().await.expected = Some(Expected {
            epoch: published.epoch(),
            tasks,
            topology: Arc::clone(&published.topology),
        });
    }

    pub(crate) async fn record_applied(&self, epoch: u64, tasks: &WorkerTasks) {
        let mut inner = self.inner.write().await;
        inner.state.epoch = Some(epoch);
        inner.state.active_tasks = tasks.active.clone();
        inner.state.standby_tasks = tasks.standby.clone();
    }

    pub(crate) async fn clear_tasks(&self) {
        let mut inner = self.inner.write().await;
        inner.state.active_tasks.clear();
        inner.state.standby_tasks.clear();
    }
}

/// Logical AND of local convergence. An empty set of detectors is not
/// considered stable.
pub async fn cluster_converged(detectors: &[Arc<StabilityDetector>]) -> bool {
    if detectors.is_empty() {
        return false;
    }
    for detector in detectors {
        if !detector.is_locally_converged().await {
            return false;
        }
    }
    true
}

/// Poll the detectors until all of them report local convergence or the
/// timeout expires.
pub async fn wait_for_stable(
    detectors: &[Arc<StabilityDetector>],
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    if util::poll_until(timeout, interval, || cluster_converged(detectors)).await {
        return Ok(());
    }

    let mut unconverged = Vec::new();
    for detector in detectors {
        if !detector.is_locally_converged().await {
            unconverged.push(detector.worker_id().clone());
        }
    }
    Err(Error::StabilityTimeout {
        waited: timeout,
        unconverged,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::topology::{StoreSpec, SubtaskSpec};
    use crate::types::Assignment;

    struct Recorder(Mutex<Vec<(WorkerLifecycle, WorkerLifecycle)>>);

    impl StateListener for Recorder {
        fn on_change(&self, new_state: WorkerLifecycle, old_state: WorkerLifecycle) {
            self.0.lock().unwrap().push((new_state, old_state));
        }
    }

    fn published(worker: &WorkerId, tasks: WorkerTasks, logging_enabled: bool) -> PublishedAssignment {
        let store = StoreSpec {
            name: "s".to_string(),
            logging_enabled,
        };
        let topology = TopologyDescriptor::from_subtasks((0..2).map(|p| SubtaskSpec {
            id: TaskId::new(0, p),
            stores: vec![store.clone()],
        }))
        .unwrap();
        let mut assignment = Assignment::empty(1);
        assignment.tasks.insert(worker.clone(), tasks);
        PublishedAssignment {
            application_id: "app".to_string(),
            assignment: Arc::new(assignment),
            topology: Arc::new(topology),
        }
    }

    fn tasks(active: &[u32], standby: &[u32]) -> WorkerTasks {
        WorkerTasks {
            active: active.iter().map(|p| TaskId::new(0, *p)).collect(),
            standby: standby.iter().map(|p| TaskId::new(0, *p)).collect(),
        }
    }

    #[tokio::test]
    async fn listener_sees_every_transition() {
        let detector = StabilityDetector::new(WorkerId::from("w"));
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        detector.set_state_listener(recorder.clone()).await;

        detector.transition(WorkerLifecycle::Rebalancing).await.unwrap();
        detector.transition(WorkerLifecycle::Running).await.unwrap();
        detector.transition(WorkerLifecycle::Shutdown).await.unwrap();

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                (WorkerLifecycle::Rebalancing, WorkerLifecycle::Created),
                (WorkerLifecycle::Running, WorkerLifecycle::Rebalancing),
                (WorkerLifecycle::Shutdown, WorkerLifecycle::Running),
            ]
        );
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let detector = StabilityDetector::new(WorkerId::from("w"));
        let err = detector.transition(WorkerLifecycle::Running).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(detector.phase().await, WorkerLifecycle::Created);
    }

    #[tokio::test]
    async fn converged_once_running_with_expected_tasks() {
        let id = WorkerId::from("w");
        let detector = StabilityDetector::new(id.clone());
        let held = tasks(&[0], &[]);
        detector.record_expected(&published(&id, held.clone(), false)).await;
        assert!(!detector.is_locally_converged().await);

        detector.transition(WorkerLifecycle::Rebalancing).await.unwrap();
        detector.record_applied(1, &held).await;
        assert!(!detector.is_locally_converged().await, "not running yet");

        detector.transition(WorkerLifecycle::Running).await.unwrap();
        assert!(detector.is_locally_converged().await);

        let metadata = detector.local_threads_metadata().await;
        assert_eq!(metadata.len(), 1);
        assert!(metadata[0].standby_tasks.is_empty());
        assert!(!metadata[0].active_tasks.is_empty());
    }

    #[tokio::test]
    async fn standby_for_unlogged_task_is_never_converged() {
        let id = WorkerId::from("w");
        let detector = StabilityDetector::new(id.clone());
        let held = tasks(&[0], &[1]);
        detector.record_expected(&published(&id, held.clone(), false)).await;
        detector.transition(WorkerLifecycle::Rebalancing).await.unwrap();
        detector.record_applied(1, &held).await;
        detector.transition(WorkerLifecycle::Running).await.unwrap();

        assert!(!detector.is_locally_converged().await);
    }

    #[tokio::test]
    async fn newer_expected_epoch_breaks_convergence() {
        let id = WorkerId::from("w");
        let detector = StabilityDetector::new(id.clone());
        let held = tasks(&[0, 1], &[]);
        detector.record_expected(&published(&id, held.clone(), true)).await;
        detector.transition(WorkerLifecycle::Rebalancing).await.unwrap();
        detector.record_applied(1, &held).await;
        detector.transition(WorkerLifecycle::Running).await.unwrap();
        assert!(detector.is_locally_converged().await);

        let mut next = published(&id, tasks(&[0], &[1]), true);
        Arc::make_mut(&mut next.assignment).epoch = 2;
        detector.record_expected(&next).await;
        assert!(!detector.is_locally_converged().await);
    }

    #[tokio::test]
    async fn wait_for_stable_names_unconverged_workers() {
        let detectors = vec![Arc::new(StabilityDetector::new(WorkerId::from("w")))];
        let err = wait_for_stable(
            &detectors,
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            Error::StabilityTimeout { unconverged, .. } if unconverged == vec![WorkerId::from("w")]
        ));
    }

    #[tokio::test]
    async fn empty_cluster_is_not_stable() {
        assert!(!cluster_converged(&[]).await);
    }
}
