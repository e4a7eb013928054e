use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{broadcast, watch, RwLock};

use crate::error::{Error, Result};
use crate::topology::TopologyDescriptor;
use crate::types::{
    ApplyOutcome, ApplyReport, Assignment, PublishedAssignment, RegisteredWorker, WorkerId,
    WorkerStatus, WorkerTasks,
};
use crate::util;

const EVENT_CHANNEL_SIZE: usize = 256;

/// Changes that can trigger a rebalance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    WorkerRegistered(WorkerId),
    WorkerLeft(WorkerId),
    WorkerStatusChanged(WorkerId, WorkerStatus),
    TopologyChanged,
}

#[derive(Default)]
struct StoreState {
    workers: BTreeMap<WorkerId, RegisteredWorker>,
    topology: Option<Arc<TopologyDescriptor>>,
    last_epoch: u64,
}

/// In-process group membership and assignment distribution for one
/// application.
///
/// Holds the worker registry and the topology, hands out epoch numbers, and
/// fans out three streams: cluster events (membership or topology changed),
/// the latest published assignment, and apply reports from workers.
pub struct ClusterStore {
    application_id: String,
    state: RwLock<StoreState>,
    events: broadcast::Sender<ClusterEvent>,
    reports: broadcast::Sender<ApplyReport>,
    assignments: watch::Sender<Option<PublishedAssignment>>,
}

impl ClusterStore {
    pub fn new(application_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (reports, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (assignments, _) = watch::channel(None);
        Self {
            application_id: application_id.into(),
            state: RwLock::new(StoreState::default()),
            events,
            reports,
            assignments,
        }
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    fn emit(&self, event: ClusterEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("no subscribers for cluster event");
        }
    }

    // ── Worker operations ───────────────────────────────────────

    /// Register (or re-register) a worker. Re-registering clears a suspect
    /// mark and replaces the reported ownership.
    pub async fn register_worker(&self, worker_id: &WorkerId, owned: WorkerTasks) {
        let worker = RegisteredWorker {
            worker_id: worker_id.clone(),
            status: WorkerStatus::Ready,
            owned,
            registered_at: util::now_seconds(),
        };
        self.state
            .write()
            .await
            .workers
            .insert(worker_id.clone(), worker);
        self.emit(ClusterEvent::WorkerRegistered(worker_id.clone()));
    }

    pub async fn unregister_worker(&self, worker_id: &WorkerId) -> Result<()> {
        let removed = self.state.write().await.workers.remove(worker_id);
        if removed.is_none() {
            return Err(Error::NotFound(format!("worker {worker_id}")));
        }
        self.emit(ClusterEvent::WorkerLeft(worker_id.clone()));
        Ok(())
    }

    pub async fn update_worker_status(
        &self,
        worker_id: &WorkerId,
        status: WorkerStatus,
    ) -> Result<()> {
        {
            let mut state = self.state.write().await;
            let worker = state
                .workers
                .get_mut(worker_id)
                .ok_or_else(|| Error::NotFound(format!("worker {worker_id}")))?;
            if worker.status == status {
                return Ok(());
            }
            worker.status = status;
        }
        self.emit(ClusterEvent::WorkerStatusChanged(worker_id.clone(), status));
        Ok(())
    }

    pub async fn get_worker(&self, worker_id: &WorkerId) -> Option<RegisteredWorker> {
        self.state.read().await.workers.get(worker_id).cloned()
    }

    pub async fn list_workers(&self) -> Vec<RegisteredWorker> {
        self.state.read().await.workers.values().cloned().collect()
    }

    pub fn watch_events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    // ── Topology ────────────────────────────────────────────────

    pub async fn set_topology(&self, topology: TopologyDescriptor) {
        self.state.write().await.topology = Some(Arc::new(topology));
        self.emit(ClusterEvent::TopologyChanged);
    }

    pub async fn topology(&self) -> Option<Arc<TopologyDescriptor>> {
        self.state.read().await.topology.clone()
    }

    // ── Epochs and assignments ──────────────────────────────────

    /// Reserve the next epoch number. Epochs are never reused, even when the
    /// epoch is aborted before anything is published.
    pub async fn next_epoch(&self) -> u64 {
        let mut state = self.state.write().await;
        state.last_epoch += 1;
        state.last_epoch
    }

    pub async fn publish_assignment(
        &self,
        assignment: Assignment,
        topology: Arc<TopologyDescriptor>,
    ) -> PublishedAssignment {
        let published = PublishedAssignment {
            application_id: self.application_id.clone(),
            assignment: Arc::new(assignment),
            topology,
        };
        self.assignments.send_replace(Some(published.clone()));
        published
    }

    pub fn latest_assignment(&self) -> Option<PublishedAssignment> {
        self.assignments.borrow().clone()
    }

    pub fn watch_assignments(&self) -> watch::Receiver<Option<PublishedAssignment>> {
        self.assignments.subscribe()
    }

    // ── Apply reports ───────────────────────────────────────────

    /// Record a worker's result for an epoch. A successful apply of the
    /// latest epoch becomes the worker's prior ownership for the next one.
    pub async fn report_apply(&self, report: ApplyReport) {
        if report.outcome == ApplyOutcome::Applied {
            let owned = self
                .latest_assignment()
                .filter(|published| published.epoch() == report.epoch)
                .and_then(|published| published.assignment.for_worker(&report.worker_id).cloned());
            if let Some(owned) = owned {
                if let Some(worker) = self.state.write().await.workers.get_mut(&report.worker_id)
                {
                    worker.owned = owned;
                }
            }
        }

        if self.reports.send(report).is_err() {
            tracing::debug!("no subscribers for apply report");
        }
    }

    pub fn watch_apply_reports(&self) -> broadcast::Receiver<ApplyReport> {
        self.reports.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskId;

    #[tokio::test]
    async fn register_and_unregister_emit_events() {
        let store = ClusterStore::new("app");
        let mut events = store.watch_events();
        let id = WorkerId::from("w-0");

        store.register_worker(&id, WorkerTasks::default()).await;
        assert_eq!(
            events.recv().await.unwrap(),
            ClusterEvent::WorkerRegistered(id.clone())
        );
        assert_eq!(store.list_workers().await.len(), 1);

        store.unregister_worker(&id).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ClusterEvent::WorkerLeft(id.clone()));
        assert!(store.list_workers().await.is_empty());
        assert!(matches!(
            store.unregister_worker(&id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reregistering_clears_suspect() {
        let store = ClusterStore::new("app");
        let id = WorkerId::from("w-0");
        store.register_worker(&id, WorkerTasks::default()).await;
        store
            .update_worker_status(&id, WorkerStatus::Suspect)
            .await
            .unwrap();
        assert_eq!(
            store.get_worker(&id).await.unwrap().status,
            WorkerStatus::Suspect
        );

        store.register_worker(&id, WorkerTasks::default()).await;
        assert_eq!(
            store.get_worker(&id).await.unwrap().status,
            WorkerStatus::Ready
        );
    }

    #[tokio::test]
    async fn epochs_are_monotonic() {
        let store = ClusterStore::new("app");
        assert_eq!(store.next_epoch().await, 1);
        assert_eq!(store.next_epoch().await, 2);
        assert_eq!(store.next_epoch().await, 3);
    }

    #[tokio::test]
    async fn applied_report_updates_prior_ownership() {
        let store = ClusterStore::new("app");
        let id = WorkerId::from("w-0");
        store.register_worker(&id, WorkerTasks::default()).await;

        let mut assignment = Assignment::empty(1);
        let mut held = WorkerTasks::default();
        held.active.insert(TaskId::new(0, 0));
        assignment.tasks.insert(id.clone(), held.clone());
        store
            .publish_assignment(assignment, Arc::new(TopologyDescriptor::default()))
            .await;

        let mut reports = store.watch_apply_reports();
        let report = ApplyReport {
            worker_id: id.clone(),
            epoch: 1,
            outcome: ApplyOutcome::Applied,
        };
        store.report_apply(report.clone()).await;

        assert_eq!(reports.recv().await.unwrap(), report);
        assert_eq!(store.get_worker(&id).await.unwrap().owned, held);
    }

    #[tokio::test]
    async fn stale_report_leaves_ownership_alone() {
        let store = ClusterStore::new("app");
        let id = WorkerId::from("w-0");
        store.register_worker(&id, WorkerTasks::default()).await;

        let mut assignment = Assignment::empty(2);
        assignment.tasks.entry(id.clone()).or_default().active.insert(TaskId::new(0, 0));
        store
            .publish_assignment(assignment, Arc::new(TopologyDescriptor::default()))
            .await;

        store
            .report_apply(ApplyReport {
                worker_id: id.clone(),
                epoch: 1,
                outcome: ApplyOutcome::Applied,
            })
            .await;
        assert!(store.get_worker(&id).await.unwrap().owned.is_empty());
    }
}
