use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::topology::TopologyDescriptor;

/// Opaque identity of a worker process. Ordered, so it doubles as the final
/// tie-breaker in every placement decision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identity of a subtask: one partition of one subtopology.
///
/// Displayed as `{subtopology}_{partition}`, e.g. `0_1`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TaskId {
    pub subtopology: u32,
    pub partition: u32,
}

impl TaskId {
    pub fn new(subtopology: u32, partition: u32) -> Self {
        Self {
            subtopology,
            partition,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.subtopology, self.partition)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskRole {
    Active,
    Standby,
}

impl TaskRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskRole::Active => "active",
            TaskRole::Standby => "standby",
        }
    }
}

/// The tasks a single worker holds in one assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTasks {
    pub active: BTreeSet<TaskId>,
    pub standby: BTreeSet<TaskId>,
}

impl WorkerTasks {
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.standby.is_empty()
    }

    pub fn role_of(&self, task: &TaskId) -> Option<TaskRole> {
        if self.active.contains(task) {
            Some(TaskRole::Active)
        } else if self.standby.contains(task) {
            Some(TaskRole::Standby)
        } else {
            None
        }
    }
}

/// Output of the assignor for one epoch: worker -> tasks.
///
/// Every worker of the snapshot has an entry, possibly empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub epoch: u64,
    pub tasks: BTreeMap<WorkerId, WorkerTasks>,
}

impl Assignment {
    pub fn empty(epoch: u64) -> Self {
        Self {
            epoch,
            tasks: BTreeMap::new(),
        }
    }

    pub fn for_worker(&self, worker: &WorkerId) -> Option<&WorkerTasks> {
        self.tasks.get(worker)
    }

    pub fn active_owner(&self, task: &TaskId) -> Option<&WorkerId> {
        self.tasks
            .iter()
            .find(|(_, held)| held.active.contains(task))
            .map(|(worker, _)| worker)
    }

    pub fn standby_owners(&self, task: &TaskId) -> Vec<&WorkerId> {
        self.tasks
            .iter()
            .filter(|(_, held)| held.standby.contains(task))
            .map(|(worker, _)| worker)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.tasks.values().map(|held| held.active.len()).sum()
    }

    pub fn standby_count(&self) -> usize {
        self.tasks.values().map(|held| held.standby.len()).sum()
    }
}

/// Liveness of a registered worker as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    /// Eligible for tasks.
    Ready,
    /// Failed to apply an epoch in time; excluded until it re-registers.
    Suspect,
    /// Shutting down; excluded from new assignments.
    Draining,
}

/// A worker entry in the cluster store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredWorker {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    /// Tasks the worker held when it last registered or applied an epoch.
    pub owned: WorkerTasks,
    pub registered_at: i64,
}

/// Local lifecycle of a worker.
///
/// ```text
/// Created -> Rebalancing <-> Running
///    \___________\______________\____> Shutdown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerLifecycle {
    Created,
    Rebalancing,
    Running,
    Shutdown,
}

impl WorkerLifecycle {
    pub fn can_transition_to(self, next: WorkerLifecycle) -> bool {
        use WorkerLifecycle as L;
        matches!(
            (self, next),
            (L::Created, L::Rebalancing)
                | (L::Rebalancing, L::Running)
                | (L::Rebalancing, L::Rebalancing)
                | (L::Running, L::Rebalancing)
                | (L::Created | L::Rebalancing | L::Running, L::Shutdown)
        )
    }
}

/// What a worker sends back to the coordinator after handling an epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub worker_id: WorkerId,
    pub epoch: u64,
    pub outcome: ApplyOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Applied,
    Failed(String),
}

/// An assignment as distributed to workers. Immutable once published.
#[derive(Debug, Clone)]
pub struct PublishedAssignment {
    pub application_id: String,
    pub assignment: Arc<Assignment>,
    pub topology: Arc<TopologyDescriptor>,
}

impl PublishedAssignment {
    pub fn epoch(&self) -> u64 {
        self.assignment.epoch
    }
}
