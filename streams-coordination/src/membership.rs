use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::types::{RegisteredWorker, TaskId, WorkerId, WorkerStatus, WorkerTasks};

/// Consistent view of the eligible workers for one epoch.
///
/// Taken once per epoch and passed by value into the assignor. `prior` holds
/// what each worker owned before this epoch and drives stickiness.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    pub epoch: u64,
    prior: BTreeMap<WorkerId, WorkerTasks>,
}

impl MembershipSnapshot {
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            prior: BTreeMap::new(),
        }
    }

    /// Snapshot the `Ready` workers of a registry listing. Suspect and
    /// draining workers are left out.
    pub fn from_registered(epoch: u64, workers: &[RegisteredWorker]) -> Self {
        let prior = workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Ready)
            .map(|w| (w.worker_id.clone(), w.owned.clone()))
            .collect();
        Self { epoch, prior }
    }

    pub fn with_worker(mut self, worker: impl Into<WorkerId>, prior: WorkerTasks) -> Self {
        self.prior.insert(worker.into(), prior);
        self
    }

    /// Workers in id order.
    pub fn workers(&self) -> impl Iterator<Item = &WorkerId> {
        self.prior.keys()
    }

    pub fn contains(&self, worker: &WorkerId) -> bool {
        self.prior.contains_key(worker)
    }

    pub fn previously_active(&self, worker: &WorkerId, task: &TaskId) -> bool {
        self.prior
            .get(worker)
            .is_some_and(|held| held.active.contains(task))
    }

    /// Whether the worker held the task in any role before this epoch.
    pub fn previously_held(&self, worker: &WorkerId, task: &TaskId) -> bool {
        self.prior
            .get(worker)
            .is_some_and(|held| held.role_of(task).is_some())
    }

    pub fn len(&self) -> usize {
        self.prior.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prior.is_empty()
    }
}

/// Counts rebalance triggers inside a sliding window.
///
/// Triggers are already coalesced by the coordinator's debounce; this only
/// detects a membership that keeps changing and reports it.
#[derive(Debug)]
pub struct FlapDetector {
    window: Duration,
    threshold: usize,
    triggers: VecDeque<Instant>,
}

impl FlapDetector {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            triggers: VecDeque::new(),
        }
    }

    /// Record a trigger at `now`. Returns `true` if the number of triggers in
    /// the window is above the threshold.
    pub fn record(&mut self, now: Instant) -> bool {
        while let Some(front) = self.triggers.front() {
            if now.duration_since(*front) > self.window {
                self.triggers.pop_front();
            } else {
                break;
            }
        }
        self.triggers.push_back(now);
        self.threshold > 0 && self.triggers.len() > self.threshold
    }

    pub fn recent_triggers(&self) -> usize {
        self.triggers.len()
    }
}

/// Keeps workers that failed an epoch out of later snapshots for a while.
///
/// Each failure doubles the worker's quarantine, capped at `max`. Strikes are
/// kept after the quarantine ends so a worker that fails again right after
/// readmission stays out longer. A successful apply clears them.
#[derive(Debug)]
pub struct SuspectQuarantine {
    base: Duration,
    max: Duration,
    strikes: HashMap<WorkerId, Strikes>,
}

#[derive(Debug, Clone, Copy)]
struct Strikes {
    count: u32,
    until: Instant,
}

impl SuspectQuarantine {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            strikes: HashMap::new(),
        }
    }

    /// Record a failure at `now`. Returns how long the worker stays out.
    pub fn strike(&mut self, worker: &WorkerId, now: Instant) -> Duration {
        let entry = self.strikes.entry(worker.clone()).or_insert(Strikes {
            count: 0,
            until: now,
        });
        entry.count = entry.count.saturating_add(1);
        let factor = 2u32.saturating_pow(entry.count - 1);
        let backoff = self.base.saturating_mul(factor).min(self.max);
        entry.until = now + backoff;
        backoff
    }

    pub fn is_quarantined(&self, worker: &WorkerId, now: Instant) -> bool {
        self.strikes.get(worker).is_some_and(|s| s.until > now)
    }

    /// Earliest quarantine still running at `now`.
    pub fn next_release(&self, now: Instant) -> Option<Instant> {
        self.strikes
            .values()
            .map(|s| s.until)
            .filter(|until| *until > now)
            .min()
    }

    pub fn strikes(&self, worker: &WorkerId) -> u32 {
        self.strikes.get(worker).map_or(0, |s| s.count)
    }

    pub fn clear(&mut self, worker: &WorkerId) {
        self.strikes.remove(worker);
    }
}
