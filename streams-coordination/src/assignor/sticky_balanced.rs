use std::collections::BTreeMap;

use crate::membership::MembershipSnapshot;
use crate::topology::TopologyDescriptor;
use crate::types::{Assignment, TaskId, WorkerId, WorkerTasks};

use super::{max_standby, TaskAssignor};

/// Places tasks while minimizing movement from the previous epoch.
///
/// Active tasks: every worker gets within +/-1 of the ideal count. A worker
/// keeps the actives it already owned up to its target; the +1 slots go to
/// the workers with the most prior actives. Orphaned and new tasks go to the
/// least loaded worker.
///
/// Standby tasks: only for replicable subtasks (stateful, every store logged).
/// Prior holders of the task are preferred, then the workers with the fewest
/// standbys. The active owner is never a candidate, so a cluster too small for
/// the requested replica count simply gets fewer standbys.
///
/// Every tie is broken by worker id, so the result is fully deterministic.
pub struct StickyBalancedAssignor;

impl TaskAssignor for StickyBalancedAssignor {
    fn compute_assignment(
        &self,
        topology: &TopologyDescriptor,
        members: &MembershipSnapshot,
        num_standby_replicas: u32,
    ) -> Assignment {
        let mut assignment = Assignment::empty(members.epoch);
        if members.is_empty() {
            return assignment;
        }

        // Sorted by id: index order is the tie-break order.
        let workers: Vec<&WorkerId> = members.workers().collect();
        let mut held: Vec<WorkerTasks> = vec![WorkerTasks::default(); workers.len()];

        let active_owners = place_actives(topology, members, &workers);
        for (task, owner) in &active_owners {
            held[*owner].active.insert(*task);
        }

        if num_standby_replicas > 0 {
            place_standbys(
                topology,
                members,
                &workers,
                &active_owners,
                num_standby_replicas,
                &mut held,
            );
        }

        assignment.tasks = workers.into_iter().cloned().zip(held).collect();
        assignment
    }
}

/// Returns task -> index into `workers`.
fn place_actives(
    topology: &TopologyDescriptor,
    members: &MembershipSnapshot,
    workers: &[&WorkerId],
) -> BTreeMap<TaskId, usize> {
    let num_workers = workers.len();
    let target_min = topology.len() / num_workers;
    let extra = topology.len() % num_workers;

    // Count how many current tasks each worker already owns as active.
    let sticky: Vec<usize> = workers
        .iter()
        .map(|w| {
            topology
                .task_ids()
                .filter(|t| members.previously_active(w, t))
                .count()
        })
        .collect();

    // Workers with more prior actives get priority for the +1 slots.
    let mut ranked: Vec<usize> = (0..num_workers).collect();
    ranked.sort_by(|&a, &b| sticky[b].cmp(&sticky[a]).then(a.cmp(&b)));
    let mut targets = vec![target_min; num_workers];
    for &i in ranked.iter().take(extra) {
        targets[i] += 1;
    }

    let mut load = vec![0usize; num_workers];
    let mut owners = BTreeMap::new();

    // Step 1: keep prior actives while under target. Two workers can claim
    // the same task after a split membership; the less loaded one wins.
    for task in topology.task_ids() {
        let claimant = least_loaded(
            (0..num_workers).filter(|&i| members.previously_active(workers[i], task)),
            &load,
            &targets,
        );
        if let Some(i) = claimant {
            owners.insert(*task, i);
            load[i] += 1;
        }
    }

    // Step 2: everything else goes to the emptiest worker with room.
    for task in topology.task_ids() {
        if owners.contains_key(task) {
            continue;
        }
        if let Some(i) = least_loaded(0..num_workers, &load, &targets) {
            owners.insert(*task, i);
            load[i] += 1;
        }
    }

    owners
}

fn place_standbys(
    topology: &TopologyDescriptor,
    members: &MembershipSnapshot,
    workers: &[&WorkerId],
    active_owners: &BTreeMap<TaskId, usize>,
    num_standby_replicas: u32,
    held: &mut [WorkerTasks],
) {
    let mut standby_load = vec![0usize; workers.len()];

    for spec in topology.subtasks() {
        let wanted = max_standby(spec, num_standby_replicas);
        if wanted == 0 {
            continue;
        }
        let Some(&owner) = active_owners.get(&spec.id) else {
            continue;
        };

        let mut candidates: Vec<usize> = (0..workers.len()).filter(|&i| i != owner).collect();
        candidates.sort_by_key(|&i| {
            (
                !members.previously_held(workers[i], &spec.id),
                standby_load[i],
                i,
            )
        });

        for &i in candidates.iter().take(wanted) {
            held[i].standby.insert(spec.id);
            standby_load[i] += 1;
        }
    }
}

fn least_loaded(
    candidates: impl Iterator<Item = usize>,
    load: &[usize],
    targets: &[usize],
) -> Option<usize> {
    candidates
        .filter(|&i| load[i] < targets[i])
        .min_by_key(|&i| (load[i], i))
}
