mod sticky_balanced;

pub use sticky_balanced::StickyBalancedAssignor;

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::membership::MembershipSnapshot;
use crate::topology::{SubtaskSpec, TopologyDescriptor};
use crate::types::{Assignment, TaskId};

/// Trait for task placement strategies.
///
/// The coordinator calls `assign` once per epoch with an immutable topology
/// and membership snapshot. Implementations only decide placement in
/// `compute_assignment`; `assign` checks the result before anything is
/// distributed.
pub trait TaskAssignor: Send + Sync {
    /// Compute active and standby placement.
    ///
    /// - `topology`: every subtask that must run
    /// - `members`: eligible workers and what they owned before this epoch
    /// - `num_standby_replicas`: cluster-wide standby target per subtask
    ///
    /// Must be deterministic for identical inputs.
    fn compute_assignment(
        &self,
        topology: &TopologyDescriptor,
        members: &MembershipSnapshot,
        num_standby_replicas: u32,
    ) -> Assignment;

    fn assign(
        &self,
        topology: &TopologyDescriptor,
        members: &MembershipSnapshot,
        num_standby_replicas: u32,
    ) -> Result<Assignment> {
        let assignment = self.compute_assignment(topology, members, num_standby_replicas);
        validate(topology, members, num_standby_replicas, &assignment)?;
        Ok(assignment)
    }
}

/// Upper bound on standbys for a subtask, before cluster size is considered.
pub fn max_standby(spec: &SubtaskSpec, num_standby_replicas: u32) -> usize {
    if spec.is_replicable() {
        num_standby_replicas as usize
    } else {
        0
    }
}

/// Check the invariants every distributed assignment must hold:
/// workers come from the snapshot, each subtask has exactly one active owner,
/// nobody is both active and standby for a subtask, and standby counts stay
/// within bounds (zero for non-replicable subtasks).
pub fn validate(
    topology: &TopologyDescriptor,
    members: &MembershipSnapshot,
    num_standby_replicas: u32,
    assignment: &Assignment,
) -> Result<()> {
    if assignment.epoch != members.epoch {
        return Err(Error::inconsistency(format!(
            "assignment epoch {} does not match snapshot epoch {}",
            assignment.epoch, members.epoch
        )));
    }

    let mut active_owners: HashMap<TaskId, usize> = HashMap::with_capacity(topology.len());
    let mut standby_counts: HashMap<TaskId, usize> = HashMap::new();

    for (worker, held) in &assignment.tasks {
        if !members.contains(worker) {
            return Err(Error::inconsistency(format!(
                "worker {worker} is not part of epoch {}",
                members.epoch
            )));
        }
        if let Some(task) = held.active.intersection(&held.standby).next() {
            return Err(Error::inconsistency(format!(
                "worker {worker} holds both active and standby for {task}"
            )));
        }
        for task in &held.active {
            if !topology.contains(task) {
                return Err(Error::inconsistency(format!("unknown active task {task}")));
            }
            *active_owners.entry(*task).or_default() += 1;
        }
        for task in &held.standby {
            if !topology.contains(task) {
                return Err(Error::inconsistency(format!("unknown standby task {task}")));
            }
            *standby_counts.entry(*task).or_default() += 1;
        }
    }

    if members.is_empty() {
        return Ok(());
    }

    let standby_ceiling = members.len() - 1;
    for spec in topology.subtasks() {
        match active_owners.get(&spec.id).copied().unwrap_or(0) {
            1 => {}
            0 => {
                return Err(Error::inconsistency(format!(
                    "task {} has no active owner",
                    spec.id
                )))
            }
            n => {
                return Err(Error::inconsistency(format!(
                    "task {} has {n} active owners",
                    spec.id
                )))
            }
        }

        let standbys = standby_counts.get(&spec.id).copied().unwrap_or(0);
        let allowed = max_standby(spec, num_standby_replicas).min(standby_ceiling);
        if standbys > allowed {
            return Err(Error::inconsistency(format!(
                "task {} has {standbys} standbys, at most {allowed} allowed",
                spec.id
            )));
        }
    }

    Ok(())
}
