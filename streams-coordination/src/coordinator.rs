use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::assignor::TaskAssignor;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::membership::{FlapDetector, MembershipSnapshot, SuspectQuarantine};
use crate::store::{ClusterEvent, ClusterStore};
use crate::topology::TopologyDescriptor;
use crate::types::{ApplyOutcome, ApplyReport, WorkerId, WorkerStatus};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub name: String,
    pub num_standby_replicas: u32,
    /// How long workers get to report back on an epoch before they are
    /// marked suspect.
    pub apply_timeout: Duration,
    /// How long to wait after the first cluster event before rebalancing, to
    /// batch rapid registrations into a single epoch.
    pub rebalance_debounce_interval: Duration,
    pub flap_window: Duration,
    pub flap_warn_threshold: usize,
    /// How long a worker that failed an epoch is left out of snapshots, even
    /// if it registers again. Doubles per repeated failure.
    pub suspect_backoff: Duration,
    pub suspect_backoff_max: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            name: "coordinator-0".to_string(),
            num_standby_replicas: 0,
            apply_timeout: Duration::from_secs(30),
            rebalance_debounce_interval: Duration::from_millis(100),
            flap_window: Duration::from_secs(30),
            flap_warn_threshold: 10,
            suspect_backoff: Duration::from_secs(5),
            suspect_backoff_max: Duration::from_secs(300),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            name: format!("{}-coordinator", config.application_id),
            num_standby_replicas: config.num_standby_replicas()?,
            apply_timeout: config.apply_timeout(),
            rebalance_debounce_interval: config.rebalance_debounce_interval(),
            flap_window: config.flap_window(),
            flap_warn_threshold: config.flap_warn_threshold,
            suspect_backoff: config.suspect_backoff(),
            suspect_backoff_max: config.suspect_backoff_max(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RebalancePhase {
    Triggered,
    AssignmentComputed,
    Distributed,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApplyStatus {
    Applying,
    Applied,
    Failed,
}

/// Where the current (or last) epoch stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EpochProgress {
    pub epoch: u64,
    pub phase: RebalancePhase,
    pub workers: BTreeMap<WorkerId, ApplyStatus>,
    /// Rebalance triggers seen inside the flap window, this one included.
    pub recent_triggers: usize,
}

/// How an epoch ended, from the coordination loop's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpochEnd {
    Completed,
    /// Aborted or had failing workers. A store event follows when workers
    /// were marked suspect.
    Failed,
    /// A newer cluster event arrived while waiting for reports.
    Superseded,
    /// Nothing to assign yet.
    Skipped,
    Cancelled,
}

/// Carried from one epoch to the next within a single `run`.
struct RebalanceState {
    flaps: FlapDetector,
    quarantine: SuspectQuarantine,
    /// Members and topology of the last epoch that every member applied.
    settled: Option<(BTreeSet<WorkerId>, Arc<TopologyDescriptor>)>,
}

pub struct Coordinator {
    store: Arc<ClusterStore>,
    config: CoordinatorConfig,
    assignor: Arc<dyn TaskAssignor>,
    progress: watch::Sender<Option<EpochProgress>>,
}

impl Coordinator {
    pub fn new(
        store: Arc<ClusterStore>,
        config: CoordinatorConfig,
        assignor: Arc<dyn TaskAssignor>,
    ) -> Self {
        let (progress, _) = watch::channel(None);
        Self {
            store,
            config,
            assignor,
            progress,
        }
    }

    pub fn progress(&self) -> Option<EpochProgress> {
        self.progress.borrow().clone()
    }

    pub fn watch_progress(&self) -> watch::Receiver<Option<EpochProgress>> {
        self.progress.subscribe()
    }

    /// Run the coordination loop until cancelled.
    ///
    /// Rebalances once on start, then once per debounced batch of cluster
    /// events. An epoch still waiting for reports is abandoned as soon as a
    /// newer event arrives.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        // Subscribe before the first epoch so no event or report is missed.
        let mut events = self.store.watch_events();
        let mut reports = self.store.watch_apply_reports();
        let mut state = RebalanceState {
            flaps: FlapDetector::new(self.config.flap_window, self.config.flap_warn_threshold),
            quarantine: SuspectQuarantine::new(
                self.config.suspect_backoff,
                self.config.suspect_backoff_max,
            ),
            settled: None,
        };

        tracing::info!(name = %self.config.name, application = %self.store.application_id(), "coordinator started");

        let mut triggered = true;
        loop {
            if !triggered {
                let release = state.quarantine.next_release(Instant::now());
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    event = events.recv() => Self::on_event(event)?,
                    _ = sleep_until_release(release) => {
                        tracing::info!(name = %self.config.name, "suspect quarantine ended");
                    }
                }
            }

            if !self.debounce(&mut events, &cancel).await? {
                return Ok(());
            }

            if state.flaps.record(Instant::now()) {
                tracing::warn!(
                    name = %self.config.name,
                    triggers = state.flaps.recent_triggers(),
                    window = ?self.config.flap_window,
                    "membership is flapping"
                );
                metrics::counter!("streams_membership_flapping_total").increment(1);
            }

            triggered = match self
                .run_epoch(&mut state, &mut events, &mut reports, &cancel)
                .await?
            {
                EpochEnd::Superseded => true,
                EpochEnd::Cancelled => return Ok(()),
                EpochEnd::Completed | EpochEnd::Failed | EpochEnd::Skipped => false,
            };
        }
    }

    /// Drain events arriving within the debounce window. Returns `false` if
    /// cancelled.
    async fn debounce(
        &self,
        events: &mut broadcast::Receiver<ClusterEvent>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let deadline = Instant::now() + self.config.rebalance_debounce_interval;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                _ = tokio::time::sleep_until(deadline) => return Ok(true),
                event = events.recv() => Self::on_event(event)?,
            }
        }
    }

    fn on_event(event: std::result::Result<ClusterEvent, RecvError>) -> Result<()> {
        match event {
            Ok(ClusterEvent::WorkerRegistered(worker)) => {
                tracing::info!(worker = %worker, "worker registered")
            }
            Ok(ClusterEvent::WorkerLeft(worker)) => tracing::info!(worker = %worker, "worker left"),
            Ok(ClusterEvent::WorkerStatusChanged(worker, status)) => {
                tracing::info!(worker = %worker, status = ?status, "worker status changed")
            }
            Ok(ClusterEvent::TopologyChanged) => tracing::info!("topology changed"),
            // Missed events still mean something changed.
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "cluster event receiver lagged")
            }
            Err(RecvError::Closed) => return Err(Error::ChannelClosed("cluster events")),
        }
        Ok(())
    }

    async fn run_epoch(
        &self,
        state: &mut RebalanceState,
        events: &mut broadcast::Receiver<ClusterEvent>,
        reports: &mut broadcast::Receiver<ApplyReport>,
        cancel: &CancellationToken,
    ) -> Result<EpochEnd> {
        let Some(topology) = self.store.topology().await else {
            tracing::debug!("topology not set, skipping rebalance");
            return Ok(EpochEnd::Skipped);
        };

        let now = Instant::now();
        let workers = self.store.list_workers().await;
        let (eligible, quarantined): (Vec<_>, Vec<_>) = workers
            .iter()
            .cloned()
            .partition(|w| !state.quarantine.is_quarantined(&w.worker_id, now));
        for worker in &quarantined {
            tracing::debug!(worker = %worker.worker_id, strikes = state.quarantine.strikes(&worker.worker_id), "worker still quarantined, left out");
        }

        let mut snapshot = MembershipSnapshot::from_registered(0, &eligible);
        let members: BTreeSet<WorkerId> = snapshot.workers().cloned().collect();
        let unchanged = state.settled.as_ref().is_some_and(|(settled, settled_topology)| {
            *settled == members && Arc::ptr_eq(settled_topology, &topology)
        });
        if unchanged {
            tracing::debug!(workers = members.len(), "membership unchanged since the last settled epoch, skipping rebalance");
            return Ok(EpochEnd::Skipped);
        }

        let epoch = self.store.next_epoch().await;
        snapshot.epoch = epoch;

        self.progress.send_replace(Some(EpochProgress {
            epoch,
            phase: RebalancePhase::Triggered,
            workers: members
                .iter()
                .map(|w| (w.clone(), ApplyStatus::Applying))
                .collect(),
            recent_triggers: state.flaps.recent_triggers(),
        }));
        metrics::counter!("streams_rebalances_total").increment(1);

        let assignment = match self.assignor.assign(
            &topology,
            &snapshot,
            self.config.num_standby_replicas,
        ) {
            Ok(assignment) => assignment,
            Err(e) => {
                tracing::error!(epoch, error = %e, "epoch aborted, nothing distributed");
                metrics::counter!("streams_epochs_failed_total", "reason" => "inconsistency")
                    .increment(1);
                self.set_phase(RebalancePhase::Failed);
                return Ok(EpochEnd::Failed);
            }
        };
        self.set_phase(RebalancePhase::AssignmentComputed);

        tracing::info!(
            epoch,
            workers = snapshot.len(),
            registered = workers.len(),
            active = assignment.active_count(),
            standby = assignment.standby_count(),
            "assignment computed"
        );

        // Whatever was settled no longer matches what workers are told to run.
        state.settled = None;
        self.store
            .publish_assignment(assignment, Arc::clone(&topology))
            .await;
        self.set_phase(RebalancePhase::Distributed);
        metrics::gauge!("streams_assignment_epoch").set(epoch as f64);

        let end = self
            .await_reports(state, epoch, &snapshot, events, reports, cancel)
            .await?;
        if end == EpochEnd::Completed {
            state.settled = Some((members, topology));
        }
        Ok(end)
    }

    async fn await_reports(
        &self,
        state: &mut RebalanceState,
        epoch: u64,
        snapshot: &MembershipSnapshot,
        events: &mut broadcast::Receiver<ClusterEvent>,
        reports: &mut broadcast::Receiver<ApplyReport>,
        cancel: &CancellationToken,
    ) -> Result<EpochEnd> {
        let deadline = Instant::now() + self.config.apply_timeout;
        let mut pending: BTreeSet<WorkerId> = snapshot.workers().cloned().collect();
        let mut failed: Vec<WorkerId> = Vec::new();

        while !pending.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(EpochEnd::Cancelled),
                _ = tokio::time::sleep_until(deadline) => break,
                event = events.recv() => {
                    Self::on_event(event)?;
                    tracing::info!(epoch, pending = pending.len(), "epoch superseded by a newer cluster event");
                    self.set_phase(RebalancePhase::Failed);
                    return Ok(EpochEnd::Superseded);
                }
                report = reports.recv() => match report {
                    Ok(report) if report.epoch == epoch && pending.remove(&report.worker_id) => {
                        match report.outcome {
                            ApplyOutcome::Applied => {
                                tracing::debug!(epoch, worker = %report.worker_id, "worker applied epoch");
                                state.quarantine.clear(&report.worker_id);
                                self.set_worker_status(&report.worker_id, ApplyStatus::Applied);
                            }
                            ApplyOutcome::Failed(reason) => {
                                let e = Error::ApplyFailed { worker: report.worker_id.clone(), reason };
                                tracing::warn!(epoch, error = %e, "worker failed to apply epoch");
                                self.set_worker_status(&report.worker_id, ApplyStatus::Failed);
                                failed.push(report.worker_id);
                            }
                        }
                    }
                    // Stale epoch, duplicate, or a worker outside this epoch.
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(epoch, skipped, "apply report receiver lagged");
                    }
                    Err(RecvError::Closed) => return Err(Error::ChannelClosed("apply reports")),
                },
            }
        }

        for worker in pending {
            let e = Error::ApplyTimeout {
                worker: worker.clone(),
                epoch,
            };
            tracing::warn!(epoch, timeout = ?self.config.apply_timeout, error = %e, "worker missed the apply deadline");
            self.set_worker_status(&worker, ApplyStatus::Failed);
            failed.push(worker);
        }

        if failed.is_empty() {
            self.set_phase(RebalancePhase::Completed);
            tracing::info!(epoch, workers = snapshot.len(), "epoch completed");
            return Ok(EpochEnd::Completed);
        }

        self.set_phase(RebalancePhase::Failed);
        metrics::counter!("streams_epochs_failed_total", "reason" => "apply").increment(1);

        // Marking a worker suspect emits a status event, which starts the
        // next epoch without it. The quarantine keeps it out even if it
        // registers again straight away.
        let now = Instant::now();
        for worker in &failed {
            let backoff = state.quarantine.strike(worker, now);
            tracing::warn!(
                epoch,
                worker = %worker,
                strikes = state.quarantine.strikes(worker),
                backoff = ?backoff,
                "worker quarantined"
            );
            match self
                .store
                .update_worker_status(worker, WorkerStatus::Suspect)
                .await
            {
                Ok(()) => {
                    tracing::warn!(epoch, worker = %worker, "worker marked suspect");
                    metrics::counter!("streams_workers_suspected_total").increment(1);
                }
                Err(Error::NotFound(_)) => {
                    tracing::debug!(epoch, worker = %worker, "failed worker already left");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(EpochEnd::Failed)
    }

    fn set_phase(&self, phase: RebalancePhase) {
        self.progress.send_modify(|progress| {
            if let Some(progress) = progress {
                progress.phase = phase;
            }
        });
    }

    fn set_worker_status(&self, worker: &WorkerId, status: ApplyStatus) {
        self.progress.send_modify(|progress| {
            if let Some(progress) = progress {
                progress.workers.insert(worker.clone(), status);
            }
        });
    }
}

async fn sleep_until_release(release: Option<Instant>) {
    match release {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
