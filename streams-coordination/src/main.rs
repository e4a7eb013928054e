use std::sync::Arc;

use async_trait::async_trait;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use streams_coordination::assignor::StickyBalancedAssignor;
use streams_coordination::config::Config;
use streams_coordination::coordinator::{Coordinator, CoordinatorConfig};
use streams_coordination::error::{Error, Result};
use streams_coordination::stability::{self, StateListener};
use streams_coordination::store::ClusterStore;
use streams_coordination::topology::{TopologyDefinition, TopologyDescriptor};
use streams_coordination::types::{WorkerId, WorkerLifecycle, WorkerTasks};
use streams_coordination::worker::{TaskHandler, WorkerConfig, WorkerHandle};

/// Stands in for a processing engine: logs what it would start.
struct LoggingTaskHandler {
    worker_id: WorkerId,
}

#[async_trait]
impl TaskHandler for LoggingTaskHandler {
    async fn apply_assignment(&self, tasks: &WorkerTasks) -> Result<()> {
        let active: Vec<String> = tasks.active.iter().map(ToString::to_string).collect();
        let standby: Vec<String> = tasks.standby.iter().map(ToString::to_string).collect();
        tracing::info!(worker = %self.worker_id, ?active, ?standby, "running tasks");
        Ok(())
    }
}

struct LoggingStateListener {
    worker_id: WorkerId,
}

impl StateListener for LoggingStateListener {
    fn on_change(&self, new_state: WorkerLifecycle, old_state: WorkerLifecycle) {
        tracing::info!(worker = %self.worker_id, from = ?old_state, to = ?new_state, "state changed");
    }
}

fn load_topology(path: &str) -> Result<TopologyDescriptor> {
    let raw = std::fs::read_to_string(path)?;
    let definition: TopologyDefinition = serde_json::from_str(&raw)?;
    TopologyDescriptor::from_definition(&definition)
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let config = Config::init_from_env().expect("Invalid configuration");

    let log_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(log_layer)
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    if config.num_workers == 0 {
        return Err(Error::configuration("num_workers must be at least 1").into());
    }

    let coordinator_config = CoordinatorConfig::from_config(&config)?;
    let topology = load_topology(&config.topology_path)?;
    tracing::info!(
        path = %config.topology_path,
        subtasks = topology.len(),
        num_standby_replicas = coordinator_config.num_standby_replicas,
        "loaded topology"
    );

    let store = Arc::new(ClusterStore::new(config.application_id.clone()));
    store.set_topology(topology).await;

    let cancel = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    let coordinator = Coordinator::new(
        Arc::clone(&store),
        coordinator_config,
        Arc::new(StickyBalancedAssignor),
    );
    {
        let token = cancel.child_token();
        tasks.spawn(async move { coordinator.run(token).await });
    }

    let mut detectors = Vec::with_capacity(config.num_workers);
    for i in 0..config.num_workers {
        let worker_id = WorkerId::new(format!("{}-{i}", config.application_id));
        let worker = WorkerHandle::new(
            Arc::clone(&store),
            WorkerConfig {
                worker_id: worker_id.clone(),
                application_id: config.application_id.clone(),
                apply_timeout: config.apply_timeout(),
            },
            Arc::new(LoggingTaskHandler {
                worker_id: worker_id.clone(),
            }),
        );
        worker
            .set_state_listener(Arc::new(LoggingStateListener { worker_id }))
            .await;
        detectors.push(worker.detector());

        let token = cancel.child_token();
        tasks.spawn(async move { worker.run(token).await });
    }

    let stable = stability::wait_for_stable(
        &detectors,
        config.stability_timeout(),
        config.stability_poll_interval(),
    )
    .await;

    match &stable {
        Ok(()) => {
            if let Some(published) = store.latest_assignment() {
                tracing::info!(
                    epoch = published.epoch(),
                    assignment = %serde_json::to_string(published.assignment.as_ref())?,
                    "cluster stable"
                );
            }
            for detector in &detectors {
                for thread in detector.local_threads_metadata().await {
                    tracing::info!(
                        thread = %thread.thread_name,
                        active = thread.active_tasks.len(),
                        standby = thread.standby_tasks.len(),
                        "thread metadata"
                    );
                }
            }
        }
        Err(e) => tracing::error!(error = %e, "cluster did not stabilize"),
    }

    tracing::info!("Shutting down gracefully...");
    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "component exited with error"),
            Err(e) => tracing::error!(error = %e, "component panicked"),
        }
    }

    stable.map_err(Into::into)
}
