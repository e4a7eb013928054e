use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use streams_coordination::assignor::StickyBalancedAssignor;
use streams_coordination::coordinator::{Coordinator, CoordinatorConfig};
use streams_coordination::error::{Error, Result};
use streams_coordination::stability::StabilityDetector;
use streams_coordination::store::ClusterStore;
use streams_coordination::topology::{StoreSpec, Subtopology, TopicMetadata, TopologyDescriptor};
use streams_coordination::types::{WorkerId, WorkerTasks};
use streams_coordination::worker::{TaskHandler, WorkerConfig, WorkerHandle};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);
pub const APPLY_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEBOUNCE: Duration = Duration::from_millis(50);
pub const SUSPECT_BACKOFF: Duration = Duration::from_millis(300);

pub fn test_store(test_name: &str) -> Arc<ClusterStore> {
    let application_id = format!("test-{}-{}", test_name, uuid::Uuid::new_v4());
    Arc::new(ClusterStore::new(application_id))
}

/// One input topic with `partitions` partitions feeding a single
/// subtopology that owns one store.
pub fn single_store_topology(partitions: u32, logging_enabled: bool) -> TopologyDescriptor {
    let store = StoreSpec {
        name: "counts-store".to_string(),
        logging_enabled,
    };
    TopologyDescriptor::new(
        &[TopicMetadata {
            name: "input".to_string(),
            partition_count: partitions,
            replication_factor: 1,
        }],
        &[store],
        &[Subtopology {
            id: 0,
            source_topics: vec!["input".to_string()],
            stores: vec!["counts-store".to_string()],
        }],
    )
    .expect("valid topology")
}

pub async fn wait_for_condition<F, Fut>(timeout: Duration, interval: Duration, f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if f().await {
            return;
        }
        tokio::time::sleep(interval).await;
    }
    panic!("condition not met within {timeout:?}");
}

// ── Component builders ──────────────────────────────────────────

pub fn start_coordinator(
    store: Arc<ClusterStore>,
    num_standby_replicas: u32,
    cancel: CancellationToken,
) -> JoinHandle<Result<()>> {
    start_coordinator_with_backoff(store, num_standby_replicas, SUSPECT_BACKOFF, cancel)
}

pub fn start_coordinator_with_backoff(
    store: Arc<ClusterStore>,
    num_standby_replicas: u32,
    suspect_backoff: Duration,
    cancel: CancellationToken,
) -> JoinHandle<Result<()>> {
    let coordinator = Coordinator::new(
        store,
        CoordinatorConfig {
            num_standby_replicas,
            apply_timeout: APPLY_TIMEOUT,
            rebalance_debounce_interval: DEBOUNCE,
            suspect_backoff,
            ..Default::default()
        },
        Arc::new(StickyBalancedAssignor),
    );
    let token = cancel.child_token();
    tokio::spawn(async move { coordinator.run(token).await })
}

pub struct WorkerHandles {
    pub worker_id: WorkerId,
    pub detector: Arc<StabilityDetector>,
    pub applied: Arc<Mutex<Vec<WorkerTasks>>>,
    /// Cancels only this worker.
    pub cancel: CancellationToken,
    pub handle: JoinHandle<Result<()>>,
}

pub fn start_worker(
    store: Arc<ClusterStore>,
    name: &str,
    cancel: CancellationToken,
) -> WorkerHandles {
    let (handler, applied) = MockTaskHandler::new();
    spawn_worker(store, name, Arc::new(handler), applied, cancel)
}

/// Start a worker whose first `failures` applies fail.
pub fn start_worker_flaky(
    store: Arc<ClusterStore>,
    name: &str,
    failures: usize,
    cancel: CancellationToken,
) -> WorkerHandles {
    let (handler, applied) = FlakyTaskHandler::new(failures);
    spawn_worker(store, name, Arc::new(handler), applied, cancel)
}

/// Start a worker whose applies never finish.
pub fn start_worker_blocking(
    store: Arc<ClusterStore>,
    name: &str,
    cancel: CancellationToken,
) -> WorkerHandles {
    let applied = Arc::new(Mutex::new(Vec::new()));
    spawn_worker(
        store,
        name,
        Arc::new(BlockingTaskHandler),
        applied,
        cancel,
    )
}

/// Start a worker that can stop everything but fails to run any task.
pub fn start_worker_failing_with_tasks(
    store: Arc<ClusterStore>,
    name: &str,
    cancel: CancellationToken,
) -> WorkerHandles {
    let (handler, applied) = FailsWithTasksHandler::new();
    spawn_worker(store, name, Arc::new(handler), applied, cancel)
}

fn spawn_worker(
    store: Arc<ClusterStore>,
    name: &str,
    handler: Arc<dyn TaskHandler>,
    applied: Arc<Mutex<Vec<WorkerTasks>>>,
    cancel: CancellationToken,
) -> WorkerHandles {
    let worker_id = WorkerId::from(name);
    let worker = WorkerHandle::new(
        Arc::clone(&store),
        WorkerConfig {
            worker_id: worker_id.clone(),
            application_id: store.application_id().to_string(),
            apply_timeout: APPLY_TIMEOUT,
        },
        handler,
    );
    let detector = worker.detector();
    let token = cancel.child_token();
    let handle = {
        let token = token.clone();
        tokio::spawn(async move { worker.run(token).await })
    };
    WorkerHandles {
        worker_id,
        detector,
        applied,
        cancel: token,
        handle,
    }
}

pub fn detectors(workers: &[&WorkerHandles]) -> Vec<Arc<StabilityDetector>> {
    workers.iter().map(|w| Arc::clone(&w.detector)).collect()
}

// ── Mock handlers ───────────────────────────────────────────────

/// Records every task set it is asked to run.
pub struct MockTaskHandler {
    pub applied: Arc<Mutex<Vec<WorkerTasks>>>,
}

impl MockTaskHandler {
    pub fn new() -> (Self, Arc<Mutex<Vec<WorkerTasks>>>) {
        let applied = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                applied: Arc::clone(&applied),
            },
            applied,
        )
    }
}

#[async_trait]
impl TaskHandler for MockTaskHandler {
    async fn apply_assignment(&self, tasks: &WorkerTasks) -> Result<()> {
        self.applied.lock().await.push(tasks.clone());
        Ok(())
    }
}

/// Fails the first `failures` applies, then behaves like `MockTaskHandler`.
/// `usize::MAX` fails forever.
pub struct FlakyTaskHandler {
    remaining_failures: AtomicUsize,
    pub applied: Arc<Mutex<Vec<WorkerTasks>>>,
}

impl FlakyTaskHandler {
    pub fn new(failures: usize) -> (Self, Arc<Mutex<Vec<WorkerTasks>>>) {
        let applied = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                remaining_failures: AtomicUsize::new(failures),
                applied: Arc::clone(&applied),
            },
            applied,
        )
    }
}

#[async_trait]
impl TaskHandler for FlakyTaskHandler {
    async fn apply_assignment(&self, tasks: &WorkerTasks) -> Result<()> {
        let failing = match self.remaining_failures.load(Ordering::SeqCst) {
            0 => false,
            usize::MAX => true,
            _ => {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                true
            }
        };
        if failing {
            return Err(Error::ApplyFailed {
                worker: WorkerId::from("flaky"),
                reason: "state store could not be opened".to_string(),
            });
        }
        self.applied.lock().await.push(tasks.clone());
        Ok(())
    }
}

/// Applies the empty task set and fails on anything else, like an engine
/// whose state directory is unusable.
pub struct FailsWithTasksHandler {
    pub applied: Arc<Mutex<Vec<WorkerTasks>>>,
}

impl FailsWithTasksHandler {
    pub fn new() -> (Self, Arc<Mutex<Vec<WorkerTasks>>>) {
        let applied = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                applied: Arc::clone(&applied),
            },
            applied,
        )
    }
}

#[async_trait]
impl TaskHandler for FailsWithTasksHandler {
    async fn apply_assignment(&self, tasks: &WorkerTasks) -> Result<()> {
        self.applied.lock().await.push(tasks.clone());
        if tasks.is_empty() {
            return Ok(());
        }
        Err(Error::ApplyFailed {
            worker: WorkerId::from("broken"),
            reason: "state directory is not writable".to_string(),
        })
    }
}

/// Never finishes applying. Simulates a worker stuck restoring state.
pub struct BlockingTaskHandler;

#[async_trait]
impl TaskHandler for BlockingTaskHandler {
    async fn apply_assignment(&self, _tasks: &WorkerTasks) -> Result<()> {
        std::future::pending().await
    }
}
