//! Periodic ticks that drive the dispatch core.
//!
//! A running scheduler owns four independent interval loops (dispatch,
//! topology refresh, reconciliation and post-processing) and a command loop
//! that serves requests from a [`SchedulerHandle`]. The dispatcher is shared
//! behind an async mutex so submission to the backend is serialized.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use anyhow::Result;
use anyhow::anyhow;
use chrono::DateTime;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::EngineConfig;
use crate::ExecutionBackend;
use crate::JobDispatcher;
use crate::PairId;
use crate::PairStore;
use crate::PostProcessingCoordinator;
use crate::backend::CommandRunner;
use crate::backend::SystemCommandRunner;
use crate::dispatch::DispatchReport;
use crate::post::PostProcessingReport;
use crate::post::ScriptPostProcessor;
use crate::store::Job;

mod commands;

pub use commands::SchedulerCommand;

/// Channel buffer size for scheduler commands.
const CHANNEL_BUFFER_SIZE: usize = 64;

/// The error reason recorded for pairs the backend no longer knows about.
pub const ORPHANED_REASON: &str = "execution no longer known to backend";

/// The cluster topology as last seen by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    /// The worker nodes.
    pub nodes: Vec<String>,
    /// The queues.
    pub queues: Vec<String>,
    /// The queue of each node.
    pub associations: HashMap<String, String>,
    /// When the snapshot was taken; `None` if it never was.
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl ClusterSnapshot {
    /// Gets the number of nodes in each known queue.
    ///
    /// Queues without nodes are included with a count of zero. A snapshot
    /// that was never refreshed knows no queues.
    pub fn node_counts(&self) -> HashMap<String, usize> {
        let mut counts: HashMap<String, usize> =
            self.queues.iter().map(|q| (q.clone(), 0)).collect();
        for queue in self.associations.values() {
            *counts.entry(queue.clone()).or_default() += 1;
        }
        counts
    }
}

/// Represents the periodic driver of the dispatch core.
#[derive(Debug, Clone)]
pub struct Scheduler {
    /// The execution backend.
    backend: Arc<dyn ExecutionBackend>,
    /// The persistence layer.
    store: Arc<dyn PairStore>,
    /// The dispatcher, shared by the dispatch loop and the command loop.
    dispatcher: Arc<Mutex<JobDispatcher>>,
    /// The post-processing coordinator.
    coordinator: Arc<PostProcessingCoordinator>,
    /// The latest cluster topology.
    snapshot: Arc<RwLock<ClusterSnapshot>>,
    /// The interval between dispatch ticks.
    dispatch_interval: Duration,
    /// The interval between topology refreshes.
    topology_interval: Duration,
    /// The interval between reconciliation sweeps.
    reconcile_interval: Duration,
    /// The interval between post-processing ticks.
    post_processing_interval: Duration,
}

impl Scheduler {
    /// Constructs a new scheduler.
    pub fn new(
        config: &EngineConfig,
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<dyn PairStore>,
        dispatcher: JobDispatcher,
        coordinator: PostProcessingCoordinator,
    ) -> Self {
        Self {
            backend,
            store,
            dispatcher: Arc::new(Mutex::new(dispatcher)),
            coordinator: Arc::new(coordinator),
            snapshot: Default::default(),
            dispatch_interval: config.dispatch.interval(),
            topology_interval: config.topology.interval(),
            reconcile_interval: config.topology.reconcile_interval(),
            post_processing_interval: config.post_processing.interval(),
        }
    }

    /// Constructs a scheduler with the dispatcher and script post processor
    /// described by the configuration.
    pub fn from_config(
        config: &EngineConfig,
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<dyn PairStore>,
    ) -> Result<Self> {
        let dispatcher = JobDispatcher::from_config(&config.dispatch, backend.clone(), store.clone())?;
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new());
        let processor = ScriptPostProcessor::new(
            &config.post_processing,
            dispatcher.layout().clone(),
            store.clone(),
            runner,
        );
        let coordinator = PostProcessingCoordinator::new(
            store.clone(),
            Arc::new(processor),
            config.post_processing.batch_size,
        );

        Ok(Self::new(config, backend, store, dispatcher, coordinator))
    }

    /// Gets a copy of the latest cluster topology.
    pub fn snapshot(&self) -> ClusterSnapshot {
        self.snapshot.read().clone()
    }

    /// Runs one dispatch tick.
    pub async fn dispatch_tick(&self) -> DispatchReport {
        let counts = self.snapshot.read().node_counts();
        self.dispatcher.lock().await.dispatch(&counts).await
    }

    /// Refreshes the cluster topology.
    ///
    /// If any query fails, the previous snapshot is kept. Returns whether
    /// the snapshot was replaced.
    pub async fn refresh_topology(&self) -> bool {
        let queried = async {
            let nodes = self.backend.worker_nodes().await?;
            let queues = self.backend.queues().await?;
            let associations = self.backend.node_queue_associations().await?;
            anyhow::Ok((nodes, queues, associations))
        };

        let (nodes, queues, associations) = match queried.await {
            Ok(topology) => topology,
            Err(e) => {
                warn!(
                    backend = self.backend.name(),
                    "failed to refresh cluster topology; keeping the previous snapshot: {e:#}"
                );
                return false;
            }
        };

        debug!(
            nodes = nodes.len(),
            queues = queues.len(),
            "refreshed cluster topology"
        );

        *self.snapshot.write() = ClusterSnapshot {
            nodes,
            queues,
            associations,
            refreshed_at: Some(Utc::now()),
        };

        if !self.backend.clear_node_error_states().await {
            debug!(backend = self.backend.name(), "node error states were not cleared");
        }

        true
    }

    /// Runs one reconciliation sweep.
    ///
    /// Pairs the store believes are held by the backend but whose execution
    /// handle the backend no longer reports are marked as an error. Returns
    /// the number of pairs marked.
    pub async fn reconcile(&self) -> usize {
        // Read the store before the backend so that pairs submitted in
        // between are not mistaken for orphans
        let pairs = match self.store.get_pairs_in_backend().await {
            Ok(pairs) => pairs,
            Err(e) => {
                error!("failed to get job pairs held by the backend: {e:#}");
                return 0;
            }
        };

        if pairs.is_empty() {
            return 0;
        }

        let active = match self.backend.active_execution_ids().await {
            Ok(active) => active,
            Err(e) => {
                warn!(
                    backend = self.backend.name(),
                    "failed to get active execution ids; skipping reconciliation: {e:#}"
                );
                return 0;
            }
        };

        let mut orphaned = 0;
        for pair in pairs {
            let Some(id) = pair.execution_id else {
                continue;
            };

            if active.contains(&id) {
                continue;
            }

            match self.store.set_pair_error(pair.id, ORPHANED_REASON).await {
                Ok(true) => {
                    warn!(pair = pair.id, %id, "job pair is no longer known to the backend");
                    orphaned += 1;
                }
                Ok(false) => {}
                Err(e) => error!(pair = pair.id, "failed to record job pair error: {e:#}"),
            }
        }

        orphaned
    }

    /// Runs one post-processing tick.
    pub async fn post_processing_tick(&self) -> PostProcessingReport {
        self.coordinator.tick().await
    }

    /// Starts the scheduler.
    ///
    /// The topology is refreshed once before the loops start. The scheduler
    /// runs until `shutdown` is cancelled or [`SchedulerHandle::shutdown`] is
    /// called.
    pub async fn start(self, shutdown: CancellationToken) -> SchedulerHandle {
        self.refresh_topology().await;

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let tasks = vec![
            self.every("dispatch", self.dispatch_interval, &shutdown, |s| async move {
                s.dispatch_tick().await;
            }),
            self.every("topology", self.topology_interval, &shutdown, |s| async move {
                s.refresh_topology().await;
            }),
            self.every("reconcile", self.reconcile_interval, &shutdown, |s| async move {
                s.reconcile().await;
            }),
            self.every(
                "post-processing",
                self.post_processing_interval,
                &shutdown,
                |s| async move {
                    s.post_processing_tick().await;
                },
            ),
            tokio::spawn(self.clone().run_commands(rx, shutdown.clone())),
        ];

        info!(backend = self.backend.name(), "scheduler started");

        SchedulerHandle {
            tx,
            shutdown,
            tasks,
            backend: self.backend,
        }
    }

    /// Spawns a loop running `tick` at a fixed interval until shutdown.
    ///
    /// A tick that overruns the interval delays the following ticks rather
    /// than bursting to catch up.
    fn every<F, Fut>(
        &self,
        name: &'static str,
        period: Duration,
        shutdown: &CancellationToken,
        tick: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Scheduler) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let scheduler = self.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => tick(scheduler.clone()).await,
                }
            }

            debug!(name, "periodic loop stopped");
        })
    }

    /// Runs the command loop.
    async fn run_commands(self, mut rx: mpsc::Receiver<SchedulerCommand>, shutdown: CancellationToken) {
        loop {
            let command = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                SchedulerCommand::SubmitJob { job, rx } => {
                    debug!(user = job.user_id, name = %job.name, "received `SubmitJob` command");
                    let result = self.dispatcher.lock().await.submit_job(job).await;
                    let _ = rx.send(result);
                }
                SchedulerCommand::KillPair { pair, rx } => {
                    debug!(pair, "received `KillPair` command");
                    let result = self.dispatcher.lock().await.kill_pair(pair).await;
                    let _ = rx.send(result);
                }
                SchedulerCommand::KillAll { rx } => {
                    debug!("received `KillAll` command");
                    let result = self.dispatcher.lock().await.kill_all().await;
                    let _ = rx.send(result);
                }
                SchedulerCommand::Topology { rx } => {
                    debug!("received `Topology` command");
                    let _ = rx.send(self.snapshot());
                }
                SchedulerCommand::Ping { rx } => {
                    debug!("received `Ping` command");
                    let _ = rx.send(());
                }
            }
        }

        debug!("command loop stopped");
    }
}

/// A handle to a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    /// The command sender.
    tx: mpsc::Sender<SchedulerCommand>,
    /// The shutdown token of the loops.
    shutdown: CancellationToken,
    /// The loop tasks.
    tasks: Vec<JoinHandle<()>>,
    /// The backend, shut down after the loops stop.
    backend: Arc<dyn ExecutionBackend>,
}

impl SchedulerHandle {
    /// Gets a sender for scheduler commands.
    pub fn sender(&self) -> mpsc::Sender<SchedulerCommand> {
        self.tx.clone()
    }

    /// Stores a job and submits its pairs.
    pub async fn submit_job(&self, job: Job) -> Result<(Job, DispatchReport)> {
        self.request(|rx| SchedulerCommand::SubmitJob { job, rx })
            .await?
    }

    /// Kills a pair.
    pub async fn kill_pair(&self, pair: PairId) -> Result<bool> {
        self.request(|rx| SchedulerCommand::KillPair { pair, rx })
            .await?
    }

    /// Kills every pair held by the backend.
    pub async fn kill_all(&self) -> Result<usize> {
        self.request(|rx| SchedulerCommand::KillAll { rx }).await?
    }

    /// Gets the latest cluster topology.
    pub async fn topology(&self) -> Result<ClusterSnapshot> {
        self.request(|rx| SchedulerCommand::Topology { rx }).await
    }

    /// Checks that the scheduler is responsive.
    pub async fn ping(&self) -> Result<()> {
        self.request(|rx| SchedulerCommand::Ping { rx }).await
    }

    /// Stops the scheduler.
    ///
    /// Each loop finishes its current tick; the backend is shut down once
    /// every loop has stopped.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("scheduler task failed: {e}");
            }
        }

        self.backend.shutdown().await;
        info!("scheduler stopped");
    }

    /// Sends a command and waits for its response.
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(command(tx))
            .await
            .map_err(|_| anyhow!("the scheduler is not running"))?;
        rx.await.context("the scheduler dropped the request")
    }
}
