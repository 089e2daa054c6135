//! Implementation of the local backend.
//!
//! Job scripts run one at a time, in submission order, on the host running
//! the process. The head of the queue stays queued (and active) while it
//! runs; it is removed when the script exits or is killed.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::CommandRunner;
use super::CommandSpec;
use super::ExecutionBackend;
use super::ExecutionId;
use crate::config::LocalBackendConfig;

/// The node name used when the host name cannot be determined.
const FALLBACK_NODE_NAME: &str = "localhost";

/// The exclusive upper bound of local execution ids.
const MAX_EXECUTION_ID: i64 = i32::MAX as i64;

/// Generates execution ids for the local backend.
///
/// Ids increase, wrap around before `i32::MAX`, are never zero and are never
/// an id that is still active.
#[derive(Debug, Default)]
struct IdSequence {
    /// The last id handed out.
    current: i64,
}

impl IdSequence {
    /// Gets the next free execution id.
    ///
    /// Returns `None` if every id is in use.
    fn next(&mut self, active: &HashMap<ExecutionId, LocalJob>) -> Option<ExecutionId> {
        if active.len() as i64 >= MAX_EXECUTION_ID - 1 {
            return None;
        }

        loop {
            self.current = ((self.current + 1) % MAX_EXECUTION_ID).max(1);
            let id = ExecutionId::new(self.current);
            if !active.contains_key(&id) {
                return Some(id);
            }
        }
    }
}

/// Represents a job script accepted by the local backend.
#[derive(Debug, Clone)]
struct LocalJob {
    /// The execution id of the job.
    id: ExecutionId,
    /// The script to run.
    script: PathBuf,
    /// The working directory of the script.
    working_dir: PathBuf,
    /// The file receiving the script's stdout and stderr.
    log: PathBuf,
    /// Whether the script is currently running.
    running: bool,
    /// Cancelled when the job is killed.
    cancel: CancellationToken,
}

/// Represents the state of the local queue.
#[derive(Debug, Default)]
struct State {
    /// The execution id sequence.
    ids: IdSequence,
    /// The active jobs, keyed by execution id.
    active: HashMap<ExecutionId, LocalJob>,
    /// The order in which jobs run.
    queue: VecDeque<ExecutionId>,
}

impl State {
    /// Removes a job from the queue and the active set.
    fn remove(&mut self, id: ExecutionId) -> Option<LocalJob> {
        self.queue.retain(|i| *i != id);
        self.active.remove(&id)
    }
}

/// Represents the local execution backend.
///
/// <div class="warning">
/// Warning: job scripts run directly on the host without any isolation.
/// </div>
#[derive(Debug)]
pub struct LocalBackend {
    /// The backend configuration.
    config: LocalBackendConfig,
    /// The runner used to discover the host name.
    runner: Arc<dyn CommandRunner>,
    /// The name reported for the single worker node.
    node_name: RwLock<String>,
    /// The queue state, shared with the worker task.
    state: Arc<Mutex<State>>,
    /// Wakes the worker task when a job is submitted.
    notify: Arc<Notify>,
    /// Cancelled to stop the worker task.
    shutdown: CancellationToken,
    /// The worker task, once started.
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LocalBackend {
    /// Constructs a new local backend.
    ///
    /// No job runs until the backend is initialized.
    pub fn new(config: LocalBackendConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let node_name = config
            .node_name
            .clone()
            .unwrap_or_else(|| FALLBACK_NODE_NAME.to_string());

        Self {
            config,
            runner,
            node_name: RwLock::new(node_name),
            state: Default::default(),
            notify: Default::default(),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// Runs queued jobs until shut down.
    async fn run_queue(state: Arc<Mutex<State>>, notify: Arc<Notify>, shutdown: CancellationToken) {
        info!("local job execution started");

        loop {
            let next = {
                let mut guard = state.lock();
                let head = guard.queue.front().copied();
                head.and_then(|id| guard.active.get_mut(&id)).map(|job| {
                    job.running = true;
                    job.clone()
                })
            };

            let Some(job) = next else {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = shutdown.cancelled() => break,
                }
                continue;
            };

            tokio::select! {
                result = Self::run_job(&job) => match result {
                    Ok(status) => debug!(id = %job.id, status, "local job finished"),
                    Err(e) => error!(id = %job.id, "local job failed: {e:#}"),
                },
                _ = shutdown.cancelled() => break,
            }

            let mut guard = state.lock();
            // A killed job may already be gone; only remove the job we ran
            if guard.active.get(&job.id).is_some_and(|j| j.running) {
                guard.remove(job.id);
            }
        }

        info!("local job execution stopped");
    }

    /// Runs a single job script to completion or until killed.
    ///
    /// Returns the exit code of the script, or `-1` if it was killed.
    async fn run_job(job: &LocalJob) -> Result<i32> {
        if let Some(parent) = job.log.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create directory `{path}`",
                    path = parent.display()
                )
            })?;
        }

        let stdout = File::create(&job.log).with_context(|| {
            format!(
                "failed to create log file `{path}`",
                path = job.log.display()
            )
        })?;
        let stderr = stdout
            .try_clone()
            .context("failed to duplicate log file handle")?;

        let mut child = Command::new(&job.script)
            .current_dir(&job.working_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "failed to spawn job script `{path}`",
                    path = job.script.display()
                )
            })?;

        info!(id = %job.id, script = %job.script.display(), "spawned local job script");

        tokio::select! {
            status = child.wait() => {
                let status = status.context("failed to wait for job script")?;
                match status.code() {
                    Some(code) => Ok(code),
                    None => bail!("job script was terminated by a signal"),
                }
            }
            _ = job.cancel.cancelled() => {
                warn!(id = %job.id, "killing local job script");
                child.kill().await.context("failed to kill job script")?;
                Ok(-1)
            }
        }
    }

    /// Discovers the node name from the host.
    async fn discover_node_name(&self) -> Option<String> {
        match self.runner.run(&CommandSpec::new("hostname")).await {
            Ok(output) => output
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(String::from),
            Err(e) => {
                error!("failed to determine host name: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn initialize(&self, _: Option<&Path>) -> Result<()> {
        if self.config.node_name.is_none()
            && let Some(name) = self.discover_node_name().await
        {
            *self.node_name.write() = name;
        }

        let mut worker = self.worker.lock();
        if worker.is_none() {
            *worker = Some(tokio::spawn(Self::run_queue(
                self.state.clone(),
                self.notify.clone(),
                self.shutdown.clone(),
            )));
        }

        info!(node = %self.node_name.read(), "initialized local backend");
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.await.ok();
        }
    }

    async fn submit_script(&self, script: &Path, working_dir: &Path, log: &Path) -> ExecutionId {
        let mut state = self.state.lock();
        let State { ids, active, .. } = &mut *state;
        let Some(id) = ids.next(active) else {
            error!("no local execution ids are available");
            return ExecutionId::SUBMIT_FAILED;
        };

        state.active.insert(
            id,
            LocalJob {
                id,
                script: script.to_path_buf(),
                working_dir: working_dir.to_path_buf(),
                log: log.to_path_buf(),
                running: false,
                cancel: CancellationToken::new(),
            },
        );
        state.queue.push_back(id);
        drop(state);

        self.notify.notify_one();
        debug!(%id, script = %script.display(), "queued local job script");
        id
    }

    async fn kill_pair(&self, id: ExecutionId) -> bool {
        // Killing an unknown id is not an error
        if let Some(job) = self.state.lock().remove(id) {
            job.cancel.cancel();
        }

        true
    }

    async fn kill_all(&self) -> bool {
        let mut state = self.state.lock();
        state.queue.clear();
        for (_, job) in state.active.drain() {
            job.cancel.cancel();
        }

        true
    }

    async fn worker_nodes(&self) -> Result<Vec<String>> {
        Ok(vec![self.node_name.read().clone()])
    }

    async fn queues(&self) -> Result<Vec<String>> {
        Ok(vec![self.config.queue_name.clone()])
    }

    async fn node_queue_associations(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::from([(
            self.node_name.read().clone(),
            self.config.queue_name.clone(),
        )]))
    }

    async fn move_node(&self, _: &str, _: &str) -> bool {
        false
    }

    async fn create_queue_with_slots(
        &self,
        _: &str,
        _: &[String],
        _: &[Option<String>],
        _: i64,
    ) -> bool {
        false
    }

    async fn delete_queue(&self, _: &str) -> bool {
        false
    }

    async fn active_execution_ids(&self) -> Result<HashSet<ExecutionId>> {
        Ok(self.state.lock().active.keys().copied().collect())
    }

    async fn clear_node_error_states(&self) -> bool {
        true
    }

    async fn running_jobs_status(&self) -> Result<String> {
        let state = self.state.lock();
        let mut status = String::new();
        for job in state.queue.iter().filter_map(|id| state.active.get(id)) {
            // Writing to a string cannot fail
            let _ = writeln!(
                status,
                "{script} {id} {state}",
                script = job.script.display(),
                id = job.id,
                state = if job.running { "running" } else { "pending" }
            );
        }

        Ok(status)
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
