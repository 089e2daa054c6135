//! OAR execution backend.
//!
//! Jobs are submitted with `oarsub` requesting a single cpuset. Queues are
//! managed with `oarnotify` and nodes are assigned to queues through the
//! `queue` resource property with `oarnodesetting`.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::LazyLock;

use anyhow::Result;
use anyhow::anyhow;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::CommandRunner;
use super::CommandSpec;
use super::ExecutionBackend;
use super::ExecutionId;
use crate::config::OarBackendConfig;

/// Matches the job id printed by `oarsub`.
static JOB_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // SAFETY: this is checked statically with tests to always unwrap.
    Regex::new(r"(?i)OAR_JOB_ID=(-?\d+)").unwrap()
});

/// The scheduler used for queues created by the backend.
const QUEUE_SCHEDULER: &str = "oar_sched_gantt_with_timesharing";

/// Parses the job id out of `oarsub` output.
fn parse_submit_output(output: &str) -> Option<i64> {
    JOB_ID_REGEX.captures(output)?.get(1)?.as_str().parse().ok()
}

/// Parses the active queues out of `oarnotify -l` output.
///
/// Each queue is a name line followed by `key = value` lines; only queues
/// whose state is `Active` are returned.
fn parse_queues(output: &str) -> Vec<String> {
    let mut queues = Vec::new();
    let mut current: Option<&str> = None;
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match line.split_once('=') {
            None => current = Some(line),
            Some((key, value)) => {
                if key.trim() == "state"
                    && value.trim() == "Active"
                    && let Some(name) = current.take()
                {
                    queues.push(name.to_string());
                }
            }
        }
    }

    queues
}

/// Parses the node to queue associations out of `oarnodes -J` output.
///
/// Resources without a queue are left out.
fn parse_associations(output: &str) -> Result<HashMap<String, String>> {
    let value: Value = serde_json::from_str(output)?;
    let resources = value
        .as_object()
        .ok_or_else(|| anyhow!("`oarnodes` output is not a JSON object"))?;

    Ok(resources
        .values()
        .filter_map(|resource| {
            let node = resource.get("network_address")?.as_str()?;
            let queue = resource.get("queue")?.as_str()?;
            Some((node.to_string(), queue.to_string()))
        })
        .collect())
}

/// Parses the job ids out of `oarstat -J` output.
///
/// `oarstat` prints nothing parseable when no jobs exist, so malformed output
/// is an empty set.
fn parse_active_ids(output: &str) -> HashSet<ExecutionId> {
    let Ok(Value::Object(jobs)) = serde_json::from_str::<Value>(output) else {
        return HashSet::new();
    };

    jobs.values()
        .filter_map(|job| job.get("Job_Id")?.as_i64())
        .map(ExecutionId::new)
        .collect()
}

/// Represents the OAR execution backend.
#[derive(Debug)]
pub struct OarBackend {
    /// The backend configuration.
    config: OarBackendConfig,
    /// The runner used for scheduler commands.
    runner: Arc<dyn CommandRunner>,
    /// Serializes state-mutating operations.
    lock: Mutex<()>,
}

impl OarBackend {
    /// Constructs a new OAR backend.
    pub fn new(config: OarBackendConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            lock: Mutex::new(()),
        }
    }

    /// Creates a command for a scheduler tool.
    fn command(&self, program: &str) -> CommandSpec {
        CommandSpec::new(program).timeout(self.config.command_timeout())
    }

    /// Runs a command, logging and converting any failure.
    async fn run(&self, command: CommandSpec) -> Result<String> {
        match self.runner.run(&command).await {
            Ok(output) => Ok(output),
            Err(e) => {
                error!(%command, "OAR command failed: {e}");
                Err(anyhow!(e).context(format!("failed to run `{command}`")))
            }
        }
    }

    /// Assigns a node to a queue without checking that the queue exists.
    async fn assign(&self, node: &str, queue: &str) -> Result<()> {
        self.run(
            self.command("oarnodesetting")
                .arg("--sql")
                .arg(format!("network_address='{node}'"))
                .arg("-p")
                .arg(format!("queue={queue}")),
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl ExecutionBackend for OarBackend {
    fn name(&self) -> &'static str {
        "OAR"
    }

    async fn initialize(&self, _: Option<&Path>) -> Result<()> {
        info!("initialized OAR backend");
        Ok(())
    }

    async fn submit_script(&self, script: &Path, working_dir: &Path, log: &Path) -> ExecutionId {
        let _guard = self.lock.lock().await;

        let log = log.display().to_string();
        let command = self
            .command("oarsub")
            .arg("-O")
            .arg(log.as_str())
            .arg("-E")
            .arg(log.as_str())
            .arg("-d")
            .arg(working_dir.display().to_string())
            .args(["-l", "/cpuset=1", "-S"])
            .arg(script.display().to_string());

        debug!(%command, "submitting job script");

        let output = match self.run(command).await {
            Ok(output) => output,
            Err(_) => return ExecutionId::SUBMIT_FAILED,
        };

        match parse_submit_output(&output) {
            Some(id) => ExecutionId::new(id),
            None => {
                warn!(
                    script = %script.display(),
                    "`oarsub` did not report a job id"
                );
                ExecutionId::SUBMIT_FAILED
            }
        }
    }

    async fn kill_pair(&self, id: ExecutionId) -> bool {
        let _guard = self.lock.lock().await;
        self.run(self.command("oardel").arg(id.to_string()))
            .await
            .is_ok()
    }

    async fn kill_all(&self) -> bool {
        let ids = match self.active_execution_ids().await {
            Ok(ids) => ids,
            Err(_) => return false,
        };

        let _guard = self.lock.lock().await;
        for id in ids {
            if self
                .run(self.command("oardel").arg(id.to_string()))
                .await
                .is_err()
            {
                error!(%id, "unable to kill job");
            }
        }

        true
    }

    async fn worker_nodes(&self) -> Result<Vec<String>> {
        let output = self.run(self.command("oarnodes").arg("-l")).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn queues(&self) -> Result<Vec<String>> {
        let output = self.run(self.command("oarnotify").arg("-l")).await?;
        Ok(parse_queues(&output))
    }

    async fn node_queue_associations(&self) -> Result<HashMap<String, String>> {
        let output = self.run(self.command("oarnodes").arg("-J")).await?;
        parse_associations(&output).inspect_err(|e| {
            error!("failed to parse `oarnodes` output: {e:#}");
        })
    }

    async fn move_node(&self, node: &str, queue: &str) -> bool {
        match self.queues().await {
            Ok(queues) if queues.iter().any(|q| q == queue) => {}
            Ok(_) => {
                warn!(node, queue, "refusing to move node into a queue that does not exist");
                return false;
            }
            Err(_) => return false,
        }

        let _guard = self.lock.lock().await;
        self.assign(node, queue).await.is_ok()
    }

    async fn create_queue_with_slots(
        &self,
        name: &str,
        nodes: &[String],
        source_queues: &[Option<String>],
        slots: i64,
    ) -> bool {
        if slots <= 0 {
            warn!(queue = name, slots, "refusing to create a queue without slots");
            return false;
        }

        if name.is_empty() || name.contains(',') || nodes.len() != source_queues.len() {
            warn!(queue = name, "refusing to create queue from an invalid request");
            return false;
        }

        match self.queues().await {
            Ok(queues) if queues.iter().any(|q| q == name) => {
                warn!(queue = name, "refusing to create a queue that already exists");
                return false;
            }
            Ok(_) => {}
            Err(_) => return false,
        }

        let _guard = self.lock.lock().await;
        if self
            .run(
                self.command("oarnotify")
                    .arg("--add_queue")
                    .arg(format!("{name},1,{QUEUE_SCHEDULER}")),
            )
            .await
            .is_err()
        {
            return false;
        }

        // OAR has no per-queue slot count; every node contributes its cpusets
        for node in nodes {
            if self.assign(node, name).await.is_err() {
                return false;
            }
        }

        info!(queue = name, nodes = nodes.len(), "created queue");
        true
    }

    async fn delete_queue(&self, name: &str) -> bool {
        match self.queues().await {
            Ok(queues) if !queues.iter().any(|q| q == name) => {
                warn!(queue = name, "refusing to delete a queue that does not exist");
                return false;
            }
            Ok(_) => {}
            Err(_) => return false,
        }

        match self.node_queue_associations().await {
            Ok(associations) if associations.values().any(|q| q == name) => {
                warn!(queue = name, "refusing to delete a queue that still has nodes");
                return false;
            }
            Ok(_) => {}
            Err(_) => return false,
        }

        let _guard = self.lock.lock().await;

        // Resources may still reference the queue without being reported as
        // nodes of it; make sure they are assigned nowhere
        if self
            .run(
                self.command("oarnodesetting")
                    .arg("--sql")
                    .arg(format!("queue='{name}'"))
                    .args(["-p", "queue=null"]),
            )
            .await
            .is_err()
        {
            return false;
        }

        self.run(self.command("oarnotify").args(["--remove_queue", name]))
            .await
            .is_ok()
    }

    async fn active_execution_ids(&self) -> Result<HashSet<ExecutionId>> {
        let output = self.run(self.command("oarstat").arg("-J")).await?;
        Ok(parse_active_ids(&output))
    }

    async fn clear_node_error_states(&self) -> bool {
        let _guard = self.lock.lock().await;
        self.run(self.command("oarnodesetting").args([
            "--sql",
            "state='Suspected'",
            "-s",
            "Alive",
        ]))
        .await
        .is_ok()
    }

    async fn running_jobs_status(&self) -> Result<String> {
        self.run(self.command("oarstat")).await
    }
}
