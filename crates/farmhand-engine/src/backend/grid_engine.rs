//! Grid engine (SGE) execution backend.
//!
//! Submission and queries go through the standard `qsub`, `qstat`, `qdel` and
//! `qconf` tools. Topology mutations run `qconf` as the administrative user,
//! with `SGE_ROOT` set to the configured installation root.
//!
//! Each queue `<name>.q` is served by a host group named `@<name>hosts`;
//! moving a node between queues is a matter of moving it between host groups.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::LazyLock;

use anyhow::Context as _;
use anyhow::Result;
use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::CommandRunner;
use super::CommandSpec;
use super::ExecutionBackend;
use super::ExecutionId;
use super::short_name;
use crate::config::GridEngineBackendConfig;

/// Matches a `queue@host.domain` instance in `qstat -f` output.
static QUEUE_INSTANCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // SAFETY: this is checked statically with tests to always unwrap.
    Regex::new(r"(?i)\b[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,16}\b").unwrap()
});

/// The queue attributes written for a newly created queue, after `qname`,
/// `hostlist` and `slots`.
const QUEUE_DEFAULTS: &[(&str, &str)] = &[
    ("seq_no", "0"),
    ("load_thresholds", "np_load_avg=1.75"),
    ("suspend_thresholds", "NONE"),
    ("nsuspend", "1"),
    ("suspend_interval", "00:05:00"),
    ("priority", "0"),
    ("min_cpu_interval", "00:05:00"),
    ("processors", "UNDEFINED"),
    ("qtype", "BATCH INTERACTIVE"),
    ("ckpt_list", "NONE"),
    ("pe_list", "make"),
    ("rerun", "FALSE"),
    ("tmpdir", "/tmp"),
    ("shell", "/bin/bash"),
    ("prolog", "NONE"),
    ("epilog", "NONE"),
    ("shell_start_mode", "posix_compliant"),
    ("starter_method", "NONE"),
    ("suspend_method", "NONE"),
    ("resume_method", "NONE"),
    ("terminate_method", "NONE"),
    ("notify", "00:00:60"),
    ("owner_list", "NONE"),
    ("user_lists", "NONE"),
    ("xuser_lists", "NONE"),
    ("subordinate_list", "NONE"),
    ("complex_values", "NONE"),
    ("projects", "NONE"),
    ("xprojects", "NONE"),
    ("calendar", "NONE"),
    ("initial_state", "default"),
    ("s_rt", "INFINITY"),
    ("h_rt", "INFINITY"),
    ("s_cpu", "INFINITY"),
    ("h_cpu", "INFINITY"),
    ("s_fsize", "INFINITY"),
    ("h_fsize", "INFINITY"),
    ("s_data", "INFINITY"),
    ("h_data", "INFINITY"),
    ("s_stack", "INFINITY"),
    ("h_stack", "INFINITY"),
    ("s_core", "INFINITY"),
    ("h_core", "INFINITY"),
    ("s_rss", "INFINITY"),
    ("h_rss", "INFINITY"),
    ("s_vmem", "INFINITY"),
    ("h_vmem", "INFINITY"),
];

/// Gets the name of the host group serving the given queue.
fn host_group(queue: &str) -> String {
    format!("@{short}hosts", short = short_name(queue))
}

/// Parses the job id printed by `qsub -terse`.
///
/// Array jobs print `<id>.<range>`; only the job id is kept.
fn parse_submit_output(output: &str) -> Option<i64> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    line.split('.').next()?.parse().ok()
}

/// Parses the job ids out of `qstat` output.
///
/// The header and separator lines do not start with a number and are skipped.
fn parse_active_ids(output: &str) -> HashSet<ExecutionId> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|token| token.parse::<i64>().ok())
        .map(ExecutionId::new)
        .collect()
}

/// Parses the node to queue associations out of `qstat -f` output.
fn parse_associations(output: &str) -> HashMap<String, String> {
    QUEUE_INSTANCE_REGEX
        .find_iter(output)
        .filter_map(|m| {
            let (queue, node) = m.as_str().split_once('@')?;
            Some((node.to_string(), queue.to_string()))
        })
        .collect()
}

/// Parses the `slots` attribute out of `qconf -sq` output.
///
/// Host specific overrides (`1,[n001=2]`) are ignored.
fn parse_slots(output: &str) -> Option<u64> {
    output.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? != "slots" {
            return None;
        }

        parts.next()?.split(',').next()?.parse().ok()
    })
}

/// Parses a newline-delimited listing into its non-empty entries.
fn parse_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Renders the host group definition for a queue.
fn render_host_group(queue: &str, nodes: &[String]) -> String {
    let hosts: Vec<&str> = nodes.iter().map(|n| short_name(n)).collect();
    format!(
        "group_name {group}\nhostlist {hosts}\n",
        group = host_group(queue),
        hosts = if hosts.is_empty() {
            "NONE".to_string()
        } else {
            hosts.join(" ")
        }
    )
}

/// Renders the queue definition for a queue.
fn render_queue(queue: &str, slots: i64) -> String {
    let mut conf = String::new();
    // Writing to a string cannot fail
    let _ = writeln!(conf, "{:<22}{queue}", "qname");
    let _ = writeln!(conf, "{:<22}{group}", "hostlist", group = host_group(queue));
    let _ = writeln!(conf, "{:<22}{slots}", "slots");
    for (key, value) in QUEUE_DEFAULTS {
        let _ = writeln!(conf, "{key:<22}{value}");
    }
    conf
}

/// Writes a `qconf` definition file readable by the administrative user.
fn write_definition(contents: &str, suffix: &str) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("farmhand-")
        .suffix(suffix)
        .tempfile()
        .context("failed to create queue definition file")?;
    file.write_all(contents.as_bytes())
        .context("failed to write queue definition file")?;
    file.flush()
        .context("failed to write queue definition file")?;

    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;

        std::fs::set_permissions(file.path(), Permissions::from_mode(0o644)).with_context(
            || {
                format!(
                    "failed to set permissions of `{path}`",
                    path = file.path().display()
                )
            },
        )?;
    }

    Ok(file)
}

/// Represents the grid engine execution backend.
#[derive(Debug)]
pub struct GridEngineBackend {
    /// The backend configuration.
    config: GridEngineBackendConfig,
    /// The runner used for scheduler commands.
    runner: Arc<dyn CommandRunner>,
    /// The installation root, replaced by `initialize`.
    root: RwLock<PathBuf>,
    /// Serializes state-mutating operations.
    lock: Mutex<()>,
}

impl GridEngineBackend {
    /// Constructs a new grid engine backend.
    pub fn new(config: GridEngineBackendConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let root = config.root.clone();
        Self {
            config,
            runner,
            root: RwLock::new(root),
            lock: Mutex::new(()),
        }
    }

    /// Creates a command for a scheduler tool.
    fn command(&self, program: &str) -> CommandSpec {
        CommandSpec::new(program)
            .env("SGE_ROOT", self.root.read().display().to_string())
            .timeout(self.config.command_timeout())
    }

    /// Creates a scheduler command run as the administrative user.
    fn admin(&self, program: &str) -> CommandSpec {
        if self.config.use_sudo {
            self.command("sudo")
                .args(["-u", self.config.admin_user.as_str()])
                .arg(program)
        } else {
            self.command(program)
        }
    }

    /// Creates an administrative `qconf` command.
    fn admin_command(&self) -> CommandSpec {
        self.admin(&self.config.qconf_path)
    }

    /// Runs a command, logging and converting any failure.
    async fn run(&self, command: CommandSpec) -> Result<String> {
        match self.runner.run(&command).await {
            Ok(output) => Ok(output),
            Err(e) => {
                error!(%command, "grid engine command failed: {e}");
                Err(anyhow!(e).context(format!("failed to run `{command}`")))
            }
        }
    }

    /// Gets the number of slots each node of a queue provides.
    pub async fn slots_in_queue(&self, queue: &str) -> Result<u64> {
        let output = self.run(self.command("qconf").args(["-sq", queue])).await?;
        parse_slots(&output)
            .with_context(|| format!("queue `{queue}` does not define a slot count"))
    }

    /// Removes a node from the host group of a queue.
    async fn remove_from_queue(&self, node: &str, queue: &str) -> Result<()> {
        self.run(
            self.admin_command()
                .args(["-dattr", "hostgroup", "hostlist", node])
                .arg(host_group(queue)),
        )
        .await
        .map(|_| ())
    }

    /// Adds a node to the host group of a queue.
    async fn add_to_queue(&self, node: &str, queue: &str) -> Result<()> {
        self.run(
            self.admin_command()
                .args(["-aattr", "hostgroup", "hostlist", node])
                .arg(host_group(queue)),
        )
        .await
        .map(|_| ())
    }

    /// Creates the host group and queue definitions of a new queue.
    async fn add_queue(
        &self,
        name: &str,
        nodes: &[String],
        source_queues: &[Option<String>],
        slots: i64,
    ) -> Result<()> {
        for (node, source) in nodes.iter().zip(source_queues) {
            // Orphaned nodes have no host group to leave
            if let Some(source) = source {
                self.remove_from_queue(node, source).await?;
            }
        }

        let group = write_definition(&render_host_group(name, nodes), ".hgrp")?;
        self.run(
            self.admin_command()
                .arg("-Ahgrp")
                .arg(group.path().display().to_string()),
        )
        .await?;

        let queue = write_definition(&render_queue(name, slots), ".q")?;
        self.run(
            self.admin_command()
                .arg("-Aq")
                .arg(queue.path().display().to_string()),
        )
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ExecutionBackend for GridEngineBackend {
    fn name(&self) -> &'static str {
        "grid engine"
    }

    async fn initialize(&self, root: Option<&Path>) -> Result<()> {
        if let Some(root) = root {
            *self.root.write() = root.to_path_buf();
        }

        let root = self.root.read().clone();
        info!(root = %root.display(), "initialized grid engine backend");
        Ok(())
    }

    async fn submit_script(&self, script: &Path, working_dir: &Path, log: &Path) -> ExecutionId {
        let _guard = self.lock.lock().await;

        let command = self
            .command("qsub")
            .args(["-terse", "-shell", "y", "-b", "n", "-w", "n", "-wd"])
            .arg(working_dir.display().to_string())
            .args(["-j", "y", "-o"])
            .arg(format!(":{log}", log = log.display()))
            .arg(script.display().to_string());

        debug!(%command, "submitting job script");

        let output = match self.run(command).await {
            Ok(output) => output,
            Err(_) => return ExecutionId::SUBMIT_FAILED,
        };

        match parse_submit_output(&output) {
            Some(id) if id >= 0 => ExecutionId::new(id),
            _ => {
                error!(
                    script = %script.display(),
                    output = output.trim(),
                    "`qsub` did not report a job id"
                );
                ExecutionId::SUBMIT_FAILED
            }
        }
    }

    async fn kill_pair(&self, id: ExecutionId) -> bool {
        let _guard = self.lock.lock().await;
        self.run(self.command("qdel").arg(id.to_string()))
            .await
            .is_ok()
    }

    async fn kill_all(&self) -> bool {
        let ids = match self.active_execution_ids().await {
            Ok(ids) => ids,
            Err(_) => return false,
        };

        let _guard = self.lock.lock().await;
        let mut all = true;
        for id in ids {
            all &= self
                .run(self.command("qdel").arg(id.to_string()))
                .await
                .is_ok();
        }

        all
    }

    async fn worker_nodes(&self) -> Result<Vec<String>> {
        let output = self.run(self.command("qconf").arg("-sel")).await?;
        Ok(parse_list(&output))
    }

    async fn queues(&self) -> Result<Vec<String>> {
        let output = self.run(self.command("qconf").arg("-sql")).await?;
        Ok(parse_list(&output))
    }

    async fn node_queue_associations(&self) -> Result<HashMap<String, String>> {
        let output = self.run(self.command("qstat").arg("-f")).await?;
        Ok(parse_associations(&output))
    }

    async fn queue_slots(&self, queue: &str) -> Result<Option<u64>> {
        self.slots_in_queue(queue).await.map(Some)
    }

    async fn move_node(&self, node: &str, queue: &str) -> bool {
        let queues = match self.queues().await {
            Ok(queues) => queues,
            Err(_) => return false,
        };

        if !queues.iter().any(|q| q == queue) {
            warn!(node, queue, "refusing to move node into a queue that does not exist");
            return false;
        }

        let current = match self.node_queue_associations().await {
            Ok(associations) => associations.get(node).cloned(),
            Err(_) => return false,
        };

        let _guard = self.lock.lock().await;
        if let Some(current) = current {
            if current == queue {
                debug!(node, queue, "node is already in the queue");
                return true;
            }

            if self.remove_from_queue(node, &current).await.is_err() {
                return false;
            }
        }

        self.add_to_queue(node, queue).await.is_ok()
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

        if name.is_empty() || nodes.len() != source_queues.len() {
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
        match self.add_queue(name, nodes, source_queues, slots).await {
            Ok(()) => {
                info!(queue = name, slots, nodes = nodes.len(), "created queue");
                true
            }
            Err(e) => {
                error!(queue = name, "failed to create queue: {e:#}");
                false
            }
        }
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
        if self
            .run(self.admin_command().args(["-dq", name]))
            .await
            .is_err()
        {
            return false;
        }

        self.run(self.admin_command().arg("-dhgrp").arg(host_group(name)))
            .await
            .is_ok()
    }

    async fn active_execution_ids(&self) -> Result<HashSet<ExecutionId>> {
        let output = self.run(self.command("qstat").args(["-s", "a"])).await?;
        Ok(parse_active_ids(&output))
    }

    async fn clear_node_error_states(&self) -> bool {
        let _guard = self.lock.lock().await;
        self.run(self.admin("qmod").args(["-c", "*"]))
            .await
            .is_ok()
    }

    async fn running_jobs_status(&self) -> Result<String> {
        self.run(self.command("qstat").arg("-f")).await
    }
}
