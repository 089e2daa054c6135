//! Implementation of execution backends.
//!
//! An execution backend is the boundary between the dispatch core and the
//! system that actually runs job scripts: a batch scheduler reached through
//! its command line tools, or an in-process queue on a single node.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::config::BackendConfig;

pub mod command;
pub mod grid_engine;
pub mod local;
pub mod null;
pub mod oar;

pub use command::CommandRunner;
pub use command::CommandSpec;
pub use command::SystemCommandRunner;
pub use grid_engine::GridEngineBackend;
pub use local::LocalBackend;
pub use null::NullBackend;
pub use oar::OarBackend;

/// Represents an execution handle issued by a backend upon submission.
///
/// A non-negative value identifies accepted work. Negative values signal a
/// failed submission; callers key off the sign alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(i64);

impl ExecutionId {
    /// The handle returned when a submission fails.
    pub const SUBMIT_FAILED: Self = Self(-1);

    /// Creates an execution id from a raw scheduler id.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Gets the raw value of the execution id.
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Determines if the execution id signals a failed submission.
    pub const fn is_error(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ExecutionId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Represents an execution backend.
///
/// Submission and kill operations report failure through their return value
/// rather than an error: a scheduler that is briefly unavailable is routine
/// and must never abort the caller's loop. Topology queries return an error
/// that has already been logged by the backend.
///
/// All state-mutating operations of an implementation are serialized
/// internally; a backend is shared by every tick of the process.
#[async_trait]
pub trait ExecutionBackend: Send + Sync + fmt::Debug {
    /// Gets the name of the backend, used in log messages.
    fn name(&self) -> &'static str;

    /// Prepares backend session state.
    ///
    /// The `root` is the installation root of the scheduler, if any.
    ///
    /// Calling other methods without initializing first is allowed; backends
    /// that need a session fall back to their defaults.
    async fn initialize(&self, root: Option<&Path>) -> Result<()>;

    /// Releases any session state held by the backend.
    async fn shutdown(&self) {}

    /// Determines if the given execution id represents a failed submission.
    fn is_error(&self, id: ExecutionId) -> bool {
        id.is_error()
    }

    /// Submits a fully materialized, executable script.
    ///
    /// Returns [`ExecutionId::SUBMIT_FAILED`] if the backend did not accept
    /// the script.
    async fn submit_script(&self, script: &Path, working_dir: &Path, log: &Path) -> ExecutionId;

    /// Kills the work associated with an execution id.
    ///
    /// This is best-effort and does not wait for the backend to confirm.
    async fn kill_pair(&self, id: ExecutionId) -> bool;

    /// Kills all work known to the backend.
    async fn kill_all(&self) -> bool;

    /// Gets the names of the worker nodes.
    async fn worker_nodes(&self) -> Result<Vec<String>>;

    /// Gets the names of the queues.
    async fn queues(&self) -> Result<Vec<String>>;

    /// Gets the association of worker node to queue.
    async fn node_queue_associations(&self) -> Result<HashMap<String, String>>;

    /// Gets the number of slots each node of a queue provides.
    ///
    /// Returns `None` for a backend without a notion of slots.
    async fn queue_slots(&self, _queue: &str) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Moves a node into the given queue.
    ///
    /// Returns `false` without mutating anything if the destination queue does
    /// not exist.
    async fn move_node(&self, node: &str, queue: &str) -> bool;

    /// Creates a queue with the given nodes and number of slots per node.
    ///
    /// `source_queues` holds the current queue of each node (`None` for an
    /// orphaned node) and must be the same length as `nodes`.
    ///
    /// Returns `false` without mutating anything if the slot count is not
    /// positive or the request is otherwise invalid.
    async fn create_queue_with_slots(
        &self,
        name: &str,
        nodes: &[String],
        source_queues: &[Option<String>],
        slots: i64,
    ) -> bool;

    /// Deletes a queue.
    ///
    /// Returns `false` without mutating anything if the queue does not exist
    /// or still has nodes associated with it.
    async fn delete_queue(&self, name: &str) -> bool;

    /// Gets the set of execution ids the backend currently considers active.
    async fn active_execution_ids(&self) -> Result<HashSet<ExecutionId>>;

    /// Clears any error states of the worker nodes.
    async fn clear_node_error_states(&self) -> bool;

    /// Gets a human readable dump of the work known to the backend.
    async fn running_jobs_status(&self) -> Result<String>;
}

/// Creates the execution backend for the given configuration.
pub fn from_config(config: &BackendConfig) -> Arc<dyn ExecutionBackend> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new());
    match config {
        BackendConfig::GridEngine(config) => {
            Arc::new(GridEngineBackend::new(config.clone(), runner))
        }
        BackendConfig::Oar(config) => Arc::new(OarBackend::new(config.clone(), runner)),
        BackendConfig::Local(config) => Arc::new(LocalBackend::new(config.clone(), runner)),
        BackendConfig::Null => Arc::new(NullBackend::new()),
    }
}

/// Gets the short name of a queue or node (the part before the first `.`).
pub(crate) fn short_name(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}
