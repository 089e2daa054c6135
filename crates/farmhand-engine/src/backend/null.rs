//! A backend that runs nothing.
//!
//! Useful for exercising the rest of the system without a scheduler: every
//! submission fails and the cluster has no nodes or queues.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::ExecutionBackend;
use super::ExecutionId;

/// Represents the null execution backend.
#[derive(Debug, Default)]
pub struct NullBackend;

impl NullBackend {
    /// Constructs a new null backend.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecutionBackend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    async fn initialize(&self, _: Option<&Path>) -> Result<()> {
        Ok(())
    }

    async fn submit_script(&self, script: &Path, _: &Path, _: &Path) -> ExecutionId {
        debug!(script = %script.display(), "null backend rejecting submission");
        ExecutionId::SUBMIT_FAILED
    }

    async fn kill_pair(&self, _: ExecutionId) -> bool {
        false
    }

    async fn kill_all(&self) -> bool {
        false
    }

    async fn worker_nodes(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn queues(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn node_queue_associations(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
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
        Ok(HashSet::new())
    }

    async fn clear_node_error_states(&self) -> bool {
        false
    }

    async fn running_jobs_status(&self) -> Result<String> {
        Ok(String::new())
    }
}
