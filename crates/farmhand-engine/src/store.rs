//! The persistence contract of the dispatch core.
//!
//! Jobs and pairs are owned by the store; the dispatch core only holds the
//! copies it needs for one tick.

use std::collections::HashMap;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;

use crate::ExecutionId;
use crate::JobId;
use crate::PairId;
use crate::ProcessorId;
use crate::UserId;
use crate::monitor::Load;

mod models;

pub use models::Benchmark;
pub use models::Configuration;
pub use models::Job;
pub use models::JobPair;
pub use models::JobStatus;
pub use models::PairStatus;
pub use models::PostProcessingItem;
pub use models::Processor;
pub use models::ResourceLimits;
pub use models::ResourceUsage;
pub use models::Solver;
pub use models::Stage;

/// Represents the persistence layer consumed by the dispatch core.
#[async_trait]
pub trait PairStore: Send + Sync + fmt::Debug {
    /// Stores a job and its pairs.
    ///
    /// Returns the stored job with ids assigned.
    async fn add_job(&self, job: Job) -> Result<Job>;

    /// Gets the pairs eligible for dispatch, in dispatch order.
    ///
    /// These are pairs that were never submitted and enqueued pairs that
    /// have no execution handle yet.
    async fn get_eligible_pairs_for_dispatch(&self) -> Result<Vec<JobPair>>;

    /// Records the execution handle a backend assigned to a pair.
    async fn record_execution_handle(&self, pair: PairId, handle: ExecutionId) -> Result<()>;

    /// Sets the status of a pair.
    ///
    /// Returns `false` if the transition is not allowed and nothing changed.
    async fn set_pair_status(&self, pair: PairId, status: PairStatus) -> Result<bool>;

    /// Gets the stages awaiting post-processing.
    async fn get_pairs_awaiting_post_processing(&self) -> Result<Vec<PostProcessingItem>>;

    /// Marks a stage of a pair as post-processed.
    async fn mark_post_processed(&self, pair: PairId, stage: i64) -> Result<()>;

    /// Gets a pair.
    async fn get_pair(&self, pair: PairId) -> Result<Option<JobPair>>;

    /// Gets a job with its pairs and aggregate status.
    async fn get_job(&self, job: JobId) -> Result<Option<Job>>;

    /// Stores a processor.
    async fn add_processor(&self, processor: Processor) -> Result<Processor>;

    /// Gets a processor.
    async fn get_processor(&self, processor: ProcessorId) -> Result<Option<Processor>>;

    /// Gets the pairs currently held by the backend: enqueued or running with
    /// an execution handle, and not yet reported finished.
    async fn get_pairs_in_backend(&self) -> Result<Vec<JobPair>>;

    /// Gets the load of each user on a queue: the sum of the wallclock
    /// timeouts of the user's pairs held by the backend.
    async fn get_user_loads_on_queue(&self, queue: &str) -> Result<HashMap<UserId, Load>>;

    /// Counts the pairs of a queue held by the backend.
    async fn count_pairs_in_queue(&self, queue: &str) -> Result<u64>;

    /// Sets a pair to `Error`, recording the reason.
    ///
    /// Returns `false` if the pair was already in a terminal status.
    async fn set_pair_error(&self, pair: PairId, reason: &str) -> Result<bool>;

    /// Adds the attributes extracted from a stage's output.
    async fn add_pair_attributes(
        &self,
        pair: PairId,
        stage: i64,
        attributes: &IndexMap<String, String>,
    ) -> Result<()>;

    /// Records that a stage of a pair has finished running.
    ///
    /// If the pair has a post processor, the stage is queued for
    /// post-processing.
    async fn complete_stage(&self, pair: PairId, stage: i64) -> Result<()>;

    /// Records that the job script of a pair has finished.
    ///
    /// The pair leaves the backend's work without changing status. When
    /// `usage` is given it is stored, and the unused part of the pair's
    /// wallclock timeout becomes a load credit of the owner on the pair's
    /// queue.
    ///
    /// Returns `false` if the pair was already reported finished.
    async fn finish_pair(&self, pair: PairId, usage: Option<ResourceUsage>) -> Result<bool>;

    /// Takes the pending load credits of each user on a queue.
    ///
    /// Taken credits are cleared.
    async fn take_load_credits(&self, queue: &str) -> Result<HashMap<UserId, Load>>;
}
