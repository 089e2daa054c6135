//! Job dispatch and cluster orchestration core.
//!
//! A *job pair* is one execution of a solver configuration against a
//! benchmark. This crate turns pending job pairs into executable scripts,
//! hands them to a batch scheduler through an [`ExecutionBackend`], keeps
//! submission fair between users with a [`FairShareLoadMonitor`] and drives
//! the post-processing of completed output with a
//! [`PostProcessingCoordinator`].
//!
//! The periodic ticks that tie these together live in [`Scheduler`]; the
//! progress reported by running job scripts is applied through [`report`].

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod monitor;
pub mod post;
pub mod report;
pub mod scheduler;
pub mod store;

pub use backend::ExecutionBackend;
pub use backend::ExecutionId;
pub use config::EngineConfig;
pub use dispatch::JobDispatcher;
pub use monitor::FairShareLoadMonitor;
pub use post::PostProcessingCoordinator;
pub use scheduler::Scheduler;
pub use store::PairStore;

/// The identifier of a user.
pub type UserId = i64;

/// The identifier of a job.
pub type JobId = i64;

/// The identifier of a job pair.
pub type PairId = i64;

/// The identifier of a post processor.
pub type ProcessorId = i64;

#[cfg(test)]
pub(crate) mod test_support;
