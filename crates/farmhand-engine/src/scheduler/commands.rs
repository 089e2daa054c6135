//! Scheduler command types.

use anyhow::Result;
use tokio::sync::oneshot;

use crate::PairId;
use crate::dispatch::DispatchReport;
use crate::scheduler::ClusterSnapshot;
use crate::store::Job;

/// Commands sent to a running scheduler.
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Store a job and submit its pairs.
    SubmitJob {
        /// The job to submit.
        job: Job,
        /// Channel to send the response back.
        rx: oneshot::Sender<Result<(Job, DispatchReport)>>,
    },

    /// Kill a single pair.
    KillPair {
        /// The pair to kill.
        pair: PairId,
        /// Channel to send the response back.
        rx: oneshot::Sender<Result<bool>>,
    },

    /// Kill every pair held by the backend.
    KillAll {
        /// Channel to send the response back.
        rx: oneshot::Sender<Result<usize>>,
    },

    /// Get the latest cluster topology.
    Topology {
        /// Channel to send the response back.
        rx: oneshot::Sender<ClusterSnapshot>,
    },

    /// Check that the scheduler is responsive.
    Ping {
        /// Channel to send the response back.
        rx: oneshot::Sender<()>,
    },
}
