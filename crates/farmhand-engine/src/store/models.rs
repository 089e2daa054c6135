//! Models of the persistence contract.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::ExecutionId;
use crate::JobId;
use crate::PairId;
use crate::ProcessorId;
use crate::UserId;
use crate::monitor::Load;

/// The number of milliseconds in a second.
const MILLIS_PER_SECOND: u64 = 1000;

/// Job pair lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairStatus {
    /// The pair has not been submitted yet.
    #[default]
    Created,
    /// The pair has been handed to (or is waiting for) the backend.
    Enqueued,
    /// The pair is running on a worker node.
    Running,
    /// The pair finished and its output has been processed.
    Complete,
    /// The pair failed.
    Error,
    /// The pair was killed.
    Killed,
}

impl PairStatus {
    /// Determines if the status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Killed)
    }

    /// Determines if a pair may move from this status to `next`.
    ///
    /// Statuses only move forward; any non-terminal status may become
    /// `Killed` or `Error`, and terminal statuses never change.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }

        match next {
            Self::Killed | Self::Error => true,
            _ => next.rank() > self.rank(),
        }
    }

    /// Gets the position of the status in the forward lifecycle.
    fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Enqueued => 1,
            Self::Running => 2,
            Self::Complete | Self::Error | Self::Killed => 3,
        }
    }
}

impl fmt::Display for PairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairStatus::Created => write!(f, "created"),
            PairStatus::Enqueued => write!(f, "enqueued"),
            PairStatus::Running => write!(f, "running"),
            PairStatus::Complete => write!(f, "complete"),
            PairStatus::Error => write!(f, "error"),
            PairStatus::Killed => write!(f, "killed"),
        }
    }
}

impl FromStr for PairStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(PairStatus::Created),
            "enqueued" => Ok(PairStatus::Enqueued),
            "running" => Ok(PairStatus::Running),
            "complete" => Ok(PairStatus::Complete),
            "error" => Ok(PairStatus::Error),
            "killed" => Ok(PairStatus::Killed),
            _ => Err(format!("invalid pair status: {}", s)),
        }
    }
}

impl TryFrom<String> for PairStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, <Self as TryFrom<String>>::Error> {
        Self::from_str(&s)
    }
}

/// Resource limits applied to every pair of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ResourceLimits {
    /// The wallclock timeout in seconds.
    pub wallclock_timeout: i64,
    /// The CPU timeout in seconds.
    pub cpu_timeout: i64,
    /// The maximum memory in bytes.
    pub max_memory: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wallclock_timeout: 900,
            cpu_timeout: 900,
            max_memory: 1 << 30,
        }
    }
}

impl ResourceLimits {
    /// Gets the part of the wallclock timeout a finished pair did not use.
    ///
    /// The full timeout is charged to the owner's load when a pair is
    /// submitted; this is what is credited back once the pair finishes.
    pub fn unused_wallclock(&self, usage: &ResourceUsage) -> Load {
        (self.wallclock_timeout - usage.wallclock_secs()).max(0)
    }
}

/// Resources used by a finished pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ResourceUsage {
    /// The CPU time in milliseconds.
    pub cpu_time_ms: u64,
    /// The wallclock time in milliseconds.
    pub wallclock_ms: u64,
    /// The peak memory in bytes.
    pub max_memory: u64,
}

impl ResourceUsage {
    /// Gets the wallclock time in whole seconds, rounded up.
    pub fn wallclock_secs(&self) -> i64 {
        i64::try_from(self.wallclock_ms.div_ceil(MILLIS_PER_SECOND)).unwrap_or(i64::MAX)
    }
}

/// A solver: an executable directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Solver {
    /// The solver id.
    #[serde(default)]
    pub id: i64,
    /// The solver name.
    pub name: String,
    /// The solver directory.
    pub path: PathBuf,
}

/// A named run configuration of a solver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// The configuration id.
    #[serde(default)]
    pub id: i64,
    /// The configuration name.
    pub name: String,
}

/// A benchmark: an input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Benchmark {
    /// The benchmark id.
    #[serde(default)]
    pub id: i64,
    /// The benchmark name.
    pub name: String,
    /// The benchmark file.
    pub path: PathBuf,
}

/// One execution stage of a job pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// The 1-based stage number.
    #[serde(default)]
    pub number: i64,
    /// The solver run by the stage.
    pub solver: Solver,
    /// The configuration of the solver.
    pub configuration: Configuration,
}

/// A job pair: one execution of one or more solver stages against a
/// benchmark.
///
/// The job level fields (`job_id`, `user_id`, `queue`, `limits` and
/// `post_processor`) are filled in from the owning job when it is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JobPair {
    /// The pair id.
    #[serde(default)]
    pub id: PairId,
    /// The owning job.
    #[serde(default)]
    pub job_id: JobId,
    /// The owning user.
    #[serde(default)]
    pub user_id: UserId,
    /// The queue the pair runs on.
    #[serde(default)]
    pub queue: String,
    /// The resource limits of the pair.
    #[serde(default)]
    pub limits: ResourceLimits,
    /// The post processor applied to finished stages.
    #[serde(default)]
    pub post_processor: Option<ProcessorId>,
    /// The benchmark.
    pub benchmark: Benchmark,
    /// The ordered execution stages.
    pub stages: Vec<Stage>,
    /// The lifecycle status.
    #[serde(default)]
    pub status: PairStatus,
    /// The handle assigned by the backend, once submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    /// The resources used, once the job script reported finishing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResourceUsage>,
}

impl JobPair {
    /// Gets the first stage of the pair.
    pub fn primary_stage(&self) -> Option<&Stage> {
        self.stages.first()
    }
}

/// The aggregate status of a job, derived from the statuses of its pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// No pair has been submitted yet.
    #[default]
    Pending,
    /// Some pairs are submitted or running.
    Running,
    /// Every pair finished, with or without an error.
    Complete,
    /// Every pair finished and at least one was killed.
    Killed,
}

impl JobStatus {
    /// Derives the status of a job from the statuses of its pairs.
    pub fn from_pairs(statuses: impl IntoIterator<Item = PairStatus>) -> Self {
        let mut started = false;
        let mut live = false;
        let mut killed = false;
        for status in statuses {
            match status {
                PairStatus::Created => live = true,
                PairStatus::Enqueued | PairStatus::Running => {
                    live = true;
                    started = true;
                }
                PairStatus::Killed => {
                    killed = true;
                    started = true;
                }
                PairStatus::Complete | PairStatus::Error => started = true,
            }
        }

        match (started, live, killed) {
            (false, _, _) => Self::Pending,
            (true, true, _) => Self::Running,
            (true, false, true) => Self::Killed,
            (true, false, false) => Self::Complete,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::Killed => write!(f, "killed"),
        }
    }
}

/// A job: a batch of pairs submitted together by one user to one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Job {
    /// The job id.
    #[serde(default)]
    pub id: JobId,
    /// The owning user.
    pub user_id: UserId,
    /// The job name.
    pub name: String,
    /// The queue the job runs on.
    pub queue: String,
    /// The resource limits of every pair.
    #[serde(default)]
    pub limits: ResourceLimits,
    /// The pre processor, if any.
    #[serde(default)]
    pub pre_processor: Option<ProcessorId>,
    /// The post processor, if any.
    #[serde(default)]
    pub post_processor: Option<ProcessorId>,
    /// The pairs of the job.
    #[serde(default)]
    pub pairs: Vec<JobPair>,
    /// The aggregate status of the pairs.
    #[serde(default, skip_deserializing)]
    pub status: JobStatus,
}

impl Job {
    /// Recomputes the aggregate status from the pairs.
    pub fn refresh_status(&mut self) {
        self.status = JobStatus::from_pairs(self.pairs.iter().map(|p| p.status));
    }
}

/// A processor: a directory holding a script that turns raw output into
/// attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Processor {
    /// The processor id.
    #[serde(default)]
    pub id: ProcessorId,
    /// The processor name.
    pub name: String,
    /// The processor directory.
    pub path: PathBuf,
}

/// A stage of a pair whose output awaits post-processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PostProcessingItem {
    /// The pair.
    pub pair_id: PairId,
    /// The stage number.
    pub stage: i64,
    /// The processor to run.
    pub processor_id: ProcessorId,
}
