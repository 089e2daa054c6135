//! Database row models.

use std::path::PathBuf;

use farmhand_engine::ExecutionId;
use farmhand_engine::store::Benchmark;
use farmhand_engine::store::Configuration;
use farmhand_engine::store::Job;
use farmhand_engine::store::JobPair;
use farmhand_engine::store::PairStatus;
use farmhand_engine::store::Processor;
use farmhand_engine::store::ResourceLimits;
use farmhand_engine::store::ResourceUsage;
use farmhand_engine::store::Solver;
use farmhand_engine::store::Stage;
use sqlx::FromRow;

/// The columns selected for a [`PairRow`].
pub(crate) const PAIR_COLUMNS: &str = "p.id, p.job_id, j.user_id, j.queue, j.wallclock_timeout, \
                                       j.cpu_timeout, j.max_memory, j.post_processor, p.bench_id, \
                                       p.bench_name, p.bench_path, p.status, p.execution_id, \
                                       p.cpu_time_ms, p.wallclock_ms, p.memory_used";

/// A job pair joined with its job.
#[derive(Debug, Clone, FromRow)]
pub struct PairRow {
    /// The pair id.
    pub id: i64,
    /// The owning job.
    pub job_id: i64,
    /// The owning user.
    pub user_id: i64,
    /// The queue of the job.
    pub queue: String,
    /// The wallclock timeout in seconds.
    pub wallclock_timeout: i64,
    /// The CPU timeout in seconds.
    pub cpu_timeout: i64,
    /// The maximum memory in bytes.
    pub max_memory: i64,
    /// The post processor of the job.
    pub post_processor: Option<i64>,
    /// The benchmark id.
    pub bench_id: i64,
    /// The benchmark name.
    pub bench_name: String,
    /// The benchmark file.
    #[sqlx(try_from = "String")]
    pub bench_path: PathBuf,
    /// The lifecycle status.
    #[sqlx(try_from = "String")]
    pub status: PairStatus,
    /// The execution handle, once submitted.
    pub execution_id: Option<i64>,
    /// The CPU time used in milliseconds, once finished.
    pub cpu_time_ms: Option<i64>,
    /// The wallclock time used in milliseconds, once finished.
    pub wallclock_ms: Option<i64>,
    /// The peak memory used in bytes, once finished.
    pub memory_used: Option<i64>,
}

impl PairRow {
    /// Converts the row into a pair with the given stages.
    pub fn into_pair(self, stages: Vec<Stage>) -> JobPair {
        JobPair {
            id: self.id,
            job_id: self.job_id,
            user_id: self.user_id,
            queue: self.queue,
            limits: ResourceLimits {
                wallclock_timeout: self.wallclock_timeout,
                cpu_timeout: self.cpu_timeout,
                max_memory: self.max_memory.max(0) as u64,
            },
            post_processor: self.post_processor,
            benchmark: Benchmark {
                id: self.bench_id,
                name: self.bench_name,
                path: self.bench_path,
            },
            stages,
            status: self.status,
            execution_id: self.execution_id.map(ExecutionId::new),
            usage: match (self.cpu_time_ms, self.wallclock_ms, self.memory_used) {
                (Some(cpu), Some(wallclock), Some(memory)) => Some(ResourceUsage {
                    cpu_time_ms: cpu.max(0) as u64,
                    wallclock_ms: wallclock.max(0) as u64,
                    max_memory: memory.max(0) as u64,
                }),
                _ => None,
            },
        }
    }
}

/// A job without its pairs.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    /// The job id.
    pub id: i64,
    /// The owning user.
    pub user_id: i64,
    /// The job name.
    pub name: String,
    /// The queue of the job.
    pub queue: String,
    /// The wallclock timeout in seconds.
    pub wallclock_timeout: i64,
    /// The CPU timeout in seconds.
    pub cpu_timeout: i64,
    /// The maximum memory in bytes.
    pub max_memory: i64,
    /// The pre processor of the job.
    pub pre_processor: Option<i64>,
    /// The post processor of the job.
    pub post_processor: Option<i64>,
}

impl JobRow {
    /// Converts the row into a job with the given pairs.
    pub fn into_job(self, pairs: Vec<JobPair>) -> Job {
        let mut job = Job {
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            queue: self.queue,
            limits: ResourceLimits {
                wallclock_timeout: self.wallclock_timeout,
                cpu_timeout: self.cpu_timeout,
                max_memory: self.max_memory.max(0) as u64,
            },
            pre_processor: self.pre_processor,
            post_processor: self.post_processor,
            pairs,
            status: Default::default(),
        };
        job.refresh_status();
        job
    }
}

/// One stage of a job pair.
#[derive(Debug, Clone, FromRow)]
pub struct StageRow {
    /// The stage number.
    pub stage: i64,
    /// The solver id.
    pub solver_id: i64,
    /// The solver name.
    pub solver_name: String,
    /// The solver directory.
    #[sqlx(try_from = "String")]
    pub solver_path: PathBuf,
    /// The configuration id.
    pub config_id: i64,
    /// The configuration name.
    pub config_name: String,
}

impl From<StageRow> for Stage {
    fn from(row: StageRow) -> Self {
        Self {
            number: row.stage,
            solver: Solver {
                id: row.solver_id,
                name: row.solver_name,
                path: row.solver_path,
            },
            configuration: Configuration {
                id: row.config_id,
                name: row.config_name,
            },
        }
    }
}

/// A processor.
#[derive(Debug, Clone, FromRow)]
pub struct ProcessorRow {
    /// The processor id.
    pub id: i64,
    /// The processor name.
    pub name: String,
    /// The processor directory.
    #[sqlx(try_from = "String")]
    pub path: PathBuf,
}

impl From<ProcessorRow> for Processor {
    fn from(row: ProcessorRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            path: row.path,
        }
    }
}
