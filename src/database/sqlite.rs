//! SQLite database implementation.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::bail;
use async_trait::async_trait;
use farmhand_engine::ExecutionId;
use farmhand_engine::JobId;
use farmhand_engine::PairId;
use farmhand_engine::PairStore;
use farmhand_engine::ProcessorId;
use farmhand_engine::UserId;
use farmhand_engine::monitor::Load;
use farmhand_engine::store::Job;
use farmhand_engine::store::JobPair;
use farmhand_engine::store::PairStatus;
use farmhand_engine::store::PostProcessingItem;
use farmhand_engine::store::Processor;
use farmhand_engine::store::ResourceLimits;
use farmhand_engine::store::ResourceUsage;
use farmhand_engine::store::Stage;
use indexmap::IndexMap;
use sqlx::SqliteConnection;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqliteSynchronous;
use tracing::debug;

use super::DatabaseError;
use super::Result;
use super::models::JobRow;
use super::models::PAIR_COLUMNS;
use super::models::PairRow;
use super::models::ProcessorRow;
use super::models::StageRow;

/// SQLite connection string prefix.
const SQLITE_CONNECTION_PREFIX: &str = "sqlite:";

/// Store temporary tables and indices in memory for faster operations.
const SQLITE_TEMP_STORE: &str = "memory";

/// Enable foreign key constraint enforcement for referential integrity.
const SQLITE_FOREIGN_KEYS: &str = "on";

/// Configure 5-second timeout when database is locked to prevent spurious
/// failures.
const SQLITE_BUSY_TIMEOUT: &str = "5000";

/// Allocate approximately 8MB for SQLite page cache.
const SQLITE_CACHE_SIZE: &str = "2000";

/// The statuses of pairs held by the backend.
const IN_BACKEND: &str = "p.status in ('enqueued', 'running') and p.execution_id is not null and \
                          p.finished_at is null";

/// SQLite database implementation.
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    /// The underlying SQLite connection pool.
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// Create a new SQLite database connection from a path.
    ///
    /// Migrations are run upon a successful connection pool being established.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let database_url = format!("{}//{}", SQLITE_CONNECTION_PREFIX, path.display());
        let options = SqliteConnectOptions::from_str(&database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("temp_store", SQLITE_TEMP_STORE)
            .pragma("foreign_keys", SQLITE_FOREIGN_KEYS)
            .pragma("busy_timeout", SQLITE_BUSY_TIMEOUT)
            .pragma("cache_size", SQLITE_CACHE_SIZE);

        let pool = SqlitePool::connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Creates a new SQLite connection from an existing pool.
    ///
    /// This method also runs the embedded migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Gets the recorded error reason of a pair.
    pub async fn get_pair_error(&self, pair: PairId) -> Result<Option<String>> {
        let error: Option<(Option<String>,)> =
            sqlx::query_as("select error from job_pairs where id = ?")
                .bind(pair)
                .fetch_optional(&self.pool)
                .await?;

        Ok(error.and_then(|(e,)| e))
    }

    /// Gets the attributes of a pair stage.
    pub async fn get_pair_attributes(
        &self,
        pair: PairId,
        stage: i64,
    ) -> Result<IndexMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "select key, value from job_pair_attributes where pair_id = ? and stage = ? order by \
             rowid",
        )
        .bind(pair)
        .bind(stage)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    /// Validates a job before it is stored.
    fn validate_job(job: &Job) -> Result<()> {
        if job.name.is_empty() {
            return Err(DatabaseError::Validation(String::from(
                "`name` cannot be empty for a job",
            )));
        }

        if job.queue.is_empty() {
            return Err(DatabaseError::Validation(String::from(
                "`queue` cannot be empty for a job",
            )));
        }

        if i64::try_from(job.limits.max_memory).is_err() {
            return Err(DatabaseError::Validation(format!(
                "`max_memory` of {bytes} bytes is too large",
                bytes = job.limits.max_memory
            )));
        }

        for (i, pair) in job.pairs.iter().enumerate() {
            if pair.stages.is_empty() {
                return Err(DatabaseError::Validation(format!(
                    "pair {i} of job `{name}` has no stages",
                    name = job.name
                )));
            }

            if pair.benchmark.name.is_empty() {
                return Err(DatabaseError::Validation(format!(
                    "pair {i} of job `{name}` has an unnamed benchmark",
                    name = job.name
                )));
            }

            if pair.stages.iter().any(|s| s.solver.name.is_empty()) {
                return Err(DatabaseError::Validation(format!(
                    "pair {i} of job `{name}` has an unnamed solver",
                    name = job.name
                )));
            }
        }

        Ok(())
    }

    /// Fetches pairs matching a `where` clause, with their stages.
    async fn fetch_pairs(&self, filter: &str) -> Result<Vec<JobPair>> {
        let sql = format!(
            "select {PAIR_COLUMNS} from job_pairs p join jobs j on j.id = p.job_id where {filter} \
             order by p.id"
        );
        let rows: Vec<PairRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        self.with_stages(rows).await
    }

    /// Converts pair rows into pairs, fetching their stages.
    async fn with_stages(&self, rows: Vec<PairRow>) -> Result<Vec<JobPair>> {
        let mut pairs = Vec::with_capacity(rows.len());
        for row in rows {
            let stages = self.fetch_stages(row.id).await?;
            pairs.push(row.into_pair(stages));
        }

        Ok(pairs)
    }

    /// Fetches the stages of a pair.
    async fn fetch_stages(&self, pair: PairId) -> Result<Vec<Stage>> {
        let rows: Vec<StageRow> = sqlx::query_as(
            "select stage, solver_id, solver_name, solver_path, config_id, config_name from \
             job_pair_stages where pair_id = ? order by stage",
        )
        .bind(pair)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Gets the status of a pair within a transaction.
    async fn status_of(conn: &mut SqliteConnection, pair: PairId) -> anyhow::Result<PairStatus> {
        let status: Option<(String,)> = sqlx::query_as("select status from job_pairs where id = ?")
            .bind(pair)
            .fetch_optional(&mut *conn)
            .await?;

        let Some((status,)) = status else {
            bail!("job pair `{pair}` does not exist");
        };

        status.parse().map_err(anyhow::Error::msg)
    }
}

#[async_trait]
impl PairStore for SqliteDatabase {
    async fn add_job(&self, mut job: Job) -> anyhow::Result<Job> {
        Self::validate_job(&job)?;

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "insert into jobs (user_id, name, queue, wallclock_timeout, cpu_timeout, max_memory, \
             pre_processor, post_processor) values (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.user_id)
        .bind(&job.name)
        .bind(&job.queue)
        .bind(job.limits.wallclock_timeout)
        .bind(job.limits.cpu_timeout)
        .bind(job.limits.max_memory as i64)
        .bind(job.pre_processor)
        .bind(job.post_processor)
        .execute(&mut *tx)
        .await?;
        job.id = result.last_insert_rowid();

        for pair in &mut job.pairs {
            let result = sqlx::query(
                "insert into job_pairs (job_id, bench_id, bench_name, bench_path, status) values \
                 (?, ?, ?, ?, ?)",
            )
            .bind(job.id)
            .bind(pair.benchmark.id)
            .bind(&pair.benchmark.name)
            .bind(pair.benchmark.path.display().to_string())
            .bind(PairStatus::Created.to_string())
            .execute(&mut *tx)
            .await?;

            pair.id = result.last_insert_rowid();
            pair.job_id = job.id;
            pair.user_id = job.user_id;
            pair.queue = job.queue.clone();
            pair.limits = job.limits;
            pair.post_processor = job.post_processor;
            pair.status = PairStatus::Created;
            pair.execution_id = None;

            for (i, stage) in pair.stages.iter_mut().enumerate() {
                stage.number = i as i64 + 1;
                sqlx::query(
                    "insert into job_pair_stages (pair_id, stage, solver_id, solver_name, \
                     solver_path, config_id, config_name) values (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(pair.id)
                .bind(stage.number)
                .bind(stage.solver.id)
                .bind(&stage.solver.name)
                .bind(stage.solver.path.display().to_string())
                .bind(stage.configuration.id)
                .bind(&stage.configuration.name)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!(job = job.id, pairs = job.pairs.len(), "inserted job");
        job.refresh_status();
        Ok(job)
    }

    async fn get_eligible_pairs_for_dispatch(&self) -> anyhow::Result<Vec<JobPair>> {
        Ok(self
            .fetch_pairs(
                "p.status = 'created' or (p.status = 'enqueued' and p.execution_id is null)",
            )
            .await?)
    }

    async fn record_execution_handle(&self, pair: PairId, handle: ExecutionId) -> anyhow::Result<()> {
        let result = sqlx::query(
            "update job_pairs set execution_id = ?, updated_at = current_timestamp where id = ?",
        )
        .bind(handle.get())
        .bind(pair)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("job pair `{pair}` does not exist");
        }

        Ok(())
    }

    async fn set_pair_status(&self, pair: PairId, status: PairStatus) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        let current = Self::status_of(&mut tx, pair).await?;
        if !current.can_transition_to(status) {
            debug!(pair, %current, %status, "ignoring status transition");
            return Ok(false);
        }

        sqlx::query("update job_pairs set status = ?, updated_at = current_timestamp where id = ?")
            .bind(status.to_string())
            .bind(pair)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_pairs_awaiting_post_processing(&self) -> anyhow::Result<Vec<PostProcessingItem>> {
        let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
            "select pair_id, stage, processor_id from pending_post_processing order by rowid",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(pair_id, stage, processor_id)| PostProcessingItem {
                pair_id,
                stage,
                processor_id,
            })
            .collect())
    }

    async fn mark_post_processed(&self, pair: PairId, stage: i64) -> anyhow::Result<()> {
        sqlx::query("delete from pending_post_processing where pair_id = ? and stage = ?")
            .bind(pair)
            .bind(stage)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_pair(&self, pair: PairId) -> anyhow::Result<Option<JobPair>> {
        let sql = format!(
            "select {PAIR_COLUMNS} from job_pairs p join jobs j on j.id = p.job_id where p.id = ?"
        );
        let row: Option<PairRow> = sqlx::query_as(&sql)
            .bind(pair)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let stages = self.fetch_stages(row.id).await?;
        Ok(Some(row.into_pair(stages)))
    }

    async fn get_job(&self, job: JobId) -> anyhow::Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(
            "select id, user_id, name, queue, wallclock_timeout, cpu_timeout, max_memory, \
             pre_processor, post_processor from jobs where id = ?",
        )
        .bind(job)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let sql = format!(
            "select {PAIR_COLUMNS} from job_pairs p join jobs j on j.id = p.job_id where p.job_id \
             = ? order by p.id"
        );
        let pairs: Vec<PairRow> = sqlx::query_as(&sql)
            .bind(job)
            .fetch_all(&self.pool)
            .await?;

        let pairs = self.with_stages(pairs).await?;
        Ok(Some(row.into_job(pairs)))
    }

    async fn add_processor(&self, mut processor: Processor) -> anyhow::Result<Processor> {
        if processor.name.is_empty() {
            return Err(DatabaseError::Validation(String::from(
                "`name` cannot be empty for a processor",
            ))
            .into());
        }

        let result = sqlx::query("insert into processors (name, path) values (?, ?)")
            .bind(&processor.name)
            .bind(processor.path.display().to_string())
            .execute(&self.pool)
            .await?;

        processor.id = result.last_insert_rowid();
        Ok(processor)
    }

    async fn get_processor(&self, processor: ProcessorId) -> anyhow::Result<Option<Processor>> {
        let row: Option<ProcessorRow> =
            sqlx::query_as("select id, name, path from processors where id = ?")
                .bind(processor)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(Into::into))
    }

    async fn get_pairs_in_backend(&self) -> anyhow::Result<Vec<JobPair>> {
        Ok(self.fetch_pairs(IN_BACKEND).await?)
    }

    async fn get_user_loads_on_queue(&self, queue: &str) -> anyhow::Result<HashMap<UserId, Load>> {
        let sql = format!(
            "select j.user_id, sum(j.wallclock_timeout) from job_pairs p join jobs j on j.id = \
             p.job_id where j.queue = ? and {IN_BACKEND} group by j.user_id"
        );
        let rows: Vec<(i64, i64)> = sqlx::query_as(&sql)
            .bind(queue)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().collect())
    }

    async fn count_pairs_in_queue(&self, queue: &str) -> anyhow::Result<u64> {
        let sql = format!(
            "select count(*) from job_pairs p join jobs j on j.id = p.job_id where j.queue = ? \
             and {IN_BACKEND}"
        );
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }

    async fn set_pair_error(&self, pair: PairId, reason: &str) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        if Self::status_of(&mut tx, pair).await?.is_terminal() {
            return Ok(false);
        }

        sqlx::query(
            "update job_pairs set status = ?, error = ?, updated_at = current_timestamp where id \
             = ?",
        )
        .bind(PairStatus::Error.to_string())
        .bind(reason)
        .bind(pair)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn add_pair_attributes(
        &self,
        pair: PairId,
        stage: i64,
        attributes: &IndexMap<String, String>,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for (key, value) in attributes {
            sqlx::query(
                "insert into job_pair_attributes (pair_id, stage, key, value) values (?, ?, ?, ?) \
                 on conflict (pair_id, stage, key) do update set value = excluded.value",
            )
            .bind(pair)
            .bind(stage)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn complete_stage(&self, pair: PairId, stage: i64) -> anyhow::Result<()> {
        let processor: Option<(Option<i64>,)> = sqlx::query_as(
            "select j.post_processor from job_pairs p join jobs j on j.id = p.job_id where p.id = ?",
        )
        .bind(pair)
        .fetch_optional(&self.pool)
        .await?;

        let Some((processor,)) = processor else {
            bail!("job pair `{pair}` does not exist");
        };

        let Some(processor) = processor else {
            debug!(pair, stage, "job pair has no post processor");
            return Ok(());
        };

        sqlx::query(
            "insert or ignore into pending_post_processing (pair_id, stage, processor_id) values \
             (?, ?, ?)",
        )
        .bind(pair)
        .bind(stage)
        .bind(processor)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finish_pair(
        &self,
        pair: PairId,
        usage: Option<ResourceUsage>,
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        let row: Option<(i64, i64)> = sqlx::query_as(
            "select j.wallclock_timeout, p.finished_at is not null from job_pairs p join jobs j \
             on j.id = p.job_id where p.id = ?",
        )
        .bind(pair)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((wallclock_timeout, finished)) = row else {
            bail!("job pair `{pair}` does not exist");
        };

        if finished != 0 {
            debug!(pair, "job pair was already reported finished");
            return Ok(false);
        }

        let credit = usage.map(|usage| {
            let limits = ResourceLimits {
                wallclock_timeout,
                ..Default::default()
            };
            limits.unused_wallclock(&usage)
        });
        let to_column = |value: u64| i64::try_from(value).unwrap_or(i64::MAX);

        sqlx::query(
            "update job_pairs set cpu_time_ms = ?, wallclock_ms = ?, memory_used = ?, load_credit \
             = ?, finished_at = current_timestamp, updated_at = current_timestamp where id = ?",
        )
        .bind(usage.map(|u| to_column(u.cpu_time_ms)))
        .bind(usage.map(|u| to_column(u.wallclock_ms)))
        .bind(usage.map(|u| to_column(u.max_memory)))
        .bind(credit)
        .bind(pair)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn take_load_credits(&self, queue: &str) -> anyhow::Result<HashMap<UserId, Load>> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "select j.user_id, sum(p.load_credit) from job_pairs p join jobs j on j.id = p.job_id \
             where j.queue = ? and p.load_credit is not null group by j.user_id",
        )
        .bind(queue)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            "update job_pairs set load_credit = null where load_credit is not null and job_id in \
             (select id from jobs where queue = ?)",
        )
        .bind(queue)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(rows.into_iter().collect())
    }
}
