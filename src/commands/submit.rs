//! Implementation of the `submit` subcommand.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use farmhand_engine::JobDispatcher;
use farmhand_engine::PairStore;
use farmhand_engine::config::BackendConfig;
use farmhand_engine::store::Job;
use tracing::info;

use super::open_backend;
use super::open_database;
use crate::Config;

/// Arguments to the `submit` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The job description (TOML) to submit.
    #[arg(value_name = "JOB")]
    pub job: PathBuf,

    /// The database file to use.
    #[arg(long, value_name = "PATH")]
    pub database: Option<PathBuf>,

    /// The queue to submit to, overriding the queue of the job description.
    #[arg(long, value_name = "QUEUE")]
    pub queue: Option<String>,
}

impl Args {
    /// Applies the arguments to the configuration.
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(database) = &self.database {
            config.database.path = database.clone();
        }

        config
    }
}

/// Reads a job description.
pub fn read_job(path: &Path) -> Result<Job> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read job description `{}`", path.display()))?;
    parse_job(&contents)
        .with_context(|| format!("invalid job description `{}`", path.display()))
}

/// Parses a job description.
pub fn parse_job(contents: &str) -> Result<Job> {
    let job: Job = toml::from_str(contents)?;
    if job.pairs.is_empty() {
        bail!("job `{name}` has no pairs", name = job.name);
    }

    Ok(job)
}

/// The main function for the `submit` subcommand.
pub async fn submit(args: Args, config: Config) -> Result<()> {
    let config = args.apply(config);
    config.validate()?;

    let mut job = read_job(&args.job)?;
    if let Some(queue) = args.queue {
        job.queue = queue;
    }

    let store: Arc<dyn PairStore> = open_database(&config).await?;

    // Scripts of the local backend run inside the serving process.
    if matches!(config.backend, BackendConfig::Local(_)) {
        let job = store.add_job(job).await?;
        info!(job = job.id, pairs = job.pairs.len(), "stored job for dispatch");
        println!(
            "job {id} stored with {count} pair(s); run `farmhand serve` to dispatch it",
            id = job.id,
            count = job.pairs.len()
        );
        return Ok(());
    }

    let backend = open_backend(&config).await?;
    let result = match JobDispatcher::from_config(&config.dispatch, backend.clone(), store) {
        Ok(mut dispatcher) => dispatcher.submit_job(job).await,
        Err(e) => Err(e),
    };
    backend.shutdown().await;

    let (job, report) = result?;
    println!(
        "job {id}: {submitted} submitted, {deferred} deferred, {failed} failed",
        id = job.id,
        submitted = report.submitted,
        deferred = report.deferred,
        failed = report.failed
    );

    Ok(())
}
