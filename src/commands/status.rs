//! Implementation of the `status` subcommand.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use farmhand_engine::JobId;
use farmhand_engine::PairStore;
use farmhand_engine::store::Job;

use super::open_database;
use crate::Config;

/// The number of milliseconds in a second.
const MILLIS_PER_SECOND: f64 = 1000.0;

/// Arguments to the `status` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The job to show.
    #[arg(value_name = "JOB")]
    pub job: JobId,

    /// Print the job as JSON.
    #[arg(long)]
    pub json: bool,

    /// The database file to use.
    #[arg(long, value_name = "PATH")]
    pub database: Option<PathBuf>,
}

/// Renders a job and its pairs as text.
pub fn render(job: &Job) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "job {id} `{name}` of user {user} on {queue}: {status}",
        id = job.id,
        name = job.name,
        user = job.user_id,
        queue = job.queue,
        status = job.status
    );

    for pair in &job.pairs {
        let _ = write!(
            out,
            "  pair {id} ({bench}): {status}",
            id = pair.id,
            bench = pair.benchmark.name,
            status = pair.status
        );
        if let Some(usage) = &pair.usage {
            let _ = write!(
                out,
                " in {wallclock:.2}s wallclock, {cpu:.2}s cpu, {memory} byte(s)",
                wallclock = usage.wallclock_ms as f64 / MILLIS_PER_SECOND,
                cpu = usage.cpu_time_ms as f64 / MILLIS_PER_SECOND,
                memory = usage.max_memory
            );
        }
        out.push('\n');
    }

    out
}

/// The main function for the `status` subcommand.
pub async fn status(args: Args, mut config: Config) -> Result<()> {
    if let Some(database) = args.database {
        config.database.path = database;
    }
    config.validate()?;

    let db = open_database(&config).await?;
    let Some(job) = db.get_job(args.job).await? else {
        bail!("job `{job}` does not exist", job = args.job);
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        print!("{}", render(&job));
    }

    Ok(())
}
