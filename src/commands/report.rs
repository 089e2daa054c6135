//! Implementation of the `report` subcommand.
//!
//! Job scripts call this subcommand to report their progress; see the
//! `report` module of the engine for how each event changes a pair.

use std::path::PathBuf;

use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use clap::Subcommand;
use farmhand_engine::PairId;
use farmhand_engine::report::PairReport;
use farmhand_engine::store::ResourceUsage;
use tracing::debug;

use super::open_database;
use crate::Config;

/// The number of milliseconds in a second.
const MILLIS_PER_SECOND: f64 = 1000.0;

/// Arguments to the `report` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The job pair reporting.
    #[arg(value_name = "PAIR")]
    pub pair: PairId,

    /// The database file to use.
    #[arg(long, value_name = "PATH")]
    pub database: Option<PathBuf>,

    /// The event being reported.
    #[command(subcommand)]
    pub event: Event,
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

/// An event reported by a job script.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Event {
    /// The job script started running.
    Running,

    /// A stage of the pair finished.
    Stage {
        /// The number of the finished stage, starting at 1.
        #[arg(value_name = "STAGE", value_parser = clap::value_parser!(i64).range(1..))]
        stage: i64,
    },

    /// The job script finished.
    Complete {
        /// The wallclock time used, in seconds.
        #[arg(long, value_name = "SECONDS", value_parser = parse_millis)]
        wallclock: Option<u64>,

        /// The CPU time used, in seconds.
        #[arg(long, value_name = "SECONDS", value_parser = parse_millis)]
        cpu_time: Option<u64>,

        /// The maximum memory used, in bytes.
        #[arg(long, value_name = "BYTES")]
        memory: Option<u64>,
    },

    /// The job script failed.
    Error {
        /// Why the job script failed.
        #[arg(value_name = "REASON")]
        reason: String,
    },
}

impl Event {
    /// Converts the event into a pair report.
    ///
    /// Usage is only reported when the wallclock time was measured.
    pub fn into_report(self) -> PairReport {
        match self {
            Self::Running => PairReport::Running,
            Self::Stage { stage } => PairReport::StageFinished(stage),
            Self::Complete {
                wallclock,
                cpu_time,
                memory,
            } => PairReport::Finished(wallclock.map(|wallclock_ms| ResourceUsage {
                cpu_time_ms: cpu_time.unwrap_or_default(),
                wallclock_ms,
                max_memory: memory.unwrap_or_default(),
            })),
            Self::Error { reason } => PairReport::Failed(reason),
        }
    }
}

/// Parses a non-negative number of seconds into milliseconds.
fn parse_millis(s: &str) -> Result<u64, String> {
    let secs: f64 = s
        .parse()
        .map_err(|_| format!("`{s}` is not a number of seconds"))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("`{s}` is not a non-negative number of seconds"));
    }

    Ok((secs * MILLIS_PER_SECOND).round() as u64)
}

/// The main function for the `report` subcommand.
///
/// Only the database is needed; the rest of the configuration may describe
/// a host the job script is not running on.
pub async fn report(args: Args, config: Config) -> Result<()> {
    let config = args.apply(config);
    if config.database.path.as_os_str().is_empty() {
        bail!("database configuration value `path` cannot be empty");
    }

    let db = open_database(&config).await?;
    let status = farmhand_engine::report::apply(db.as_ref(), args.pair, args.event.into_report())
        .await?;
    debug!(pair = args.pair, %status, "applied job script report");
    Ok(())
}
