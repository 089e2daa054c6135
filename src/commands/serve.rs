//! Implementation of the `serve` subcommand.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use farmhand_engine::PairStore;
use farmhand_engine::Scheduler;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::open_backend;
use super::open_database;
use crate::Config;

/// Arguments to the `serve` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The database file to use.
    #[arg(long, value_name = "PATH")]
    pub database: Option<PathBuf>,

    /// The number of seconds between dispatch ticks.
    #[arg(long, value_name = "SECONDS")]
    pub dispatch_interval: Option<u64>,

    /// The number of pairs kept enqueued per node of a queue.
    #[arg(long, value_name = "COUNT")]
    pub node_multiplier: Option<u64>,

    /// The number of seconds between post-processing ticks.
    #[arg(long, value_name = "SECONDS")]
    pub post_processing_interval: Option<u64>,
}

impl Args {
    /// Applies the arguments to the configuration.
    pub fn apply(self, mut config: Config) -> Config {
        if let Some(database) = self.database {
            config.database.path = database;
        }

        if let Some(interval) = self.dispatch_interval {
            config.dispatch.interval_secs = interval;
        }

        if let Some(multiplier) = self.node_multiplier {
            config.dispatch.node_multiplier = multiplier;
        }

        if let Some(interval) = self.post_processing_interval {
            config.post_processing.interval_secs = interval;
        }

        config
    }
}

/// The main function for the `serve` subcommand.
pub async fn serve(args: Args, config: Config) -> Result<()> {
    let config = args.apply(config);
    config.validate()?;

    let store: Arc<dyn PairStore> = open_database(&config).await?;
    let backend = open_backend(&config).await?;

    let scheduler = Scheduler::from_config(&config.engine(), backend.clone(), store.clone())
        .context("failed to create the scheduler")?;

    let pending = store.get_eligible_pairs_for_dispatch().await?.len();
    info!(
        backend = backend.name(),
        database = %config.database.path.display(),
        pending,
        "starting scheduler"
    );

    let shutdown = CancellationToken::new();
    let handle = scheduler.start(shutdown.clone()).await;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the interrupt signal")?;

    info!("received interrupt, shutting down");
    handle.shutdown().await;
    Ok(())
}
