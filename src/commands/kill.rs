//! Implementation of the `kill` subcommand.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use anyhow::anyhow;
use clap::Parser;
use farmhand_engine::JobDispatcher;
use farmhand_engine::PairId;
use farmhand_engine::PairStore;
use farmhand_engine::dispatch::ScriptTemplate;

use super::open_backend;
use super::open_database;
use crate::Config;

/// Arguments to the `kill` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The job pair to kill.
    #[arg(value_name = "PAIR", required_unless_present = "all", conflicts_with = "all")]
    pub pair: Option<PairId>,

    /// Kill every pair held by the backend.
    #[arg(long)]
    pub all: bool,

    /// The database file to use.
    #[arg(long, value_name = "PATH")]
    pub database: Option<PathBuf>,
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

/// The main function for the `kill` subcommand.
pub async fn kill(args: Args, config: Config) -> Result<()> {
    let config = args.apply(config);
    config.validate()?;

    let store: Arc<dyn PairStore> = open_database(&config).await?;
    let backend = open_backend(&config).await?;

    // Killing never renders a script.
    let dispatcher = JobDispatcher::new(
        &config.dispatch,
        ScriptTemplate::new(String::new()),
        backend.clone(),
        store,
    );

    let result = match (args.pair, args.all) {
        (_, true) => dispatcher
            .kill_all()
            .await
            .map(|count| println!("killed {count} pair(s)")),
        (Some(pair), false) => dispatcher.kill_pair(pair).await.map(|changed| {
            if changed {
                println!("killed job pair {pair}");
            } else {
                println!("job pair {pair} had already finished");
            }
        }),
        (None, false) => Err(anyhow!("a job pair or `--all` must be given")),
    };
    backend.shutdown().await;
    result
}
