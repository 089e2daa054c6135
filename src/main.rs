//! The farmhand command line tool.

use std::io::IsTerminal;
use std::io::stderr;
use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::Verbosity;
use colored::Colorize;
use farmhand::Config;
use farmhand::commands;
use git_testament::git_testament;
use git_testament::render_testament;
use tracing_log::AsTrace;

git_testament!(TESTAMENT);

#[derive(Subcommand)]
enum Commands {
    /// Runs the dispatch, topology and post-processing loops until
    /// interrupted.
    Serve(commands::serve::Args),

    /// Stores a job described by a TOML file and submits its pairs.
    Submit(commands::submit::Args),

    /// Prints the worker nodes and queues of the cluster.
    Topology(commands::topology::Args),

    /// Kills a job pair (or every pair held by the backend).
    Kill(commands::kill::Args),

    /// Administers the queues of the cluster.
    Queue(commands::queue::Args),

    /// Records progress of a job pair; called by job scripts.
    Report(commands::report::Args),

    /// Prints a job and the status of its pairs.
    Status(commands::status::Args),
}

#[derive(Parser)]
#[command(author, version = render_testament!(TESTAMENT), propagate_version = true, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// The configuration file to use.
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(flatten)]
    verbose: Verbosity,
}

pub async fn inner() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_log::LogTracer::init()?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(cli.verbose.log_level_filter().as_trace())
        .with_writer(std::io::stderr)
        .with_ansi(stderr().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve(args) => commands::serve::serve(args, config).await,
        Commands::Submit(args) => commands::submit::submit(args, config).await,
        Commands::Topology(args) => commands::topology::topology(args, config).await,
        Commands::Kill(args) => commands::kill::kill(args, config).await,
        Commands::Queue(args) => commands::queue::queue(args, config).await,
        Commands::Report(args) => commands::report::report(args, config).await,
        Commands::Status(args) => commands::status::status(args, config).await,
    }
}

#[tokio::main]
pub async fn main() {
    if let Err(e) = inner().await {
        eprintln!(
            "{error}: {e:?}",
            error = if std::io::stderr().is_terminal() {
                "error".red().bold()
            } else {
                "error".normal()
            }
        );
        std::process::exit(1);
    }
}
