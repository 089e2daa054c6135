//! Implementation of the `queue` subcommand.

use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use clap::Subcommand;
use farmhand_engine::ExecutionBackend;
use tracing::info;

use super::open_backend;
use crate::Config;

/// Arguments to the `queue` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The queue operation to perform.
    #[command(subcommand)]
    pub command: QueueCommand,
}

/// A queue administration operation.
#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    /// Creates a queue and moves the given nodes into it.
    Create {
        /// The name of the queue.
        name: String,

        /// The number of slots per node.
        #[arg(long)]
        slots: i64,

        /// A node to move into the queue.
        #[arg(long = "node", value_name = "NODE")]
        nodes: Vec<String>,
    },

    /// Deletes an empty queue.
    Delete {
        /// The name of the queue.
        name: String,
    },

    /// Moves a node into a queue.
    Move {
        /// The node to move.
        node: String,

        /// The destination queue.
        queue: String,
    },
}

/// Runs a queue operation against a backend.
pub async fn run(backend: &dyn ExecutionBackend, command: QueueCommand) -> Result<()> {
    match command {
        QueueCommand::Create { name, slots, nodes } => {
            let associations = backend.node_queue_associations().await?;
            let sources: Vec<Option<String>> = nodes
                .iter()
                .map(|node| associations.get(node).cloned())
                .collect();

            if !backend
                .create_queue_with_slots(&name, &nodes, &sources, slots)
                .await
            {
                bail!("failed to create queue `{name}`");
            }

            info!(queue = %name, slots, nodes = nodes.len(), "created queue");
        }
        QueueCommand::Delete { name } => {
            if !backend.delete_queue(&name).await {
                bail!("failed to delete queue `{name}`; it must exist and have no nodes");
            }

            info!(queue = %name, "deleted queue");
        }
        QueueCommand::Move { node, queue } => {
            if !backend.move_node(&node, &queue).await {
                bail!("failed to move node `{node}` to queue `{queue}`");
            }

            info!(%node, %queue, "moved node");
        }
    }

    Ok(())
}

/// The main function for the `queue` subcommand.
pub async fn queue(args: Args, config: Config) -> Result<()> {
    config.validate()?;

    let backend = open_backend(&config).await?;
    let result = run(backend.as_ref(), args.command).await;
    backend.shutdown().await;
    result
}
