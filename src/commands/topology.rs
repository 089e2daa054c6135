//! Implementation of the `topology` subcommand.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use farmhand_engine::ExecutionBackend;
use farmhand_engine::scheduler::ClusterSnapshot;
use serde::Serialize;
use tracing::warn;

use super::open_backend;
use crate::Config;

/// Arguments to the `topology` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// Print the topology as JSON.
    #[arg(long)]
    pub json: bool,

    /// Also print the work known to the backend.
    #[arg(long)]
    pub jobs: bool,
}

/// The cluster topology as printed by the subcommand.
#[derive(Debug, Serialize)]
pub struct Topology {
    /// The nodes, queues and their associations.
    #[serde(flatten)]
    pub snapshot: ClusterSnapshot,
    /// The slots per node of each queue, where the backend knows them.
    ///
    /// Slots are informational; queue capacity is counted in nodes.
    pub slots: BTreeMap<String, u64>,
}

/// Queries the cluster topology from a backend.
///
/// A queue whose slot count cannot be read is printed without one.
pub async fn query(backend: &dyn ExecutionBackend) -> Result<Topology> {
    let mut nodes = backend.worker_nodes().await?;
    let mut queues = backend.queues().await?;
    let associations = backend.node_queue_associations().await?;
    nodes.sort();
    queues.sort();

    let mut slots = BTreeMap::new();
    for queue in &queues {
        match backend.queue_slots(queue).await {
            Ok(Some(count)) => {
                slots.insert(queue.clone(), count);
            }
            Ok(None) => {}
            Err(e) => warn!(queue, "failed to get slots of queue: {e:#}"),
        }
    }

    Ok(Topology {
        snapshot: ClusterSnapshot {
            nodes,
            queues,
            associations,
            refreshed_at: Some(Utc::now()),
        },
        slots,
    })
}

/// Renders a topology as text.
pub fn render(topology: &Topology) -> String {
    let mut out = String::new();
    let snapshot = &topology.snapshot;
    let counts = snapshot.node_counts();

    let _ = writeln!(out, "queues:");
    for queue in &snapshot.queues {
        let count = counts.get(queue).copied().unwrap_or_default();
        let _ = match topology.slots.get(queue) {
            Some(slots) => writeln!(
                out,
                "  {queue} ({count} node(s), {slots} slot(s) per node)"
            ),
            None => writeln!(out, "  {queue} ({count} node(s))"),
        };
    }

    let _ = writeln!(out, "nodes:");
    for node in &snapshot.nodes {
        match snapshot.associations.get(node) {
            Some(queue) => {
                let _ = writeln!(out, "  {node} -> {queue}");
            }
            None => {
                let _ = writeln!(out, "  {node} (no queue)");
            }
        }
    }

    out
}

/// The main function for the `topology` subcommand.
pub async fn topology(args: Args, config: Config) -> Result<()> {
    config.validate()?;

    let backend = open_backend(&config).await?;
    let result = query(backend.as_ref()).await;
    let status = if args.jobs {
        Some(backend.running_jobs_status().await)
    } else {
        None
    };
    backend.shutdown().await;

    let topology = result?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&topology)?);
    } else {
        print!("{}", render(&topology));
    }

    if let Some(status) = status {
        println!("{}", status?);
    }

    Ok(())
}
