//! Command-line interface of the `leader-election` binary.
//!
//! Both subcommands take the same cluster flags, since every node has to be
//! started with identical timings and addressing to find its peers.

use std::net::IpAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::NodeId;
use crate::config::ElectionConfig;

/// Top-level arguments.
#[derive(Parser, Debug)]
#[command(author, version, about = "Leader election over UDP with randomized timeouts", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every node of the cluster in this process.
    Cluster(ClusterArgs),
    /// Run a single node. Its peers are expected on the neighbouring ports.
    Node(NodeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    #[command(flatten)]
    pub election: ElectionArgs,
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Id of this node, in 0..nodes.
    #[arg(long)]
    pub id: NodeId,

    #[command(flatten)]
    pub election: ElectionArgs,
}

/// Parameters every node of a cluster must agree on.
#[derive(Args, Debug, Clone)]
pub struct ElectionArgs {
    /// Number of nodes in the cluster.
    #[arg(long, default_value_t = 5)]
    pub nodes: usize,

    /// Port of node 0; node i listens on base-port + i.
    #[arg(long, default_value_t = 5000)]
    pub base_port: u16,

    /// Interface every node binds on.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    #[arg(long, default_value_t = 1500)]
    pub election_timeout_min_ms: u64,

    #[arg(long, default_value_t = 3000)]
    pub election_timeout_max_ms: u64,

    /// How often each node checks its election timer.
    #[arg(long, default_value_t = 100)]
    pub tick_ms: u64,

    /// How often a leader broadcasts heartbeats.
    #[arg(long, default_value_t = 500)]
    pub heartbeat_ms: u64,

    /// Sleep between receive polls when no datagram is pending.
    #[arg(long, default_value_t = 10)]
    pub poll_ms: u64,

    /// Seed for reproducible election timeouts.
    #[arg(long)]
    pub seed: Option<u64>,
}

impl ElectionArgs {
    /// Converts the flags into an [`ElectionConfig`]. The result is not
    /// validated yet.
    pub fn to_config(&self) -> ElectionConfig {
        ElectionConfig {
            total_nodes: self.nodes,
            host: self.host,
            base_port: self.base_port,
            election_timeout_min: Duration::from_millis(self.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(self.election_timeout_max_ms),
            tick_interval: Duration::from_millis(self.tick_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            poll_interval: Duration::from_millis(self.poll_ms),
            seed: self.seed,
        }
    }
}
