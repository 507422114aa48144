//! Cluster-wide election parameters.
//!
//! Every node of a cluster is started from the same [`ElectionConfig`], which
//! is how peers find each other without a directory service: node `i` always
//! lives at `host:(base_port + i)`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;

use crate::NodeId;

/// Timing and addressing shared by all nodes of a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionConfig {
    /// Number of nodes; ids run from `0` to `total_nodes - 1`.
    pub total_nodes: usize,
    /// Interface every node binds on.
    pub host: IpAddr,
    /// Port of node 0; node `i` listens on `base_port + i`.
    pub base_port: u16,
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min: Duration,
    /// Upper bound (inclusive) of the randomized election timeout.
    pub election_timeout_max: Duration,
    /// How often the tick duty wakes a node.
    ///
    /// Bounds how late an expired election timeout is noticed.
    pub tick_interval: Duration,
    /// How often a leader broadcasts heartbeats.
    ///
    /// Must stay below `election_timeout_min` or followers would keep
    /// starting elections against a live leader.
    pub heartbeat_interval: Duration,
    /// Sleep between receive polls when no datagram is pending.
    pub poll_interval: Duration,
    /// Seed for the per-node timeout RNG. Node `i` uses `seed + i`.
    pub seed: Option<u64>,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            total_nodes: 5,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            base_port: 5000,
            election_timeout_min: Duration::from_millis(1500),
            election_timeout_max: Duration::from_millis(3000),
            tick_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            seed: None,
        }
    }
}

impl ElectionConfig {
    /// Default timings for `total_nodes` nodes starting at `base_port`.
    pub fn new(total_nodes: usize, base_port: u16) -> Self {
        Self {
            total_nodes,
            base_port,
            ..Default::default()
        }
    }

    /// Checks that a cluster started from this config can elect a leader.
    ///
    /// # Errors
    ///
    /// Returns the first problem found:
    /// - no nodes
    /// - an empty or zero election timeout range
    /// - a zero tick, heartbeat or poll interval
    /// - a heartbeat interval not below the minimum election timeout
    /// - node ports running past 65535
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.total_nodes == 0 {
            return Err(ConfigError::NoNodes);
        }
        if self.election_timeout_min.is_zero()
            || self.election_timeout_min > self.election_timeout_max
        {
            return Err(ConfigError::InvalidTimeoutRange {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        for (name, interval) in [
            ("tick interval", self.tick_interval),
            ("heartbeat interval", self.heartbeat_interval),
            ("poll interval", self.poll_interval),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                min_timeout: self.election_timeout_min,
            });
        }
        let last_port = u32::from(self.base_port) + self.total_nodes as u32 - 1;
        if last_port > u32::from(u16::MAX) {
            return Err(ConfigError::PortOverflow {
                base_port: self.base_port,
                total_nodes: self.total_nodes,
            });
        }
        Ok(())
    }

    /// Smallest number of votes that wins an election.
    pub fn majority(&self) -> usize {
        self.total_nodes / 2 + 1
    }

    /// Address of node `id`, or `None` if the id is outside the cluster.
    pub fn addr_of(&self, id: NodeId) -> Option<SocketAddr> {
        if id >= self.total_nodes {
            return None;
        }
        let port = u16::try_from(u32::from(self.base_port) + id as u32).ok()?;
        Some(SocketAddr::new(self.host, port))
    }

    /// Every node id except `id`.
    pub fn peers_of(&self, id: NodeId) -> impl Iterator<Item = NodeId> {
        (0..self.total_nodes).filter(move |peer| *peer != id)
    }
}

/// Reasons an [`ElectionConfig`] is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("cluster requires at least one node")]
    NoNodes,
    #[error("election timeout range {min:?}..={max:?} is empty or starts at zero")]
    InvalidTimeoutRange { min: Duration, max: Duration },
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("heartbeat interval {heartbeat:?} must be below the minimum election timeout {min_timeout:?}")]
    HeartbeatTooSlow {
        heartbeat: Duration,
        min_timeout: Duration,
    },
    #[error("{total_nodes} nodes starting at port {base_port} run past port 65535")]
    PortOverflow { base_port: u16, total_nodes: usize },
}
