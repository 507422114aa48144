//! Starts every node of a cluster in one process.
//!
//! Nodes still talk only through their transports; the harness just owns
//! their handles and a shared event stream.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::NodeId;
use crate::config::ElectionConfig;
use crate::node::{Node, NodeStatus, Role};
use crate::runtime::{EVENT_BUFFER, NodeEvent, NodeHandle, spawn_node_with_events};
use crate::transport::{MemoryNetwork, UdpTransport};

/// Handles of every node in a cluster, plus the shared event stream.
///
/// Node `i` is always `handles()[i]`, also after it has been shut down.
pub struct Cluster {
    config: ElectionConfig,
    handles: Vec<NodeHandle>,
    events: broadcast::Sender<NodeEvent>,
    network: Option<MemoryNetwork>,
}

impl Cluster {
    /// Binds one UDP socket per node and starts all nodes.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or any node's port
    /// cannot be bound. Nodes started before the failure are stopped when
    /// their handles drop.
    pub async fn spawn_udp(config: ElectionConfig) -> Result<Self> {
        config.validate().context("invalid cluster configuration")?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let mut handles = Vec::with_capacity(config.total_nodes);
        for id in 0..config.total_nodes {
            let transport = UdpTransport::bind(&config, id).await?;
            let node = Node::new(id, &config);
            handles.push(spawn_node_with_events(node, transport, &config, events.clone()));
        }
        info!(
            nodes = config.total_nodes,
            base_port = config.base_port,
            "udp cluster started"
        );
        Ok(Self {
            config,
            handles,
            events,
            network: None,
        })
    }

    /// Starts all nodes over an in-process [`MemoryNetwork`].
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn spawn_memory(config: ElectionConfig) -> Result<Self> {
        config.validate().context("invalid cluster configuration")?;
        let network = MemoryNetwork::new(&config)?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let mut handles = Vec::with_capacity(config.total_nodes);
        for id in 0..config.total_nodes {
            let transport = network
                .transport(id)
                .with_context(|| format!("no endpoint for node {id}"))?;
            let node = Node::new(id, &config);
            handles.push(spawn_node_with_events(node, transport, &config, events.clone()));
        }
        info!(nodes = config.total_nodes, "memory cluster started");
        Ok(Self {
            config,
            handles,
            events,
            network: Some(network),
        })
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    pub fn handles(&self) -> &[NodeHandle] {
        &self.handles
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeHandle> {
        self.handles.get(id)
    }

    /// The in-process network, for clusters started with
    /// [`spawn_memory`](Cluster::spawn_memory).
    pub fn network(&self) -> Option<&MemoryNetwork> {
        self.network.as_ref()
    }

    /// Events of every node in the cluster.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Status of every node that is still running.
    pub async fn statuses(&self) -> Vec<NodeStatus> {
        let mut statuses = Vec::with_capacity(self.handles.len());
        for handle in &self.handles {
            if let Ok(status) = handle.status().await {
                statuses.push(status);
            }
        }
        statuses
    }

    pub async fn leaders(&self) -> Vec<NodeStatus> {
        self.statuses()
            .await
            .into_iter()
            .filter(|status| status.role == Role::Leader)
            .collect()
    }

    /// Polls until exactly one running node believes it is leader.
    ///
    /// # Errors
    ///
    /// Returns error if no single leader shows up within `timeout`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let leaders = self.leaders().await;
            if let [leader] = leaders.as_slice() {
                return Ok(*leader);
            }
            if Instant::now() >= deadline {
                bail!(
                    "no single leader after {timeout:?} ({} nodes claim leadership)",
                    leaders.len()
                );
            }
            sleep(self.config.tick_interval).await;
        }
    }

    /// Stops one node; the rest keep running.
    pub async fn shutdown_node(&mut self, id: NodeId) -> Result<()> {
        let handle = self
            .handles
            .get_mut(id)
            .with_context(|| format!("no node {id}"))?;
        handle.shutdown().await
    }

    /// Stops every node and waits for their tasks.
    ///
    /// All nodes are signalled before any is joined, so one failing node
    /// never leaves the others running.
    ///
    /// # Errors
    ///
    /// Returns the first task failure after every node has been joined.
    pub async fn shutdown(&mut self) -> Result<()> {
        for handle in &self.handles {
            handle.signal_shutdown();
        }
        let mut first_error = None;
        for handle in &mut self.handles {
            if let Err(err) = handle.shutdown().await {
                warn!(node = handle.id(), error = %err, "node did not stop cleanly");
                first_error.get_or_insert(err);
            }
        }
        info!("cluster stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Runs until `shutdown` completes, then stops every node.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        shutdown.await;
        self.shutdown().await
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use crate::message::Message;
    use crate::transport::{Inbound, Transport};

    /// Panics on the first send, taking the node's actor down with it.
    struct FailingTransport {
        local_addr: SocketAddr,
    }

    impl Transport for FailingTransport {
        fn send(&self, to: NodeId, message: &Message) {
            panic!("send of {message} to node {to} failed");
        }

        fn try_receive(&self) -> Option<Inbound> {
            None
        }

        fn local_addr(&self) -> SocketAddr {
            self.local_addr
        }
    }

    fn quiet_config() -> ElectionConfig {
        ElectionConfig {
            election_timeout_min: Duration::from_secs(30),
            election_timeout_max: Duration::from_secs(30),
            tick_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(50),
            poll_interval: Duration::from_millis(2),
            seed: Some(3),
            ..ElectionConfig::new(3, 9200)
        }
    }

    #[tokio::test]
    async fn shutdown_stops_remaining_nodes_after_a_failure() -> Result<()> {
        let config = quiet_config();
        let network = MemoryNetwork::new(&config)?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let failing = FailingTransport {
            local_addr: config.addr_of(0).context("addr")?,
        };
        let mut handles = vec![spawn_node_with_events(
            Node::new(0, &config),
            failing,
            &config,
            events.clone(),
        )];
        for id in 1..config.total_nodes {
            let transport = network.transport(id).context("endpoint")?;
            handles.push(spawn_node_with_events(
                Node::new(id, &config),
                transport,
                &config,
                events.clone(),
            ));
        }
        let mut cluster = Cluster {
            config,
            handles,
            events,
            network: Some(network),
        };

        // Campaigning sends vote requests, which panics node 0's actor.
        assert!(cluster.node(0).context("node 0")?.campaign().await.is_err());

        assert!(cluster.shutdown().await.is_err());
        for handle in cluster.handles() {
            assert!(!handle.is_running(), "node {} still running", handle.id());
        }
        Ok(())
    }
}
