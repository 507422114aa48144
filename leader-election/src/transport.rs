//! Unreliable, non-blocking message delivery between peers.
//!
//! A [`Transport`] is one node's endpoint. Sending is fire-and-forget: send
//! failures are logged and swallowed, never reported to the node. Receiving
//! never blocks: [`Transport::try_receive`] returns `None` as soon as nothing
//! is pending. Malformed datagrams are dropped at this boundary so the node
//! only ever sees decoded [`Message`]s.
//!
//! Two endpoints are provided:
//!
//! - [`UdpTransport`]: one UDP socket per node at `host:(base_port + id)`.
//! - [`MemoryTransport`]: endpoints of a [`MemoryNetwork`], used by tests to
//!   run real node runtimes without ports and to cut nodes off on demand.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::NodeId;
use crate::config::ElectionConfig;
use crate::message::{MAX_DATAGRAM, Message};

/// A decoded message and the address it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inbound {
    pub message: Message,
    pub from: SocketAddr,
}

/// One node's endpoint on an unreliable network.
///
/// Implementations must never block and never surface delivery failures;
/// the election protocol already tolerates lost messages.
pub trait Transport: Send + Sync + 'static {
    /// Best-effort delivery of `message` to node `to`.
    fn send(&self, to: NodeId, message: &Message);

    /// Next decodable message, or `None` when nothing is pending.
    fn try_receive(&self) -> Option<Inbound>;

    fn local_addr(&self) -> SocketAddr;
}

/// Decodes a raw datagram, logging and discarding anything malformed.
fn decode_datagram(datagram: &[u8], from: SocketAddr) -> Option<Inbound> {
    match Message::decode(datagram) {
        Ok(message) => Some(Inbound { message, from }),
        Err(err) => {
            debug!(%from, error = %err, "dropping malformed datagram");
            None
        }
    }
}

/// A node's UDP socket plus the addresses of all peers.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    peers: Vec<SocketAddr>,
}

impl UdpTransport {
    /// Binds node `id`'s well-known address.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `id` is outside the cluster or the port range overflows
    /// - The address is already in use or cannot be bound
    pub async fn bind(config: &ElectionConfig, id: NodeId) -> Result<Self> {
        let addr = config
            .addr_of(id)
            .ok_or_else(|| anyhow!("node {id} is outside a {}-node cluster", config.total_nodes))?;
        let peers = (0..config.total_nodes)
            .map(|peer| config.addr_of(peer))
            .collect::<Option<Vec<_>>>()
            .context("peer port range overflows")?;
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind node {id} to {addr}"))?;
        // try_send_to reports WouldBlock until the reactor has seen the
        // socket become writable once.
        socket
            .writable()
            .await
            .with_context(|| format!("socket for node {id} never became writable"))?;
        let local_addr = socket.local_addr()?;
        debug!(id, %local_addr, "udp transport bound");
        Ok(Self {
            socket,
            local_addr,
            peers,
        })
    }
}

impl Transport for UdpTransport {
    fn send(&self, to: NodeId, message: &Message) {
        let Some(addr) = self.peers.get(to) else {
            warn!(to, "no address for peer, dropping message");
            return;
        };
        match self.socket.try_send_to(&message.encode(), *addr) {
            Ok(_) => trace!(%addr, %message, "sent"),
            Err(err) => warn!(%addr, kind = message.kind(), error = %err, "failed to send message"),
        }
    }

    fn try_receive(&self) -> Option<Inbound> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok((len, from)) => {
                    if let Some(inbound) = decode_datagram(&buf[..len], from) {
                        return Some(inbound);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return None,
                Err(err) => {
                    // ICMP errors from earlier sends can surface here.
                    debug!(error = %err, "receive failed");
                    return None;
                }
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

type Datagram = (Vec<u8>, SocketAddr);

/// In-process network connecting the endpoints of one cluster.
///
/// Messages still travel as encoded datagrams so the codec is exercised
/// exactly as over UDP. A node can be isolated, which silently drops all
/// traffic to and from it until it is healed.
///
/// The network only keeps the sending half of each inbox. Once a node's
/// [`MemoryTransport`] is dropped its inbox closes and traffic to it is
/// discarded instead of queued.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    addrs: Vec<SocketAddr>,
    inboxes: Vec<Sender<Datagram>>,
    /// Receiving halves not yet claimed by a [`MemoryTransport`].
    unclaimed: Mutex<Vec<Option<Receiver<Datagram>>>>,
    isolated: Vec<AtomicBool>,
}

impl MemoryNetwork {
    pub fn new(config: &ElectionConfig) -> Result<Self> {
        let addrs = (0..config.total_nodes)
            .map(|id| config.addr_of(id))
            .collect::<Option<Vec<_>>>()
            .context("peer port range overflows")?;
        let (inboxes, unclaimed): (Vec<_>, Vec<_>) = addrs
            .iter()
            .map(|_| {
                let (sender, receiver) = unbounded();
                (sender, Some(receiver))
            })
            .unzip();
        let isolated = addrs.iter().map(|_| AtomicBool::new(false)).collect();
        Ok(Self {
            inner: Arc::new(NetworkInner {
                addrs,
                inboxes,
                unclaimed: Mutex::new(unclaimed),
                isolated,
            }),
        })
    }

    /// Endpoint for node `id`. Each endpoint can be claimed once; later
    /// calls for the same id return `None`.
    pub fn transport(&self, id: NodeId) -> Option<MemoryTransport> {
        let inbox = self.inner.unclaimed.lock().ok()?.get_mut(id)?.take()?;
        Some(MemoryTransport {
            id,
            local_addr: self.inner.addrs[id],
            inbox,
            network: self.clone(),
        })
    }

    /// Datagrams waiting in node `id`'s inbox.
    pub fn pending(&self, id: NodeId) -> usize {
        self.inner.inboxes.get(id).map_or(0, Sender::len)
    }

    pub fn isolate(&self, id: NodeId) {
        if let Some(flag) = self.inner.isolated.get(id) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn heal(&self, id: NodeId) {
        if let Some(flag) = self.inner.isolated.get(id) {
            flag.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_isolated(&self, id: NodeId) -> bool {
        self.inner
            .isolated
            .get(id)
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Puts raw bytes in node `to`'s inbox, as if a datagram had arrived
    /// from `from`.
    pub fn inject(&self, to: NodeId, datagram: &[u8], from: SocketAddr) {
        if let Some(sender) = self.inner.inboxes.get(to) {
            let _ = sender.send((datagram.to_vec(), from));
        }
    }

    fn deliver(&self, from: NodeId, to: NodeId, datagram: Vec<u8>) -> Result<()> {
        if self.is_isolated(from) || self.is_isolated(to) {
            trace!(from, to, "isolated, dropping message");
            return Ok(());
        }
        let sender = self
            .inner
            .inboxes
            .get(to)
            .ok_or_else(|| anyhow!("no endpoint for node {to}"))?;
        sender
            .send((datagram, self.inner.addrs[from]))
            .map_err(|_| anyhow!("inbox of node {to} is closed"))
    }
}

/// Endpoint of a [`MemoryNetwork`]. Dropping it closes the node's inbox.
pub struct MemoryTransport {
    id: NodeId,
    local_addr: SocketAddr,
    inbox: Receiver<Datagram>,
    network: MemoryNetwork,
}

impl Transport for MemoryTransport {
    fn send(&self, to: NodeId, message: &Message) {
        if let Err(err) = self.network.deliver(self.id, to, message.encode()) {
            debug!(to, kind = message.kind(), error = %err, "message dropped");
        }
    }

    fn try_receive(&self) -> Option<Inbound> {
        loop {
            match self.inbox.try_recv() {
                Ok((datagram, from)) => {
                    if self.network.is_isolated(self.id) {
                        continue;
                    }
                    if let Some(inbound) = decode_datagram(&datagram, from) {
                        return Some(inbound);
                    }
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return None,
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config(total_nodes: usize) -> ElectionConfig {
        ElectionConfig::new(total_nodes, 9000)
    }

    #[test]
    fn memory_network_delivers_encoded_messages() -> Result<()> {
        let network = MemoryNetwork::new(&memory_config(3))?;
        let a = network.transport(0).expect("node 0");
        let b = network.transport(1).expect("node 1");
        assert_eq!(b.try_receive(), None);

        let message = Message::VoteRequest {
            candidate_id: 0,
            term: 4,
        };
        a.send(1, &message);
        assert_eq!(
            b.try_receive(),
            Some(Inbound {
                message,
                from: a.local_addr()
            })
        );
        assert_eq!(b.try_receive(), None);
        Ok(())
    }

    #[test]
    fn isolated_nodes_neither_send_nor_receive() -> Result<()> {
        let network = MemoryNetwork::new(&memory_config(3))?;
        let a = network.transport(0).expect("node 0");
        let b = network.transport(1).expect("node 1");
        let heartbeat = Message::Heartbeat {
            leader_id: 0,
            term: 1,
        };

        network.isolate(0);
        a.send(1, &heartbeat);
        assert_eq!(b.try_receive(), None);

        // Already queued traffic is dropped once the receiver is cut off.
        network.heal(0);
        a.send(1, &heartbeat);
        network.isolate(1);
        assert_eq!(b.try_receive(), None);

        network.heal(1);
        a.send(1, &heartbeat);
        assert_eq!(b.try_receive().map(|inbound| inbound.message), Some(heartbeat));
        Ok(())
    }

    #[test]
    fn malformed_datagrams_are_skipped() -> Result<()> {
        let network = MemoryNetwork::new(&memory_config(2))?;
        let b = network.transport(1).expect("node 1");
        let from: SocketAddr = "127.0.0.1:4000".parse()?;
        network.inject(1, b"garbage", from);
        network.inject(1, b"HEARTBEAT 0", from);
        network.inject(1, b"HEARTBEAT 0 2\n", from);

        assert_eq!(
            b.try_receive(),
            Some(Inbound {
                message: Message::Heartbeat {
                    leader_id: 0,
                    term: 2
                },
                from
            })
        );
        assert_eq!(b.try_receive(), None);
        Ok(())
    }

    #[test]
    fn unknown_endpoint_is_none() -> Result<()> {
        let network = MemoryNetwork::new(&memory_config(2))?;
        assert!(network.transport(2).is_none());
        Ok(())
    }

    #[test]
    fn endpoints_are_claimed_once() -> Result<()> {
        let network = MemoryNetwork::new(&memory_config(2))?;
        assert!(network.transport(0).is_some());
        assert!(network.transport(0).is_none());
        assert!(network.transport(1).is_some());
        Ok(())
    }

    #[test]
    fn dropped_endpoint_stops_queueing() -> Result<()> {
        let network = MemoryNetwork::new(&memory_config(2))?;
        let a = network.transport(0).expect("node 0");
        let b = network.transport(1).expect("node 1");
        let heartbeat = Message::Heartbeat {
            leader_id: 0,
            term: 1,
        };

        a.send(1, &heartbeat);
        assert_eq!(network.pending(1), 1);
        assert!(b.try_receive().is_some());
        assert_eq!(network.pending(1), 0);

        drop(b);
        for _ in 0..100 {
            a.send(1, &heartbeat);
        }
        assert_eq!(network.pending(1), 0);
        assert!(network.deliver(0, 1, heartbeat.encode()).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn udp_transport_round_trip() -> Result<()> {
        let config = ElectionConfig::new(2, 17901);
        let a = UdpTransport::bind(&config, 0).await?;
        let b = UdpTransport::bind(&config, 1).await?;
        assert_eq!(b.local_addr(), config.addr_of(1).expect("addr"));

        let message = Message::VoteResponse {
            voter_id: 0,
            term: 2,
        };
        a.send(1, &message);

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        let inbound = loop {
            if let Some(inbound) = b.try_receive() {
                break inbound;
            }
            assert!(tokio::time::Instant::now() < deadline, "datagram never arrived");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        assert_eq!(inbound.message, message);
        assert_eq!(inbound.from, a.local_addr());
        Ok(())
    }

    #[tokio::test]
    async fn udp_bind_rejects_unknown_node() {
        let config = ElectionConfig::new(2, 17911);
        assert!(UdpTransport::bind(&config, 5).await.is_err());
    }
}
