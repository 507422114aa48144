//! Tasks that drive a [`Node`] on a Tokio runtime.
//!
//! Each node runs three tasks:
//!
//! - **Receive duty**: polls the transport without blocking, forwards every
//!   decoded message to the actor, and sleeps for the poll interval when
//!   nothing is pending.
//! - **Tick duty**: wakes every tick interval and forwards a tick.
//! - **Actor**: owns the [`Node`] and applies inputs one at a time, then
//!   sends the resulting messages and publishes the resulting events.
//!
//! Only the actor touches node state, so the two duties never race on it.
//! All three tasks watch one shutdown signal; [`NodeHandle::shutdown`] raises
//! it and joins them, which also releases the transport.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{Instrument, debug, info, info_span};

use crate::{NodeId, Term};
use crate::config::ElectionConfig;
use crate::node::{ElectionEvent, Node, NodeStatus, Ready};
use crate::transport::{Inbound, Transport};

/// Capacity of a node's input queue. The duties wait when it is full.
const INPUT_QUEUE: usize = 1024;

/// Events retained for slow subscribers before they start lagging.
pub const EVENT_BUFFER: usize = 1024;

/// An [`ElectionEvent`] tagged with the node that emitted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEvent {
    pub node: NodeId,
    pub event: ElectionEvent,
}

enum NodeInput {
    Inbound(Inbound),
    Tick(Duration),
    Campaign {
        respond_to: oneshot::Sender<NodeStatus>,
    },
    Status {
        respond_to: oneshot::Sender<NodeStatus>,
    },
}

/// Handle to a running node.
///
/// Dropping the handle stops the node as well, but only [`shutdown`] waits
/// for its tasks to finish.
///
/// [`shutdown`]: NodeHandle::shutdown
pub struct NodeHandle {
    id: NodeId,
    inputs: mpsc::Sender<NodeInput>,
    events: broadcast::Sender<NodeEvent>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Snapshot of the node's election state.
    ///
    /// # Errors
    ///
    /// Returns error if the node has stopped.
    pub async fn status(&self) -> Result<NodeStatus> {
        let (respond_to, response) = oneshot::channel();
        self.request(NodeInput::Status { respond_to }).await?;
        response.await.context("status response channel closed")
    }

    /// Forces the node to start an election now, as if its timer expired.
    /// Returns the node's state right after the attempt started.
    ///
    /// # Errors
    ///
    /// Returns error if the node has stopped, or stopped while handling
    /// the request.
    pub async fn campaign(&self) -> Result<NodeStatus> {
        let (respond_to, response) = oneshot::channel();
        self.request(NodeInput::Campaign { respond_to }).await?;
        response.await.context("campaign response channel closed")
    }

    /// Stream of election events. In a cluster the stream is shared, so it
    /// carries every node's events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    /// Asks every task of the node to stop without waiting for them.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stops both duties and the actor, then waits for them to exit.
    /// Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if one of the node's tasks panicked.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.signal_shutdown();
        for task in self.tasks.drain(..) {
            task.await
                .with_context(|| format!("task of node {} panicked", self.id))?;
        }
        Ok(())
    }

    async fn request(&self, input: NodeInput) -> Result<()> {
        self.inputs
            .send(input)
            .await
            .map_err(|_| anyhow!("node {} has stopped", self.id))
    }
}

/// Starts `node` on the current Tokio runtime with its own event stream.
pub fn spawn_node<T: Transport>(node: Node, transport: T, config: &ElectionConfig) -> NodeHandle {
    let (events, _) = broadcast::channel(EVENT_BUFFER);
    spawn_node_with_events(node, transport, config, events)
}

/// Starts `node`, publishing its events on a caller-provided channel so a
/// whole cluster can share one stream.
pub fn spawn_node_with_events<T: Transport>(
    node: Node,
    transport: T,
    config: &ElectionConfig,
    events: broadcast::Sender<NodeEvent>,
) -> NodeHandle {
    let id = node.id();
    let span = info_span!("node", id);
    let transport = Arc::new(transport);
    let (inputs_tx, inputs_rx) = mpsc::channel(INPUT_QUEUE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let receive = tokio::spawn(
        receive_duty(
            Arc::clone(&transport),
            inputs_tx.clone(),
            config.poll_interval,
            shutdown_rx.clone(),
        )
        .instrument(span.clone()),
    );
    let tick = tokio::spawn(
        tick_duty(inputs_tx.clone(), config.tick_interval, shutdown_rx.clone())
            .instrument(span.clone()),
    );
    let actor = Actor::new(node, transport, events.clone());
    let actor = tokio::spawn(actor.run(inputs_rx, shutdown_rx).instrument(span));

    NodeHandle {
        id,
        inputs: inputs_tx,
        events,
        shutdown: shutdown_tx,
        tasks: vec![receive, tick, actor],
    }
}

/// True once shutdown was requested or the handle was dropped.
fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

async fn receive_duty<T: Transport>(
    transport: Arc<T>,
    inputs: mpsc::Sender<NodeInput>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    while !stopping(&shutdown) {
        match transport.try_receive() {
            Some(inbound) => {
                if inputs.send(NodeInput::Inbound(inbound)).await.is_err() {
                    break;
                }
            }
            None => {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = sleep(poll_interval) => {}
                }
            }
        }
    }
    debug!("receive duty stopped");
}

async fn tick_duty(
    inputs: mpsc::Sender<NodeInput>,
    tick_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of an interval completes immediately.
    ticker.tick().await;

    while !stopping(&shutdown) {
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = ticker.tick() => {
                if inputs.send(NodeInput::Tick(tick_interval)).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("tick duty stopped");
}

/// Sole owner of a node's state.
struct Actor<T> {
    node: Node,
    transport: Arc<T>,
    events: broadcast::Sender<NodeEvent>,
    /// Leader and term of the last heartbeat logged at info level.
    observed_leader: Option<(NodeId, Term)>,
}

impl<T: Transport> Actor<T> {
    fn new(node: Node, transport: Arc<T>, events: broadcast::Sender<NodeEvent>) -> Self {
        Self {
            node,
            transport,
            events,
            observed_leader: None,
        }
    }

    async fn run(mut self, mut inputs: mpsc::Receiver<NodeInput>, mut shutdown: watch::Receiver<bool>) {
        info!(addr = %self.transport.local_addr(), "node started");
        while !stopping(&shutdown) {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {}
                input = inputs.recv() => match input {
                    Some(input) => self.handle(input),
                    None => break,
                },
            }
        }
        info!(term = self.node.term(), role = %self.node.role(), "node stopped");
    }

    fn handle(&mut self, input: NodeInput) {
        let ready = match input {
            NodeInput::Inbound(Inbound { message, from }) => {
                debug!(%from, %message, "received");
                self.node.step(message)
            }
            NodeInput::Tick(elapsed) => self.node.tick(elapsed),
            NodeInput::Campaign { respond_to } => {
                let ready = self.node.campaign();
                self.apply(ready);
                let _ = respond_to.send(self.node.status());
                return;
            }
            NodeInput::Status { respond_to } => {
                let _ = respond_to.send(self.node.status());
                return;
            }
        };
        self.apply(ready);
    }

    fn apply(&mut self, ready: Ready) {
        for outbound in &ready.messages {
            self.transport.send(outbound.to, &outbound.message);
        }
        for event in ready.events {
            self.log_event(&event);
            // No subscribers is fine.
            let _ = self.events.send(NodeEvent {
                node: self.node.id(),
                event,
            });
        }
    }

    /// Heartbeats are logged at info level once per leader and term, and
    /// at debug level after that.
    fn log_event(&mut self, event: &ElectionEvent) {
        match *event {
            ElectionEvent::BecameCandidate { term } => info!(term, "became candidate"),
            ElectionEvent::VoteGranted { candidate, term } => {
                info!(candidate, term, "voted for candidate")
            }
            ElectionEvent::VoteReceived { voter, votes, term } => {
                debug!(voter, votes, term, "received vote")
            }
            ElectionEvent::HeartbeatObserved { leader, term } => {
                if self.observed_leader.replace((leader, term)) == Some((leader, term)) {
                    debug!(leader, term, "heartbeat from leader");
                } else {
                    info!(leader, term, "heartbeat from leader");
                }
            }
            ElectionEvent::ElectedLeader { term } => info!(term, "elected leader"),
            ElectionEvent::SteppedDown { term } => info!(term, "stepped down to follower"),
        }
    }
}
