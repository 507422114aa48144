//! Election state machine for a single peer.
//!
//! [`Node`] is pure state: it never touches sockets, clocks, or tasks. The
//! runtime feeds it ticks and decoded messages, and every call returns a
//! [`Ready`] bundle holding the messages to send and the events to report.
//!
//! # Rules
//!
//! - Followers and candidates advance their election timer on every tick and
//!   start an election once it exceeds the randomized timeout. Leaders never
//!   time out; they broadcast heartbeats every heartbeat interval instead.
//! - A node grants at most one vote per term, first come first served. The
//!   vote is only cleared when the term advances.
//! - Votes are counted per distinct voter and only for the current term.
//! - Any message carrying a lower term is ignored without side effects.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, trace};

use crate::config::ElectionConfig;
use crate::message::Message;
use crate::timer::ElectionTimer;
use crate::{NodeId, Term};

/// Election role. Every node starts as a follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// A message addressed to one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outbound {
    pub to: NodeId,
    pub message: Message,
}

/// Observable milestones of an election, reported for logging and for
/// external verification of a running cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionEvent {
    BecameCandidate { term: Term },
    VoteGranted { candidate: NodeId, term: Term },
    VoteReceived { voter: NodeId, votes: usize, term: Term },
    HeartbeatObserved { leader: NodeId, term: Term },
    ElectedLeader { term: Term },
    /// A candidate or leader fell back to follower.
    SteppedDown { term: Term },
}

/// Output of one state-machine step.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Ready {
    pub messages: Vec<Outbound>,
    pub events: Vec<ElectionEvent>,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.events.is_empty()
    }

    fn send(&mut self, to: NodeId, message: Message) {
        self.messages.push(Outbound { to, message });
    }
}

/// Point-in-time view of a node, returned by status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub vote_count: usize,
    /// Leader known for the current term: self when leading, otherwise the
    /// sender of the last accepted heartbeat.
    pub leader: Option<NodeId>,
}

/// One peer's election state.
///
/// Mutated only through [`tick`](Node::tick), [`campaign`](Node::campaign)
/// and [`step`](Node::step); the caller is responsible for delivering the
/// returned [`Ready`].
pub struct Node {
    id: NodeId,
    total_nodes: usize,
    peers: Vec<NodeId>,
    majority: usize,
    heartbeat_interval: Duration,
    term: Term,
    role: Role,
    voted_for: Option<NodeId>,
    votes: BTreeSet<NodeId>,
    leader: Option<NodeId>,
    election_timer: ElectionTimer,
    since_heartbeat: Duration,
    rng: StdRng,
}

impl Node {
    /// Creates a follower at term 0.
    ///
    /// With `config.seed` set, the node's timeouts are reproducible; each node
    /// offsets the seed by its id so peers still draw different timeouts.
    pub fn new(id: NodeId, config: &ElectionConfig) -> Self {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id as u64)),
            None => StdRng::from_entropy(),
        };
        let election_timer = ElectionTimer::new(
            config.election_timeout_min,
            config.election_timeout_max,
            &mut rng,
        );
        Self {
            id,
            total_nodes: config.total_nodes,
            peers: config.peers_of(id).collect(),
            majority: config.majority(),
            heartbeat_interval: config.heartbeat_interval,
            term: 0,
            role: Role::Follower,
            voted_for: None,
            votes: BTreeSet::new(),
            leader: None,
            election_timer,
            since_heartbeat: Duration::ZERO,
            rng,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// Votes gathered in the current election attempt, self-vote included.
    /// Zero for followers.
    pub fn vote_count(&self) -> usize {
        match self.role {
            Role::Follower => 0,
            Role::Candidate | Role::Leader => self.votes.len(),
        }
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    /// Time accumulated on the election timer since its last reset.
    pub fn election_elapsed(&self) -> Duration {
        self.election_timer.elapsed()
    }

    /// The currently drawn election timeout.
    pub fn election_timeout(&self) -> Duration {
        self.election_timer.timeout()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            role: self.role,
            term: self.term,
            voted_for: self.voted_for,
            vote_count: self.vote_count(),
            leader: self.leader,
        }
    }

    /// Advances the node's clocks by `elapsed`.
    ///
    /// Followers and candidates move their election timer and start an
    /// election once it expires. Leaders only move their heartbeat clock.
    pub fn tick(&mut self, elapsed: Duration) -> Ready {
        let mut ready = Ready::default();
        match self.role {
            Role::Leader => {
                self.since_heartbeat = self.since_heartbeat.saturating_add(elapsed);
                if self.since_heartbeat >= self.heartbeat_interval {
                    self.broadcast_heartbeat(&mut ready);
                }
            }
            Role::Follower | Role::Candidate => {
                if self.election_timer.advance(elapsed) {
                    debug!(
                        term = self.term,
                        timeout_ms = self.election_timer.timeout().as_millis() as u64,
                        "election timeout expired"
                    );
                    self.become_candidate(&mut ready);
                }
            }
        }
        ready
    }

    /// Starts an election right away, as if the election timer had expired.
    /// Does nothing on a leader.
    pub fn campaign(&mut self) -> Ready {
        let mut ready = Ready::default();
        self.become_candidate(&mut ready);
        ready
    }

    /// Handles one decoded message from a peer.
    pub fn step(&mut self, message: Message) -> Ready {
        let mut ready = Ready::default();
        let sender = message.sender();
        if sender == self.id || sender >= self.total_nodes {
            debug!(%message, "ignoring message from unknown sender");
            return ready;
        }

        match message {
            Message::VoteRequest { candidate_id, term } => {
                self.handle_vote_request(candidate_id, term, &mut ready)
            }
            Message::VoteResponse { voter_id, term } => {
                self.handle_vote_response(voter_id, term, &mut ready)
            }
            Message::Heartbeat { leader_id, term } => {
                self.handle_heartbeat(leader_id, term, &mut ready)
            }
        }
        ready
    }

    fn become_candidate(&mut self, ready: &mut Ready) {
        if self.role == Role::Leader {
            return;
        }

        self.role = Role::Candidate;
        self.term += 1;
        self.voted_for = Some(self.id);
        self.votes.clear();
        self.votes.insert(self.id);
        self.leader = None;
        self.election_timer.reset(&mut self.rng);
        ready.events.push(ElectionEvent::BecameCandidate { term: self.term });

        let request = Message::VoteRequest {
            candidate_id: self.id,
            term: self.term,
        };
        for &peer in &self.peers {
            ready.send(peer, request);
        }

        // A single-node cluster wins on its own vote.
        if self.has_majority() {
            self.become_leader(ready);
        }
    }

    fn become_leader(&mut self, ready: &mut Ready) {
        self.role = Role::Leader;
        self.leader = Some(self.id);
        ready.events.push(ElectionEvent::ElectedLeader { term: self.term });
        self.broadcast_heartbeat(ready);
    }

    fn broadcast_heartbeat(&mut self, ready: &mut Ready) {
        self.since_heartbeat = Duration::ZERO;
        let heartbeat = Message::Heartbeat {
            leader_id: self.id,
            term: self.term,
        };
        for &peer in &self.peers {
            ready.send(peer, heartbeat);
        }
    }

    /// Moves to a newer term as a follower with no vote cast.
    fn adopt_term(&mut self, term: Term, ready: &mut Ready) {
        debug_assert!(term > self.term);
        if self.role != Role::Follower {
            ready.events.push(ElectionEvent::SteppedDown { term });
        }
        self.term = term;
        self.role = Role::Follower;
        self.voted_for = None;
        self.votes.clear();
        self.leader = None;
    }

    fn handle_vote_request(&mut self, candidate_id: NodeId, candidate_term: Term, ready: &mut Ready) {
        if candidate_term > self.term {
            self.adopt_term(candidate_term, ready);
        }

        let free_to_vote = self.voted_for.map_or(true, |voted| voted == candidate_id);
        if !free_to_vote || candidate_term < self.term {
            trace!(
                candidate = candidate_id,
                candidate_term,
                voted_for = ?self.voted_for,
                "vote refused"
            );
            return;
        }

        // Re-answering a duplicate request is harmless: the candidate counts
        // each voter once.
        if self.voted_for.is_none() {
            self.voted_for = Some(candidate_id);
            ready.events.push(ElectionEvent::VoteGranted {
                candidate: candidate_id,
                term: self.term,
            });
        }
        self.election_timer.reset(&mut self.rng);
        ready.send(
            candidate_id,
            Message::VoteResponse {
                voter_id: self.id,
                term: self.term,
            },
        );
    }

    fn handle_vote_response(&mut self, voter_id: NodeId, voter_term: Term, ready: &mut Ready) {
        if self.role != Role::Candidate || voter_term != self.term {
            trace!(voter = voter_id, voter_term, role = %self.role, "vote response ignored");
            return;
        }
        if !self.votes.insert(voter_id) {
            return;
        }

        ready.events.push(ElectionEvent::VoteReceived {
            voter: voter_id,
            votes: self.votes.len(),
            term: self.term,
        });
        if self.has_majority() {
            self.become_leader(ready);
        }
    }

    fn handle_heartbeat(&mut self, leader_id: NodeId, leader_term: Term, ready: &mut Ready) {
        if leader_term < self.term {
            trace!(leader = leader_id, leader_term, "stale heartbeat ignored");
            return;
        }

        if leader_term > self.term {
            self.adopt_term(leader_term, ready);
        } else if self.role != Role::Follower {
            ready.events.push(ElectionEvent::SteppedDown { term: self.term });
            self.role = Role::Follower;
            self.votes.clear();
        }

        self.leader = Some(leader_id);
        self.election_timer.reset(&mut self.rng);
        ready.events.push(ElectionEvent::HeartbeatObserved {
            leader: leader_id,
            term: leader_term,
        });
    }

    fn has_majority(&self) -> bool {
        self.votes.len() >= self.majority
    }
}
