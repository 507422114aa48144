//! Randomized-timeout leader election for a fixed set of peers.
//!
//! A cluster of `N` nodes agrees on at most one leader per term using the
//! election half of Raft: followers that stop hearing heartbeats time out
//! after a randomized delay, become candidates for a new term, and win with
//! votes from a strict majority. There is no log replication, persistence,
//! or membership change.
//!
//! # Architecture
//!
//! - [`node`]: the election state machine. Pure, deterministic, no I/O.
//! - [`message`]: the three wire messages and their `KIND sender term` text
//!   encoding.
//! - [`transport`]: unreliable non-blocking delivery over UDP, or over an
//!   in-memory network for tests.
//! - [`runtime`]: per-node Tokio tasks. A receive duty and a tick duty feed
//!   a single actor that owns the node, so state is never shared.
//! - [`cluster`]: starts all nodes of a cluster in one process.
//! - [`config`]: cluster parameters shared by every node.
//! - [`cli`]: command-line interface of the `leader-election` binary.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod message;
pub mod node;
pub mod runtime;
pub mod timer;
pub mod transport;

/// Index of a node in `0..total_nodes`. Also fixes its port.
pub type NodeId = usize;

/// Election epoch. Never decreases on any node.
pub type Term = u64;
