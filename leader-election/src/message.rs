//! Wire messages exchanged between election peers.
//!
//! Each message travels as one datagram of whitespace-separated ASCII
//! tokens, `{KIND} {sender} {term}`, for example `VOTE_REQUEST 2 7`. There is
//! no framing, checksum, or authentication: anything that reaches a node's
//! port is treated as a trusted peer.
//!
//! Datagrams are decoded exactly once, at the transport boundary, into the
//! closed [`Message`] enum. The node never looks at raw text.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::{NodeId, Term};

/// Largest datagram a transport will read.
pub const MAX_DATAGRAM: usize = 1024;

const VOTE_REQUEST: &str = "VOTE_REQUEST";
const VOTE_RESPONSE: &str = "VOTE_RESPONSE";
const HEARTBEAT: &str = "HEARTBEAT";

/// A decoded election message. Every variant carries its sender and term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Message {
    /// A candidate asks for a vote in `term`.
    VoteRequest { candidate_id: NodeId, term: Term },
    /// A voter grants its vote for `term`. Refusals are never sent.
    VoteResponse { voter_id: NodeId, term: Term },
    /// A leader asserts its leadership for `term`.
    Heartbeat { leader_id: NodeId, term: Term },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::VoteRequest { .. } => VOTE_REQUEST,
            Message::VoteResponse { .. } => VOTE_RESPONSE,
            Message::Heartbeat { .. } => HEARTBEAT,
        }
    }

    /// Id of the node that sent the message.
    pub fn sender(&self) -> NodeId {
        match *self {
            Message::VoteRequest { candidate_id, .. } => candidate_id,
            Message::VoteResponse { voter_id, .. } => voter_id,
            Message::Heartbeat { leader_id, .. } => leader_id,
        }
    }

    pub fn term(&self) -> Term {
        match *self {
            Message::VoteRequest { term, .. }
            | Message::VoteResponse { term, .. }
            | Message::Heartbeat { term, .. } => term,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Decodes one datagram. Surrounding whitespace, including a trailing
    /// newline from tools like `nc -u`, is ignored.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] naming the first malformed part.
    pub fn decode(datagram: &[u8]) -> Result<Self, DecodeError> {
        std::str::from_utf8(datagram)
            .map_err(|_| DecodeError::NotUtf8)?
            .parse()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.kind(), self.sender(), self.term())
    }
}

impl FromStr for Message {
    type Err = DecodeError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut tokens = line.split_whitespace();
        let kind = tokens.next().ok_or(DecodeError::Empty)?;
        if !matches!(kind, VOTE_REQUEST | VOTE_RESPONSE | HEARTBEAT) {
            return Err(DecodeError::UnknownKind(kind.to_string()));
        }

        let sender: NodeId = parse_field(tokens.next(), "sender")?;
        let term: Term = parse_field(tokens.next(), "term")?;
        if tokens.next().is_some() {
            return Err(DecodeError::TrailingTokens);
        }

        Ok(match kind {
            VOTE_REQUEST => Message::VoteRequest {
                candidate_id: sender,
                term,
            },
            VOTE_RESPONSE => Message::VoteResponse {
                voter_id: sender,
                term,
            },
            _ => Message::Heartbeat {
                leader_id: sender,
                term,
            },
        })
    }
}

fn parse_field<T: FromStr>(token: Option<&str>, field: &'static str) -> Result<T, DecodeError> {
    let token = token.ok_or(DecodeError::MissingField(field))?;
    token.parse().map_err(|_| DecodeError::InvalidNumber {
        field,
        value: token.to_string(),
    })
}

/// Why a datagram could not be turned into a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("datagram is not valid UTF-8")]
    NotUtf8,
    #[error("empty datagram")]
    Empty,
    #[error("unknown message kind {0:?}")]
    UnknownKind(String),
    #[error("missing {0} field")]
    MissingField(&'static str),
    #[error("invalid {field} {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("unexpected tokens after term")]
    TrailingTokens,
}
