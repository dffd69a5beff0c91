//! Protocol Message Model
//!
//! The two message shapes exchanged on a connection: requests carry a
//! subject for handler routing, replies carry a status. Heartbeats are
//! ordinary requests/replies on a reserved subject. Message ids are unique
//! per originating node for the lifetime of the process and correlate a
//! reply to its request.

use crate::address::Address;
use bytes::Bytes;

/// Reserved subject for the heartbeat sub-protocol.
///
/// This name is a wire contract: it must never change across protocol
/// versions, and no application handler may register under it.
pub const HEARTBEAT_SUBJECT: &str = "internal-heartbeat";

/// Status of a reply.
///
/// Discriminant values are a stable wire contract; never renumber, only
/// append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    ErrorNoHandler = 1,
    ErrorHandlerException = 2,
    ProtocolException = 3,
}

impl ReplyStatus {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Ok),
            1 => Some(Self::ErrorNoHandler),
            2 => Some(Self::ErrorHandlerException),
            3 => Some(Self::ProtocolException),
            _ => None,
        }
    }
}

/// A subject-addressed request sent to a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolRequest {
    pub id: u64,
    pub sender: Address,
    pub subject: String,
    pub payload: Bytes,
}

impl ProtocolRequest {
    pub fn new(id: u64, sender: Address, subject: impl Into<String>, payload: Bytes) -> Self {
        Self {
            id,
            sender,
            subject: subject.into(),
            payload,
        }
    }

    /// Whether this request belongs to the heartbeat sub-protocol
    pub fn is_heartbeat(&self) -> bool {
        self.subject == HEARTBEAT_SUBJECT
    }
}

/// A reply correlated to a request by id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolReply {
    pub id: u64,
    pub status: ReplyStatus,
    pub payload: Bytes,
}

impl ProtocolReply {
    pub fn new(id: u64, status: ReplyStatus, payload: Bytes) -> Self {
        Self {
            id,
            status,
            payload,
        }
    }

    pub fn ok(id: u64, payload: Bytes) -> Self {
        Self::new(id, ReplyStatus::Ok, payload)
    }
}

/// Either message shape, as produced by the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    Request(ProtocolRequest),
    Reply(ProtocolReply),
}

impl ProtocolMessage {
    pub fn id(&self) -> u64 {
        match self {
            Self::Request(r) => r.id,
            Self::Reply(r) => r.id,
        }
    }
}
