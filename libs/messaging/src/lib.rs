//! Cluster Messaging Transport
//!
//! Point-to-point messaging between cluster nodes: typed, subject-addressed
//! binary messages over persistent TCP connections, with request/response
//! correlation, per-peer channel pooling, heartbeat-based liveness
//! detection and protocol version negotiation for rolling upgrades.
//!
//! The entry point is [`MessagingService`]; the
//! [`cluster::ClusterCommunicationService`] layer on top addresses peers by
//! member id instead of network address.

pub mod address;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod message;
pub mod metrics;
pub mod protocol;
pub mod service;

mod handshake;
mod heartbeat;
mod pool;

// Re-export commonly used types
pub use address::Address;
pub use cluster::{ClusterCommunicationService, Member, MemberId, MembershipLookup};
pub use config::{CompressionAlgorithm, MessagingConfig};
pub use connection::{ClientConnection, StreamWrapper};
pub use error::{MessagingError, Result};
pub use message::{ProtocolReply, ProtocolRequest, ReplyStatus, HEARTBEAT_SUBJECT};
pub use metrics::{MessagingMetrics, MetricsSnapshot};
pub use protocol::ProtocolVersion;
pub use service::MessagingService;
