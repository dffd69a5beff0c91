//! Messaging Error Types
//!
//! Error taxonomy for the cluster messaging transport. Connection and
//! protocol failures are scoped to a single connection; nothing in this
//! layer retries automatically, every failure surfaces to the caller.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Main messaging error type
#[derive(Error, Debug)]
pub enum MessagingError {
    /// Service is not started or has been stopped
    #[error("messaging service is closed")]
    Closed,

    /// Failed to establish a connection to a remote peer
    #[error("failed to connect to {address}: {message}")]
    Connect {
        address: String,
        message: String,
        source: Option<std::io::Error>,
    },

    /// Connection was closed before the operation completed
    #[error("connection to {peer} closed before the request was handled")]
    ConnectionClosed { peer: String },

    /// Wire protocol violation (malformed frame, bad handshake, unknown
    /// discriminator). Fatal to the connection, never to the process.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The remote node has no handler registered for the subject
    #[error("no remote handler registered for subject '{subject}'")]
    NoRemoteHandler { subject: String },

    /// The remote handler failed while processing the request
    #[error("remote handler failure: {}", .message.as_deref().unwrap_or("unknown"))]
    RemoteHandlerFailure { message: Option<String> },

    /// The remote node reported a protocol-level failure
    #[error("remote protocol exception")]
    RemoteProtocolException,

    /// Request timed out; always carries subject, address and the
    /// configured duration for diagnosability
    #[error("request '{subject}' to {address} timed out after {timeout:?}")]
    Timeout {
        subject: String,
        address: String,
        timeout: Duration,
    },

    /// Target member is not part of the cluster membership view
    #[error("unknown cluster member '{member}'")]
    UnknownMember { member: String },

    /// Invalid configuration
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Generic I/O failure on an established connection
    #[error("i/o error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for messaging operations
pub type Result<T> = std::result::Result<T, MessagingError>;

impl MessagingError {
    /// Create a connect error for the given remote address
    pub fn connect(address: impl ToString, source: std::io::Error) -> Self {
        Self::Connect {
            address: address.to_string(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a connect error without an underlying I/O cause
    pub fn connect_msg(address: impl ToString, message: impl Into<String>) -> Self {
        Self::Connect {
            address: address.to_string(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection-closed error
    pub fn connection_closed(peer: impl ToString) -> Self {
        Self::ConnectionClosed {
            peer: peer.to_string(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an I/O error with context
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Create a timeout error for a request
    pub fn timeout(subject: impl Into<String>, address: &SocketAddr, timeout: Duration) -> Self {
        Self::Timeout {
            subject: subject.into(),
            address: address.to_string(),
            timeout,
        }
    }

    /// Whether this error should evict the pooled channel it occurred on.
    ///
    /// Timeouts and remote application errors keep the channel alive; only
    /// transport-level failures tear it down.
    pub fn is_fatal_to_connection(&self) -> bool {
        !matches!(
            self,
            Self::Timeout { .. }
                | Self::NoRemoteHandler { .. }
                | Self::RemoteHandlerFailure { .. }
                | Self::RemoteProtocolException
        )
    }
}
