//! Messaging Service Configuration
//!
//! Plain settings object supplied at construction time. No file loading
//! here; the deployment layer owns parsing and hands over a validated
//! struct.

use crate::error::{MessagingError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Payload compression applied symmetrically by both peers of a connection.
///
/// Not negotiated: both sides of a cluster must be configured identically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Gzip,
}

/// Messaging service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Port to bind; defaults to the advertised address port
    pub port: Option<u16>,
    /// Interfaces to bind; defaults to the advertised host when empty
    pub interfaces: Vec<String>,
    /// Timeout for establishing an outbound connection (incl. handshake)
    pub connect_timeout: Duration,
    /// Default request timeout for `send_and_receive` convenience calls
    pub request_timeout: Duration,
    /// Number of shared connections kept per peer
    pub pool_size: usize,
    /// Subjects that get a dedicated connection, isolated from the shared
    /// hashed pool
    pub dedicated_subjects: Vec<String>,
    /// Interval between heartbeats on an otherwise idle connection; zero
    /// together with a zero timeout disables heartbeats
    pub heartbeat_interval: Duration,
    /// Read-idle duration after which a peer is considered dead
    pub heartbeat_timeout: Duration,
    /// Whether this node is willing to exchange heartbeat payloads
    pub heartbeat_payload: bool,
    /// Deliver heartbeats to a registered handler in addition to the
    /// built-in ack path
    pub forward_heartbeats: bool,
    /// Payload compression algorithm
    pub compression: CompressionAlgorithm,
    /// Upper bound on a single decoded payload
    pub max_message_size: usize,
    /// Grace period for in-flight work during shutdown
    pub shutdown_quiet_period: Duration,
    /// Hard bound on shutdown
    pub shutdown_timeout: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            port: None,
            interfaces: Vec::new(),
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            pool_size: 8,
            dedicated_subjects: Vec::new(),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            heartbeat_payload: true,
            forward_heartbeats: false,
            compression: CompressionAlgorithm::None,
            max_message_size: 16 * 1024 * 1024,
            shutdown_quiet_period: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl MessagingConfig {
    /// Whether heartbeats are enabled at all for this node.
    ///
    /// Setting both interval and timeout to zero disables the mechanism,
    /// which is a valid configuration.
    pub fn heartbeats_enabled(&self) -> bool {
        !self.heartbeat_interval.is_zero() || !self.heartbeat_timeout.is_zero()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(MessagingError::configuration("pool_size must be at least 1"));
        }
        if self.max_message_size == 0 {
            return Err(MessagingError::configuration(
                "max_message_size cannot be zero",
            ));
        }
        if self.heartbeats_enabled() {
            if self.heartbeat_interval.is_zero() || self.heartbeat_timeout.is_zero() {
                return Err(MessagingError::configuration(
                    "heartbeat interval and timeout must both be set, or both zero to disable",
                ));
            }
            if self.heartbeat_interval >= self.heartbeat_timeout {
                return Err(MessagingError::configuration(format!(
                    "heartbeat interval {:?} must be less than heartbeat timeout {:?}",
                    self.heartbeat_interval, self.heartbeat_timeout
                )));
            }
        }
        Ok(())
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_interfaces(mut self, interfaces: Vec<String>) -> Self {
        self.interfaces = interfaces;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    /// Disable the heartbeat mechanism entirely
    pub fn without_heartbeats(mut self) -> Self {
        self.heartbeat_interval = Duration::ZERO;
        self.heartbeat_timeout = Duration::ZERO;
        self
    }

    pub fn with_compression(mut self, compression: CompressionAlgorithm) -> Self {
        self.compression = compression;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(MessagingConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_heartbeats_disable_the_mechanism() {
        let config = MessagingConfig::default().without_heartbeats();
        assert!(!config.heartbeats_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn interval_must_be_less_than_timeout() {
        let config = MessagingConfig::default()
            .with_heartbeat(Duration::from_secs(10), Duration::from_secs(10));
        assert!(config.validate().is_err());

        let config = MessagingConfig::default()
            .with_heartbeat(Duration::from_secs(10), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn lopsided_heartbeat_config_is_rejected() {
        let config =
            MessagingConfig::default().with_heartbeat(Duration::ZERO, Duration::from_secs(30));
        assert!(config.validate().is_err());
    }
}
