//! Wire Protocol Versions
//!
//! A closed set of protocol versions, each mapping to a concrete
//! encoder/decoder pair. The negotiated version is fixed for the lifetime
//! of a connection; frames of different versions never mix on one socket.

pub mod codec;
pub mod varint;

pub use codec::{MessageDecoder, MessageEncoder};

use crate::address::Address;
use crate::config::CompressionAlgorithm;
use std::net::IpAddr;

/// Supported wire protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    /// Sender address framed as raw IP octets + port
    V1,
    /// Sender address framed as host string + port, preserving hostnames
    V2,
}

impl ProtocolVersion {
    /// The newest version this node speaks; always offered when initiating
    pub fn latest() -> Self {
        Self::V2
    }

    /// Numeric value as it appears in the handshake preamble
    pub fn version(self) -> u16 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    /// Resolve a preamble value to a known version
    pub fn from_version(version: u16) -> Option<Self> {
        match version {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }

    /// Build the encoder half of this version's codec pair
    pub fn new_encoder(
        self,
        sender: Address,
        sender_ip: IpAddr,
        compression: CompressionAlgorithm,
    ) -> MessageEncoder {
        MessageEncoder::new(self, sender, sender_ip, compression)
    }

    /// Build the decoder half of this version's codec pair
    pub fn new_decoder(
        self,
        compression: CompressionAlgorithm,
        max_message_size: usize,
    ) -> MessageDecoder {
        MessageDecoder::new(self, compression, max_message_size)
    }
}
