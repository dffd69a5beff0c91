//! Versioned Frame Codec
//!
//! Byte-exact framing of protocol messages. Each connection carries frames
//! of exactly one negotiated version. The sender address is transmitted
//! once, ahead of the first frame; V1 encodes it as raw IP octets + port
//! while V2 encodes the host as a string, preserving hostnames across the
//! wire. Everything else is identical between the two versions.
//!
//! The decoder is resumable at any byte boundary: a partial frame leaves
//! the input buffer untouched and yields `None` until enough bytes arrive.

use crate::address::Address;
use crate::config::CompressionAlgorithm;
use crate::error::{MessagingError, Result};
use crate::message::{ProtocolMessage, ProtocolReply, ProtocolRequest, ReplyStatus};
use crate::protocol::varint::{self, Decoded};
use crate::protocol::ProtocolVersion;
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{Read, Write};
use std::net::IpAddr;

const TYPE_REQUEST: u8 = 1;
const TYPE_REPLY: u8 = 2;

/// Stateful per-connection frame encoder
pub struct MessageEncoder {
    version: ProtocolVersion,
    sender: Address,
    sender_ip: IpAddr,
    compression: CompressionAlgorithm,
    address_written: bool,
}

impl MessageEncoder {
    /// Create an encoder for one side of a connection.
    ///
    /// `sender_ip` is the resolved IP of `sender`; V1 framing has no way to
    /// carry a hostname so the caller resolves it once at activation.
    pub fn new(
        version: ProtocolVersion,
        sender: Address,
        sender_ip: IpAddr,
        compression: CompressionAlgorithm,
    ) -> Self {
        Self {
            version,
            sender,
            sender_ip,
            compression,
            address_written: false,
        }
    }

    /// Append one encoded frame to `dst`
    pub fn encode(&mut self, message: &ProtocolMessage, dst: &mut BytesMut) -> Result<()> {
        if !self.address_written {
            self.write_address(dst)?;
            self.address_written = true;
        }
        match message {
            ProtocolMessage::Request(request) => {
                dst.put_u8(TYPE_REQUEST);
                varint::write_u64(dst, request.id);
                write_string(dst, &request.subject)?;
                self.write_payload(dst, &request.payload)?;
            }
            ProtocolMessage::Reply(reply) => {
                dst.put_u8(TYPE_REPLY);
                varint::write_u64(dst, reply.id);
                dst.put_u8(reply.status.id());
                self.write_payload(dst, &reply.payload)?;
            }
        }
        Ok(())
    }

    fn write_address(&self, dst: &mut BytesMut) -> Result<()> {
        match self.version {
            ProtocolVersion::V1 => {
                let octets = match self.sender_ip {
                    IpAddr::V4(ip) => ip.octets().to_vec(),
                    IpAddr::V6(ip) => ip.octets().to_vec(),
                };
                dst.put_u8(octets.len() as u8);
                dst.put_slice(&octets);
                dst.put_u32(u32::from(self.sender.port()));
            }
            ProtocolVersion::V2 => {
                write_string(dst, self.sender.host())?;
                dst.put_u32(u32::from(self.sender.port()));
            }
        }
        Ok(())
    }

    fn write_payload(&self, dst: &mut BytesMut, payload: &Bytes) -> Result<()> {
        let encoded = compress(self.compression, payload)?;
        varint::write_u32(dst, encoded.len() as u32);
        dst.put_slice(&encoded);
        Ok(())
    }
}

/// Stateful per-connection frame decoder
pub struct MessageDecoder {
    version: ProtocolVersion,
    compression: CompressionAlgorithm,
    max_message_size: usize,
    sender: Option<Address>,
}

impl MessageDecoder {
    pub fn new(
        version: ProtocolVersion,
        compression: CompressionAlgorithm,
        max_message_size: usize,
    ) -> Self {
        Self {
            version,
            compression,
            max_message_size,
            sender: None,
        }
    }

    /// The peer's advertised address, once the first frame has arrived
    pub fn sender(&self) -> Option<&Address> {
        self.sender.as_ref()
    }

    /// Decode one frame from the front of `src`, consuming its bytes.
    ///
    /// Returns `Ok(None)` without consuming anything when `src` holds only
    /// part of a frame. Malformed input is an error and fatal to the
    /// connection that produced it.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ProtocolMessage>> {
        let mut cursor = Cursor::new(&src[..]);

        let sender = match self.sender.clone() {
            Some(sender) => sender,
            None => match self.read_address(&mut cursor)? {
                Some(sender) => sender,
                None => return Ok(None),
            },
        };

        let Some(kind) = cursor.read_u8() else {
            return Ok(None);
        };
        let Some(id) = cursor.read_varint_u64()? else {
            return Ok(None);
        };

        let message = match kind {
            TYPE_REQUEST => {
                let Some(subject) = cursor.read_string()? else {
                    return Ok(None);
                };
                let Some(payload) = self.read_payload(&mut cursor)? else {
                    return Ok(None);
                };
                ProtocolMessage::Request(ProtocolRequest::new(id, sender.clone(), subject, payload))
            }
            TYPE_REPLY => {
                let Some(status_id) = cursor.read_u8() else {
                    return Ok(None);
                };
                let status = ReplyStatus::from_id(status_id).ok_or_else(|| {
                    MessagingError::protocol(format!("unknown reply status {status_id}"))
                })?;
                let Some(payload) = self.read_payload(&mut cursor)? else {
                    return Ok(None);
                };
                ProtocolMessage::Reply(ProtocolReply::new(id, status, payload))
            }
            other => {
                return Err(MessagingError::protocol(format!(
                    "unknown message discriminator {other}"
                )))
            }
        };

        // commit only once a whole frame was read
        let consumed = cursor.position();
        let _ = src.split_to(consumed);
        self.sender = Some(sender);
        Ok(Some(message))
    }

    fn read_address(&self, cursor: &mut Cursor<'_>) -> Result<Option<Address>> {
        match self.version {
            ProtocolVersion::V1 => {
                let Some(len) = cursor.read_u8() else {
                    return Ok(None);
                };
                let Some(octets) = cursor.read_bytes(usize::from(len)) else {
                    return Ok(None);
                };
                let ip: IpAddr = match octets.len() {
                    4 => {
                        let mut bytes = [0u8; 4];
                        bytes.copy_from_slice(octets);
                        IpAddr::from(bytes)
                    }
                    16 => {
                        let mut bytes = [0u8; 16];
                        bytes.copy_from_slice(octets);
                        IpAddr::from(bytes)
                    }
                    n => {
                        return Err(MessagingError::protocol(format!(
                            "invalid sender ip length {n}"
                        )))
                    }
                };
                let Some(port) = cursor.read_u32_be() else {
                    return Ok(None);
                };
                Ok(Some(Address::new(ip.to_string(), port as u16)))
            }
            ProtocolVersion::V2 => {
                let Some(host) = cursor.read_string()? else {
                    return Ok(None);
                };
                let Some(port) = cursor.read_u32_be() else {
                    return Ok(None);
                };
                Ok(Some(Address::new(host, port as u16)))
            }
        }
    }

    fn read_payload(&self, cursor: &mut Cursor<'_>) -> Result<Option<Bytes>> {
        let Some(len) = cursor.read_varint_u32()? else {
            return Ok(None);
        };
        let len = len as usize;
        if len > self.max_message_size {
            return Err(MessagingError::protocol(format!(
                "payload of {len} bytes exceeds maximum {}",
                self.max_message_size
            )));
        }
        let Some(bytes) = cursor.read_bytes(len) else {
            return Ok(None);
        };
        decompress(self.compression, bytes).map(Some)
    }
}

/// Bounded forward-only reader over a byte slice; never consumes the
/// underlying buffer, so incomplete parses cost nothing.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        if end > self.buf.len() {
            return None;
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn read_u8(&mut self) -> Option<u8> {
        self.read_bytes(1).map(|b| b[0])
    }

    fn read_u16_be(&mut self) -> Option<u16> {
        self.read_bytes(2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32_be(&mut self) -> Option<u32> {
        self.read_bytes(4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_string(&mut self) -> Result<Option<String>> {
        let Some(len) = self.read_u16_be() else {
            return Ok(None);
        };
        let Some(bytes) = self.read_bytes(usize::from(len)) else {
            return Ok(None);
        };
        std::str::from_utf8(bytes)
            .map(|s| Some(s.to_owned()))
            .map_err(|_| MessagingError::protocol("string is not valid utf-8"))
    }

    fn read_varint_u32(&mut self) -> Result<Option<u32>> {
        match varint::read_u32(&self.buf[self.pos..])? {
            Decoded::Value(value, used) => {
                self.pos += used;
                Ok(Some(value))
            }
            Decoded::NeedMoreData => Ok(None),
        }
    }

    fn read_varint_u64(&mut self) -> Result<Option<u64>> {
        match varint::read_u64(&self.buf[self.pos..])? {
            Decoded::Value(value, used) => {
                self.pos += used;
                Ok(Some(value))
            }
            Decoded::NeedMoreData => Ok(None),
        }
    }
}

/// UTF-8 bytes prefixed by a fixed 16-bit length; not a varint, by wire
/// contract.
fn write_string(dst: &mut BytesMut, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > usize::from(u16::MAX) {
        return Err(MessagingError::protocol(format!(
            "string of {} bytes exceeds u16 length prefix",
            bytes.len()
        )));
    }
    dst.put_u16(bytes.len() as u16);
    dst.put_slice(bytes);
    Ok(())
}

fn compress(algorithm: CompressionAlgorithm, payload: &Bytes) -> Result<Bytes> {
    match algorithm {
        CompressionAlgorithm::None => Ok(payload.clone()),
        CompressionAlgorithm::Gzip if payload.is_empty() => Ok(payload.clone()),
        CompressionAlgorithm::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(payload)
                .and_then(|()| encoder.finish())
                .map(Bytes::from)
                .map_err(|e| MessagingError::io("gzip compression failed", e))
        }
    }
}

fn decompress(algorithm: CompressionAlgorithm, payload: &[u8]) -> Result<Bytes> {
    match algorithm {
        CompressionAlgorithm::None => Ok(Bytes::copy_from_slice(payload)),
        CompressionAlgorithm::Gzip if payload.is_empty() => Ok(Bytes::new()),
        CompressionAlgorithm::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(payload);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| MessagingError::protocol(format!("gzip decompression failed: {e}")))?;
            Ok(Bytes::from(out))
        }
    }
}
