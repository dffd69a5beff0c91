//! Connection Handshake
//!
//! Both sides exchange a fixed 6-byte preamble immediately on connect:
//! a 4-byte big-endian hash of the cluster name followed by the 2-byte
//! protocol version. The hash guards against cross-cluster connections;
//! the version field drives negotiation.
//!
//! The initiator always offers its latest version. The accepter echoes the
//! lower of the offered version and its own latest, falling back to its
//! own latest when the offer is unrecognized, so an old server still
//! answers a newer client. The initiator treats an unknown echoed version
//! as a broken peer and closes.

use crate::error::{MessagingError, Result};
use crate::protocol::ProtocolVersion;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

pub(crate) const PREAMBLE_LEN: usize = 6;

/// Cluster identity as it appears on the wire
pub(crate) fn cluster_preamble(cluster: &str) -> u32 {
    crc32fast::hash(cluster.as_bytes())
}

async fn write_preamble<S>(stream: &mut S, preamble: u32, version: ProtocolVersion) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut bytes = [0u8; PREAMBLE_LEN];
    bytes[..4].copy_from_slice(&preamble.to_be_bytes());
    bytes[4..].copy_from_slice(&version.version().to_be_bytes());
    stream
        .write_all(&bytes)
        .await
        .map_err(|e| MessagingError::io("failed to write handshake preamble", e))?;
    stream
        .flush()
        .await
        .map_err(|e| MessagingError::io("failed to flush handshake preamble", e))
}

async fn read_preamble<S>(stream: &mut S, expected: u32) -> Result<u16>
where
    S: AsyncRead + Unpin,
{
    let mut bytes = [0u8; PREAMBLE_LEN];
    stream
        .read_exact(&mut bytes)
        .await
        .map_err(|e| MessagingError::io("connection closed during handshake", e))?;

    let preamble = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if preamble != expected {
        return Err(MessagingError::protocol(
            "handshake preamble does not match cluster identity",
        ));
    }
    Ok(u16::from_be_bytes([bytes[4], bytes[5]]))
}

/// Initiator side: offer `offered`, expect the peer to echo a version we
/// know. Since we offered our own latest, an unrecognized echo means a
/// broken peer, not an older one.
pub(crate) async fn client_handshake<S>(
    stream: &mut S,
    preamble: u32,
    offered: ProtocolVersion,
) -> Result<ProtocolVersion>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_preamble(stream, preamble, offered).await?;
    let echoed = read_preamble(stream, preamble).await?;
    match ProtocolVersion::from_version(echoed) {
        Some(version) => {
            debug!(?version, "negotiated protocol version");
            Ok(version)
        }
        None => {
            warn!(version = echoed, "peer echoed an unknown protocol version");
            Err(MessagingError::protocol(format!(
                "failed to negotiate protocol version, peer answered with unknown version {echoed}"
            )))
        }
    }
}

/// Accepter side: pick the lower of the client's offer and our `latest`;
/// an unrecognized offer falls back to `latest` rather than disconnecting,
/// so newer-but-compatible clients still get an answer.
pub(crate) async fn server_handshake<S>(
    stream: &mut S,
    preamble: u32,
    latest: ProtocolVersion,
) -> Result<ProtocolVersion>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let offered = read_preamble(stream, preamble).await?;
    let version = match ProtocolVersion::from_version(offered) {
        Some(client_version) => client_version.min(latest),
        None => latest,
    };
    write_preamble(stream, preamble, version).await?;
    debug!(?version, offered, "negotiated protocol version");
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn negotiate(
        client_offer: ProtocolVersion,
        server_latest: ProtocolVersion,
    ) -> (Result<ProtocolVersion>, Result<ProtocolVersion>) {
        let (mut client_io, mut server_io) = tokio::io::duplex(64);
        let preamble = cluster_preamble("test-cluster");
        tokio::join!(
            client_handshake(&mut client_io, preamble, client_offer),
            server_handshake(&mut server_io, preamble, server_latest),
        )
    }

    #[tokio::test]
    async fn both_latest_negotiate_latest() {
        let (client, server) = negotiate(ProtocolVersion::V2, ProtocolVersion::V2).await;
        assert_eq!(client.unwrap(), ProtocolVersion::V2);
        assert_eq!(server.unwrap(), ProtocolVersion::V2);
    }

    #[tokio::test]
    async fn new_client_meets_old_server_on_v1() {
        let (client, server) = negotiate(ProtocolVersion::V2, ProtocolVersion::V1).await;
        // no version skew: both sides must install the same codec pair
        assert_eq!(client.unwrap(), ProtocolVersion::V1);
        assert_eq!(server.unwrap(), ProtocolVersion::V1);
    }

    #[tokio::test]
    async fn old_client_stays_on_v1_against_newer_server() {
        let (client, server) = negotiate(ProtocolVersion::V1, ProtocolVersion::V2).await;
        assert_eq!(client.unwrap(), ProtocolVersion::V1);
        assert_eq!(server.unwrap(), ProtocolVersion::V1);
    }

    #[tokio::test]
    async fn cluster_mismatch_fails_the_server_side() {
        let (mut client_io, mut server_io) = tokio::io::duplex(64);
        // the server drops its half on mismatch, closing the connection
        // before any application frame is exchanged
        let server = tokio::spawn(async move {
            server_handshake(
                &mut server_io,
                cluster_preamble("cluster-b"),
                ProtocolVersion::V2,
            )
            .await
        });
        let client = client_handshake(
            &mut client_io,
            cluster_preamble("cluster-a"),
            ProtocolVersion::V2,
        )
        .await;
        assert!(matches!(
            server.await.unwrap(),
            Err(MessagingError::Protocol { .. })
        ));
        // the server never answered, so the client must not negotiate
        assert!(client.is_err());
    }

    #[tokio::test]
    async fn unknown_echoed_version_fails_the_client() {
        let (mut client_io, mut server_io) = tokio::io::duplex(64);
        let preamble = cluster_preamble("test-cluster");

        let server = async {
            let mut ignore = [0u8; PREAMBLE_LEN];
            server_io.read_exact(&mut ignore).await.unwrap();
            let mut bytes = [0u8; PREAMBLE_LEN];
            bytes[..4].copy_from_slice(&preamble.to_be_bytes());
            bytes[4..].copy_from_slice(&99u16.to_be_bytes());
            server_io.write_all(&bytes).await.unwrap();
        };
        let (client, ()) = tokio::join!(
            client_handshake(&mut client_io, preamble, ProtocolVersion::V2),
            server,
        );
        assert!(matches!(client, Err(MessagingError::Protocol { .. })));
    }

    #[test]
    fn different_cluster_names_hash_differently() {
        assert_ne!(cluster_preamble("cluster-a"), cluster_preamble("cluster-b"));
        assert_eq!(cluster_preamble("cluster-a"), cluster_preamble("cluster-a"));
    }
}
