//! Heartbeat Sub-Protocol
//!
//! Liveness detection layered onto an established connection, independent
//! of request traffic. Two phases: a one-shot setup exchange negotiating
//! the idle-read timeout and payload support, then a steady-state exchange
//! where the client pings on an idle-write interval and closes when acks
//! stop arriving. The server mirrors with a read-idle watchdog.
//!
//! TCP alone does not detect a frozen peer behind an open socket; the
//! explicit ping plus read-idle timeout is the mitigation.

use crate::address::Address;
use crate::connection::remote::{ChannelShared, CloseReason, RemoteClientConnection};
use crate::connection::ClientConnection;
use crate::handler::{HandlerRegistry, RegisteredHandler};
use crate::message::{ProtocolMessage, ProtocolReply, ProtocolRequest, HEARTBEAT_SUBJECT};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// First message of the sub-protocol: the client's desired idle-read
/// timeout and whether it wants heartbeat payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeartbeatSetupRequest {
    pub timeout: Duration,
    pub payload_enabled: bool,
}

impl HeartbeatSetupRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u64(self.timeout.as_millis() as u64);
        buf.put_u8(u8::from(self.payload_enabled));
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 9 {
            return None;
        }
        let mut millis = [0u8; 8];
        millis.copy_from_slice(&payload[..8]);
        Some(Self {
            timeout: Duration::from_millis(u64::from_be_bytes(millis)),
            payload_enabled: payload[8] != 0,
        })
    }
}

/// The server's answer: whether heartbeats run on this connection and
/// whether both sides agreed on payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeartbeatSetupResponse {
    pub enabled: bool,
    pub payload_enabled: bool,
}

impl HeartbeatSetupResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2);
        buf.put_u8(u8::from(self.enabled));
        buf.put_u8(u8::from(self.payload_enabled));
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 2 {
            return None;
        }
        Some(Self {
            enabled: payload[0] != 0,
            payload_enabled: payload[1] != 0,
        })
    }
}

/// Millisecond wall-clock timestamp carried by payload heartbeats
fn heartbeat_payload_now() -> Bytes {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64(millis);
    buf.freeze()
}

enum ServerHeartbeatState {
    AwaitingSetup,
    Active { payload: bool },
    Disabled,
}

/// Server-side heartbeat state for one connection
pub(crate) struct ServerHeartbeats {
    enabled: bool,
    payload_supported: bool,
    forward: bool,
    state: Mutex<ServerHeartbeatState>,
}

impl ServerHeartbeats {
    pub fn new(enabled: bool, payload_supported: bool, forward: bool) -> Arc<Self> {
        Arc::new(Self {
            enabled,
            payload_supported,
            forward,
            state: Mutex::new(ServerHeartbeatState::AwaitingSetup),
        })
    }

    /// Handle a request on the reserved heartbeat subject. The first one
    /// is the setup exchange; everything after is a steady-state ping.
    pub async fn on_heartbeat(
        &self,
        shared: &Arc<ChannelShared>,
        handlers: &Arc<HandlerRegistry>,
        request: ProtocolRequest,
    ) {
        let awaiting_setup = matches!(*self.state.lock(), ServerHeartbeatState::AwaitingSetup);
        if awaiting_setup {
            self.handle_setup(shared, request.id, &request.payload).await;
            return;
        }

        trace!(peer = %shared.peer(), id = request.id, "heartbeat received");
        let payload_on = matches!(
            *self.state.lock(),
            ServerHeartbeatState::Active { payload: true }
        );
        let payload = if payload_on {
            heartbeat_payload_now()
        } else {
            Bytes::new()
        };
        let reply = ProtocolReply::ok(request.id, payload);
        if shared.send(ProtocolMessage::Reply(reply)).await.is_err() {
            return;
        }
        if self.forward {
            forward_to_handler(handlers, request);
        }
    }

    async fn handle_setup(&self, shared: &Arc<ChannelShared>, id: u64, payload: &[u8]) {
        let setup = HeartbeatSetupRequest::decode(payload);
        let response = match setup {
            Some(setup) if self.enabled && !setup.timeout.is_zero() => {
                let payload_on = setup.payload_enabled && self.payload_supported;
                *self.state.lock() = ServerHeartbeatState::Active {
                    payload: payload_on,
                };
                spawn_server_watchdog(Arc::clone(shared), setup.timeout);
                debug!(
                    peer = %shared.peer(),
                    timeout = ?setup.timeout,
                    payload = payload_on,
                    "heartbeats negotiated"
                );
                HeartbeatSetupResponse {
                    enabled: true,
                    payload_enabled: payload_on,
                }
            }
            _ => {
                // a malformed or non-positive setup silently disables
                // heartbeats; the connection stays usable without liveness
                // detection so mixed-version clusters keep talking
                debug!(peer = %shared.peer(), "heartbeats disabled for connection");
                *self.state.lock() = ServerHeartbeatState::Disabled;
                HeartbeatSetupResponse {
                    enabled: false,
                    payload_enabled: false,
                }
            }
        };
        let reply = ProtocolReply::ok(id, response.encode());
        let _ = shared.send(ProtocolMessage::Reply(reply)).await;
    }
}

/// Hand a heartbeat to a handler registered under the reserved subject,
/// discarding whatever the handler produces. The built-in path already
/// replied.
fn forward_to_handler(handlers: &Arc<HandlerRegistry>, request: ProtocolRequest) {
    let Some(handler) = handlers.get(HEARTBEAT_SUBJECT) else {
        return;
    };
    match handler {
        RegisteredHandler::Consumer(consumer) => consumer(request.sender, request.payload),
        RegisteredHandler::Function(function) => {
            let future = function(request.sender, request.payload);
            tokio::spawn(async move {
                let _ = future.await;
            });
        }
    }
}

/// Close the connection when the peer goes silent past `timeout`
pub(crate) fn spawn_server_watchdog(shared: Arc<ChannelShared>, timeout: Duration) {
    tokio::spawn(async move {
        let check = (timeout / 4).max(Duration::from_millis(10));
        let mut closed = shared.subscribe();
        loop {
            if shared.is_closed() {
                break;
            }
            tokio::select! {
                _ = closed.changed() => break,
                _ = tokio::time::sleep(check) => {
                    if shared.last_read_elapsed() > timeout {
                        warn!(
                            peer = %shared.peer(),
                            ?timeout,
                            "peer silent past heartbeat timeout, closing connection"
                        );
                        shared.close(CloseReason::Error);
                        break;
                    }
                }
            }
        }
    });
}

/// Negotiate heartbeats on a fresh client connection, then keep pinging on
/// the idle-write interval until the connection closes.
pub(crate) fn spawn_client_heartbeats(
    connection: Arc<RemoteClientConnection>,
    advertised: Address,
    next_id: Arc<AtomicU64>,
    interval: Duration,
    timeout: Duration,
    want_payload: bool,
) {
    tokio::spawn(async move {
        let id = next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let setup = HeartbeatSetupRequest {
            timeout,
            payload_enabled: want_payload,
        };
        let request = ProtocolRequest::new(
            id,
            advertised.clone(),
            HEARTBEAT_SUBJECT,
            setup.encode(),
        );

        let response = match tokio::time::timeout(timeout, connection.send_and_receive(request))
            .await
        {
            Ok(Ok(payload)) => HeartbeatSetupResponse::decode(&payload),
            Ok(Err(error)) => {
                debug!(peer = %connection.peer(), %error, "heartbeat setup rejected");
                None
            }
            Err(_) => {
                debug!(peer = %connection.peer(), "heartbeat setup timed out");
                None
            }
        };
        let enabled = response.map(|r| r.enabled).unwrap_or(false);
        if !enabled {
            debug!(peer = %connection.peer(), "peer declined heartbeats, liveness detection off");
            return;
        }
        let payload_on = want_payload && response.map(|r| r.payload_enabled).unwrap_or(false);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut closed = connection.closed();
        loop {
            if connection.is_closed() {
                break;
            }
            tokio::select! {
                _ = closed.changed() => break,
                _ = ticker.tick() => {
                    if connection.outstanding_heartbeats() > 0
                        && connection.last_read_elapsed() > timeout
                    {
                        warn!(
                            peer = %connection.peer(),
                            ?timeout,
                            "heartbeats unacknowledged past timeout, closing connection"
                        );
                        connection.close(CloseReason::Error);
                        break;
                    }
                    // suppressed while organic traffic keeps the writer busy
                    if connection.last_write_elapsed() >= interval {
                        let id = next_id.fetch_add(1, Ordering::Relaxed) + 1;
                        let payload = if payload_on {
                            heartbeat_payload_now()
                        } else {
                            Bytes::new()
                        };
                        trace!(peer = %connection.peer(), id, "sending heartbeat");
                        connection.track_heartbeat(id);
                        let ping = ProtocolRequest::new(
                            id,
                            advertised.clone(),
                            HEARTBEAT_SUBJECT,
                            payload,
                        );
                        if connection.send_async(ping).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_request_round_trip() {
        let setup = HeartbeatSetupRequest {
            timeout: Duration::from_millis(3500),
            payload_enabled: true,
        };
        let decoded = HeartbeatSetupRequest::decode(&setup.encode()).unwrap();
        assert_eq!(decoded, setup);
    }

    #[test]
    fn truncated_setup_is_rejected() {
        assert_eq!(HeartbeatSetupRequest::decode(b""), None);
        assert_eq!(HeartbeatSetupRequest::decode(&[0u8; 8]), None);
    }

    #[test]
    fn setup_response_round_trip() {
        for (enabled, payload_enabled) in
            [(true, true), (true, false), (false, false), (false, true)]
        {
            let response = HeartbeatSetupResponse {
                enabled,
                payload_enabled,
            };
            assert_eq!(
                HeartbeatSetupResponse::decode(&response.encode()).unwrap(),
                response
            );
        }
    }

    #[test]
    fn payload_timestamp_is_positive() {
        let payload = heartbeat_payload_now();
        assert_eq!(payload.len(), 8);
        let mut millis = [0u8; 8];
        millis.copy_from_slice(&payload);
        assert!(u64::from_be_bytes(millis) > 0);
    }
}
