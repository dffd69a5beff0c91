//! Socket-Backed Connections
//!
//! Each connection runs a reader task and a writer task over the split
//! stream. Writes are funneled through a bounded queue so frame order is
//! preserved and back-pressure propagates to senders; reads are decoded
//! incrementally and dispatched without blocking the reader.
//!
//! Client connections carry requests out and correlate replies back in;
//! server connections dispatch requests to handlers and write replies.
//! A connection failure is fatal to that connection only.

use crate::address::Address;
use crate::connection::{
    dispatch_request, ClientConnection, PendingRequests, RawStream, ReplySink,
};
use crate::error::{MessagingError, Result};
use crate::handler::HandlerRegistry;
use crate::heartbeat::ServerHeartbeats;
use crate::message::{ProtocolMessage, ProtocolReply, ProtocolRequest, ReplyStatus};
use crate::metrics::MessagingMetrics;
use crate::protocol::{MessageDecoder, MessageEncoder};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Outbound queue depth per connection; the bounded queue is what exerts
/// write back-pressure on senders.
const WRITE_QUEUE_DEPTH: usize = 128;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Why a connection was closed; decides which error pending requests see
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// Transport failure, remote close or protocol violation
    Error,
    /// Local service shutdown
    Shutdown,
}

/// State shared between a connection's reader, writer and watchdog tasks
pub(crate) struct ChannelShared {
    peer: Address,
    writer_tx: mpsc::Sender<ProtocolMessage>,
    closed: watch::Sender<bool>,
    reason: AtomicU8,
    last_read: Mutex<Instant>,
    last_write: Mutex<Instant>,
}

impl ChannelShared {
    fn new(peer: Address, writer_tx: mpsc::Sender<ProtocolMessage>) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            peer,
            writer_tx,
            closed: watch::Sender::new(false),
            reason: AtomicU8::new(CloseReason::Error as u8),
            last_read: Mutex::new(now),
            last_write: Mutex::new(now),
        })
    }

    pub fn peer(&self) -> &Address {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Mark the connection closed; idempotent, the first reason wins
    pub fn close(&self, reason: CloseReason) {
        self.closed.send_if_modified(|closed| {
            if *closed {
                return false;
            }
            self.reason.store(reason as u8, Ordering::Release);
            *closed = true;
            true
        });
    }

    /// The error a pending request should fail with after close
    pub fn close_error(&self) -> MessagingError {
        if self.reason.load(Ordering::Acquire) == CloseReason::Shutdown as u8 {
            MessagingError::Closed
        } else {
            MessagingError::connection_closed(&self.peer)
        }
    }

    /// Queue a frame for writing, in order, behind earlier frames
    pub async fn send(&self, message: ProtocolMessage) -> Result<()> {
        if self.is_closed() {
            return Err(self.close_error());
        }
        self.writer_tx
            .send(message)
            .await
            .map_err(|_| MessagingError::connection_closed(&self.peer))
    }

    pub fn touch_read(&self) {
        *self.last_read.lock() = Instant::now();
    }

    pub fn touch_write(&self) {
        *self.last_write.lock() = Instant::now();
    }

    pub fn last_read_elapsed(&self) -> Duration {
        self.last_read.lock().elapsed()
    }

    pub fn last_write_elapsed(&self) -> Duration {
        self.last_write.lock().elapsed()
    }
}

/// Client side of an established connection
pub struct RemoteClientConnection {
    shared: Arc<ChannelShared>,
    pending: Arc<PendingRequests>,
    heartbeat_outstanding: Mutex<BTreeSet<u64>>,
}

impl RemoteClientConnection {
    /// Take ownership of a handshaken stream and start its I/O tasks
    pub(crate) fn spawn(
        stream: Box<dyn RawStream>,
        peer: Address,
        encoder: MessageEncoder,
        decoder: MessageDecoder,
    ) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let shared = ChannelShared::new(peer, writer_tx);

        let connection = Arc::new(Self {
            shared: Arc::clone(&shared),
            pending: PendingRequests::new(),
            heartbeat_outstanding: Mutex::new(BTreeSet::new()),
        });

        tokio::spawn(run_writer(write_half, encoder, writer_rx, shared));
        tokio::spawn(run_client_reader(read_half, decoder, Arc::clone(&connection)));

        connection
    }

    pub fn peer(&self) -> &Address {
        self.shared.peer()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolves once the connection has closed
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.shared.subscribe()
    }

    pub(crate) fn close(&self, reason: CloseReason) {
        self.shared.close(reason);
    }

    pub(crate) fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }

    pub(crate) fn last_read_elapsed(&self) -> Duration {
        self.shared.last_read_elapsed()
    }

    pub(crate) fn last_write_elapsed(&self) -> Duration {
        self.shared.last_write_elapsed()
    }

    /// Record a heartbeat request awaiting acknowledgement
    pub(crate) fn track_heartbeat(&self, id: u64) {
        self.heartbeat_outstanding.lock().insert(id);
    }

    pub(crate) fn outstanding_heartbeats(&self) -> usize {
        self.heartbeat_outstanding.lock().len()
    }

    /// Acknowledge heartbeats up to and including `id`. A single late ack
    /// clears the whole backlog below it, so reordering cannot produce
    /// false-positive disconnects.
    fn ack_heartbeats(&self, id: u64) -> bool {
        let mut outstanding = self.heartbeat_outstanding.lock();
        let retained = outstanding.split_off(&(id.saturating_add(1)));
        let acked = !outstanding.is_empty();
        *outstanding = retained;
        acked
    }

    fn handle_reply(&self, reply: ProtocolReply) {
        let id = reply.id;
        if self.pending.complete(reply) {
            return;
        }
        if self.ack_heartbeats(id) {
            return;
        }
        // reply raced a timeout or close; the entry is gone, drop it
        debug!(peer = %self.shared.peer(), id, "dropping reply with no pending request");
    }
}

#[async_trait]
impl ClientConnection for RemoteClientConnection {
    async fn send_async(&self, request: ProtocolRequest) -> Result<()> {
        self.shared.send(ProtocolMessage::Request(request)).await
    }

    async fn send_and_receive(&self, request: ProtocolRequest) -> Result<Bytes> {
        let (rx, _guard) = self.pending.register(request.id, &request.subject);
        self.shared.send(ProtocolMessage::Request(request)).await?;
        match rx.await {
            Ok(result) => result,
            // sender vanished without completing: the connection is gone
            Err(_) => Err(self.shared.close_error()),
        }
    }
}

/// Server side of an accepted connection
pub struct RemoteServerConnection {
    shared: Arc<ChannelShared>,
}

impl RemoteServerConnection {
    /// Take ownership of a handshaken inbound stream and start its I/O
    /// tasks; requests are dispatched to `handlers` as they decode.
    pub(crate) fn spawn(
        stream: Box<dyn RawStream>,
        peer: Address,
        encoder: MessageEncoder,
        decoder: MessageDecoder,
        handlers: Arc<HandlerRegistry>,
        heartbeats: Arc<ServerHeartbeats>,
        metrics: MessagingMetrics,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let shared = ChannelShared::new(peer, writer_tx);

        tokio::spawn(run_writer(write_half, encoder, writer_rx, Arc::clone(&shared)));
        tokio::spawn(run_server_reader(
            read_half,
            decoder,
            Arc::clone(&shared),
            handlers,
            heartbeats,
            metrics,
        ));

        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }
}

/// Reply sink writing through a connection's ordered write queue
pub(crate) struct ChannelReplySink {
    shared: Arc<ChannelShared>,
}

impl ChannelReplySink {
    pub fn new(shared: Arc<ChannelShared>) -> Self {
        Self { shared }
    }
}

#[async_trait]
impl ReplySink for ChannelReplySink {
    async fn reply(&self, id: u64, status: ReplyStatus, payload: Bytes) {
        let reply = ProtocolReply::new(id, status, payload);
        if let Err(error) = self.shared.send(ProtocolMessage::Reply(reply)).await {
            debug!(peer = %self.shared.peer(), id, %error, "failed to write reply");
        }
    }
}

async fn run_writer(
    mut write_half: WriteHalf<Box<dyn RawStream>>,
    mut encoder: MessageEncoder,
    mut writer_rx: mpsc::Receiver<ProtocolMessage>,
    shared: Arc<ChannelShared>,
) {
    let mut closed = shared.subscribe();
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        tokio::select! {
            _ = closed.changed() => break,
            message = writer_rx.recv() => {
                let Some(message) = message else { break };
                buf.clear();
                if let Err(error) = encoder.encode(&message, &mut buf) {
                    warn!(peer = %shared.peer(), %error, "failed to encode frame");
                    shared.close(CloseReason::Error);
                    break;
                }
                shared.touch_write();
                let write = async {
                    write_half.write_all(&buf).await?;
                    write_half.flush().await
                };
                if let Err(error) = write.await {
                    debug!(peer = %shared.peer(), %error, "write failed, closing connection");
                    shared.close(CloseReason::Error);
                    break;
                }
            }
        }
    }
    // drain frames already queued so a close right after a send does not
    // drop the frame before it reaches the socket
    while let Ok(message) = writer_rx.try_recv() {
        buf.clear();
        if encoder.encode(&message, &mut buf).is_err() {
            break;
        }
        if write_half.write_all(&buf).await.is_err() {
            break;
        }
    }
    let _ = write_half.flush().await;
    // half-close so the peer observes EOF promptly
    let _ = write_half.shutdown().await;
}

async fn run_client_reader(
    mut read_half: ReadHalf<Box<dyn RawStream>>,
    mut decoder: MessageDecoder,
    connection: Arc<RemoteClientConnection>,
) {
    let shared = Arc::clone(&connection.shared);
    let mut closed = shared.subscribe();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    'outer: loop {
        tokio::select! {
            _ = closed.changed() => break,
            read = read_half.read_buf(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!(peer = %shared.peer(), "connection closed by peer");
                        shared.close(CloseReason::Error);
                        break;
                    }
                    Ok(_) => {
                        shared.touch_read();
                        loop {
                            match decoder.decode(&mut buf) {
                                Ok(Some(ProtocolMessage::Reply(reply))) => {
                                    connection.handle_reply(reply);
                                }
                                Ok(Some(ProtocolMessage::Request(request))) => {
                                    warn!(
                                        peer = %shared.peer(),
                                        subject = %request.subject,
                                        "unexpected request on client connection"
                                    );
                                    shared.close(CloseReason::Error);
                                    break 'outer;
                                }
                                Ok(None) => break,
                                Err(error) => {
                                    warn!(peer = %shared.peer(), %error, "failed to decode frame");
                                    shared.close(CloseReason::Error);
                                    break 'outer;
                                }
                            }
                        }
                    }
                    Err(error) => {
                        debug!(peer = %shared.peer(), %error, "read failed, closing connection");
                        shared.close(CloseReason::Error);
                        break;
                    }
                }
            }
        }
    }
    connection.pending.fail_all(|| shared.close_error());
}

async fn run_server_reader(
    mut read_half: ReadHalf<Box<dyn RawStream>>,
    mut decoder: MessageDecoder,
    shared: Arc<ChannelShared>,
    handlers: Arc<HandlerRegistry>,
    heartbeats: Arc<ServerHeartbeats>,
    metrics: MessagingMetrics,
) {
    let mut closed = shared.subscribe();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    'outer: loop {
        tokio::select! {
            _ = closed.changed() => break,
            read = read_half.read_buf(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!(peer = %shared.peer(), "connection closed by peer");
                        shared.close(CloseReason::Error);
                        break;
                    }
                    Ok(_) => {
                        shared.touch_read();
                        loop {
                            match decoder.decode(&mut buf) {
                                Ok(Some(ProtocolMessage::Request(request))) => {
                                    if request.is_heartbeat() {
                                        heartbeats
                                            .on_heartbeat(&shared, &handlers, request)
                                            .await;
                                        continue;
                                    }
                                    metrics.record_request_handled(request.payload.len());
                                    let handlers = Arc::clone(&handlers);
                                    let sink = ChannelReplySink::new(Arc::clone(&shared));
                                    // handlers run off the reader task so slow
                                    // application code cannot stall the socket
                                    tokio::spawn(async move {
                                        dispatch_request(&handlers, request, &sink).await;
                                    });
                                }
                                Ok(Some(ProtocolMessage::Reply(reply))) => {
                                    warn!(
                                        peer = %shared.peer(),
                                        id = reply.id,
                                        "unexpected reply on server connection"
                                    );
                                    shared.close(CloseReason::Error);
                                    break 'outer;
                                }
                                Ok(None) => break,
                                Err(error) => {
                                    warn!(peer = %shared.peer(), %error, "failed to decode frame");
                                    shared.close(CloseReason::Error);
                                    break 'outer;
                                }
                            }
                        }
                    }
                    Err(error) => {
                        debug!(peer = %shared.peer(), %error, "read failed, closing connection");
                        shared.close(CloseReason::Error);
                        break;
                    }
                }
            }
        }
    }
}
