//! Connection Abstractions
//!
//! Client-side and server-side connection contracts, the in-flight request
//! (correlation) table, and the dispatch path shared by the local and
//! remote implementations.

pub mod local;
pub mod remote;

pub use local::LocalClientConnection;
pub use remote::{RemoteClientConnection, RemoteServerConnection};

use crate::error::{MessagingError, Result};
use crate::handler::{HandlerRegistry, RegisteredHandler};
use crate::message::{ProtocolReply, ProtocolRequest, ReplyStatus};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Byte stream a connection runs over. Plain TCP by default; a
/// [`StreamWrapper`] may substitute e.g. a TLS-wrapped stream.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// Stream-layer provider boundary.
///
/// This is where a TLS context plugs in: the deployment layer supplies an
/// already-validated wrapper, the core never loads certificates itself.
#[async_trait]
pub trait StreamWrapper: Send + Sync {
    async fn wrap_outbound(&self, stream: TcpStream) -> std::io::Result<Box<dyn RawStream>>;
    async fn wrap_inbound(&self, stream: TcpStream) -> std::io::Result<Box<dyn RawStream>>;
}

/// Client-side connection contract
#[async_trait]
pub trait ClientConnection: Send + Sync {
    /// Fire-and-forget send; resolves once the message is queued for write
    async fn send_async(&self, request: ProtocolRequest) -> Result<()>;

    /// Send a request and await the correlated reply payload
    async fn send_and_receive(&self, request: ProtocolRequest) -> Result<Bytes>;
}

/// Server-side reply channel handed to the dispatch path
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn reply(&self, id: u64, status: ReplyStatus, payload: Bytes);
}

/// In-flight request table: correlation id -> pending completion.
///
/// A pending entry is completed by exactly one of reply, timeout or
/// connection close; whichever removes the entry first wins and the others
/// degrade to no-ops.
#[derive(Default)]
pub(crate) struct PendingRequests {
    inner: DashMap<u64, PendingEntry>,
}

struct PendingEntry {
    subject: String,
    tx: oneshot::Sender<Result<Bytes>>,
}

/// Removes the pending entry when the awaiting future is dropped (e.g. a
/// timeout cancelled it) so the table cannot leak abandoned entries.
pub(crate) struct PendingGuard {
    table: Arc<PendingRequests>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.inner.remove(&self.id);
    }
}

impl PendingRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a pending request before its frame is written
    pub fn register(
        self: &Arc<Self>,
        id: u64,
        subject: &str,
    ) -> (oneshot::Receiver<Result<Bytes>>, PendingGuard) {
        let (tx, rx) = oneshot::channel();
        self.inner.insert(
            id,
            PendingEntry {
                subject: subject.to_owned(),
                tx,
            },
        );
        let guard = PendingGuard {
            table: Arc::clone(self),
            id,
        };
        (rx, guard)
    }

    /// Complete the pending request matching `reply`, translating error
    /// statuses into typed failures. Returns false when no entry matched
    /// (late reply after timeout or close); such replies are dropped.
    pub fn complete(&self, reply: ProtocolReply) -> bool {
        let Some((_, entry)) = self.inner.remove(&reply.id) else {
            return false;
        };
        let result = match reply.status {
            ReplyStatus::Ok => Ok(reply.payload),
            ReplyStatus::ErrorNoHandler => Err(MessagingError::NoRemoteHandler {
                subject: entry.subject,
            }),
            ReplyStatus::ErrorHandlerException => Err(MessagingError::RemoteHandlerFailure {
                message: if reply.payload.is_empty() {
                    None
                } else {
                    Some(String::from_utf8_lossy(&reply.payload).into_owned())
                },
            }),
            ReplyStatus::ProtocolException => Err(MessagingError::RemoteProtocolException),
        };
        let _ = entry.tx.send(result);
        true
    }

    /// Fail every pending request, e.g. when the connection closes
    pub fn fail_all(&self, error: impl Fn() -> MessagingError) {
        let ids: Vec<u64> = self.inner.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.inner.remove(&id) {
                let _ = entry.tx.send(Err(error()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

/// Look up and invoke the handler for a request, converting every handler
/// outcome into at most one reply. Handler failures never propagate as
/// faults; missing handlers are an expected condition and not logged as
/// errors.
pub(crate) async fn dispatch_request(
    handlers: &HandlerRegistry,
    request: ProtocolRequest,
    sink: &dyn ReplySink,
) {
    let ProtocolRequest {
        id,
        sender,
        subject,
        payload,
    } = request;

    match handlers.get(&subject) {
        None => {
            debug!(subject = %subject, sender = %sender, "no handler registered for subject");
            sink.reply(id, ReplyStatus::ErrorNoHandler, Bytes::new())
                .await;
        }
        Some(RegisteredHandler::Consumer(consumer)) => {
            consumer(sender, payload);
        }
        Some(RegisteredHandler::Function(function)) => {
            match function(sender.clone(), payload).await {
                Ok(response) => {
                    sink.reply(id, ReplyStatus::Ok, response).await;
                }
                Err(error) => {
                    warn!(
                        subject = %subject,
                        sender = %sender,
                        error = %error,
                        "handler failed while processing message"
                    );
                    let message = error.to_string();
                    sink.reply(id, ReplyStatus::ErrorHandlerException, Bytes::from(message))
                        .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_is_exactly_once() {
        let pending = PendingRequests::new();
        let (rx, _guard) = pending.register(1, "subject");

        assert!(pending.complete(ProtocolReply::ok(1, Bytes::from_static(b"first"))));
        // second completion for the same id is a no-op
        assert!(!pending.complete(ProtocolReply::ok(1, Bytes::from_static(b"second"))));

        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn reply_after_fail_all_is_dropped() {
        let pending = PendingRequests::new();
        let (rx, _guard) = pending.register(1, "subject");

        pending.fail_all(|| MessagingError::Closed);
        assert!(!pending.complete(ProtocolReply::ok(1, Bytes::new())));
        assert!(matches!(rx.await.unwrap(), Err(MessagingError::Closed)));
    }

    #[tokio::test]
    async fn dropping_the_caller_removes_the_entry() {
        let pending = PendingRequests::new();
        let (rx, guard) = pending.register(7, "subject");
        assert_eq!(pending.len(), 1);

        // simulates a timeout cancelling the awaiting future
        drop(rx);
        drop(guard);
        assert_eq!(pending.len(), 0);
        assert!(!pending.complete(ProtocolReply::ok(7, Bytes::new())));
    }

    #[tokio::test]
    async fn error_statuses_translate_to_typed_failures() {
        let pending = PendingRequests::new();

        let (rx, _g) = pending.register(1, "missing-subject");
        pending.complete(ProtocolReply::new(
            1,
            ReplyStatus::ErrorNoHandler,
            Bytes::new(),
        ));
        match rx.await.unwrap() {
            Err(MessagingError::NoRemoteHandler { subject }) => {
                assert_eq!(subject, "missing-subject")
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let (rx, _g) = pending.register(2, "s");
        pending.complete(ProtocolReply::new(
            2,
            ReplyStatus::ErrorHandlerException,
            Bytes::from_static(b"boom"),
        ));
        match rx.await.unwrap() {
            Err(MessagingError::RemoteHandlerFailure { message }) => {
                assert_eq!(message.as_deref(), Some("boom"))
            }
            other => panic!("unexpected result: {other:?}"),
        }

        // an empty failure payload means the remote exception had no message
        let (rx, _g) = pending.register(3, "s");
        pending.complete(ProtocolReply::new(
            3,
            ReplyStatus::ErrorHandlerException,
            Bytes::new(),
        ));
        match rx.await.unwrap() {
            Err(MessagingError::RemoteHandlerFailure { message }) => assert_eq!(message, None),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
