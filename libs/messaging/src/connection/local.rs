//! In-Process Connection
//!
//! Short-circuit path for messages addressed to this node's own advertised
//! address: no socket, no serialization, but identical dispatch and error
//! conversion semantics so application code stays address-agnostic.

use crate::connection::{dispatch_request, ClientConnection, ReplySink};
use crate::error::{MessagingError, Result};
use crate::handler::HandlerRegistry;
use crate::message::{ProtocolReply, ProtocolRequest, ReplyStatus};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Connection to this node itself
pub struct LocalClientConnection {
    handlers: Arc<HandlerRegistry>,
}

impl LocalClientConnection {
    pub(crate) fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl ClientConnection for LocalClientConnection {
    async fn send_async(&self, request: ProtocolRequest) -> Result<()> {
        let handlers = Arc::clone(&self.handlers);
        // replies to fire-and-forget sends are discarded, as on the wire
        tokio::spawn(async move {
            dispatch_request(&handlers, request, &DiscardingSink).await;
        });
        Ok(())
    }

    async fn send_and_receive(&self, request: ProtocolRequest) -> Result<Bytes> {
        let subject = request.subject.clone();
        let (tx, rx) = oneshot::channel();
        let sink = CapturingSink {
            tx: Mutex::new(Some(tx)),
        };

        dispatch_request(&self.handlers, request, &sink).await;

        let reply = rx
            .await
            .map_err(|_| MessagingError::connection_closed("local"))?;
        match reply.status {
            ReplyStatus::Ok => Ok(reply.payload),
            ReplyStatus::ErrorNoHandler => Err(MessagingError::NoRemoteHandler { subject }),
            ReplyStatus::ErrorHandlerException => Err(MessagingError::RemoteHandlerFailure {
                message: if reply.payload.is_empty() {
                    None
                } else {
                    Some(String::from_utf8_lossy(&reply.payload).into_owned())
                },
            }),
            ReplyStatus::ProtocolException => Err(MessagingError::RemoteProtocolException),
        }
    }
}

struct DiscardingSink;

#[async_trait]
impl ReplySink for DiscardingSink {
    async fn reply(&self, _id: u64, _status: ReplyStatus, _payload: Bytes) {}
}

struct CapturingSink {
    tx: Mutex<Option<oneshot::Sender<ProtocolReply>>>,
}

#[async_trait]
impl ReplySink for CapturingSink {
    async fn reply(&self, id: u64, status: ReplyStatus, payload: Bytes) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(ProtocolReply::new(id, status, payload));
        }
    }
}
