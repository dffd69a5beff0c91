//! Handler Registry
//!
//! Subject -> handler mapping used by server-side dispatch. Read-mostly
//! shared state with rare structural writes; registration is
//! idempotent-overwrite and unregistering an unknown subject is a no-op.

use crate::address::Address;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A registered message handler.
///
/// Consumers receive the message and produce no wire reply; functions
/// produce a reply payload or an error that is converted into an
/// error-status reply.
#[derive(Clone)]
pub enum RegisteredHandler {
    Consumer(Arc<dyn Fn(Address, Bytes) + Send + Sync>),
    Function(Arc<dyn Fn(Address, Bytes) -> BoxFuture<'static, anyhow::Result<Bytes>> + Send + Sync>),
}

/// Concurrent subject -> handler map
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, RegisteredHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous registration
    pub fn register(&self, subject: impl Into<String>, handler: RegisteredHandler) {
        self.handlers.write().insert(subject.into(), handler);
    }

    /// Remove the handler for a subject; unknown subjects are a no-op
    pub fn unregister(&self, subject: &str) {
        self.handlers.write().remove(subject);
    }

    pub fn get(&self, subject: &str) -> Option<RegisteredHandler> {
        self.handlers.read().get(subject).cloned()
    }
}
