//! Messaging Service
//!
//! The top-level component: binds listening sockets, bootstraps outbound
//! connections through the channel pool, performs the handshake, and
//! exposes the send/receive/register API the cluster communication layer
//! consumes. Sends to this node's own advertised address short-circuit
//! in-process without opening a socket.

use crate::address::Address;
use crate::config::MessagingConfig;
use crate::connection::remote::{
    ChannelShared, CloseReason, RemoteClientConnection, RemoteServerConnection,
};
use crate::connection::{ClientConnection, LocalClientConnection, RawStream, StreamWrapper};
use crate::error::{MessagingError, Result};
use crate::handler::{HandlerRegistry, RegisteredHandler};
use crate::handshake::{client_handshake, cluster_preamble, server_handshake};
use crate::heartbeat::{spawn_client_heartbeats, ServerHeartbeats};
use crate::message::ProtocolRequest;
use crate::metrics::{MessagingMetrics, MetricsSnapshot};
use crate::pool::ChannelPool;
use crate::protocol::ProtocolVersion;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Point-to-point messaging service for one cluster node
#[derive(Clone)]
pub struct MessagingService {
    ctx: Arc<ServiceContext>,
}

struct ServiceContext {
    cluster: String,
    preamble: u32,
    advertised: Address,
    binding: Vec<Address>,
    config: MessagingConfig,
    version: ProtocolVersion,
    started: AtomicBool,
    handlers: Arc<HandlerRegistry>,
    local: LocalClientConnection,
    pool: ChannelPool,
    message_ids: Arc<AtomicU64>,
    next_connection_id: AtomicU64,
    connections: Mutex<HashMap<u64, Arc<ChannelShared>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    metrics: MessagingMetrics,
    stream_wrapper: Option<Arc<dyn StreamWrapper>>,
    sender_ip: tokio::sync::OnceCell<IpAddr>,
}

impl MessagingService {
    /// Create a service advertising `advertised` within `cluster`.
    ///
    /// The service is inert until [`start`](Self::start) succeeds.
    pub fn new(
        cluster: impl Into<String>,
        advertised: Address,
        config: MessagingConfig,
    ) -> Result<Self> {
        Self::build(cluster, advertised, config, ProtocolVersion::latest(), None)
    }

    /// Create a service with a stream wrapper supplied by the deployment
    /// layer (e.g. an already-validated TLS context).
    pub fn new_with_stream_wrapper(
        cluster: impl Into<String>,
        advertised: Address,
        config: MessagingConfig,
        wrapper: Arc<dyn StreamWrapper>,
    ) -> Result<Self> {
        Self::build(
            cluster,
            advertised,
            config,
            ProtocolVersion::latest(),
            Some(wrapper),
        )
    }

    /// Pin the newest protocol version this node offers; lets tests stand
    /// up a peer that behaves like an older software version.
    #[doc(hidden)]
    pub fn new_with_protocol_version(
        cluster: impl Into<String>,
        advertised: Address,
        config: MessagingConfig,
        version: ProtocolVersion,
    ) -> Result<Self> {
        Self::build(cluster, advertised, config, version, None)
    }

    fn build(
        cluster: impl Into<String>,
        advertised: Address,
        config: MessagingConfig,
        version: ProtocolVersion,
        stream_wrapper: Option<Arc<dyn StreamWrapper>>,
    ) -> Result<Self> {
        config.validate()?;
        let cluster = cluster.into();

        let port = config.port.unwrap_or_else(|| advertised.port());
        let binding = if config.interfaces.is_empty() {
            vec![Address::new(advertised.host(), port)]
        } else {
            config
                .interfaces
                .iter()
                .map(|interface| Address::new(interface.clone(), port))
                .collect()
        };

        let handlers = Arc::new(HandlerRegistry::new());
        let ctx = ServiceContext {
            preamble: cluster_preamble(&cluster),
            cluster,
            advertised,
            binding,
            pool: ChannelPool::new(config.pool_size),
            config,
            version,
            started: AtomicBool::new(false),
            local: LocalClientConnection::new(Arc::clone(&handlers)),
            handlers,
            message_ids: Arc::new(AtomicU64::new(0)),
            next_connection_id: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            shutdown: watch::Sender::new(false),
            metrics: MessagingMetrics::new(),
            stream_wrapper,
            sender_ip: tokio::sync::OnceCell::new(),
        };
        Ok(Self { ctx: Arc::new(ctx) })
    }

    /// The address this node advertises as message sender
    pub fn address(&self) -> &Address {
        &self.ctx.advertised
    }

    /// The addresses the service binds its listeners to
    pub fn binding_addresses(&self) -> &[Address] {
        &self.ctx.binding
    }

    pub fn is_running(&self) -> bool {
        self.ctx.started.load(Ordering::Acquire)
    }

    /// Live connection count, inbound and outbound; lets callers probe
    /// that local sends never open sockets
    pub fn active_connection_count(&self) -> usize {
        self.ctx.connections.lock().len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    /// Bind all configured interfaces and start accepting connections.
    /// Any bind failure fails the whole startup. Sends attempted before
    /// this returns fail fast.
    pub async fn start(&self) -> Result<()> {
        let ctx = &self.ctx;
        if ctx.started.load(Ordering::Acquire) {
            warn!(advertised = %ctx.advertised, "messaging service already running");
            return Ok(());
        }

        let mut listeners = Vec::new();
        for address in &ctx.binding {
            let socket = address.resolve().await?;
            let listener = TcpListener::bind(socket).await.map_err(|e| {
                warn!(%address, error = %e, "failed to bind messaging listener");
                MessagingError::connect(address, e)
            })?;
            listeners.push(listener);
        }
        for listener in listeners {
            let task = spawn_acceptor(Arc::clone(ctx), listener);
            ctx.listeners.lock().push(task);
        }

        ctx.started.store(true, Ordering::Release);
        info!(
            cluster = %ctx.cluster,
            binding = ?ctx.binding,
            advertising = %ctx.advertised,
            "started messaging service"
        );
        Ok(())
    }

    /// Stop the service: refuse new work first, then tear down listeners
    /// and connections, failing every still-outstanding request so no
    /// caller hangs forever.
    pub async fn stop(&self) {
        let ctx = &self.ctx;
        if !ctx.started.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = ctx.shutdown.send(true);

        let listeners: Vec<JoinHandle<()>> = ctx.listeners.lock().drain(..).collect();
        let connections: Vec<Arc<ChannelShared>> = {
            let mut map = ctx.connections.lock();
            map.drain().map(|(_, shared)| shared).collect()
        };
        for connection in connections {
            connection.close(CloseReason::Shutdown);
        }
        ctx.pool.clear();

        let drain = async {
            for listener in listeners {
                let _ = listener.await;
            }
        };
        if tokio::time::timeout(ctx.config.shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!("listener tasks did not stop within the shutdown timeout");
        }
        tokio::time::sleep(ctx.config.shutdown_quiet_period).await;

        info!(
            cluster = %ctx.cluster,
            advertising = %ctx.advertised,
            "stopped messaging service"
        );
    }

    /// Fire-and-forget send. With `keep_alive` the message flows through
    /// the pooled channel for its subject; otherwise a one-off connection
    /// is opened and closed after the write.
    pub async fn send_async(
        &self,
        address: Address,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
        keep_alive: bool,
    ) -> Result<()> {
        let ctx = &self.ctx;
        if !ctx.started.load(Ordering::Acquire) {
            return Err(MessagingError::Closed);
        }
        let request = ctx.new_request(subject.into(), payload.into());

        if address == ctx.advertised {
            return ctx.local.send_async(request).await;
        }
        if keep_alive {
            let connection = ctx.pooled_channel(&address, &request.subject).await?;
            connection.send_async(request).await
        } else {
            let connection = ctx.open_channel(&address).await?;
            let result = connection.send_async(request).await;
            connection.close(CloseReason::Error);
            result
        }
    }

    /// Send a request and await its reply, racing the given timeout.
    /// Exactly one of reply, timeout or connection close settles the call.
    pub async fn send_and_receive(
        &self,
        address: Address,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
        keep_alive: bool,
        timeout: Duration,
    ) -> Result<Bytes> {
        let ctx = Arc::clone(&self.ctx);
        if !ctx.started.load(Ordering::Acquire) {
            return Err(MessagingError::Closed);
        }
        let subject = subject.into();
        let payload = payload.into();
        let request = ctx.new_request(subject.clone(), payload);

        ctx.metrics.record_request_sent(request.payload.len());
        let started_at = std::time::Instant::now();

        let exchange = ctx.send_and_receive_inner(address.clone(), request, keep_alive);
        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(response)) => {
                ctx.metrics
                    .record_response(response.len(), started_at.elapsed());
                Ok(response)
            }
            Ok(Err(error)) => {
                ctx.metrics.record_request_failed();
                Err(error)
            }
            Err(_) => {
                ctx.metrics.record_request_failed();
                Err(MessagingError::Timeout {
                    subject,
                    address: address.to_string(),
                    timeout,
                })
            }
        }
    }

    /// As [`send_and_receive`](Self::send_and_receive) with the configured
    /// default timeout and a pooled connection.
    pub async fn request(
        &self,
        address: Address,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<Bytes> {
        let timeout = self.ctx.config.request_timeout;
        self.send_and_receive(address, subject, payload, true, timeout)
            .await
    }

    /// Register a request/reply handler; registering twice replaces the
    /// previous handler.
    pub fn register_handler<F, Fut>(&self, subject: impl Into<String>, handler: F)
    where
        F: Fn(Address, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        self.ctx.handlers.register(
            subject.into(),
            RegisteredHandler::Function(Arc::new(move |sender, payload| {
                Box::pin(handler(sender, payload))
            })),
        );
    }

    /// Register a consume-only handler; the sender receives no reply
    pub fn register_consumer<F>(&self, subject: impl Into<String>, handler: F)
    where
        F: Fn(Address, Bytes) + Send + Sync + 'static,
    {
        self.ctx
            .handlers
            .register(subject.into(), RegisteredHandler::Consumer(Arc::new(handler)));
    }

    /// Remove the handler for a subject; unknown subjects are a no-op
    pub fn unregister_handler(&self, subject: &str) {
        self.ctx.handlers.unregister(subject);
    }
}

impl ServiceContext {
    fn new_request(&self, subject: String, payload: Bytes) -> ProtocolRequest {
        let id = self.message_ids.fetch_add(1, Ordering::Relaxed) + 1;
        ProtocolRequest::new(id, self.advertised.clone(), subject, payload)
    }

    async fn send_and_receive_inner(
        self: &Arc<Self>,
        address: Address,
        request: ProtocolRequest,
        keep_alive: bool,
    ) -> Result<Bytes> {
        if address == self.advertised {
            return self.local.send_and_receive(request).await;
        }
        if keep_alive {
            let connection = self.pooled_channel(&address, &request.subject).await?;
            connection.send_and_receive(request).await
        } else {
            let connection = self.open_channel(&address).await?;
            let result = connection.send_and_receive(request).await;
            connection.close(CloseReason::Error);
            result
        }
    }

    async fn pooled_channel(
        self: &Arc<Self>,
        address: &Address,
        subject: &str,
    ) -> Result<Arc<RemoteClientConnection>> {
        let dedicated = self
            .config
            .dedicated_subjects
            .iter()
            .any(|candidate| candidate == subject);
        self.pool
            .get_channel(address, subject, dedicated, || self.open_channel(address))
            .await
    }

    /// Dial, handshake and activate a new outbound connection
    async fn open_channel(self: &Arc<Self>, address: &Address) -> Result<Arc<RemoteClientConnection>> {
        let socket = address.resolve().await?;
        let connect = async {
            let tcp = TcpStream::connect(socket)
                .await
                .map_err(|e| MessagingError::connect(address, e))?;
            if let Err(error) = tcp.set_nodelay(true) {
                warn!(%error, "failed to set TCP_NODELAY");
            }
            let mut stream = self.wrap_outbound(tcp).await?;
            let version = client_handshake(&mut stream, self.preamble, self.version).await?;
            Ok::<_, MessagingError>((stream, version))
        };
        let (stream, version) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| {
                MessagingError::connect_msg(
                    address,
                    format!("connect timed out after {:?}", self.config.connect_timeout),
                )
            })??;

        let sender_ip = self.sender_ip().await;
        let connection = RemoteClientConnection::spawn(
            stream,
            address.clone(),
            version.new_encoder(self.advertised.clone(), sender_ip, self.config.compression),
            version.new_decoder(self.config.compression, self.config.max_message_size),
        );
        self.register_connection(Arc::clone(connection.shared()));

        if self.config.heartbeats_enabled() {
            spawn_client_heartbeats(
                Arc::clone(&connection),
                self.advertised.clone(),
                Arc::clone(&self.message_ids),
                self.config.heartbeat_interval,
                self.config.heartbeat_timeout,
                self.config.heartbeat_payload,
            );
        }

        debug!(peer = %address, ?version, "opened outbound connection");
        Ok(connection)
    }

    async fn wrap_outbound(&self, tcp: TcpStream) -> Result<Box<dyn RawStream>> {
        match &self.stream_wrapper {
            Some(wrapper) => wrapper
                .wrap_outbound(tcp)
                .await
                .map_err(|e| MessagingError::io("stream wrapper rejected outbound stream", e)),
            None => Ok(Box::new(tcp)),
        }
    }

    async fn wrap_inbound(&self, tcp: TcpStream) -> Result<Box<dyn RawStream>> {
        match &self.stream_wrapper {
            Some(wrapper) => wrapper
                .wrap_inbound(tcp)
                .await
                .map_err(|e| MessagingError::io("stream wrapper rejected inbound stream", e)),
            None => Ok(Box::new(tcp)),
        }
    }

    /// The resolved IP of the advertised address, for V1 framing
    async fn sender_ip(self: &Arc<Self>) -> IpAddr {
        *self
            .sender_ip
            .get_or_init(|| async {
                match self.advertised.resolve_ip().await {
                    Ok(ip) => ip,
                    Err(error) => {
                        warn!(%error, "failed to resolve advertised host, framing unspecified ip");
                        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
                    }
                }
            })
            .await
    }

    fn register_connection(self: &Arc<Self>, shared: Arc<ChannelShared>) {
        if *self.shutdown.borrow() {
            // raced the shutdown; nothing will close it later, so do it now
            shared.close(CloseReason::Shutdown);
            return;
        }
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.connections.lock().insert(id, Arc::clone(&shared));

        let ctx = Arc::clone(self);
        let mut closed = shared.subscribe();
        tokio::spawn(async move {
            while !*closed.borrow() {
                if closed.changed().await.is_err() {
                    break;
                }
            }
            ctx.connections.lock().remove(&id);
        });
    }
}

fn spawn_acceptor(ctx: Arc<ServiceContext>, listener: TcpListener) -> JoinHandle<()> {
    let mut shutdown = ctx.shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            if let Err(error) = accept_connection(ctx, stream, peer).await {
                                debug!(%peer, %error, "inbound connection failed");
                            }
                        });
                    }
                    Err(error) => {
                        warn!(%error, "failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }
    })
}

async fn accept_connection(
    ctx: Arc<ServiceContext>,
    tcp: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    if let Err(error) = tcp.set_nodelay(true) {
        warn!(%error, "failed to set TCP_NODELAY");
    }
    let mut stream = ctx.wrap_inbound(tcp).await?;
    let version = server_handshake(&mut stream, ctx.preamble, ctx.version).await?;

    let sender_ip = ctx.sender_ip().await;
    let heartbeats = ServerHeartbeats::new(
        ctx.config.heartbeats_enabled(),
        ctx.config.heartbeat_payload,
        ctx.config.forward_heartbeats,
    );
    let connection = RemoteServerConnection::spawn(
        stream,
        Address::from(peer),
        version.new_encoder(ctx.advertised.clone(), sender_ip, ctx.config.compression),
        version.new_decoder(ctx.config.compression, ctx.config.max_message_size),
        Arc::clone(&ctx.handlers),
        heartbeats,
        ctx.metrics.clone(),
    );
    ctx.register_connection(Arc::clone(connection.shared()));
    debug!(%peer, ?version, "accepted inbound connection");
    Ok(())
}
