//! # RPC Client
//!
//! Owns one connection: drives the handshake when the transport reports
//! `Connected`, correlates responses to in-flight calls by packet id, and
//! exposes server namespaces as [`NamespaceProxy`] handles.
//!
//! ## Correlation
//! Every `fire` registers a one-shot slot under its packet id before the frame
//! leaves. The read loop removes the slot when the matching `Reply(id)` frame
//! arrives; a timed-out call removes it itself. Whichever happens first retires
//! the entry, so a late response finds nothing and is dropped.
//!
//! ## Example
//! ```rust,no_run
//! use uni_rpc::config::ClientConfig;
//! use uni_rpc::service::client::RpcClient;
//! use uni_rpc::transport::tcp;
//!
//! # async fn run() -> uni_rpc::error::Result<()> {
//! let connection = tcp::connect("127.0.0.1:9000").await?;
//! let client = RpcClient::connect(connection, ClientConfig::default())?;
//! client.ready().await?;
//!
//! let math = client.namespace("math").expect("server advertises math");
//! let sum = math.call("add", vec![2.into(), 3.into()]).await?;
//! assert_eq!(sum.as_i64(), Some(5));
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::core::codec::{FormatCodec, PacketCodec};
use crate::core::packet::{Meta, Packet};
use crate::core::value::Value;
use crate::error::{ErrorCode, ProtocolError, Result};
use crate::protocol::handshake::{ClientHandshake, ClientStep, ConnectionInfo, ServerHello};
use crate::protocol::middleware::{
    AsyncMiddleware, ConnectionContext, Middleware, MiddlewareInstaller, Pipeline, Step,
};
use crate::protocol::{
    HANDSHAKE_CONFIRM, HANDSHAKE_FINISH, HANDSHAKE_GENERATE_KEY, HANDSHAKE_INIT, META_EVENT_NAME,
};
use crate::service::namespace::{NamespaceProxy, NamespaceState};
use crate::service::secure::Envelope;
use crate::transport::{Channel, Connection, Socket, SocketEvent};
use crate::utils::crypto::{SessionCipher, SessionKey};
use crate::utils::metrics::Metrics;

/// Per-call options for [`RpcClient::fire_with`]
#[derive(Debug, Clone, Default)]
pub struct FireOptions {
    /// Deadline for this call; the client default when `None`
    pub timeout: Option<Duration>,
    /// Extra meta entries sent with the request
    pub meta: Meta,
}

impl FireOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed,
}

type PendingMap = Mutex<HashMap<String, oneshot::Sender<Bytes>>>;

/// Retires a pending entry when the waiting call ends, however it ends
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: String,
}

impl<'a> PendingGuard<'a> {
    fn register(pending: &'a PendingMap, id: &str, tx: oneshot::Sender<Bytes>) -> Result<Self> {
        let mut map = pending.lock();
        if map.contains_key(id) {
            return Err(ProtocolError::Custom(format!("packet id '{id}' already in flight")));
        }
        map.insert(id.to_string(), tx);
        Ok(Self {
            pending,
            id: id.to_string(),
        })
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

struct ClientInner {
    config: ClientConfig,
    socket: Arc<dyn Socket>,
    codec: Arc<dyn PacketCodec>,
    pipeline: Pipeline,
    pending: PendingMap,
    cipher: RwLock<Option<Arc<SessionCipher>>>,
    info: RwLock<ConnectionInfo>,
    namespaces: RwLock<BTreeMap<String, NamespaceState>>,
    readiness: watch::Sender<Readiness>,
    events: Mutex<Option<mpsc::UnboundedReceiver<SocketEvent>>>,
    metrics: Arc<Metrics>,
}

impl ClientInner {
    fn cipher_snapshot(&self) -> Option<Arc<SessionCipher>> {
        self.cipher.read().clone()
    }

    fn install_key(&self, key: &SessionKey) {
        *self.cipher.write() = Some(Arc::new(SessionCipher::new(key)));
    }
}

/// RPC client bound to one connection
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("socket", &self.inner.socket)
            .field("connected", &self.inner.info.read().connected)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Build a client without starting it, so middleware can be installed first
    pub fn new(connection: Connection, config: ClientConfig) -> Self {
        let codec = Arc::new(FormatCodec::new(config.serialization));
        Self::with_codec(connection, config, codec)
    }

    pub fn with_codec(
        connection: Connection,
        config: ClientConfig,
        codec: Arc<dyn PacketCodec>,
    ) -> Self {
        let (readiness, _) = watch::channel(Readiness::Pending);
        Self {
            inner: Arc::new(ClientInner {
                config,
                socket: connection.socket,
                codec,
                pipeline: Pipeline::new(),
                pending: Mutex::new(HashMap::new()),
                cipher: RwLock::new(None),
                info: RwLock::new(ConnectionInfo::default()),
                namespaces: RwLock::new(BTreeMap::new()),
                readiness,
                events: Mutex::new(Some(connection.events)),
                metrics: Arc::new(Metrics::new()),
            }),
        }
    }

    /// Build and start a client in one step
    pub fn connect(connection: Connection, config: ClientConfig) -> Result<Self> {
        let client = Self::new(connection, config);
        client.start()?;
        Ok(client)
    }

    /// Spawn the read loop. The handshake starts on the transport's `Connected` event.
    pub fn start(&self) -> Result<()> {
        let events = self
            .inner
            .events
            .lock()
            .take()
            .ok_or_else(|| ProtocolError::Custom("client already started".into()))?;
        tokio::spawn(run_events(Arc::clone(&self.inner), events));
        Ok(())
    }

    /// Resolves once the handshake reached CONNECTED and namespaces are built.
    ///
    /// # Errors
    /// `ConnectionClosed` if the handshake was abandoned or the connection dropped.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.inner.readiness.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                Readiness::Ready => return Ok(()),
                Readiness::Failed => return Err(ProtocolError::ConnectionClosed),
                Readiness::Pending => {}
            }
            rx.changed()
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.inner.info.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.info.read().connected
    }

    pub fn id(&self) -> &str {
        self.inner.socket.id()
    }

    /// Proxy for a namespace the server advertised on this connection
    pub fn namespace(&self, name: &str) -> Option<NamespaceProxy> {
        self.inner
            .namespaces
            .read()
            .contains_key(name)
            .then(|| NamespaceProxy::new(self.clone(), name.to_string()))
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.inner.namespaces.read().keys().cloned().collect()
    }

    pub(crate) fn namespace_state(&self, name: &str) -> Option<NamespaceState> {
        self.inner.namespaces.read().get(name).cloned()
    }

    pub(crate) fn update_namespace(&self, name: &str, update: impl FnOnce(&mut NamespaceState)) {
        if let Some(state) = self.inner.namespaces.write().get_mut(name) {
            update(state);
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Install function middleware
    pub fn use_fn<F>(&self, install: F) -> Result<()>
    where
        F: FnOnce(&RpcClient) -> Result<()> + Send + 'static,
    {
        MiddlewareInstaller::function(install).apply(self)
    }

    /// Install object middleware
    pub fn use_middleware<M>(&self, middleware: M) -> Result<()>
    where
        M: Middleware<RpcClient> + 'static,
    {
        MiddlewareInstaller::installable(middleware).apply(self)
    }

    pub fn use_installer(&self, installer: MiddlewareInstaller<RpcClient>) -> Result<()> {
        installer.apply(self)
    }

    /// Install middleware whose install step suspends
    pub async fn use_async<M>(&self, middleware: M) -> Result<()>
    where
        M: AsyncMiddleware<RpcClient> + 'static,
    {
        Box::new(middleware).install(self).await
    }

    /// Close the connection. Pending calls fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.inner.socket.close();
    }

    /// Call `event_name` with the default options
    pub async fn fire(&self, event_name: &str, args: Vec<Value>) -> Result<Value> {
        self.fire_with(event_name, args, FireOptions::default()).await
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    /// - `RequestNoEvent` if `event_name` is empty (nothing is sent)
    /// - `RequestTimeout` if no response arrives before the deadline
    /// - `Remote` / `UnrecognizedRemote` if the server answered with an error
    /// - `ConnectionClosed` if the connection dropped while waiting
    #[instrument(skip(self, args, options), fields(client_id = %self.id()))]
    pub async fn fire_with(
        &self,
        event_name: &str,
        args: Vec<Value>,
        options: FireOptions,
    ) -> Result<Value> {
        if event_name.is_empty() {
            return Err(ProtocolError::RequestNoEvent);
        }

        let timeout = options.timeout.unwrap_or(self.inner.config.default_timeout);
        let deadline = Instant::now() + timeout;

        let mut packet = Packet::request(event_name, args);
        for (key, value) in options.meta {
            if key != META_EVENT_NAME {
                packet.add_meta(key, value);
            }
        }

        let packet = match self.inner.pipeline.before_fire.run(packet).await {
            Step::Continue(packet) => packet,
            Step::Break(result) => {
                debug!(event = event_name, "Request short-circuited before send");
                return Ok(result.unwrap_or_default());
            }
        };

        // Responses are opened with the key that sealed the request
        let envelope = Envelope::new(Arc::clone(&self.inner.codec), self.inner.cipher_snapshot());
        let bytes = envelope.seal(&packet)?;

        let (tx, rx) = oneshot::channel();
        let _guard = PendingGuard::register(&self.inner.pending, &packet.id, tx)?;

        let sent = bytes.len() as u64;
        self.inner.socket.emit(Channel::Request, bytes)?;
        self.inner.metrics.request_fired(sent);
        debug!(event = event_name, packet_id = %packet.id, "Request sent");

        let payload = match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(_)) => return Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                self.inner.metrics.request_timed_out();
                warn!(event = event_name, packet_id = %packet.id, ?timeout, "Request timed out");
                return Err(ProtocolError::RequestTimeout {
                    event: event_name.to_string(),
                    timeout,
                });
            }
        };

        self.inner.metrics.response_received(payload.len() as u64);
        let response = envelope.open(&payload)?;

        if response.is_error() {
            let message = match response.result() {
                Value::Str(s) => s,
                other => other.to_string(),
            };
            let code = response.error_code().unwrap_or_default();
            return Err(match ErrorCode::from_i64(code) {
                Some(code) => ProtocolError::Remote { code, message },
                None => ProtocolError::UnrecognizedRemote { code, message },
            });
        }

        match self.inner.pipeline.after_fire.run(response.result()).await {
            Step::Continue(value) => Ok(value),
            Step::Break(result) => Ok(result.unwrap_or_default()),
        }
    }
}

/// Read loop: one per client, ends when the transport's event stream ends
async fn run_events(inner: Arc<ClientInner>, mut events: mpsc::UnboundedReceiver<SocketEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SocketEvent::Connected => {
                inner.readiness.send_replace(Readiness::Pending);
                // Spawned: the handshake waits on replies this loop delivers
                tokio::spawn(drive_handshake(Arc::clone(&inner)));
            }
            SocketEvent::Frame {
                channel: Channel::Reply(id),
                payload,
            } => {
                let slot = inner.pending.lock().remove(&id);
                match slot {
                    Some(tx) => {
                        let _ = tx.send(payload);
                    }
                    None => debug!(packet_id = %id, "Dropping response with no pending request"),
                }
            }
            SocketEvent::Frame {
                channel: Channel::Request,
                ..
            } => debug!("Ignoring request frame sent to a client"),
            SocketEvent::Disconnected => handle_disconnection(&inner).await,
        }
    }
    debug!(id = %inner.socket.id(), "Client event stream ended");
}

async fn handle_disconnection(inner: &Arc<ClientInner>) {
    let info = {
        let mut info = inner.info.write();
        info.connected = false;
        info.clone()
    };
    inner.namespaces.write().clear();
    *inner.cipher.write() = None;

    // Dropping the senders wakes every waiting call with ConnectionClosed
    let abandoned = std::mem::take(&mut *inner.pending.lock());
    if !abandoned.is_empty() {
        debug!(count = abandoned.len(), "Failing in-flight requests");
    }
    drop(abandoned);

    inner.readiness.send_replace(Readiness::Failed);
    inner.metrics.connection_closed();
    info!(id = %inner.socket.id(), "Disconnected");

    let _ = inner
        .pipeline
        .on_disconnection
        .run(ConnectionContext::Client(info))
        .await;
}

async fn drive_handshake(inner: Arc<ClientInner>) {
    inner.metrics.handshake_attempt();
    let client = RpcClient {
        inner: Arc::clone(&inner),
    };

    match run_handshake(&client).await {
        Ok(()) => {
            inner.metrics.handshake_success();
            inner.metrics.connection_established();
            inner.readiness.send_replace(Readiness::Ready);
        }
        Err(e) => {
            inner.metrics.handshake_failed();
            inner.info.write().connected = false;
            warn!(id = %inner.socket.id(), error = %e, "Handshake abandoned, closing connection");
            inner.readiness.send_replace(Readiness::Failed);
            inner.socket.close();
        }
    }
}

#[instrument(skip(client), fields(id = %client.id()))]
async fn run_handshake(client: &RpcClient) -> Result<()> {
    let inner = &client.inner;
    let mut handshake = ClientHandshake::new(inner.config.use_crypto);

    let hello = client.fire(HANDSHAKE_INIT, handshake.init_args()).await?;
    let hello = ServerHello::from_value(&hello)?;
    {
        let mut info = inner.info.write();
        info.name = hello.name.clone();
        info.address = hello.address.clone();
        info.namespaces = hello.namespaces.clone();
        info.use_crypto = hello.use_crypto;
    }

    match handshake.accept_hello(&hello)? {
        ClientStep::Finish => {}
        ClientStep::Confirm(args) => {
            let reply = client.fire(HANDSHAKE_CONFIRM, args).await?;
            let intermediate = handshake.verify_confirm(&reply)?;
            inner.install_key(&intermediate);

            let secret = client
                .fire(HANDSHAKE_GENERATE_KEY, handshake.generate_key_args())
                .await?;
            let session = handshake.accept_true_secret(&secret)?;
            inner.install_key(&session);
        }
    }

    client.fire(HANDSHAKE_FINISH, Vec::new()).await?;

    let info = {
        let mut info = inner.info.write();
        info.connected = true;
        info.state = handshake.finish();
        info.clone()
    };

    if let Step::Break(_) = inner
        .pipeline
        .on_connection
        .run(ConnectionContext::Client(info.clone()))
        .await
    {
        return Err(ProtocolError::HandshakeError(
            "connection rejected by middleware".into(),
        ));
    }

    let namespaces = info
        .namespaces
        .iter()
        .map(|(name, methods)| (name.clone(), NamespaceState::new(methods.clone())))
        .collect();
    *inner.namespaces.write() = namespaces;

    info!(
        server = %info.name,
        state = ?info.state,
        namespaces = info.namespaces.len(),
        "Connected"
    );
    Ok(())
}
