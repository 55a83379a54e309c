//! # RPC Server
//!
//! Accepts connections from a [`SocketListener`], keeps one [`ClientRecord`]
//! per connection, and dispatches each inbound request to the method registry.
//!
//! ## Dispatch
//! Frames of one connection are handled one at a time, in arrival order:
//!
//! ```text
//! frame -> [decipher] -> decode -> stamp clientId -> ON_RECEIVE
//!       -> handler | "no handler" (3) | handler error (4) | bad argument (6)
//!       -> encode -> [cipher] -> emit on Reply(id) -> AFTER_RECEIVE_CALLBACK
//! ```
//!
//! The response is sealed with the key that was active when the request
//! arrived, so a handshake step that installs a new key still answers under
//! the old one.
//!
//! Handshake verification failures never produce a response: the connection
//! is closed instead. The same goes for any non-handshake request reaching a
//! crypto server before the connection is secured.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::core::codec::{FormatCodec, PacketCodec};
use crate::core::packet::Packet;
use crate::core::value::Value;
use crate::error::{constants, ErrorCode, HandlerError, ProtocolError, Result};
use crate::protocol::formatter::ArgSchema;
use crate::protocol::handshake::{ServerHandshake, ServerHello};
use crate::protocol::middleware::{
    AsyncMiddleware, ConnectionContext, Middleware, MiddlewareInstaller, Pipeline,
    ReceiveContext, Registration, Step,
};
use crate::protocol::registry::{
    async_handler, handler_fn, CallContext, Handler, MethodRegistry,
};
use crate::protocol::{
    is_handshake_event, namespaced, HANDSHAKE_CONFIRM, HANDSHAKE_FINISH, HANDSHAKE_GENERATE_KEY, HANDSHAKE_INIT,
    META_CLIENT_ID,
};
use crate::service::secure::Envelope;
use crate::transport::{Channel, Connection, Socket, SocketEvent, SocketListener};
use crate::utils::crypto::{SessionCipher, SessionKey};
use crate::utils::metrics::{Metrics, Timer};
use crate::utils::timeout::with_timeout_error;

/// Identity the server advertises during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub address: String,
    pub namespaces: BTreeMap<String, Vec<String>>,
    pub use_crypto: bool,
}

/// Server-side state of one connected peer
pub struct ClientRecord {
    id: String,
    socket: Arc<dyn Socket>,
    crypto: Mutex<ServerHandshake>,
    cipher: RwLock<Option<Arc<SessionCipher>>>,
}

impl ClientRecord {
    fn new(id: String, socket: Arc<dyn Socket>) -> Self {
        Self {
            id,
            socket,
            crypto: Mutex::new(ServerHandshake::new()),
            cipher: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether `HANDSHAKE_FINISH` completed with encryption
    pub fn is_encrypted(&self) -> bool {
        self.crypto.lock().is_encrypted()
    }

    fn cipher_snapshot(&self) -> Option<Arc<SessionCipher>> {
        self.cipher.read().clone()
    }

    fn install_key(&self, key: &SessionKey) {
        *self.cipher.write() = Some(Arc::new(SessionCipher::new(key)));
    }
}

impl std::fmt::Debug for ClientRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRecord")
            .field("id", &self.id)
            .field("encrypted", &self.is_encrypted())
            .finish_non_exhaustive()
    }
}

struct ServerInner {
    config: ServerConfig,
    codec: Arc<dyn PacketCodec>,
    registry: MethodRegistry,
    namespaces: RwLock<BTreeMap<String, Vec<String>>>,
    clients: RwLock<HashMap<String, Arc<ClientRecord>>>,
    pipeline: Pipeline,
    metrics: Arc<Metrics>,
}

impl ServerInner {
    fn client(&self, id: &str) -> Option<Arc<ClientRecord>> {
        self.clients.read().get(id).cloned()
    }
}

/// RPC server
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("name", &self.inner.config.name)
            .field("clients", &self.inner.clients.read().len())
            .finish_non_exhaustive()
    }
}

impl RpcServer {
    /// Create a server with the handshake events registered
    pub fn new(config: ServerConfig) -> Result<Self> {
        let codec = Arc::new(FormatCodec::new(config.serialization));
        Self::with_codec(config, codec)
    }

    pub fn with_codec(config: ServerConfig, codec: Arc<dyn PacketCodec>) -> Result<Self> {
        let server = Self {
            inner: Arc::new(ServerInner {
                config,
                codec,
                registry: MethodRegistry::new(),
                namespaces: RwLock::new(BTreeMap::new()),
                clients: RwLock::new(HashMap::new()),
                pipeline: Pipeline::new(),
                metrics: Arc::new(Metrics::new()),
            }),
        };
        server.register_handshake()?;
        Ok(server)
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            name: self.inner.config.name.clone(),
            address: self.inner.config.address.clone(),
            namespaces: self.inner.namespaces.read().clone(),
            use_crypto: self.inner.config.use_crypto,
        }
    }

    /// Ids of the currently connected clients, sorted
    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.clients.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn client(&self, id: &str) -> Option<Arc<ClientRecord>> {
        self.inner.client(id)
    }

    /// Registered event names, handshake events included
    pub fn registered_events(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn use_fn<F>(&self, install: F) -> Result<()>
    where
        F: FnOnce(&RpcServer) -> Result<()> + Send + 'static,
    {
        MiddlewareInstaller::function(install).apply(self)
    }

    pub fn use_middleware<M>(&self, middleware: M) -> Result<()>
    where
        M: Middleware<RpcServer> + 'static,
    {
        MiddlewareInstaller::installable(middleware).apply(self)
    }

    pub fn use_installer(&self, installer: MiddlewareInstaller<RpcServer>) -> Result<()> {
        installer.apply(self)
    }

    pub async fn use_async<M>(&self, middleware: M) -> Result<()>
    where
        M: AsyncMiddleware<RpcServer> + 'static,
    {
        Box::new(middleware).install(self).await
    }

    /// Register a method body.
    ///
    /// Runs ON_REGISTER first; returns `Ok(false)` if middleware skipped the
    /// registration.
    ///
    /// # Errors
    /// `DuplicateRegistration` if the (possibly rewritten) name is taken.
    pub async fn register_handler(
        &self,
        event_name: &str,
        schema: Option<ArgSchema>,
        handler: Handler,
    ) -> Result<bool> {
        self.register_entry(event_name, schema, handler)
            .await
            .map(|registered| registered.is_some())
    }

    /// Register through ON_REGISTER, returning the event name actually stored
    async fn register_entry(
        &self,
        event_name: &str,
        schema: Option<ArgSchema>,
        handler: Handler,
    ) -> Result<Option<String>> {
        let registration = Registration {
            event_name: event_name.to_string(),
            schema,
            handler,
        };

        let registration = match self.inner.pipeline.on_register.run(registration).await {
            Step::Continue(registration) => registration,
            Step::Break(_) => {
                debug!(event = event_name, "Registration skipped by middleware");
                return Ok(None);
            }
        };

        self.inner.registry.insert(
            &registration.event_name,
            registration.schema,
            registration.handler,
        )?;
        debug!(event = %registration.event_name, "Registered");
        Ok(Some(registration.event_name))
    }

    /// Register a synchronous method
    pub async fn register<F>(
        &self,
        event_name: &str,
        schema: Option<ArgSchema>,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(CallContext, Vec<Value>) -> std::result::Result<Value, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.register_handler(event_name, schema, handler_fn(handler))
            .await
            .map(|_| ())
    }

    /// Register an asynchronous method
    pub async fn register_async<F, Fut>(
        &self,
        event_name: &str,
        schema: Option<ArgSchema>,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
    {
        self.register_handler(event_name, schema, async_handler(handler))
            .await
            .map(|_| ())
    }

    /// Reserve namespace `name` and return its registrar.
    ///
    /// # Errors
    /// `NamespaceAlreadyRegistered` if `name` was reserved before.
    pub fn register_namespace(&self, name: &str) -> Result<NamespaceRegistrar> {
        let mut namespaces = self.inner.namespaces.write();
        if namespaces.contains_key(name) {
            return Err(ProtocolError::NamespaceAlreadyRegistered(name.to_string()));
        }
        namespaces.insert(name.to_string(), Vec::new());
        Ok(NamespaceRegistrar {
            server: self.clone(),
            name: name.to_string(),
        })
    }

    /// Accept connections until the listener is exhausted
    pub async fn serve<L: SocketListener>(&self, mut listener: L) -> Result<()> {
        while let Some(connection) = listener.accept().await {
            self.spawn_connection(connection);
        }
        info!("Listener exhausted, no longer accepting connections");
        Ok(())
    }

    /// Accept connections until `shutdown` fires, then close every client and
    /// wait for them to finish (bounded by the shutdown timeout)
    #[instrument(skip(self, listener, shutdown), fields(server = %self.inner.config.name))]
    pub async fn serve_with_shutdown<L: SocketListener>(
        &self,
        mut listener: L,
        mut shutdown: mpsc::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutting down server. Closing client connections...");
                    self.shutdown().await;
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Some(connection) => self.spawn_connection(connection),
                    None => {
                        info!("Listener exhausted, no longer accepting connections");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Serve until CTRL+C
    pub async fn serve_until_ctrl_c<L: SocketListener>(&self, listener: L) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received CTRL+C signal, shutting down");
                let _ = shutdown_tx.send(()).await;
            }
        });
        self.serve_with_shutdown(listener, shutdown_rx).await
    }

    async fn shutdown(&self) {
        let sockets: Vec<Arc<dyn Socket>> = self
            .inner
            .clients
            .read()
            .values()
            .map(|c| Arc::clone(&c.socket))
            .collect();
        for socket in sockets {
            socket.close();
        }

        let drained = async {
            loop {
                let connections = self.inner.clients.read().len();
                if connections == 0 {
                    return Ok(());
                }
                debug!(connections, "Waiting for connections to close");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        let timeout = self.inner.config.shutdown_timeout;
        match with_timeout_error(drained, timeout, || {
            ProtocolError::Custom(format!("connections still open after {timeout:?}"))
        })
        .await
        {
            Ok(()) => info!("All connections closed, shutting down"),
            Err(e) => warn!(error = %e, "Shutdown timeout reached, forcing exit"),
        }
        self.inner.metrics.log_summary();
    }

    fn spawn_connection(&self, connection: Connection) {
        let server = self.clone();
        tokio::spawn(async move { server.handle_connection(connection).await });
    }

    /// Run one connection to completion: register the client, process its
    /// frames in order, clean up on disconnect.
    #[instrument(skip(self, connection), fields(client_id = %connection.id()))]
    pub async fn handle_connection(&self, connection: Connection) {
        let Connection { socket, mut events } = connection;
        let client_id = socket.id().to_string();
        info!("Client tries to connect");

        let record = Arc::new(ClientRecord::new(client_id.clone(), Arc::clone(&socket)));
        {
            let mut clients = self.inner.clients.write();
            if clients.contains_key(&client_id) {
                warn!("Connection id already in use, rejecting");
                socket.close();
                return;
            }
            clients.insert(client_id.clone(), Arc::clone(&record));
        }
        self.inner.metrics.connection_established();

        let admitted = self
            .inner
            .pipeline
            .on_connection
            .run(ConnectionContext::Server {
                client_id: client_id.clone(),
            })
            .await;

        if admitted.is_break() {
            info!("Connection rejected by middleware");
            socket.close();
        } else {
            while let Some(event) = events.recv().await {
                match event {
                    SocketEvent::Frame {
                        channel: Channel::Request,
                        payload,
                    } => {
                        if let Err(e) = self.dispatch(&record, payload).await {
                            warn!(error = %e, "Closing connection");
                            socket.close();
                            break;
                        }
                    }
                    SocketEvent::Frame { channel, .. } => {
                        debug!(%channel, "Ignoring frame on reply channel");
                    }
                    SocketEvent::Connected => {}
                    SocketEvent::Disconnected => break,
                }
            }
        }

        self.inner.clients.write().remove(&client_id);
        self.inner.metrics.connection_closed();
        info!("Client disconnected");

        let _ = self
            .inner
            .pipeline
            .on_disconnection
            .run(ConnectionContext::Server { client_id })
            .await;
    }

    /// Handle one request frame. An `Err` means the connection must close.
    async fn dispatch(&self, record: &ClientRecord, payload: Bytes) -> Result<()> {
        let _timer = Timer::start("dispatch");
        // Key active at receipt seals the response too
        let envelope = Envelope::new(Arc::clone(&self.inner.codec), record.cipher_snapshot());

        let mut request = match envelope.open(&payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                return Ok(());
            }
        };
        let event = request.event_name().unwrap_or_default();
        if self.inner.config.use_crypto && !is_handshake_event(event) && !record.is_encrypted() {
            self.inner.metrics.handshake_failed();
            warn!(event = %event, packet_id = %request.id, "Request on an unsecured connection");
            return Err(ProtocolError::HandshakeError(
                constants::ERR_NOT_SECURED.to_string(),
            ));
        }
        request.add_meta(META_CLIENT_ID, record.id.as_str());

        let request_id = request.id.clone();
        let ctx = ReceiveContext {
            client_id: record.id.clone(),
            response: Packet::respond_to(&request_id),
            request,
        };

        let response = match self.inner.pipeline.on_receive.run(ctx).await {
            Step::Break(response) => {
                debug!(packet_id = %request_id, "Request answered by middleware");
                response.unwrap_or_else(|| Packet::respond_to(&request_id))
            }
            Step::Continue(ctx) => self.invoke(ctx).await?,
        };

        let bytes = envelope.seal(&response)?;
        self.inner
            .metrics
            .request_dispatched(payload.len() as u64, bytes.len() as u64);
        record
            .socket
            .emit(Channel::Reply(response.id.clone()), bytes)?;

        let _ = self
            .inner
            .pipeline
            .after_receive_callback
            .run(response)
            .await;
        Ok(())
    }

    /// Run the registered handler, turning every failure except a fatal
    /// handshake error into an error response
    async fn invoke(&self, ctx: ReceiveContext) -> Result<Packet> {
        let ReceiveContext {
            client_id,
            request,
            mut response,
        } = ctx;
        let event = request.event_name().unwrap_or_default().to_string();

        let Some(handler) = self.inner.registry.get(&event)? else {
            self.inner.metrics.handler_error();
            debug!(event = %event, "No handler registered");
            response.set_error(
                ErrorCode::RespondNoEventHandler,
                format!("no handler registered for '{event}'"),
            );
            return Ok(response);
        };

        let call = CallContext {
            client_id,
            event_name: event.clone(),
            meta: request.meta,
        };
        let args = request.data;
        let outcome = AssertUnwindSafe(async move { handler(call, args).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => response.set_result(value),
            Ok(Err(err)) => match err.downcast::<ProtocolError>() {
                Ok(err) if err.is_fatal() => return Err(*err),
                Ok(err) => {
                    self.inner.metrics.handler_error();
                    let code = match *err {
                        ProtocolError::InvalidArgument { .. } => ErrorCode::InvalidArgument,
                        _ => ErrorCode::UnknownError,
                    };
                    debug!(event = %event, error = %err, "Handler failed");
                    response.set_error(code, err.to_string());
                }
                Err(err) => {
                    self.inner.metrics.handler_error();
                    debug!(event = %event, error = %err, "Handler failed");
                    response.set_error(ErrorCode::UnknownError, err.to_string());
                }
            },
            Err(panic) => {
                self.inner.metrics.handler_error();
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                error!(event = %event, %message, "Handler panicked");
                response.set_error(ErrorCode::UnknownError, message);
            }
        }
        Ok(response)
    }

    fn register_handshake(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        self.inner.registry.insert(
            HANDSHAKE_INIT,
            None,
            handshake_step(weak.clone(), handshake_init),
        )?;
        self.inner.registry.insert(
            HANDSHAKE_CONFIRM,
            None,
            handshake_step(weak.clone(), handshake_confirm),
        )?;
        self.inner.registry.insert(
            HANDSHAKE_GENERATE_KEY,
            None,
            handshake_step(weak.clone(), handshake_generate_key),
        )?;
        self.inner
            .registry
            .insert(HANDSHAKE_FINISH, None, handshake_step(weak, handshake_finish))
    }
}

type StepFn = fn(&ServerInner, &ClientRecord, &[Value]) -> Result<Value>;

/// Bind a handshake step to the calling connection's record
fn handshake_step(server: Weak<ServerInner>, step: StepFn) -> Handler {
    handler_fn(move |ctx, args| {
        let inner = server.upgrade().ok_or(ProtocolError::ConnectionClosed)?;
        let record = inner.client(&ctx.client_id).ok_or_else(|| {
            ProtocolError::HandshakeError(constants::ERR_UNKNOWN_CLIENT.to_string())
        })?;
        Ok(step(&inner, &record, &args)?)
    })
}

fn bytes_arg<'a>(args: &'a [Value], index: usize) -> Result<&'a [u8]> {
    args.get(index)
        .and_then(Value::as_bytes)
        .ok_or_else(|| ProtocolError::HandshakeError(constants::ERR_MALFORMED_REPLY.to_string()))
}

fn handshake_init(inner: &ServerInner, record: &ClientRecord, args: &[Value]) -> Result<Value> {
    inner.metrics.handshake_attempt();
    let client_key = args.first().and_then(Value::as_bytes).unwrap_or_default();
    let public_key = record
        .crypto
        .lock()
        .init(inner.config.use_crypto, client_key)
        .inspect_err(|_| inner.metrics.handshake_failed())?;

    info!(client_id = %record.id, use_crypto = inner.config.use_crypto, "Handshake started");
    let hello = ServerHello {
        name: inner.config.name.clone(),
        address: inner.config.address.clone(),
        namespaces: inner.namespaces.read().clone(),
        use_crypto: inner.config.use_crypto,
        public_key,
    };
    Ok(hello.to_value())
}

fn handshake_confirm(inner: &ServerInner, record: &ClientRecord, args: &[Value]) -> Result<Value> {
    let hash = bytes_arg(args, 0)?;
    let signature = bytes_arg(args, 1)?;
    let (reply, intermediate) = record
        .crypto
        .lock()
        .confirm(hash, signature)
        .inspect_err(|_| inner.metrics.handshake_failed())?;
    record.install_key(&intermediate);
    debug!(client_id = %record.id, "Intermediate key installed");
    Ok(reply)
}

fn handshake_generate_key(
    inner: &ServerInner,
    record: &ClientRecord,
    args: &[Value],
) -> Result<Value> {
    let nonce = bytes_arg(args, 0)?;
    let (secret, session) = record
        .crypto
        .lock()
        .generate_key(&record.id, nonce)
        .inspect_err(|_| inner.metrics.handshake_failed())?;
    record.install_key(&session);
    debug!(client_id = %record.id, "Session key installed");
    Ok(Value::Bytes(secret))
}

fn handshake_finish(inner: &ServerInner, record: &ClientRecord, _args: &[Value]) -> Result<Value> {
    let encrypted = record
        .crypto
        .lock()
        .finish(inner.config.use_crypto)
        .inspect_err(|_| inner.metrics.handshake_failed())?;
    inner.metrics.handshake_success();
    if encrypted {
        info!(client_id = %record.id, "Secured connection established");
    } else {
        info!(client_id = %record.id, "Plaintext connection established");
    }
    Ok(Value::Bool(true))
}

/// Registers methods under one namespace
#[derive(Debug, Clone)]
pub struct NamespaceRegistrar {
    server: RpcServer,
    name: String,
}

impl NamespaceRegistrar {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `method` as `name::method` and advertise it.
    ///
    /// The advertised method is the one ON_REGISTER settled on; a rename that
    /// leaves the namespace registers the event without advertising it here.
    pub async fn register_handler(
        &self,
        method: &str,
        schema: Option<ArgSchema>,
        handler: Handler,
    ) -> Result<()> {
        let Some(event) = self
            .server
            .register_entry(&namespaced(&self.name, method), schema, handler)
            .await?
        else {
            return Ok(());
        };

        let prefix = namespaced(&self.name, "");
        match event.strip_prefix(&prefix).filter(|m| !m.is_empty()) {
            Some(registered) => self
                .server
                .inner
                .namespaces
                .write()
                .entry(self.name.clone())
                .or_default()
                .push(registered.to_string()),
            None => warn!(
                namespace = %self.name,
                event = %event,
                "Registration renamed out of its namespace, not advertised"
            ),
        }
        Ok(())
    }

    pub async fn register<F>(&self, method: &str, schema: Option<ArgSchema>, handler: F) -> Result<()>
    where
        F: Fn(CallContext, Vec<Value>) -> std::result::Result<Value, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.register_handler(method, schema, handler_fn(handler))
            .await
    }

    pub async fn register_async<F, Fut>(
        &self,
        method: &str,
        schema: Option<ArgSchema>,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
    {
        self.register_handler(method, schema, async_handler(handler))
            .await
    }
}
