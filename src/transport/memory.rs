//! In-process transport.
//!
//! [`pair`] links two connections directly; [`listener`] gives a
//! [`MemoryConnector`] / [`MemoryListener`] couple so a server can accept
//! memory connections the same way it accepts TCP ones.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{constants, ProtocolError, Result};
use crate::transport::{Channel, Connection, Socket, SocketEvent, SocketListener};

/// Shared state of both ends; `None` once closed
struct Link {
    senders: Mutex<Option<[mpsc::UnboundedSender<SocketEvent>; 2]>>,
}

pub struct MemorySocket {
    id: String,
    side: usize,
    link: Arc<Link>,
}

impl fmt::Debug for MemorySocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySocket")
            .field("id", &self.id)
            .field("side", &self.side)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Socket for MemorySocket {
    fn id(&self) -> &str {
        &self.id
    }

    fn emit(&self, channel: Channel, payload: Bytes) -> Result<()> {
        let senders = self.link.senders.lock();
        let senders = senders.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        senders[1 - self.side]
            .send(SocketEvent::Frame { channel, payload })
            .map_err(|_| ProtocolError::TransportError(constants::ERR_TRANSPORT_GONE.to_string()))
    }

    fn close(&self) {
        if let Some(senders) = self.link.senders.lock().take() {
            debug!(id = %self.id, "Closing memory connection");
            for sender in senders {
                let _ = sender.send(SocketEvent::Disconnected);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.link.senders.lock().is_none()
    }
}

/// Two connected ends: `(client, server)`. Both start with `Connected` queued.
pub fn pair(id: impl Into<String>) -> (Connection, Connection) {
    let id = id.into();
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (server_tx, server_rx) = mpsc::unbounded_channel();
    let _ = client_tx.send(SocketEvent::Connected);
    let _ = server_tx.send(SocketEvent::Connected);

    let link = Arc::new(Link {
        senders: Mutex::new(Some([client_tx, server_tx])),
    });

    let client = Connection {
        socket: Arc::new(MemorySocket {
            id: id.clone(),
            side: 0,
            link: Arc::clone(&link),
        }),
        events: client_rx,
    };
    let server = Connection {
        socket: Arc::new(MemorySocket { id, side: 1, link }),
        events: server_rx,
    };
    (client, server)
}

/// Client-side factory for memory connections
#[derive(Clone)]
pub struct MemoryConnector {
    tx: mpsc::UnboundedSender<Connection>,
    next_id: Arc<AtomicU64>,
}

impl MemoryConnector {
    /// Open a connection; the server end is handed to the listener
    pub fn connect(&self) -> Result<Connection> {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (client, server) = pair(format!("mem-{n}"));
        self.tx
            .send(server)
            .map_err(|_| ProtocolError::TransportError("memory listener dropped".into()))?;
        Ok(client)
    }
}

/// Server-side end of [`listener`]
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<Connection>,
}

impl SocketListener for MemoryListener {
    fn accept(&mut self) -> BoxFuture<'_, Option<Connection>> {
        Box::pin(self.rx.recv())
    }
}

pub fn listener() -> (MemoryConnector, MemoryListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        },
        MemoryListener { rx },
    )
}
