//! # Transport Layer
//!
//! The contract the RPC engines consume, plus two adapters.
//!
//! A transport hands the engine a [`Connection`]: a [`Socket`] for sending and
//! an ordered stream of [`SocketEvent`]s for everything that happens on it
//! (connect, inbound frames, disconnect). Frames travel on a logical
//! [`Channel`]: requests on [`Channel::Request`], each response on the
//! one-shot channel named by its packet id.
//!
//! ## Adapters
//! - **memory**: in-process pairs, used by tests and embedders
//! - **tcp**: tokio TCP with length-prefixed frames

pub mod memory;
pub mod tcp;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::CHANNEL_REQUEST;

/// Logical channel a frame travels on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Client to server requests
    Request,
    /// Response to the request with this packet id
    Reply(String),
}

impl Channel {
    pub fn name(&self) -> &str {
        match self {
            Channel::Request => CHANNEL_REQUEST,
            Channel::Reply(id) => id,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Something that happened on a connection
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Connected,
    Frame { channel: Channel, payload: Bytes },
    Disconnected,
}

/// Sending half of a connection
pub trait Socket: Send + Sync + fmt::Debug {
    /// Stable id of this connection, identical on both ends
    fn id(&self) -> &str;

    /// Queue a frame for the peer
    fn emit(&self, channel: Channel, payload: Bytes) -> Result<()>;

    /// Close the connection; both ends observe `Disconnected`
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// One end of an established connection
pub struct Connection {
    pub socket: Arc<dyn Socket>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

impl Connection {
    pub fn id(&self) -> &str {
        self.socket.id()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

/// Source of inbound connections for a server
pub trait SocketListener: Send {
    /// Next connection, `None` once the listener is exhausted
    fn accept(&mut self) -> BoxFuture<'_, Option<Connection>>;
}
