//! TCP transport.
//!
//! Each frame on the wire is a big-endian `u32` length followed by a
//! bincode-encoded [`WireFrame`]. Every connection runs a reader task that
//! feeds the event stream and a writer task fed by [`TcpSocket::emit`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ProtocolError, Result};
use crate::transport::{Channel, Connection, Socket, SocketEvent, SocketListener};

/// Largest accepted frame body (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// One frame as it travels over TCP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFrame {
    pub channel: Channel,
    pub payload: Vec<u8>,
}

/// Length-prefixed bincode framing for [`WireFrame`]
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame: MAX_FRAME_SIZE,
        }
    }
}

impl FrameCodec {
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Decoder for FrameCodec {
    type Item = WireFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireFrame>> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame {
            return Err(ProtocolError::TransportError(format!(
                "frame of {len} bytes exceeds limit of {}",
                self.max_frame
            )));
        }

        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let body = src.split_to(len);
        Ok(Some(bincode::deserialize(&body)?))
    }
}

impl Encoder<WireFrame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: WireFrame, dst: &mut BytesMut) -> Result<()> {
        let body = bincode::serialize(&item)?;
        if body.len() > self.max_frame {
            return Err(ProtocolError::TransportError(format!(
                "frame of {} bytes exceeds limit of {}",
                body.len(),
                self.max_frame
            )));
        }
        dst.reserve(LEN_PREFIX + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

enum Outbound {
    Frame(WireFrame),
    Close,
}

pub struct TcpSocket {
    id: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
    shutdown: Arc<Notify>,
}

impl fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpSocket")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Socket for TcpSocket {
    fn id(&self) -> &str {
        &self.id
    }

    fn emit(&self, channel: Channel, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.outbound
            .send(Outbound::Frame(WireFrame {
                channel,
                payload: payload.to_vec(),
            }))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.outbound.send(Outbound::Close);
            self.shutdown.notify_one();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Wrap an established stream; spawns the reader and writer tasks
pub fn spawn_connection(stream: TcpStream, id: String) -> Connection {
    let (mut sink, mut frames) = Framed::new(stream, FrameCodec::default()).split();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let shutdown = Arc::new(Notify::new());

    let _ = event_tx.send(SocketEvent::Connected);

    let writer_id = id.clone();
    tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            match out {
                Outbound::Frame(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        warn!(id = %writer_id, error = %e, "Write failed, dropping connection");
                        break;
                    }
                }
                Outbound::Close => break,
            }
        }
        let _ = sink.close().await;
    });

    let reader_id = id.clone();
    let reader_shutdown = Arc::clone(&shutdown);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = reader_shutdown.notified() => break,
                next = frames.next() => match next {
                    Some(Ok(frame)) => {
                        let event = SocketEvent::Frame {
                            channel: frame.channel,
                            payload: Bytes::from(frame.payload),
                        };
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(id = %reader_id, error = %e, "Malformed frame, dropping connection");
                        break;
                    }
                    None => break,
                }
            }
        }
        debug!(id = %reader_id, "Connection reader finished");
        let _ = event_tx.send(SocketEvent::Disconnected);
    });

    Connection {
        socket: Arc::new(TcpSocket {
            id,
            outbound: out_tx,
            closed: AtomicBool::new(false),
            shutdown,
        }),
        events: event_rx,
    }
}

/// Open a client connection
#[instrument]
pub async fn connect(addr: &str) -> Result<Connection> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let local = stream.local_addr()?;
    let peer = stream.peer_addr()?;
    info!(%local, %peer, "Connected");
    Ok(spawn_connection(stream, connection_id(local, peer)))
}

/// Both ends see the same id: client address, then server address
fn connection_id(client: SocketAddr, server: SocketAddr) -> String {
    format!("tcp-{client}-{server}")
}

/// Accepting side of the TCP transport
pub struct TcpSocketListener {
    listener: TcpListener,
    accepted: AtomicU64,
}

impl TcpSocketListener {
    #[instrument]
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(address = %listener.local_addr()?, "Listening");
        Ok(Self {
            listener,
            accepted: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

impl SocketListener for TcpSocketListener {
    fn accept(&mut self) -> BoxFuture<'_, Option<Connection>> {
        Box::pin(async move {
            loop {
                match self.listener.accept().await {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let local = match stream.local_addr() {
                            Ok(addr) => addr,
                            Err(e) => {
                                error!(error = %e, "Accepted stream has no local address");
                                continue;
                            }
                        };
                        self.accepted.fetch_add(1, Ordering::Relaxed);
                        return Some(spawn_connection(stream, connection_id(peer, local)));
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_handles_partial_frames() {
        let mut codec = FrameCodec::default();
        let frame = WireFrame {
            channel: Channel::Reply("abc".into()),
            payload: vec![1, 2, 3],
        };
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(frame));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_codec_rejects_oversized_frames() {
        let mut codec = FrameCodec::with_max_frame(8);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_tcp_frames_cross() {
        let mut listener = TcpSocketListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (client, server) = tokio::join!(connect(&addr), listener.accept());
        let mut client = client.unwrap();
        let mut server = server.unwrap();
        assert_eq!(client.id(), server.id());

        assert_eq!(server.events.recv().await, Some(SocketEvent::Connected));
        assert_eq!(client.events.recv().await, Some(SocketEvent::Connected));

        client
            .socket
            .emit(Channel::Request, Bytes::from_static(b"ping"))
            .unwrap();
        assert_eq!(
            server.events.recv().await,
            Some(SocketEvent::Frame {
                channel: Channel::Request,
                payload: Bytes::from_static(b"ping"),
            })
        );

        client.socket.close();
        assert_eq!(server.events.recv().await, Some(SocketEvent::Disconnected));
    }
}
