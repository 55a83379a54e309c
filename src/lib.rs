//! # uni-rpc
//!
//! A transport-agnostic RPC engine. A client fires named requests carrying
//! positional arguments and awaits correlated responses; a server keeps a
//! registry of named, optionally namespaced methods and answers them.
//!
//! The engine never touches a socket directly. Anything that can move
//! opaque frames on two logical channels (requests, and one reply channel
//! per packet id) can carry it; see [`transport::Socket`]. An in-memory
//! transport and a length-prefixed TCP transport ship with the crate.
//!
//! ## Layers
//! ```text
//! service    RpcClient / RpcServer / namespace proxies / envelope
//! protocol   handshake, middleware pipeline, registry, formatters
//! core       Value, Packet, serialization, PacketCodec
//! transport  Socket trait, memory pairs, TCP framing
//! ```
//!
//! ## Example
//! ```rust,no_run
//! use uni_rpc::config::{ClientConfig, ServerConfig};
//! use uni_rpc::core::value::Value;
//! use uni_rpc::service::{RpcClient, RpcServer};
//! use uni_rpc::transport::memory;
//!
//! # async fn run() -> uni_rpc::error::Result<()> {
//! let server = RpcServer::new(ServerConfig::default())?;
//! server
//!     .register_namespace("math")?
//!     .register("add", None, |_, args| {
//!         let a = args.first().and_then(Value::as_i64).unwrap_or(0);
//!         let b = args.get(1).and_then(Value::as_i64).unwrap_or(0);
//!         Ok(Value::Int(a + b))
//!     })
//!     .await?;
//!
//! let (client_end, server_end) = memory::pair("demo");
//! tokio::spawn({
//!     let server = server.clone();
//!     async move { server.handle_connection(server_end).await }
//! });
//!
//! let client = RpcClient::connect(client_end, ClientConfig::default())?;
//! client.ready().await?;
//! let sum = client.fire("math::add", vec![2.into(), 3.into()]).await?;
//! assert_eq!(sum, Value::Int(5));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::core::packet::Packet;
pub use crate::core::value::Value;
pub use crate::error::{ErrorCode, ProtocolError, Result};
pub use crate::service::{RpcClient, RpcServer};
