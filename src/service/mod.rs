//! # Service Layer
//!
//! The two engines built on top of the protocol layer.
//!
//! - **Client**: fires requests, correlates responses by packet id, drives
//!   the handshake and exposes namespace proxies
//! - **Server**: owns the method registry, answers the handshake and
//!   dispatches every inbound request in arrival order per connection
//! - **Secure**: the encode/encrypt envelope both engines seal frames with

pub mod client;
pub mod namespace;
pub mod secure;
pub mod server;

pub use client::{FireOptions, RpcClient};
pub use namespace::{MethodCall, NamespaceProxy};
pub use server::{NamespaceRegistrar, RpcServer, ServerInfo};
