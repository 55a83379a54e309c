//! # Middleware Pipeline
//!
//! Seven hook points, each an ordered chain of asynchronous units. A unit
//! receives the hook's context by value and returns a [`Step`]: either the
//! (possibly rewritten) context for the next unit, or a break that stops the
//! chain and skips the default action.
//!
//! | Hook                     | Context             | Break payload        |
//! |--------------------------|---------------------|----------------------|
//! | `before_fire`            | outgoing `Packet`   | value `fire` returns |
//! | `after_fire`             | resolved `Value`    | replacement value    |
//! | `on_receive`             | [`ReceiveContext`]  | response to send     |
//! | `after_receive_callback` | final response      | (observer)           |
//! | `on_register`            | [`Registration`]    | skips registration   |
//! | `on_connection`          | [`ConnectionContext`] | closes connection  |
//! | `on_disconnection`       | [`ConnectionContext`] | (observer)         |
//!
//! Units run strictly in registration order; a unit never starts before the
//! previous one's future has completed.
//!
//! ## Installing
//! ```rust
//! use uni_rpc::protocol::middleware::{MiddlewareInstaller, Pipeline, Step};
//!
//! struct Engine { pipeline: Pipeline }
//!
//! let engine = Engine { pipeline: Pipeline::new() };
//! let tracing_mw = MiddlewareInstaller::function(|e: &Engine| {
//!     e.pipeline.before_fire.add_sync(|packet| Step::Continue(packet));
//!     Ok(())
//! });
//! tracing_mw.apply(&engine).unwrap();
//! assert_eq!(engine.pipeline.before_fire.len(), 1);
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::core::packet::Packet;
use crate::core::value::Value;
use crate::error::Result;
use crate::protocol::formatter::ArgSchema;
use crate::protocol::handshake::ConnectionInfo;
use crate::protocol::registry::Handler;

/// Outcome of one middleware unit
#[derive(Debug)]
pub enum Step<C, R> {
    /// Hand the context to the next unit
    Continue(C),
    /// Stop the chain, optionally supplying a replacement result
    Break(Option<R>),
}

impl<C, R> Step<C, R> {
    pub fn is_break(&self) -> bool {
        matches!(self, Step::Break(_))
    }
}

/// A single middleware unit
pub type Unit<C, R> = Arc<dyn Fn(C) -> BoxFuture<'static, Step<C, R>> + Send + Sync>;

/// Ordered units for one hook
pub struct Chain<C, R> {
    units: RwLock<Vec<Unit<C, R>>>,
}

impl<C, R> Default for Chain<C, R> {
    fn default() -> Self {
        Self {
            units: RwLock::new(Vec::new()),
        }
    }
}

impl<C, R> fmt::Debug for Chain<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain").field("units", &self.units.read().len()).finish()
    }
}

impl<C, R> Chain<C, R>
where
    C: Send + 'static,
    R: Send + 'static,
{
    /// Append an asynchronous unit
    pub fn add<F, Fut>(&self, unit: F)
    where
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Step<C, R>> + Send + 'static,
    {
        self.units
            .write()
            .push(Arc::new(move |ctx| -> BoxFuture<'static, Step<C, R>> {
                Box::pin(unit(ctx))
            }));
    }

    /// Append a unit that never suspends
    pub fn add_sync<F>(&self, unit: F)
    where
        F: Fn(C) -> Step<C, R> + Send + Sync + 'static,
    {
        self.add(move |ctx| std::future::ready(unit(ctx)));
    }

    pub fn len(&self) -> usize {
        self.units.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.read().is_empty()
    }

    /// Run every unit in order, stopping at the first break
    pub async fn run(&self, ctx: C) -> Step<C, R> {
        // Snapshot so units can install further middleware without deadlocking
        let units: Vec<Unit<C, R>> = self.units.read().clone();
        let mut ctx = ctx;
        for unit in units {
            match unit(ctx).await {
                Step::Continue(next) => ctx = next,
                brk @ Step::Break(_) => return brk,
            }
        }
        Step::Continue(ctx)
    }
}

/// Context of the server's ON_RECEIVE hook
#[derive(Debug, Clone)]
pub struct ReceiveContext {
    pub client_id: String,
    /// Decoded request, `clientId` already stamped into its meta
    pub request: Packet,
    /// Response pre-populated with the request id
    pub response: Packet,
}

/// Context of the ON_REGISTER hook
#[derive(Clone)]
pub struct Registration {
    pub event_name: String,
    pub schema: Option<ArgSchema>,
    pub handler: Handler,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("event_name", &self.event_name)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Context of the connection lifecycle hooks
#[derive(Debug, Clone)]
pub enum ConnectionContext {
    /// Server side: the peer's connection id
    Server { client_id: String },
    /// Client side: the connection info as negotiated
    Client(ConnectionInfo),
}

/// The seven hook chains
#[derive(Debug, Default)]
pub struct Pipeline {
    pub before_fire: Chain<Packet, Value>,
    pub after_fire: Chain<Value, Value>,
    pub on_receive: Chain<ReceiveContext, Packet>,
    pub after_receive_callback: Chain<Packet, ()>,
    pub on_register: Chain<Registration, ()>,
    pub on_connection: Chain<ConnectionContext, ()>,
    pub on_disconnection: Chain<ConnectionContext, ()>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Middleware packaged as an object with a synchronous install step
pub trait Middleware<E>: Send {
    fn install(self: Box<Self>, engine: &E) -> Result<()>;
}

/// Middleware whose install step may suspend
pub trait AsyncMiddleware<E>: Send {
    fn install<'a>(self: Box<Self>, engine: &'a E) -> BoxFuture<'a, Result<()>>;
}

type InstallFn<E> = Box<dyn FnOnce(&E) -> Result<()> + Send>;

/// Either shape of synchronous middleware, normalized to one `apply`
pub enum MiddlewareInstaller<E> {
    Function(InstallFn<E>),
    Installable(Box<dyn Middleware<E>>),
}

impl<E> MiddlewareInstaller<E> {
    pub fn function<F>(f: F) -> Self
    where
        F: FnOnce(&E) -> Result<()> + Send + 'static,
    {
        MiddlewareInstaller::Function(Box::new(f))
    }

    pub fn installable<M>(middleware: M) -> Self
    where
        M: Middleware<E> + 'static,
    {
        MiddlewareInstaller::Installable(Box::new(middleware))
    }

    /// Install into `engine`, exactly once
    pub fn apply(self, engine: &E) -> Result<()> {
        match self {
            MiddlewareInstaller::Function(f) => f(engine),
            MiddlewareInstaller::Installable(m) => m.install(engine),
        }
    }
}

impl<E> fmt::Debug for MiddlewareInstaller<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MiddlewareInstaller::Function(_) => f.write_str("MiddlewareInstaller::Function"),
            MiddlewareInstaller::Installable(_) => f.write_str("MiddlewareInstaller::Installable"),
        }
    }
}
