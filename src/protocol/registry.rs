use crate::core::packet::Meta;
use crate::core::value::Value;
use crate::error::{constants, HandlerError, ProtocolError, Result};
use crate::protocol::formatter::ArgSchema;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// What a handler sees about the request besides its arguments
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Connection id of the caller
    pub client_id: String,
    pub event_name: String,
    /// Request meta, including `clientId` and caller-supplied keys
    pub meta: Meta,
}

pub type HandlerFuture = BoxFuture<'static, std::result::Result<Value, HandlerError>>;

/// A registered method body
pub type Handler = Arc<dyn Fn(CallContext, Vec<Value>) -> HandlerFuture + Send + Sync>;

/// Wrap a synchronous function as a [`Handler`]
pub fn handler_fn<F>(f: F) -> Handler
where
    F: Fn(CallContext, Vec<Value>) -> std::result::Result<Value, HandlerError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(move |ctx, args| -> HandlerFuture {
        let result = f(ctx, args);
        Box::pin(std::future::ready(result))
    })
}

/// Wrap an async function as a [`Handler`]
pub fn async_handler<F, Fut>(f: F) -> Handler
where
    F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(move |ctx, args| -> HandlerFuture { Box::pin(f(ctx, args)) })
}

/// Run `schema` over the arguments before `handler` sees them
fn with_schema(schema: ArgSchema, handler: Handler) -> Handler {
    let schema = Arc::new(schema);
    Arc::new(move |ctx, args| -> HandlerFuture {
        let schema = Arc::clone(&schema);
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            let args = schema
                .apply(&ctx.event_name, args)
                .await
                .map_err(|e| Box::new(e) as HandlerError)?;
            handler(ctx, args).await
        })
    })
}

/// Event name to handler map. Entries are write-once.
pub struct MethodRegistry {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Store `handler` under `event_name`, wrapped with `schema` if given.
    ///
    /// # Errors
    /// `DuplicateRegistration` if the name is taken; the first entry stays active.
    pub fn insert(
        &self,
        event_name: &str,
        schema: Option<ArgSchema>,
        handler: Handler,
    ) -> Result<()> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))?;

        if handlers.contains_key(event_name) {
            return Err(ProtocolError::DuplicateRegistration(event_name.to_string()));
        }

        let handler = match schema {
            Some(schema) => with_schema(schema, handler),
            None => handler,
        };
        handlers.insert(event_name.to_string(), handler);
        Ok(())
    }

    pub fn get(&self, event_name: &str) -> Result<Option<Handler>> {
        let handlers = self
            .handlers
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_READ_LOCK.to_string()))?;
        Ok(handlers.get(event_name).cloned())
    }

    pub fn contains(&self, event_name: &str) -> bool {
        self.handlers
            .read()
            .map(|h| h.contains_key(event_name))
            .unwrap_or(false)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.read().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
