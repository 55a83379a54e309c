//! Client-side handles for server namespaces.
//!
//! A [`NamespaceProxy`] is a cheap handle; the namespace itself (advertised
//! methods plus namespace-wide defaults) lives in the client and is rebuilt
//! on every handshake and dropped on disconnect.
//!
//! ```rust,no_run
//! # use std::time::Duration;
//! # async fn run(client: uni_rpc::service::client::RpcClient) -> uni_rpc::error::Result<()> {
//! let math = client.namespace("math").expect("advertised");
//! math.set_namespace_timeout(Duration::from_secs(2))
//!     .set_namespace_meta("tenant", "acme");
//!
//! let sum = math
//!     .method("add")?
//!     .timeout(Duration::from_millis(500))
//!     .meta("trace", "abc")
//!     .call(vec![2.into(), 3.into()])
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use crate::core::packet::Meta;
use crate::core::value::Value;
use crate::error::{ProtocolError, Result};
use crate::protocol::namespaced;
use crate::service::client::{FireOptions, RpcClient};

/// Advertised methods and namespace-wide call defaults
#[derive(Debug, Clone, Default)]
pub struct NamespaceState {
    pub methods: Vec<String>,
    pub timeout: Option<Duration>,
    pub meta: Meta,
}

impl NamespaceState {
    pub fn new(methods: Vec<String>) -> Self {
        Self {
            methods,
            ..Self::default()
        }
    }
}

/// Handle to one server namespace
#[derive(Debug, Clone)]
pub struct NamespaceProxy {
    client: RpcClient,
    name: String,
}

impl NamespaceProxy {
    pub(crate) fn new(client: RpcClient, name: String) -> Self {
        Self { client, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Advertised methods; empty once the connection is gone
    pub fn methods(&self) -> Vec<String> {
        self.client
            .namespace_state(&self.name)
            .map(|s| s.methods)
            .unwrap_or_default()
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods().iter().any(|m| m == method)
    }

    /// Default deadline for every call through this namespace
    pub fn set_namespace_timeout(&self, timeout: Duration) -> &Self {
        self.client
            .update_namespace(&self.name, |s| s.timeout = Some(timeout));
        self
    }

    /// Meta entry sent with every call through this namespace
    pub fn set_namespace_meta(&self, key: impl Into<String>, value: impl Into<Value>) -> &Self {
        let (key, value) = (key.into(), value.into());
        self.client.update_namespace(&self.name, |s| {
            s.meta.insert(key, value);
        });
        self
    }

    /// Start a call to `method`.
    ///
    /// # Errors
    /// `ConnectionClosed` if the namespace is gone, `UnknownMethod` if the
    /// server does not advertise `method`.
    pub fn method(&self, method: &str) -> Result<MethodCall> {
        let state = self
            .client
            .namespace_state(&self.name)
            .ok_or(ProtocolError::ConnectionClosed)?;
        if !state.methods.iter().any(|m| m == method) {
            return Err(ProtocolError::UnknownMethod {
                namespace: self.name.clone(),
                method: method.to_string(),
            });
        }
        Ok(MethodCall {
            client: self.client.clone(),
            event_name: namespaced(&self.name, method),
            defaults: state,
            timeout: None,
            meta: Meta::new(),
        })
    }

    /// Call `method` with the namespace defaults
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.method(method)?.call(args).await
    }
}

/// One pending call with per-call overrides
#[derive(Debug)]
pub struct MethodCall {
    client: RpcClient,
    event_name: String,
    defaults: NamespaceState,
    timeout: Option<Duration>,
    meta: Meta,
}

impl MethodCall {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// Per-call values override namespace defaults
    pub async fn call(self, args: Vec<Value>) -> Result<Value> {
        let mut meta = self.defaults.meta;
        meta.extend(self.meta);
        let options = FireOptions {
            timeout: self.timeout.or(self.defaults.timeout),
            meta,
        };
        self.client.fire_with(&self.event_name, args, options).await
    }
}
