//! # Protocol Layer
//!
//! Wire constants plus the pieces both engines share: the middleware
//! pipeline, argument formatters, the method registry and the handshake
//! state machine.
//!
//! ## Handshake
//! The handshake is ordinary request traffic against four reserved event
//! names, so it flows through the same middleware and correlation machinery
//! as application calls:
//!
//! ```text
//! plaintext:  INIT -> FINISH
//! encrypted:  INIT -> CONFIRM -> GENERATE_KEY -> FINISH
//! ```

pub mod formatter;
pub mod handshake;
pub mod middleware;
pub mod registry;


use std::time::Duration;

/// Meta key carrying the requested event name
pub const META_EVENT_NAME: &str = "eventName";
/// Meta key the server stamps with the caller's connection id
pub const META_CLIENT_ID: &str = "clientId";
/// Meta key marking an error response
pub const META_ERROR: &str = "error";
/// Meta key carrying the numeric error code of an error response
pub const META_ERROR_CODE: &str = "errorCode";

/// Logical channel name for client -> server requests
pub const CHANNEL_REQUEST: &str = "0";

pub const HANDSHAKE_INIT: &str = "$--handshake-init--$";
pub const HANDSHAKE_CONFIRM: &str = "$--handshake-confirm--$";
pub const HANDSHAKE_GENERATE_KEY: &str = "$--handshake-generate-key--$";
pub const HANDSHAKE_FINISH: &str = "$--handshake-finish--$";

/// Separator between namespace and method in a compound event name
pub const NAMESPACE_SEPARATOR: &str = "::";

/// Default deadline for a request
pub const DEFAULT_FAIL_TIMEOUT: Duration = crate::utils::timeout::DEFAULT_TIMEOUT;

/// Whether `event` is one of the reserved handshake events
pub fn is_handshake_event(event: &str) -> bool {
    matches!(
        event,
        HANDSHAKE_INIT | HANDSHAKE_CONFIRM | HANDSHAKE_GENERATE_KEY | HANDSHAKE_FINISH
    )
}

/// Compound registry name for `namespace::method`
pub fn namespaced(namespace: &str, method: &str) -> String {
    format!("{namespace}{NAMESPACE_SEPARATOR}{method}")
}
