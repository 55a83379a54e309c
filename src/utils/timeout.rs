//! Timeout defaults and helpers.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default deadline for a `fire` call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a server waits for live connections on shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `fut`, mapping an elapsed deadline to `on_elapsed`
pub async fn with_timeout_error<F, T>(
    fut: F,
    duration: Duration,
    on_elapsed: impl FnOnce() -> ProtocolError,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_elapsed()),
    }
}
