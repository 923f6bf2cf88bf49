use async_trait::async_trait;
use std::time::Duration;

use crate::error::TransportResult;

/// Shared health/disposal surface for every publisher and subscriber.
///
/// Generalizes the teacher's `Subscriber::is_connected()`/`Publisher::close()`
/// pair (which always reported `true` and did nothing, respectively) into a
/// trait the rewrite implements honestly for each transport.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// True iff the underlying client is connected and not in an error state.
    fn is_healthy(&self) -> bool;

    /// Blocking close of all channels/connections. Idempotent: calling this
    /// twice is not an error. After this returns, `is_healthy()` is false
    /// and all further operations fail with `TransportError::Closed`.
    async fn dispose(&self) -> TransportResult<()>;
}

/// Blocks until the in-flight buffer is empty or `timeout` elapses.
#[async_trait]
pub trait Flushable: Send + Sync {
    /// Returns how many sends were confirmed before returning.
    async fn flush(&self, timeout: Duration) -> TransportResult<usize>;
}
