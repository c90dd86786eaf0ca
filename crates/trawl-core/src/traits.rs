use std::future::Future;

use serde_json::Value;

use crate::error::AppError;
use crate::proxy::ProxyEndpoint;

/// Moves the data source's visible window forward (scroll, next page, refresh).
///
/// Implemented by the external browser/session driver.
pub trait PageDriver: Send + Sync {
    fn advance(&self) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Whether the source is currently showing an error or rate-limit page.
    fn is_error_page(&self) -> impl Future<Output = Result<bool, AppError>> + Send {
        async { Ok(false) }
    }
}

/// Receives each round's newly accepted records.
pub trait ItemSink: Send + Sync {
    fn accept(&self, items: &[Value]) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Reachability check used by [`ProxyRouter::test_all`](crate::proxy_router::ProxyRouter::test_all).
pub trait ProxyProbe: Send + Sync {
    /// Succeeds if traffic can flow through `endpoint`.
    fn probe(&self, endpoint: &ProxyEndpoint) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// A driver with nothing to advance, for sources paginated by the extractor itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDriver;

impl PageDriver for NoopDriver {
    async fn advance(&self) -> Result<(), AppError> {
        Ok(())
    }
}

/// A no-op ItemSink for use when persistence is not needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ItemSink for NullSink {
    async fn accept(&self, _items: &[Value]) -> Result<(), AppError> {
        Ok(())
    }
}
