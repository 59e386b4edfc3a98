//! Venue authentication strategy.

use async_trait::async_trait;
use serde_json::Value;

use super::rest::RestRequest;
use crate::error::Result;

/// Signs REST requests and builds websocket authentication payloads.
///
/// Implementations are venue-specific HMAC variants. The signing timestamp
/// must come from the venue's [`TimeSynchronizer`](super::TimeSynchronizer)
/// to avoid clock-skew rejections.
#[async_trait]
pub trait Auth: Send + Sync {
    /// Mutate `request` in place with the venue's authentication data
    /// (signature params, API-key headers, signed body fields).
    async fn rest_authenticate(&self, request: &mut RestRequest) -> Result<()>;

    /// Authentication payload to send right after a private websocket opens,
    /// or `None` for venues that authenticate through the connection URL.
    async fn ws_authenticate(&self) -> Result<Option<Value>>;
}
