//! Venue-facing order book data source contract.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use super::message::OrderBookMessage;
use crate::connector::pairs::TradingPair;
use crate::error::Result;

/// Bootstraps snapshots and streams normalized order book messages for one
/// venue.
///
/// `listen` owns the websocket lifecycle: subscribe once per connection for
/// all tracked pairs, forward diffs and trades into `output`, and on any
/// disconnect or error back off and reconnect internally. It returns only
/// when `output` is closed (the tracker shut down).
#[async_trait]
pub trait OrderBookDataSource: Send + Sync {
    /// Fetch a full REST snapshot for one pair.
    async fn fetch_snapshot(&self, trading_pair: &TradingPair) -> Result<OrderBookMessage>;

    /// Stream diffs and trades for every tracked pair into `output`.
    async fn listen(&self, output: mpsc::UnboundedSender<OrderBookMessage>);

    /// Last traded price per pair from the venue's ticker endpoint.
    async fn last_traded_prices(
        &self,
        trading_pairs: &[TradingPair],
    ) -> Result<HashMap<TradingPair, Decimal>>;
}
