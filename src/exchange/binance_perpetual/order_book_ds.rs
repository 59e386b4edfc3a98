//! Public market data source: depth snapshots, diff/trade streams, funding
//! info.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::constants;
use super::messages::{
    self, AggTradeEvent, DepthDiffEvent, DepthSnapshotResponse, MarkPriceEvent,
    PremiumIndexResponse, Ticker24hResponse,
};
use crate::connector::pairs::{TradingPair, TradingPairRegistry};
use crate::error::{Error, Result};
use crate::order_book::{OrderBookDataSource, OrderBookMessage};
use crate::perpetual::FundingInfo;
use crate::web::{RestClient, RestMethod, RestRequest, WsConnection};

const DIFF_STREAM_ID: u64 = 1;
const TRADE_STREAM_ID: u64 = 2;
const FUNDING_INFO_STREAM_ID: u64 = 3;

pub struct BinancePerpetualOrderBookDataSource {
    rest: Arc<RestClient>,
    registry: Arc<RwLock<TradingPairRegistry>>,
    trading_pairs: Vec<TradingPair>,
    rest_base: String,
    ws_base: String,
    /// Mark-price updates flow out of band to the perpetual state.
    funding_tx: Mutex<Option<mpsc::UnboundedSender<FundingInfo>>>,
}

impl BinancePerpetualOrderBookDataSource {
    pub fn new(
        rest: Arc<RestClient>,
        registry: Arc<RwLock<TradingPairRegistry>>,
        trading_pairs: Vec<TradingPair>,
        rest_base: impl Into<String>,
        ws_base: impl Into<String>,
    ) -> Self {
        Self {
            rest,
            registry,
            trading_pairs,
            rest_base: rest_base.into(),
            ws_base: ws_base.into(),
            funding_tx: Mutex::new(None),
        }
    }

    /// Install the channel mark-price funding updates are forwarded to.
    pub fn set_funding_sender(&self, tx: mpsc::UnboundedSender<FundingInfo>) {
        *self.funding_tx.lock() = Some(tx);
    }

    fn symbol_for(&self, trading_pair: &TradingPair) -> Result<String> {
        self.registry.read().symbol_for_pair(trading_pair)
    }

    fn pair_for(&self, symbol: &str) -> Option<TradingPair> {
        self.registry.read().pair_for_symbol(symbol).ok()
    }

    /// Current funding information for one pair from the mark-price
    /// endpoint.
    pub async fn get_funding_info(&self, trading_pair: &TradingPair) -> Result<FundingInfo> {
        let symbol = self.symbol_for(trading_pair)?;
        let url = format!("{}{}", self.rest_base, constants::MARK_PRICE_PATH);
        let body = self
            .rest
            .call(RestRequest::new(RestMethod::Get, url).param("symbol", symbol))
            .await?;
        let premium: PremiumIndexResponse = serde_json::from_value(body)?;
        Ok(FundingInfo {
            trading_pair: trading_pair.clone(),
            index_price: premium.index_price,
            mark_price: premium.mark_price,
            next_funding_utc_timestamp: premium.next_funding_time / 1_000,
            rate: premium.last_funding_rate,
        })
    }

    async fn connect_and_subscribe(&self) -> Result<WsConnection> {
        let url = format!("{}/stream", self.ws_base);
        let mut ws = WsConnection::connect(&url).await?;

        let streams: Vec<(u64, &str)> = vec![
            (DIFF_STREAM_ID, "@depth"),
            (TRADE_STREAM_ID, "@aggTrade"),
            (FUNDING_INFO_STREAM_ID, "@markPrice"),
        ];
        for (id, channel) in streams {
            let params: Vec<String> = self
                .trading_pairs
                .iter()
                .filter_map(|pair| self.symbol_for(pair).ok())
                .map(|symbol| format!("{}{channel}", symbol.to_lowercase()))
                .collect();
            let payload = json!({
                "method": "SUBSCRIBE",
                "params": params,
                "id": id,
            });
            ws.send_json(&payload).await?;
        }
        Ok(ws)
    }

    fn handle_payload(&self, payload: &Value, output: &mpsc::UnboundedSender<OrderBookMessage>) {
        // Subscription acks carry a "result" field and nothing else of use.
        if payload.get("result").is_some() {
            return;
        }
        let Some(event_type) = payload.get("e").and_then(Value::as_str) else {
            return;
        };

        match event_type {
            messages::DEPTH_EVENT => match serde_json::from_value::<DepthDiffEvent>(payload.clone())
            {
                Ok(diff) => {
                    let Some(trading_pair) = self.pair_for(&diff.symbol) else {
                        debug!(symbol = %diff.symbol, "Depth diff for unmapped symbol");
                        return;
                    };
                    let _ = output.send(OrderBookMessage::Diff {
                        trading_pair,
                        update_id: diff.final_update_id,
                        prev_update_id: Some(diff.prev_final_update_id),
                        bids: messages::parse_levels(&diff.bids),
                        asks: messages::parse_levels(&diff.asks),
                        timestamp: diff.event_time as f64 / 1_000.0,
                    });
                }
                Err(e) => warn!(error = %e, "Malformed depth diff, skipping"),
            },
            messages::AGG_TRADE_EVENT => {
                match serde_json::from_value::<AggTradeEvent>(payload.clone()) {
                    Ok(trade) => {
                        let Some(trading_pair) = self.pair_for(&trade.symbol) else {
                            return;
                        };
                        let _ = output.send(OrderBookMessage::Trade {
                            trading_pair,
                            trade_id: trade.trade_id.to_string(),
                            price: trade.price,
                            amount: trade.quantity,
                            timestamp: trade.trade_time as f64 / 1_000.0,
                        });
                    }
                    Err(e) => warn!(error = %e, "Malformed trade event, skipping"),
                }
            }
            messages::MARK_PRICE_EVENT => {
                match serde_json::from_value::<MarkPriceEvent>(payload.clone()) {
                    Ok(mark) => {
                        let Some(trading_pair) = self.pair_for(&mark.symbol) else {
                            return;
                        };
                        let info = FundingInfo {
                            trading_pair,
                            index_price: mark.index_price,
                            mark_price: mark.mark_price,
                            next_funding_utc_timestamp: mark.next_funding_time / 1_000,
                            rate: mark.funding_rate,
                        };
                        if let Some(tx) = self.funding_tx.lock().as_ref() {
                            let _ = tx.send(info);
                        }
                    }
                    Err(e) => warn!(error = %e, "Malformed mark price event, skipping"),
                }
            }
            other => {
                debug!(event = other, "Ignoring unhandled public stream event");
            }
        }
    }
}

#[async_trait]
impl OrderBookDataSource for BinancePerpetualOrderBookDataSource {
    async fn fetch_snapshot(&self, trading_pair: &TradingPair) -> Result<OrderBookMessage> {
        let symbol = self.symbol_for(trading_pair)?;
        let url = format!("{}{}", self.rest_base, constants::SNAPSHOT_PATH);
        let body = self
            .rest
            .call(
                RestRequest::new(RestMethod::Get, url)
                    .param("symbol", symbol)
                    .param("limit", "1000"),
            )
            .await?;
        let snapshot: DepthSnapshotResponse = serde_json::from_value(body)?;
        Ok(OrderBookMessage::Snapshot {
            trading_pair: trading_pair.clone(),
            update_id: snapshot.last_update_id,
            bids: messages::parse_levels(&snapshot.bids),
            asks: messages::parse_levels(&snapshot.asks),
            timestamp: unix_time_now(),
        })
    }

    async fn listen(&self, output: mpsc::UnboundedSender<OrderBookMessage>) {
        loop {
            let mut ws = match self.connect_and_subscribe().await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(error = %e, "Public stream connection failed, retrying");
                    tokio::time::sleep(Duration::from_secs_f64(constants::WS_RECONNECT_DELAY))
                        .await;
                    continue;
                }
            };

            let delay = loop {
                match ws.receive_json().await {
                    Ok(Some(value)) => {
                        // Combined-stream frames wrap the event in "data".
                        let payload = value.get("data").unwrap_or(&value);
                        self.handle_payload(payload, &output);
                        if output.is_closed() {
                            ws.close().await;
                            return;
                        }
                    }
                    Ok(None) => {
                        warn!("Public stream disconnected, reconnecting");
                        break constants::WS_RECONNECT_DELAY;
                    }
                    Err(Error::WebSocket(e)) => {
                        warn!(error = %e, "Public stream error, reconnecting");
                        break constants::WS_RECONNECT_DELAY;
                    }
                    Err(e) => {
                        warn!(error = %e, "Unexpected public stream failure, reconnecting");
                        break constants::WS_UNEXPECTED_ERROR_DELAY;
                    }
                }
            };
            ws.close().await;
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
    }

    async fn last_traded_prices(
        &self,
        trading_pairs: &[TradingPair],
    ) -> Result<HashMap<TradingPair, Decimal>> {
        let mut prices = HashMap::with_capacity(trading_pairs.len());
        for trading_pair in trading_pairs {
            let symbol = self.symbol_for(trading_pair)?;
            let url = format!("{}{}", self.rest_base, constants::TICKER_PRICE_CHANGE_PATH);
            let body = self
                .rest
                .call(RestRequest::new(RestMethod::Get, url).param("symbol", symbol))
                .await?;
            let ticker: Ticker24hResponse = serde_json::from_value(body)?;
            prices.insert(trading_pair.clone(), ticker.last_price);
        }
        Ok(prices)
    }
}

fn unix_time_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}
