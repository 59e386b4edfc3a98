//! In-flight order bookkeeping.
//!
//! An [`InFlightOrder`] lives from the moment a strategy calls buy/sell until
//! its terminal event. State only ever moves forward along
//! `PENDING_CREATE -> OPEN -> PARTIALLY_FILLED* -> FILLED | CANCELLED |
//! FAILED`; the tracker absorbs redundant or out-of-order inputs. Orders
//! serialize to JSON so a client can persist and restore its tracking state
//! across restarts.

use std::collections::{HashSet, VecDeque};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::fees::TradeFee;
use super::pairs::TradingPair;
use super::{OrderType, TradeType};
use crate::perpetual::PositionAction;

/// Trade ids remembered per order for exactly-once fill delivery.
const SEEN_TRADE_ID_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    PendingCreate,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Failed,
}

impl OrderState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Failed)
    }
}

/// Bounded set of venue trade ids already applied to an order.
///
/// Fills arrive through both the private stream and the trade-history poll;
/// this set makes delivery exactly-once across the two paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct SeenTradeIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenTradeIds {
    /// Record a trade id. Returns `false` if it was already present.
    pub fn insert(&mut self, trade_id: &str) -> bool {
        if self.ids.contains(trade_id) {
            return false;
        }
        if self.order.len() == SEEN_TRADE_ID_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        self.ids.insert(trade_id.to_string());
        self.order.push_back(trade_id.to_string());
        true
    }

    pub fn contains(&self, trade_id: &str) -> bool {
        self.ids.contains(trade_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl From<Vec<String>> for SeenTradeIds {
    fn from(ids: Vec<String>) -> Self {
        let mut seen = Self::default();
        for id in ids {
            seen.insert(&id);
        }
        seen
    }
}

impl From<SeenTradeIds> for Vec<String> {
    fn from(seen: SeenTradeIds) -> Self {
        seen.order.into_iter().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightOrder {
    pub client_order_id: String,
    /// Assigned on exchange ack; never changed afterwards.
    pub exchange_order_id: Option<String>,
    pub trading_pair: TradingPair,
    pub order_type: OrderType,
    pub trade_type: TradeType,
    pub price: Decimal,
    pub amount: Decimal,
    /// Epoch seconds at creation.
    pub creation_timestamp: f64,
    pub state: OrderState,
    pub executed_amount_base: Decimal,
    pub executed_amount_quote: Decimal,
    pub leverage: u32,
    pub position: PositionAction,
    pub seen_trade_ids: SeenTradeIds,
}

impl InFlightOrder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_order_id: impl Into<String>,
        trading_pair: TradingPair,
        order_type: OrderType,
        trade_type: TradeType,
        price: Decimal,
        amount: Decimal,
        creation_timestamp: f64,
    ) -> Self {
        Self {
            client_order_id: client_order_id.into(),
            exchange_order_id: None,
            trading_pair,
            order_type,
            trade_type,
            price,
            amount,
            creation_timestamp,
            state: OrderState::PendingCreate,
            executed_amount_base: Decimal::ZERO,
            executed_amount_quote: Decimal::ZERO,
            leverage: 1,
            position: PositionAction::Nil,
            seen_trade_ids: SeenTradeIds::default(),
        }
    }

    pub fn with_leverage(mut self, leverage: u32) -> Self {
        self.leverage = leverage;
        self
    }

    pub fn with_position_action(mut self, position: PositionAction) -> Self {
        self.position = position;
        self
    }

    pub fn is_done(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_pending_create(&self) -> bool {
        self.state == OrderState::PendingCreate
    }

    /// Volume-weighted average fill price, if anything filled.
    pub fn average_executed_price(&self) -> Option<Decimal> {
        if self.executed_amount_base.is_zero() {
            None
        } else {
            Some(self.executed_amount_quote / self.executed_amount_base)
        }
    }

    pub fn remaining_amount(&self) -> Decimal {
        (self.amount - self.executed_amount_base).max(Decimal::ZERO)
    }
}

/// A status transition observed via the private stream or a status poll.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub new_state: OrderState,
    /// Epoch seconds of the observation.
    pub update_timestamp: f64,
}

/// A single fill observed via the private stream or the trade-history poll.
///
/// Amounts are the fill's own delta, never cumulative totals.
#[derive(Debug, Clone)]
pub struct TradeUpdate {
    pub trade_id: String,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub trading_pair: TradingPair,
    pub fill_price: Decimal,
    pub fill_base_amount: Decimal,
    pub fill_quote_amount: Decimal,
    pub fee: TradeFee,
    /// Epoch seconds of the fill.
    pub fill_timestamp: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order() -> InFlightOrder {
        InFlightOrder::new(
            "oid-1",
            TradingPair::new("BTC", "USDT"),
            OrderType::Limit,
            TradeType::Buy,
            dec!(20000),
            dec!(0.1),
            1_700_000_000.0,
        )
    }

    #[test]
    fn seen_trade_ids_deduplicate() {
        let mut seen = SeenTradeIds::default();
        assert!(seen.insert("t1"));
        assert!(!seen.insert("t1"));
        assert!(seen.insert("t2"));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn seen_trade_ids_evict_oldest_at_capacity() {
        let mut seen = SeenTradeIds::default();
        for i in 0..SEEN_TRADE_ID_CAPACITY + 1 {
            assert!(seen.insert(&format!("t{i}")));
        }
        assert_eq!(seen.len(), SEEN_TRADE_ID_CAPACITY);
        assert!(!seen.contains("t0"));
        assert!(seen.contains("t1"));
    }

    #[test]
    fn order_serialization_round_trips() {
        let mut order = order().with_leverage(5).with_position_action(PositionAction::Open);
        order.exchange_order_id = Some("E-1".into());
        order.state = OrderState::PartiallyFilled;
        order.executed_amount_base = dec!(0.04);
        order.executed_amount_quote = dec!(800);
        order.seen_trade_ids.insert("t1");

        let json = serde_json::to_value(&order).unwrap();
        let restored: InFlightOrder = serde_json::from_value(json).unwrap();

        assert_eq!(restored.client_order_id, order.client_order_id);
        assert_eq!(restored.state, OrderState::PartiallyFilled);
        assert_eq!(restored.executed_amount_base, dec!(0.04));
        assert_eq!(restored.leverage, 5);
        assert!(restored.seen_trade_ids.contains("t1"));
    }

    #[test]
    fn average_price_is_volume_weighted() {
        let mut order = order();
        assert_eq!(order.average_executed_price(), None);
        order.executed_amount_base = dec!(0.1);
        order.executed_amount_quote = dec!(2000);
        assert_eq!(order.average_executed_price(), Some(dec!(20000)));
    }
}
