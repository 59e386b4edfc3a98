//! Typed market events delivered to strategies and recorders.
//!
//! Every event carries a [`MarketEventTag`] used for subscription and a
//! payload whose shape is fixed per tag. Timestamps are milliseconds since
//! the unix epoch; prices and amounts are fixed-point decimals.

mod bus;

pub use bus::{EventBus, EventListener};

use rust_decimal::Decimal;

use crate::connector::fees::TradeFee;
use crate::connector::pairs::TradingPair;
use crate::connector::{OrderType, TradeType};
use crate::perpetual::{PositionAction, PositionMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketEventTag {
    BuyOrderCreated,
    SellOrderCreated,
    OrderFilled,
    BuyOrderCompleted,
    SellOrderCompleted,
    OrderCancelled,
    OrderExpired,
    OrderFailure,
    FundingPaymentCompleted,
    PositionModeChangeSucceeded,
    PositionModeChangeFailed,
    ReceivedAsset,
}

#[derive(Debug, Clone)]
pub struct OrderCreatedEvent {
    pub timestamp_ms: i64,
    pub order_type: OrderType,
    pub trading_pair: TradingPair,
    pub amount: Decimal,
    pub price: Decimal,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub leverage: u32,
    pub position: PositionAction,
}

#[derive(Debug, Clone)]
pub struct OrderFilledEvent {
    pub timestamp_ms: i64,
    pub client_order_id: String,
    pub trading_pair: TradingPair,
    pub trade_type: TradeType,
    pub order_type: OrderType,
    /// Fill price of this delta.
    pub price: Decimal,
    /// Base amount filled by this trade alone, never the cumulative.
    pub amount: Decimal,
    pub trade_fee: TradeFee,
    /// Venue trade id used for exactly-once delivery.
    pub exchange_trade_id: String,
}

#[derive(Debug, Clone)]
pub struct OrderCompletedEvent {
    pub timestamp_ms: i64,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub base_asset: String,
    pub quote_asset: String,
    pub base_amount: Decimal,
    pub quote_amount: Decimal,
    pub order_type: OrderType,
}

#[derive(Debug, Clone)]
pub struct OrderCancelledEvent {
    pub timestamp_ms: i64,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrderExpiredEvent {
    pub timestamp_ms: i64,
    pub client_order_id: String,
}

#[derive(Debug, Clone)]
pub struct OrderFailureEvent {
    pub timestamp_ms: i64,
    pub client_order_id: String,
    pub order_type: OrderType,
}

#[derive(Debug, Clone)]
pub struct FundingPaymentCompletedEvent {
    pub timestamp_ms: i64,
    /// Venue name the payment happened on.
    pub market: String,
    pub trading_pair: TradingPair,
    pub funding_rate: Decimal,
    pub amount: Decimal,
}

#[derive(Debug, Clone)]
pub struct PositionModeChangeEvent {
    pub timestamp_ms: i64,
    pub trading_pair: TradingPair,
    pub position_mode: PositionMode,
    /// Venue error message on failure.
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReceivedAssetEvent {
    pub timestamp_ms: i64,
    pub asset: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone)]
pub enum MarketEvent {
    BuyOrderCreated(OrderCreatedEvent),
    SellOrderCreated(OrderCreatedEvent),
    OrderFilled(OrderFilledEvent),
    BuyOrderCompleted(OrderCompletedEvent),
    SellOrderCompleted(OrderCompletedEvent),
    OrderCancelled(OrderCancelledEvent),
    OrderExpired(OrderExpiredEvent),
    OrderFailure(OrderFailureEvent),
    FundingPaymentCompleted(FundingPaymentCompletedEvent),
    PositionModeChangeSucceeded(PositionModeChangeEvent),
    PositionModeChangeFailed(PositionModeChangeEvent),
    ReceivedAsset(ReceivedAssetEvent),
}

impl MarketEvent {
    pub fn tag(&self) -> MarketEventTag {
        match self {
            Self::BuyOrderCreated(_) => MarketEventTag::BuyOrderCreated,
            Self::SellOrderCreated(_) => MarketEventTag::SellOrderCreated,
            Self::OrderFilled(_) => MarketEventTag::OrderFilled,
            Self::BuyOrderCompleted(_) => MarketEventTag::BuyOrderCompleted,
            Self::SellOrderCompleted(_) => MarketEventTag::SellOrderCompleted,
            Self::OrderCancelled(_) => MarketEventTag::OrderCancelled,
            Self::OrderExpired(_) => MarketEventTag::OrderExpired,
            Self::OrderFailure(_) => MarketEventTag::OrderFailure,
            Self::FundingPaymentCompleted(_) => MarketEventTag::FundingPaymentCompleted,
            Self::PositionModeChangeSucceeded(_) => MarketEventTag::PositionModeChangeSucceeded,
            Self::PositionModeChangeFailed(_) => MarketEventTag::PositionModeChangeFailed,
            Self::ReceivedAsset(_) => MarketEventTag::ReceivedAsset,
        }
    }
}
