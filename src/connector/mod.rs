//! Exchange connector contract and shared order-tracking machinery.
//!
//! A connector is the per-venue state machine over in-flight orders,
//! balances, trading rules and order books. Strategies talk to the
//! [`Connector`] trait; perpetual-only operations live on
//! [`PerpetualConnector`](crate::perpetual::PerpetualConnector). Shared
//! behaviour (the in-flight book, event emission, quantization, fee
//! building) is factored into the helpers in this module rather than into
//! base classes.

pub mod fees;
pub mod in_flight;
pub mod pairs;
pub mod tracker;
pub mod trading_rule;
pub mod utils;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::Result;
use crate::order_book::OrderBook;
use fees::TradeFee;
use in_flight::InFlightOrder;
use pairs::TradingPair;
use trading_rule::TradingRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeType {
    Buy,
    Sell,
}

impl TradeType {
    pub fn is_buy(&self) -> bool {
        matches!(self, Self::Buy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    /// Post-only limit order; rejected by the venue if it would cross.
    LimitMaker,
    Market,
}

impl OrderType {
    pub fn is_limit(&self) -> bool {
        matches!(self, Self::Limit | Self::LimitMaker)
    }
}

/// Per-asset account balance. `available` excludes amounts locked in open
/// orders or margin and never exceeds `total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Balance {
    pub total: Decimal,
    pub available: Decimal,
}

/// Flat view of a resting order for strategies.
#[derive(Debug, Clone)]
pub struct LimitOrder {
    pub client_order_id: String,
    pub trading_pair: TradingPair,
    pub is_buy: bool,
    pub base_currency: String,
    pub quote_currency: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub creation_timestamp: f64,
}

impl From<&InFlightOrder> for LimitOrder {
    fn from(order: &InFlightOrder) -> Self {
        Self {
            client_order_id: order.client_order_id.clone(),
            trading_pair: order.trading_pair.clone(),
            is_buy: order.trade_type.is_buy(),
            base_currency: order.trading_pair.base().to_string(),
            quote_currency: order.trading_pair.quote().to_string(),
            price: order.price,
            quantity: order.amount,
            filled_quantity: order.executed_amount_base,
            creation_timestamp: order.creation_timestamp,
        }
    }
}

/// Outcome of one cancellation inside [`Connector::cancel_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationResult {
    pub order_id: String,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Connected,
    NotConnected,
}

/// Extra order parameters; perpetual venues read the position action.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderOptions {
    pub position_action: crate::perpetual::PositionAction,
}

/// A settable flag that async loops can wait on, in the style of an asyncio
/// event: `set` wakes every waiter, `reset` re-arms the flag. Setting while
/// a loop is mid-iteration is not lost — the next `wait` returns
/// immediately.
#[derive(Default)]
pub struct PollNotifier {
    flag: AtomicBool,
    notify: Notify,
}

impl PollNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub async fn wait(&self) {
        loop {
            if self.flag.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.notify.notified();
            if self.flag.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// The operations every venue connector exposes to strategies.
#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &'static str;

    fn trading_pairs(&self) -> Vec<TradingPair>;

    /// Launch the connector's network tasks (order book tracking, polling
    /// loops, user stream). Idempotent: an already-running connector is
    /// stopped first.
    async fn start_network(&self) -> Result<()>;

    /// Cancel every task, close sessions and clear in-memory state.
    async fn stop_network(&self);

    /// Probe venue reachability.
    async fn check_network(&self) -> NetworkStatus;

    /// Readiness of each connector component, keyed by component name.
    fn status_snapshot(&self) -> HashMap<&'static str, bool>;

    /// True once every component in [`Connector::status_snapshot`] is ready.
    fn ready(&self) -> bool {
        let status = self.status_snapshot();
        !status.is_empty() && status.values().all(|ready| *ready)
    }

    /// Clock callback; schedules status polls.
    fn tick(&self, timestamp: f64);

    fn supported_order_types(&self) -> Vec<OrderType>;

    /// Place a buy order. Returns the freshly minted client order id
    /// immediately; placement runs asynchronously and the order is tracked
    /// as pending from this call on.
    fn buy(
        &self,
        trading_pair: &TradingPair,
        amount: Decimal,
        order_type: OrderType,
        price: Decimal,
        options: OrderOptions,
    ) -> String;

    /// Place a sell order; see [`Connector::buy`].
    fn sell(
        &self,
        trading_pair: &TradingPair,
        amount: Decimal,
        order_type: OrderType,
        price: Decimal,
        options: OrderOptions,
    ) -> String;

    /// Request cancellation, fire-and-forget. The `OrderCancelled` event is
    /// produced by the confirmation path, not by this call.
    fn cancel(&self, trading_pair: &TradingPair, client_order_id: &str) -> String;

    /// Cancel every non-terminal order in parallel, waiting up to `timeout`.
    /// The underlying cancels are shielded from the caller going away.
    async fn cancel_all(&self, timeout: Duration) -> Vec<CancellationResult>;

    /// Compute the fee for a prospective trade. `is_maker` defaults to
    /// whether the order type is a maker type.
    fn get_fee(
        &self,
        trading_pair: &TradingPair,
        trade_type: TradeType,
        order_type: OrderType,
        amount: Decimal,
        price: Decimal,
        is_maker: Option<bool>,
    ) -> TradeFee;

    /// Snap a price onto the pair's tick grid.
    fn quantize_order_price(&self, trading_pair: &TradingPair, price: Decimal) -> Decimal;

    /// Snap an amount onto the pair's step grid. Returns zero for amounts
    /// below the minimum order size or, when `price` is given, below the
    /// minimum notional value — a zero result means "do not place this".
    fn quantize_order_amount(
        &self,
        trading_pair: &TradingPair,
        amount: Decimal,
        price: Option<Decimal>,
    ) -> Decimal;

    fn order_book(&self, trading_pair: &TradingPair) -> Option<Arc<RwLock<OrderBook>>>;

    fn trading_rule(&self, trading_pair: &TradingPair) -> Option<TradingRule>;

    fn in_flight_orders(&self) -> Vec<InFlightOrder>;

    /// Flat resting-order view for strategies.
    fn limit_orders(&self) -> Vec<LimitOrder> {
        self.in_flight_orders().iter().map(LimitOrder::from).collect()
    }

    fn balances(&self) -> HashMap<String, Balance>;

    fn balance(&self, asset: &str) -> Decimal {
        self.balances()
            .get(asset)
            .map(|balance| balance.total)
            .unwrap_or(Decimal::ZERO)
    }

    fn available_balance(&self, asset: &str) -> Decimal {
        self.balances()
            .get(asset)
            .map(|balance| balance.available)
            .unwrap_or(Decimal::ZERO)
    }

    /// JSON snapshot of the non-terminal in-flight orders, for persistence
    /// by the hosting client.
    fn tracking_states(&self) -> HashMap<String, Value>;

    /// Restore orders saved by [`Connector::tracking_states`] so tracking
    /// resumes where a previous run left off.
    fn restore_tracking_states(&self, states: HashMap<String, Value>);

    /// Last traded price per pair from the venue ticker.
    async fn last_traded_prices(
        &self,
        trading_pairs: &[TradingPair],
    ) -> Result<HashMap<TradingPair, Decimal>>;
}
