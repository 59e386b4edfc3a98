//! The in-flight order book: state transitions and event emission.
//!
//! The tracker is the single place where order/trade observations from the
//! private stream and the REST status poll meet. Both paths feed the same
//! two entry points; redundant inputs are absorbed (stale transitions are
//! no-ops, duplicate trade ids are dropped) so every order produces exactly
//! one `Created`, delta-only `Filled`s, and exactly one terminal event.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::fees::{TradeFee, TradeFeePercentageApplication};
use super::in_flight::{InFlightOrder, OrderState, OrderUpdate, TradeUpdate};
use crate::events::{
    EventBus, MarketEvent, OrderCancelledEvent, OrderCompletedEvent, OrderCreatedEvent,
    OrderFailureEvent, OrderFilledEvent,
};
use crate::connector::TradeType;

pub struct OrderTracker {
    orders: RwLock<HashMap<String, InFlightOrder>>,
    bus: Arc<EventBus>,
}

impl OrderTracker {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            bus,
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Begin tracking an order. Called before the placement request goes out,
    /// so a fast ack can never race an untracked order.
    pub fn start_tracking(&self, order: InFlightOrder) {
        self.orders
            .write()
            .insert(order.client_order_id.clone(), order);
    }

    /// Drop an order from tracking, returning it if present.
    pub fn stop_tracking(&self, client_order_id: &str) -> Option<InFlightOrder> {
        self.orders.write().remove(client_order_id)
    }

    pub fn get(&self, client_order_id: &str) -> Option<InFlightOrder> {
        self.orders.read().get(client_order_id).cloned()
    }

    pub fn all(&self) -> Vec<InFlightOrder> {
        self.orders.read().values().cloned().collect()
    }

    /// Orders still awaiting a terminal state.
    pub fn active(&self) -> Vec<InFlightOrder> {
        self.orders
            .read()
            .values()
            .filter(|order| !order.is_done())
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.orders.write().clear();
    }

    /// JSON snapshot of every non-terminal order, keyed by client order id.
    pub fn tracking_states(&self) -> HashMap<String, Value> {
        self.orders
            .read()
            .values()
            .filter(|order| !order.is_done())
            .filter_map(|order| {
                serde_json::to_value(order)
                    .ok()
                    .map(|json| (order.client_order_id.clone(), json))
            })
            .collect()
    }

    /// Restore orders saved by [`OrderTracker::tracking_states`]. Entries
    /// that fail to decode are skipped with a warning.
    pub fn restore_tracking_states(&self, states: HashMap<String, Value>) {
        let mut orders = self.orders.write();
        for (client_order_id, json) in states {
            match serde_json::from_value::<InFlightOrder>(json) {
                Ok(order) => {
                    orders.insert(client_order_id, order);
                }
                Err(e) => {
                    warn!(%client_order_id, error = %e, "Skipping undecodable tracking state");
                }
            }
        }
    }

    /// Apply a status observation. Stale and repeated transitions are
    /// absorbed; terminal transitions emit their event and stop tracking.
    pub fn process_order_update(&self, update: OrderUpdate) {
        let mut events: Vec<MarketEvent> = Vec::new();
        {
            let mut orders = self.orders.write();
            let Some(order) = orders.get_mut(&update.client_order_id) else {
                debug!(
                    client_order_id = %update.client_order_id,
                    "Status update for untracked order, ignoring"
                );
                return;
            };
            if order.is_done() {
                return;
            }

            if order.exchange_order_id.is_none() {
                order.exchange_order_id = update.exchange_order_id.clone();
            }
            let timestamp_ms = (update.update_timestamp * 1_000.0) as i64;

            match update.new_state {
                OrderState::PendingCreate => {}
                OrderState::Open => {
                    if order.state == OrderState::PendingCreate {
                        order.state = OrderState::Open;
                        events.push(created_event(order, timestamp_ms));
                    }
                }
                OrderState::PartiallyFilled => {
                    if order.state == OrderState::PendingCreate {
                        events.push(created_event(order, timestamp_ms));
                    }
                    if !matches!(order.state, OrderState::PartiallyFilled) {
                        order.state = OrderState::PartiallyFilled;
                    }
                }
                OrderState::Filled => {
                    if order.state == OrderState::PendingCreate {
                        events.push(created_event(order, timestamp_ms));
                    }
                    // An explicit FILLED status can land before every fill
                    // has arrived through the trade paths; the executed
                    // totals must equal the order amount once terminal, so
                    // emit the outstanding delta and true the totals up.
                    let remaining = order.amount - order.executed_amount_base;
                    if remaining > Decimal::ZERO {
                        let fill_price =
                            order.average_executed_price().unwrap_or(order.price);
                        order.executed_amount_base = order.amount;
                        order.executed_amount_quote += remaining * fill_price;
                        events.push(MarketEvent::OrderFilled(OrderFilledEvent {
                            timestamp_ms,
                            client_order_id: order.client_order_id.clone(),
                            trading_pair: order.trading_pair.clone(),
                            trade_type: order.trade_type,
                            order_type: order.order_type,
                            price: fill_price,
                            amount: remaining,
                            trade_fee: reconciled_fill_fee(),
                            // No venue trade id exists for a
                            // status-reconciled delta.
                            exchange_trade_id: String::new(),
                        }));
                    }
                    order.state = OrderState::Filled;
                    events.push(completed_event(order, timestamp_ms));
                    info!(client_order_id = %order.client_order_id, "Order filled");
                }
                OrderState::Cancelled => {
                    if order.state == OrderState::PendingCreate {
                        events.push(created_event(order, timestamp_ms));
                    }
                    order.state = OrderState::Cancelled;
                    events.push(MarketEvent::OrderCancelled(OrderCancelledEvent {
                        timestamp_ms,
                        client_order_id: order.client_order_id.clone(),
                        exchange_order_id: order.exchange_order_id.clone(),
                    }));
                    info!(client_order_id = %order.client_order_id, "Order cancelled");
                }
                OrderState::Failed => {
                    order.state = OrderState::Failed;
                    events.push(MarketEvent::OrderFailure(OrderFailureEvent {
                        timestamp_ms,
                        client_order_id: order.client_order_id.clone(),
                        order_type: order.order_type,
                    }));
                    info!(client_order_id = %order.client_order_id, "Order failed");
                }
            }

            if order.is_done() {
                let id = order.client_order_id.clone();
                orders.remove(&id);
            }
        }
        for event in events {
            self.bus.trigger_event(event);
        }
    }

    /// Apply one fill. Duplicate trade ids are dropped, making delivery
    /// exactly-once across the private stream and the trade-history poll.
    pub fn process_trade_update(&self, update: TradeUpdate) {
        let mut events: Vec<MarketEvent> = Vec::new();
        {
            let mut orders = self.orders.write();
            let Some(order) = orders.get_mut(&update.client_order_id) else {
                debug!(
                    client_order_id = %update.client_order_id,
                    trade_id = %update.trade_id,
                    "Fill for untracked order, ignoring"
                );
                return;
            };
            if order.is_done() {
                return;
            }
            if !order.seen_trade_ids.insert(&update.trade_id) {
                debug!(
                    client_order_id = %order.client_order_id,
                    trade_id = %update.trade_id,
                    "Duplicate fill dropped"
                );
                return;
            }

            let timestamp_ms = (update.fill_timestamp * 1_000.0) as i64;

            // A fill for an order still awaiting its placement response means
            // the ack was lost in flight; the fill doubles as the ack.
            if order.state == OrderState::PendingCreate {
                if order.exchange_order_id.is_none() {
                    order.exchange_order_id = update.exchange_order_id.clone();
                }
                events.push(created_event(order, timestamp_ms));
            }

            order.executed_amount_base += update.fill_base_amount;
            order.executed_amount_quote += update.fill_quote_amount;

            events.push(MarketEvent::OrderFilled(OrderFilledEvent {
                timestamp_ms,
                client_order_id: order.client_order_id.clone(),
                trading_pair: order.trading_pair.clone(),
                trade_type: order.trade_type,
                order_type: order.order_type,
                price: update.fill_price,
                amount: update.fill_base_amount,
                trade_fee: update.fee.clone(),
                exchange_trade_id: update.trade_id.clone(),
            }));

            if order.executed_amount_base >= order.amount {
                order.state = OrderState::Filled;
                events.push(completed_event(order, timestamp_ms));
                info!(client_order_id = %order.client_order_id, "Order completely filled");
                let id = order.client_order_id.clone();
                orders.remove(&id);
            } else {
                order.state = OrderState::PartiallyFilled;
            }
        }
        for event in events {
            self.bus.trigger_event(event);
        }
    }

    /// Fail orders stuck in `PENDING_CREATE` longer than `max_age` seconds:
    /// their placement response never arrived and no venue state references
    /// them. Returns the failed client order ids.
    pub fn fail_stale_pending(&self, now: f64, max_age: f64) -> Vec<String> {
        let stale: Vec<String> = self
            .orders
            .read()
            .values()
            .filter(|order| {
                order.is_pending_create() && now - order.creation_timestamp > max_age
            })
            .map(|order| order.client_order_id.clone())
            .collect();
        for client_order_id in &stale {
            warn!(%client_order_id, "Placement response never arrived, failing order");
            self.process_order_update(OrderUpdate {
                client_order_id: client_order_id.clone(),
                exchange_order_id: None,
                new_state: OrderState::Failed,
                update_timestamp: now,
            });
        }
        stale
    }
}

fn reconciled_fill_fee() -> TradeFee {
    TradeFee {
        percent: Decimal::ZERO,
        percent_token: None,
        application: TradeFeePercentageApplication::DeductedFromReturns,
        fixed_fees: Vec::new(),
    }
}

fn created_event(order: &InFlightOrder, timestamp_ms: i64) -> MarketEvent {
    let payload = OrderCreatedEvent {
        timestamp_ms,
        order_type: order.order_type,
        trading_pair: order.trading_pair.clone(),
        amount: order.amount,
        price: order.price,
        client_order_id: order.client_order_id.clone(),
        exchange_order_id: order.exchange_order_id.clone(),
        leverage: order.leverage,
        position: order.position,
    };
    match order.trade_type {
        TradeType::Buy => MarketEvent::BuyOrderCreated(payload),
        TradeType::Sell => MarketEvent::SellOrderCreated(payload),
    }
}

fn completed_event(order: &InFlightOrder, timestamp_ms: i64) -> MarketEvent {
    let payload = OrderCompletedEvent {
        timestamp_ms,
        client_order_id: order.client_order_id.clone(),
        exchange_order_id: order.exchange_order_id.clone(),
        base_asset: order.trading_pair.base().to_string(),
        quote_asset: order.trading_pair.quote().to_string(),
        base_amount: order.executed_amount_base,
        quote_amount: order.executed_amount_quote,
        order_type: order.order_type,
    };
    match order.trade_type {
        TradeType::Buy => MarketEvent::BuyOrderCompleted(payload),
        TradeType::Sell => MarketEvent::SellOrderCompleted(payload),
    }
}
