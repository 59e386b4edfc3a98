//! Order lifecycle tests: delta fills, dedupe, terminal event uniqueness.

mod support;

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crosswire::connector::fees::{TradeFee, TradeFeePercentageApplication};
use crosswire::connector::in_flight::{InFlightOrder, OrderState, OrderUpdate, TradeUpdate};
use crosswire::connector::pairs::TradingPair;
use crosswire::connector::tracker::OrderTracker;
use crosswire::connector::{OrderType, TradeType};
use crosswire::events::{EventBus, EventListener, MarketEvent, MarketEventTag};
use support::RecordingListener;

fn pair() -> TradingPair {
    TradingPair::new("BTC", "USDT")
}

fn no_fee() -> TradeFee {
    TradeFee {
        percent: Decimal::ZERO,
        percent_token: None,
        application: TradeFeePercentageApplication::DeductedFromReturns,
        fixed_fees: vec![],
    }
}

fn tracker_with_listener() -> (OrderTracker, Arc<RecordingListener>) {
    let bus = Arc::new(EventBus::new());
    let listener = RecordingListener::new();
    for tag in [
        MarketEventTag::BuyOrderCreated,
        MarketEventTag::SellOrderCreated,
        MarketEventTag::OrderFilled,
        MarketEventTag::BuyOrderCompleted,
        MarketEventTag::SellOrderCompleted,
        MarketEventTag::OrderCancelled,
        MarketEventTag::OrderFailure,
    ] {
        bus.add_listener(tag, &(listener.clone() as Arc<dyn EventListener>));
    }
    (OrderTracker::new(bus), listener)
}

fn buy_order(id: &str, amount: Decimal, price: Decimal) -> InFlightOrder {
    InFlightOrder::new(
        id,
        pair(),
        OrderType::Limit,
        TradeType::Buy,
        price,
        amount,
        1_700_000_000.0,
    )
}

fn open_update(id: &str, exchange_id: &str) -> OrderUpdate {
    OrderUpdate {
        client_order_id: id.into(),
        exchange_order_id: Some(exchange_id.into()),
        new_state: OrderState::Open,
        update_timestamp: 1_700_000_001.0,
    }
}

fn fill(id: &str, trade_id: &str, amount: Decimal, price: Decimal) -> TradeUpdate {
    TradeUpdate {
        trade_id: trade_id.into(),
        client_order_id: id.into(),
        exchange_order_id: Some("E-1".into()),
        trading_pair: pair(),
        fill_price: price,
        fill_base_amount: amount,
        fill_quote_amount: amount * price,
        fee: no_fee(),
        fill_timestamp: 1_700_000_002.0,
    }
}

#[test]
fn place_and_fill_emits_deltas_then_completion() {
    let (tracker, listener) = tracker_with_listener();
    tracker.start_tracking(buy_order("ord-1", dec!(0.1), dec!(20000)));
    tracker.process_order_update(open_update("ord-1", "E-1"));

    tracker.process_trade_update(fill("ord-1", "T1", dec!(0.04), dec!(20000)));
    tracker.process_trade_update(fill("ord-1", "T2", dec!(0.06), dec!(20000)));

    let events = listener.events();
    assert_eq!(events.len(), 4);

    match &events[0] {
        MarketEvent::BuyOrderCreated(created) => {
            assert_eq!(created.client_order_id, "ord-1");
            assert_eq!(created.exchange_order_id.as_deref(), Some("E-1"));
        }
        other => panic!("expected BuyOrderCreated, got {other:?}"),
    }
    match (&events[1], &events[2]) {
        (MarketEvent::OrderFilled(first), MarketEvent::OrderFilled(second)) => {
            // Fills carry the delta of each trade, never the cumulative.
            assert_eq!(first.amount, dec!(0.04));
            assert_eq!(second.amount, dec!(0.06));
            assert_eq!(first.exchange_trade_id, "T1");
            assert_eq!(second.exchange_trade_id, "T2");
        }
        other => panic!("expected two OrderFilled, got {other:?}"),
    }
    match &events[3] {
        MarketEvent::BuyOrderCompleted(completed) => {
            assert_eq!(completed.base_amount, dec!(0.10));
            assert_eq!(completed.quote_amount, dec!(2000.0));
            assert_eq!(completed.base_asset, "BTC");
            assert_eq!(completed.quote_asset, "USDT");
        }
        other => panic!("expected BuyOrderCompleted, got {other:?}"),
    }

    // Completed orders leave the in-flight book.
    assert!(tracker.get("ord-1").is_none());
}

#[test]
fn duplicate_trade_ids_deliver_exactly_once() {
    let (tracker, listener) = tracker_with_listener();
    tracker.start_tracking(buy_order("ord-1", dec!(0.1), dec!(20000)));
    tracker.process_order_update(open_update("ord-1", "E-1"));

    // The same fill arrives via the user stream and again via the trade
    // history poll.
    tracker.process_trade_update(fill("ord-1", "T1", dec!(0.04), dec!(20000)));
    tracker.process_trade_update(fill("ord-1", "T1", dec!(0.04), dec!(20000)));

    let fills = listener
        .events()
        .into_iter()
        .filter(|event| event.tag() == MarketEventTag::OrderFilled)
        .count();
    assert_eq!(fills, 1);

    let order = tracker.get("ord-1").unwrap();
    assert_eq!(order.executed_amount_base, dec!(0.04));
    assert_eq!(order.state, OrderState::PartiallyFilled);
}

#[test]
fn cancel_acknowledged_twice_emits_one_event() {
    let (tracker, listener) = tracker_with_listener();
    tracker.start_tracking(buy_order("ord-1", dec!(0.1), dec!(20000)));
    tracker.process_order_update(open_update("ord-1", "E-1"));

    let cancelled = OrderUpdate {
        client_order_id: "ord-1".into(),
        exchange_order_id: Some("E-1".into()),
        new_state: OrderState::Cancelled,
        update_timestamp: 1_700_000_003.0,
    };
    tracker.process_order_update(cancelled.clone());
    tracker.process_order_update(cancelled);

    let cancels = listener
        .events()
        .into_iter()
        .filter(|event| event.tag() == MarketEventTag::OrderCancelled)
        .count();
    assert_eq!(cancels, 1);
}

#[test]
fn event_stream_has_exactly_one_terminal_event() {
    let (tracker, listener) = tracker_with_listener();
    tracker.start_tracking(buy_order("ord-1", dec!(0.1), dec!(20000)));
    tracker.process_order_update(open_update("ord-1", "E-1"));
    tracker.process_trade_update(fill("ord-1", "T1", dec!(0.04), dec!(20000)));
    // Redundant status observations around the fill.
    tracker.process_order_update(OrderUpdate {
        client_order_id: "ord-1".into(),
        exchange_order_id: Some("E-1".into()),
        new_state: OrderState::PartiallyFilled,
        update_timestamp: 1_700_000_003.0,
    });
    tracker.process_trade_update(fill("ord-1", "T2", dec!(0.06), dec!(20000)));
    // A late FILLED status after completion must be absorbed.
    tracker.process_order_update(OrderUpdate {
        client_order_id: "ord-1".into(),
        exchange_order_id: Some("E-1".into()),
        new_state: OrderState::Filled,
        update_timestamp: 1_700_000_004.0,
    });

    let tags: Vec<MarketEventTag> = listener.events().iter().map(MarketEvent::tag).collect();
    assert_eq!(
        tags,
        vec![
            MarketEventTag::BuyOrderCreated,
            MarketEventTag::OrderFilled,
            MarketEventTag::OrderFilled,
            MarketEventTag::BuyOrderCompleted,
        ]
    );
}

#[test]
fn explicit_filled_status_emits_final_delta_and_trues_up_totals() {
    let (tracker, listener) = tracker_with_listener();
    tracker.start_tracking(buy_order("ord-1", dec!(0.1), dec!(20000)));
    tracker.process_order_update(open_update("ord-1", "E-1"));
    tracker.process_trade_update(fill("ord-1", "T1", dec!(0.04), dec!(20000)));

    // The status poll reports FILLED before the second fill ever arrives
    // through the trade paths.
    tracker.process_order_update(OrderUpdate {
        client_order_id: "ord-1".into(),
        exchange_order_id: Some("E-1".into()),
        new_state: OrderState::Filled,
        update_timestamp: 1_700_000_003.0,
    });

    let events = listener.events();
    let tags: Vec<MarketEventTag> = events.iter().map(MarketEvent::tag).collect();
    assert_eq!(
        tags,
        vec![
            MarketEventTag::BuyOrderCreated,
            MarketEventTag::OrderFilled,
            MarketEventTag::OrderFilled,
            MarketEventTag::BuyOrderCompleted,
        ]
    );

    // The reconciling fill carries the outstanding delta at the average
    // executed price.
    match &events[2] {
        MarketEvent::OrderFilled(delta) => {
            assert_eq!(delta.amount, dec!(0.06));
            assert_eq!(delta.price, dec!(20000));
        }
        other => panic!("expected OrderFilled, got {other:?}"),
    }
    // A FILLED order reports executed base equal to its amount.
    match &events[3] {
        MarketEvent::BuyOrderCompleted(completed) => {
            assert_eq!(completed.base_amount, dec!(0.1));
            assert_eq!(completed.quote_amount, dec!(2000));
        }
        other => panic!("expected BuyOrderCompleted, got {other:?}"),
    }
    assert!(tracker.get("ord-1").is_none());
}

#[test]
fn fill_before_ack_doubles_as_the_ack() {
    let (tracker, listener) = tracker_with_listener();
    tracker.start_tracking(buy_order("ord-1", dec!(0.1), dec!(20000)));

    tracker.process_trade_update(fill("ord-1", "T1", dec!(0.04), dec!(20000)));

    let tags: Vec<MarketEventTag> = listener.events().iter().map(MarketEvent::tag).collect();
    assert_eq!(
        tags,
        vec![MarketEventTag::BuyOrderCreated, MarketEventTag::OrderFilled]
    );
    assert_eq!(
        tracker.get("ord-1").unwrap().state,
        OrderState::PartiallyFilled
    );
}

#[test]
fn rejection_fails_without_created_event() {
    let (tracker, listener) = tracker_with_listener();
    tracker.start_tracking(buy_order("ord-1", dec!(0.1), dec!(20000)));

    tracker.process_order_update(OrderUpdate {
        client_order_id: "ord-1".into(),
        exchange_order_id: None,
        new_state: OrderState::Failed,
        update_timestamp: 1_700_000_001.0,
    });

    let tags: Vec<MarketEventTag> = listener.events().iter().map(MarketEvent::tag).collect();
    assert_eq!(tags, vec![MarketEventTag::OrderFailure]);
    assert!(tracker.get("ord-1").is_none());
}

#[test]
fn stale_pending_orders_are_failed_by_age() {
    let (tracker, listener) = tracker_with_listener();
    tracker.start_tracking(buy_order("old", dec!(0.1), dec!(20000)));
    let mut fresh = buy_order("fresh", dec!(0.1), dec!(20000));
    fresh.creation_timestamp = 1_700_000_100.0;
    tracker.start_tracking(fresh);

    let failed = tracker.fail_stale_pending(1_700_000_150.0, 120.0);
    assert_eq!(failed, vec!["old".to_string()]);
    assert!(tracker.get("old").is_none());
    assert!(tracker.get("fresh").is_some());
    assert_eq!(listener.len(), 1);
}

#[test]
fn tracking_states_round_trip_excludes_terminal_orders() {
    let (tracker, _listener) = tracker_with_listener();
    tracker.start_tracking(buy_order("live", dec!(0.1), dec!(20000)));
    tracker.process_order_update(open_update("live", "E-1"));
    tracker.process_trade_update(fill("live", "T1", dec!(0.04), dec!(20000)));

    tracker.start_tracking(buy_order("done", dec!(0.1), dec!(20000)));
    tracker.process_order_update(open_update("done", "E-2"));
    tracker.process_order_update(OrderUpdate {
        client_order_id: "done".into(),
        exchange_order_id: Some("E-2".into()),
        new_state: OrderState::Cancelled,
        update_timestamp: 1_700_000_005.0,
    });

    let states: HashMap<String, serde_json::Value> = tracker.tracking_states();
    assert!(states.contains_key("live"));
    assert!(!states.contains_key("done"));

    let (restored, listener) = tracker_with_listener();
    restored.restore_tracking_states(states);
    let order = restored.get("live").unwrap();
    assert_eq!(order.state, OrderState::PartiallyFilled);
    assert_eq!(order.executed_amount_base, dec!(0.04));

    // The restored order remembers delivered trades: no duplicate fill.
    restored.process_trade_update(fill("live", "T1", dec!(0.04), dec!(20000)));
    assert_eq!(listener.len(), 0);
}
