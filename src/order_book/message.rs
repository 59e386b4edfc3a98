//! Normalized order book stream messages.
//!
//! Venue data sources translate their wire formats into these messages; the
//! tracker and the book only ever see this shape.

use rust_decimal::Decimal;

use crate::connector::pairs::TradingPair;

/// One price level in a snapshot or diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBookRow {
    pub price: Decimal,
    pub amount: Decimal,
}

impl OrderBookRow {
    pub fn new(price: Decimal, amount: Decimal) -> Self {
        Self { price, amount }
    }
}

#[derive(Debug, Clone)]
pub enum OrderBookMessage {
    /// Full book replacement with the venue's snapshot update id.
    Snapshot {
        trading_pair: TradingPair,
        update_id: u64,
        bids: Vec<OrderBookRow>,
        asks: Vec<OrderBookRow>,
        timestamp: f64,
    },
    /// Incremental update. `prev_update_id` carries the venue's continuity
    /// pointer when the stream provides one; a gap against the book's last
    /// applied id signals a discontinuity.
    Diff {
        trading_pair: TradingPair,
        update_id: u64,
        prev_update_id: Option<u64>,
        bids: Vec<OrderBookRow>,
        asks: Vec<OrderBookRow>,
        timestamp: f64,
    },
    /// A public trade print.
    Trade {
        trading_pair: TradingPair,
        trade_id: String,
        price: Decimal,
        amount: Decimal,
        timestamp: f64,
    },
}

impl OrderBookMessage {
    pub fn trading_pair(&self) -> &TradingPair {
        match self {
            Self::Snapshot { trading_pair, .. }
            | Self::Diff { trading_pair, .. }
            | Self::Trade { trading_pair, .. } => trading_pair,
        }
    }

    /// The update id for snapshots and diffs; trades have none.
    pub fn update_id(&self) -> Option<u64> {
        match self {
            Self::Snapshot { update_id, .. } | Self::Diff { update_id, .. } => Some(*update_id),
            Self::Trade { .. } => None,
        }
    }
}
