//! Funding information and funding payment bookkeeping.

use std::collections::HashMap;

use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::connector::pairs::TradingPair;

/// Funding state for one perpetual pair, refreshed by the periodic poll and
/// the mark-price stream.
#[derive(Debug, Clone, PartialEq)]
pub struct FundingInfo {
    pub trading_pair: TradingPair,
    pub index_price: Decimal,
    pub mark_price: Decimal,
    /// Next funding time, epoch seconds UTC.
    pub next_funding_utc_timestamp: i64,
    pub rate: Decimal,
}

/// Tracks the last seen funding payment per pair and decides when a payment
/// deserves a `FundingPaymentCompleted` event.
///
/// The first observation per pair only initializes the timestamp; after
/// that, an event fires when the venue reports a strictly newer timestamp
/// with a nonzero amount. Re-polling the same payment emits nothing.
#[derive(Default)]
pub struct FundingPaymentLog {
    last_timestamps: Mutex<HashMap<TradingPair, f64>>,
}

impl FundingPaymentLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observed payment. Returns `true` when the caller should
    /// emit the event: the timestamp advanced, the amount is nonzero, and
    /// `fire_event_on_new` is set (the initialization sweep passes `false`).
    pub fn register(
        &self,
        trading_pair: &TradingPair,
        timestamp: f64,
        amount: Decimal,
        fire_event_on_new: bool,
    ) -> bool {
        let mut timestamps = self.last_timestamps.lock();
        let previous = timestamps.get(trading_pair).copied().unwrap_or(0.0);
        let should_emit = fire_event_on_new && timestamp > previous && !amount.is_zero();
        if timestamp > previous {
            timestamps.insert(trading_pair.clone(), timestamp);
        }
        should_emit
    }

    pub fn clear(&self) {
        self.last_timestamps.lock().clear();
    }
}
