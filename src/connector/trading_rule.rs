//! Venue-advertised trading constraints and price/size quantization.

use rust_decimal::Decimal;

use super::pairs::TradingPair;

/// Constraints for one trading pair, refreshed periodically from the venue's
/// exchange-info endpoint (default every 60s). Immutable between refreshes.
#[derive(Debug, Clone, PartialEq)]
pub struct TradingRule {
    pub trading_pair: TradingPair,
    pub min_order_size: Decimal,
    pub max_order_size: Decimal,
    /// Price tick: the minimum price increment.
    pub min_price_increment: Decimal,
    /// Size step: the minimum base amount increment.
    pub min_base_amount_increment: Decimal,
    /// Minimum order value in quote units.
    pub min_notional_size: Decimal,
    pub supports_market_orders: bool,
}

impl TradingRule {
    /// A permissive rule; venue parsers override the fields they know.
    pub fn new(trading_pair: TradingPair) -> Self {
        Self {
            trading_pair,
            min_order_size: Decimal::ZERO,
            max_order_size: Decimal::MAX,
            min_price_increment: Decimal::new(1, 8),
            min_base_amount_increment: Decimal::new(1, 8),
            min_notional_size: Decimal::ZERO,
            supports_market_orders: true,
        }
    }

    /// Snap `price` down onto the price tick grid.
    pub fn quantize_price(&self, price: Decimal) -> Decimal {
        quantize(price, self.min_price_increment)
    }

    /// Snap `amount` down onto the size step grid.
    pub fn quantize_amount(&self, amount: Decimal) -> Decimal {
        quantize(amount, self.min_base_amount_increment)
    }
}

fn quantize(value: Decimal, increment: Decimal) -> Decimal {
    if increment.is_zero() {
        return value;
    }
    (value / increment).floor() * increment
}
