//! Trade fee schemas and fee estimation.
//!
//! Each venue ships a default [`TradeFeeSchema`]; runtime overrides come
//! from the flat `{venue}_{parameter}` configuration map. The percent fee is
//! applied to cost for buys (unless the schema deducts buy fees from
//! returns) and to returns for sells; for perpetuals the open/close action
//! takes the role of the side.

use rust_decimal::Decimal;

use super::TradeType;
use crate::config::OverrideMap;
use crate::perpetual::PositionAction;

/// Where a percentage fee is charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeFeePercentageApplication {
    /// Added on top of the quote cost of the trade.
    AddedToCost,
    /// Deducted from the quote returns of the trade.
    DeductedFromReturns,
}

/// A flat fee in a specific asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedFee {
    pub asset: String,
    pub amount: Decimal,
}

/// A venue's advertised fee structure.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeFeeSchema {
    /// Maker fee as a decimal fraction (0.001 = 0.1%).
    pub maker_percent_fee: Decimal,
    /// Taker fee as a decimal fraction.
    pub taker_percent_fee: Decimal,
    /// Asset the percent fee is charged in, when not the quote asset.
    pub percent_fee_token: Option<String>,
    /// Venues that deduct buy fees from the received base amount.
    pub buy_percent_fee_deducted_from_returns: bool,
    pub maker_fixed_fees: Vec<FixedFee>,
    pub taker_fixed_fees: Vec<FixedFee>,
}

impl TradeFeeSchema {
    pub fn new(maker_percent_fee: Decimal, taker_percent_fee: Decimal) -> Self {
        Self {
            maker_percent_fee,
            taker_percent_fee,
            percent_fee_token: None,
            buy_percent_fee_deducted_from_returns: false,
            maker_fixed_fees: Vec::new(),
            taker_fixed_fees: Vec::new(),
        }
    }

    /// Apply `{venue}_{parameter}` overrides on top of this schema.
    pub fn with_overrides(mut self, venue: &str, overrides: &OverrideMap) -> Self {
        if let Some(pct) = overrides.decimal(&format!("{venue}_maker_percent_fee")) {
            self.maker_percent_fee = pct / Decimal::ONE_HUNDRED;
        }
        if let Some(pct) = overrides.decimal(&format!("{venue}_taker_percent_fee")) {
            self.taker_percent_fee = pct / Decimal::ONE_HUNDRED;
        }
        if let Some(token) = overrides.string(&format!("{venue}_percent_fee_token")) {
            self.percent_fee_token = Some(token);
        }
        if let Some(flag) =
            overrides.boolean(&format!("{venue}_buy_percent_fee_deducted_from_returns"))
        {
            self.buy_percent_fee_deducted_from_returns = flag;
        }
        self
    }
}

/// A fee computed for one prospective or executed trade.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeFee {
    pub percent: Decimal,
    pub percent_token: Option<String>,
    pub application: TradeFeePercentageApplication,
    pub fixed_fees: Vec<FixedFee>,
}

impl TradeFee {
    /// Percentage fee amount in quote units for a trade of `amount` at
    /// `price`, excluding fixed fees.
    pub fn fee_amount_in_quote(&self, amount: Decimal, price: Decimal) -> Decimal {
        amount * price * self.percent
    }
}

/// Build the fee for a spot trade.
pub fn build_trade_fee(
    venue: &str,
    schema: &TradeFeeSchema,
    overrides: &OverrideMap,
    is_maker: bool,
    trade_type: TradeType,
) -> TradeFee {
    let schema = schema.clone().with_overrides(venue, overrides);
    let application = percentage_application(&schema, trade_type == TradeType::Buy);
    assemble(schema, is_maker, application)
}

/// Build the fee for a perpetual trade; opening charges against cost,
/// closing against returns.
pub fn build_perpetual_trade_fee(
    venue: &str,
    schema: &TradeFeeSchema,
    overrides: &OverrideMap,
    is_maker: bool,
    position_action: PositionAction,
) -> TradeFee {
    let schema = schema.clone().with_overrides(venue, overrides);
    let application = percentage_application(&schema, position_action == PositionAction::Open);
    assemble(schema, is_maker, application)
}

fn percentage_application(
    schema: &TradeFeeSchema,
    charges_cost_side: bool,
) -> TradeFeePercentageApplication {
    // A dedicated fee token is always charged on top of the cost.
    if schema.percent_fee_token.is_some() {
        return TradeFeePercentageApplication::AddedToCost;
    }
    if charges_cost_side && !schema.buy_percent_fee_deducted_from_returns {
        TradeFeePercentageApplication::AddedToCost
    } else {
        TradeFeePercentageApplication::DeductedFromReturns
    }
}

fn assemble(
    schema: TradeFeeSchema,
    is_maker: bool,
    application: TradeFeePercentageApplication,
) -> TradeFee {
    TradeFee {
        percent: if is_maker {
            schema.maker_percent_fee
        } else {
            schema.taker_percent_fee
        },
        percent_token: schema.percent_fee_token,
        application,
        fixed_fees: if is_maker {
            schema.maker_fixed_fees
        } else {
            schema.taker_fixed_fees
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn schema() -> TradeFeeSchema {
        TradeFeeSchema::new(dec!(0.0002), dec!(0.0004))
    }

    #[test]
    fn buy_fee_is_added_to_cost_sell_deducted_from_returns() {
        let overrides = OverrideMap::default();
        let buy = build_trade_fee("venue", &schema(), &overrides, false, TradeType::Buy);
        assert_eq!(buy.application, TradeFeePercentageApplication::AddedToCost);
        assert_eq!(buy.percent, dec!(0.0004));

        let sell = build_trade_fee("venue", &schema(), &overrides, true, TradeType::Sell);
        assert_eq!(
            sell.application,
            TradeFeePercentageApplication::DeductedFromReturns
        );
        assert_eq!(sell.percent, dec!(0.0002));
    }

    #[test]
    fn schema_flag_moves_buy_fee_to_returns() {
        let mut schema = schema();
        schema.buy_percent_fee_deducted_from_returns = true;
        let overrides = OverrideMap::default();

        let buy = build_trade_fee("venue", &schema, &overrides, false, TradeType::Buy);
        assert_eq!(
            buy.application,
            TradeFeePercentageApplication::DeductedFromReturns
        );
    }

    #[test]
    fn overrides_replace_schema_percentages() {
        let mut overrides = OverrideMap::default();
        overrides.set("venue_maker_percent_fee", "0.05");

        let fee = build_trade_fee("venue", &schema(), &overrides, true, TradeType::Buy);
        assert_eq!(fee.percent, dec!(0.0005));

        // Overrides are keyed per venue.
        let other = build_trade_fee("other", &schema(), &overrides, true, TradeType::Buy);
        assert_eq!(other.percent, dec!(0.0002));
    }

    #[test]
    fn perpetual_open_charges_cost_close_charges_returns() {
        let overrides = OverrideMap::default();
        let open =
            build_perpetual_trade_fee("venue", &schema(), &overrides, false, PositionAction::Open);
        assert_eq!(open.application, TradeFeePercentageApplication::AddedToCost);

        let close =
            build_perpetual_trade_fee("venue", &schema(), &overrides, false, PositionAction::Close);
        assert_eq!(
            close.application,
            TradeFeePercentageApplication::DeductedFromReturns
        );
    }

    #[test]
    fn fee_amount_scales_with_notional() {
        let overrides = OverrideMap::default();
        let fee = build_trade_fee("venue", &schema(), &overrides, false, TradeType::Buy);
        assert_eq!(
            fee.fee_amount_in_quote(dec!(0.1), dec!(20000)),
            dec!(0.8000)
        );
    }
}
