//! Perpetual position book entries.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::connector::pairs::TradingPair;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
    /// One-way mode positions that net longs and shorts together.
    Both,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
            Self::Both => "BOTH",
        }
    }
}

/// An open perpetual position. Mutated only by position-update events from
/// the status poll and the private stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub trading_pair: TradingPair,
    pub position_side: PositionSide,
    pub unrealized_pnl: Decimal,
    pub entry_price: Decimal,
    /// Signed base amount: negative for shorts in one-way mode.
    pub amount: Decimal,
    pub leverage: Decimal,
}

impl Position {
    /// The key positions are stored under: one entry per pair and side.
    pub fn key(trading_pair: &TradingPair, side: PositionSide) -> String {
        format!("{trading_pair}{}", side.as_str())
    }
}
