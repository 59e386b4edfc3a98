//! Perpetual-derivative trading state and connector extension.

mod funding;
mod position;

pub use funding::{FundingInfo, FundingPaymentLog};
pub use position::{Position, PositionSide};

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::connector::pairs::TradingPair;
use crate::connector::Connector;

/// Whether an order opens or closes a perpetual position. Spot orders carry
/// [`PositionAction::Nil`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PositionAction {
    Open,
    Close,
    #[default]
    Nil,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PositionMode {
    /// A single net position per pair.
    OneWay,
    /// Independent long and short positions per pair.
    Hedge,
}

/// Shared perpetual state: the position book, the leverage table, funding
/// info per pair and the funding payment log. Connectors own one instance
/// and mutate it from their polling loops and private stream listener.
pub struct PerpetualTrading {
    positions: RwLock<HashMap<String, Position>>,
    leverage: RwLock<HashMap<TradingPair, u32>>,
    position_mode: RwLock<PositionMode>,
    funding_info: RwLock<HashMap<TradingPair, FundingInfo>>,
    funding_payments: FundingPaymentLog,
}

impl Default for PerpetualTrading {
    fn default() -> Self {
        Self::new()
    }
}

impl PerpetualTrading {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            leverage: RwLock::new(HashMap::new()),
            position_mode: RwLock::new(PositionMode::OneWay),
            funding_info: RwLock::new(HashMap::new()),
            funding_payments: FundingPaymentLog::new(),
        }
    }

    pub fn positions(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    pub fn position(&self, trading_pair: &TradingPair, side: PositionSide) -> Option<Position> {
        self.positions
            .read()
            .get(&Position::key(trading_pair, side))
            .cloned()
    }

    /// Upsert a position; a zero amount removes the entry.
    pub fn update_position(&self, position: Position) {
        let key = Position::key(&position.trading_pair, position.position_side);
        let mut positions = self.positions.write();
        if position.amount.is_zero() {
            positions.remove(&key);
        } else {
            positions.insert(key, position);
        }
    }

    pub fn leverage(&self, trading_pair: &TradingPair) -> u32 {
        self.leverage.read().get(trading_pair).copied().unwrap_or(1)
    }

    pub fn set_leverage(&self, trading_pair: &TradingPair, leverage: u32) {
        self.leverage.write().insert(trading_pair.clone(), leverage);
    }

    pub fn position_mode(&self) -> PositionMode {
        *self.position_mode.read()
    }

    pub fn set_position_mode(&self, mode: PositionMode) {
        *self.position_mode.write() = mode;
    }

    pub fn funding_info(&self, trading_pair: &TradingPair) -> Option<FundingInfo> {
        self.funding_info.read().get(trading_pair).cloned()
    }

    pub fn update_funding_info(&self, info: FundingInfo) {
        self.funding_info
            .write()
            .insert(info.trading_pair.clone(), info);
    }

    /// Whether funding info has loaded for every pair in `trading_pairs`.
    pub fn is_funding_info_initialized(&self, trading_pairs: &[TradingPair]) -> bool {
        let funding_info = self.funding_info.read();
        trading_pairs
            .iter()
            .all(|pair| funding_info.contains_key(pair))
    }

    pub fn funding_payments(&self) -> &FundingPaymentLog {
        &self.funding_payments
    }

    /// Drop all state; called by `stop_network`.
    pub fn clear(&self) {
        self.positions.write().clear();
        self.funding_info.write().clear();
        self.funding_payments.clear();
    }
}

/// Perpetual-only connector surface on top of [`Connector`].
pub trait PerpetualConnector: Connector {
    fn positions(&self) -> Vec<Position>;

    fn position_mode(&self) -> PositionMode;

    /// Request a venue-side position mode change. Fire-and-forget; outcome
    /// arrives as `PositionModeChangeSucceeded`/`Failed` events per pair.
    fn set_position_mode(&self, mode: PositionMode);

    fn supported_position_modes(&self) -> Vec<PositionMode>;

    fn get_leverage(&self, trading_pair: &TradingPair) -> u32;

    /// Request a venue-side leverage change, fire-and-forget.
    fn set_leverage(&self, trading_pair: &TradingPair, leverage: u32);

    fn get_funding_info(&self, trading_pair: &TradingPair) -> Option<FundingInfo>;

    /// Cadence of the funding payment poll in seconds; defaults to the
    /// venue's funding interval.
    fn funding_fee_poll_interval(&self) -> f64;

    /// Collateral asset charged when buying `trading_pair`.
    fn buy_collateral_token(&self, trading_pair: &TradingPair) -> String;

    /// Collateral asset charged when selling `trading_pair`.
    fn sell_collateral_token(&self, trading_pair: &TradingPair) -> String;
}
