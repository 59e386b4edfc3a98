//! Canonical trading pairs and venue symbol mapping.
//!
//! The canonical form everywhere in the crate is `BASE-QUOTE` uppercase.
//! Each venue keeps a bidirectional [`TradingPairRegistry`] between the
//! canonical form and its native symbol (`BTCUSDT`, `BTC_USDT`, ...); the
//! mapping is 1:1 for active markets.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TradingPair {
    base: String,
    quote: String,
}

impl TradingPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
        }
    }

    /// Parse the canonical `BASE-QUOTE` form.
    pub fn parse(s: &str) -> Result<Self> {
        let (base, quote) = s
            .split_once('-')
            .ok_or_else(|| Error::UnknownSymbol(s.to_string()))?;
        if base.is_empty() || quote.is_empty() {
            return Err(Error::UnknownSymbol(s.to_string()));
        }
        Ok(Self::new(base, quote))
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }
}

impl fmt::Display for TradingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}

impl TryFrom<String> for TradingPair {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TradingPair> for String {
    fn from(pair: TradingPair) -> Self {
        pair.to_string()
    }
}

/// Bidirectional map between venue symbols and canonical pairs.
///
/// Rebuildable on demand from the venue's exchange-info endpoint; the
/// connector owns one instance and refreshes it together with trading rules.
#[derive(Debug, Default)]
pub struct TradingPairRegistry {
    by_symbol: HashMap<String, TradingPair>,
    by_pair: HashMap<TradingPair, String>,
}

impl TradingPairRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a symbol <-> pair mapping.
    ///
    /// A conflicting entry for an already-mapped symbol or pair is skipped
    /// with a warning so the 1:1 invariant holds.
    pub fn insert(&mut self, symbol: impl Into<String>, pair: TradingPair) {
        let symbol = symbol.into();
        let conflicting_symbol = self
            .by_symbol
            .get(&symbol)
            .map(|existing| existing != &pair)
            .unwrap_or(false);
        let conflicting_pair = self
            .by_pair
            .get(&pair)
            .map(|existing| existing != &symbol)
            .unwrap_or(false);
        if conflicting_symbol || conflicting_pair {
            warn!(%symbol, %pair, "Conflicting trading pair mapping, keeping the existing entry");
            return;
        }
        self.by_symbol.insert(symbol.clone(), pair.clone());
        self.by_pair.insert(pair, symbol);
    }

    pub fn pair_for_symbol(&self, symbol: &str) -> Result<TradingPair> {
        self.by_symbol
            .get(symbol)
            .cloned()
            .ok_or_else(|| Error::UnknownSymbol(symbol.to_string()))
    }

    pub fn symbol_for_pair(&self, pair: &TradingPair) -> Result<String> {
        self.by_pair
            .get(pair)
            .cloned()
            .ok_or_else(|| Error::UnknownSymbol(pair.to_string()))
    }

    pub fn pairs(&self) -> Vec<TradingPair> {
        self.by_pair.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_symbol.len()
    }

    pub fn clear(&mut self) {
        self.by_symbol.clear();
        self.by_pair.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let pair = TradingPair::parse("btc-usdt").unwrap();
        assert_eq!(pair.base(), "BTC");
        assert_eq!(pair.quote(), "USDT");
        assert_eq!(pair.to_string(), "BTC-USDT");
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(TradingPair::parse("BTCUSDT").is_err());
        assert!(TradingPair::parse("-USDT").is_err());
        assert!(TradingPair::parse("BTC-").is_err());
    }

    #[test]
    fn registry_maps_both_directions() {
        let mut registry = TradingPairRegistry::new();
        registry.insert("BTCUSDT", TradingPair::new("BTC", "USDT"));

        assert_eq!(
            registry.pair_for_symbol("BTCUSDT").unwrap(),
            TradingPair::new("BTC", "USDT")
        );
        assert_eq!(
            registry
                .symbol_for_pair(&TradingPair::new("BTC", "USDT"))
                .unwrap(),
            "BTCUSDT"
        );
        assert!(registry.pair_for_symbol("ETHUSDT").is_err());
    }

    #[test]
    fn conflicting_mapping_is_skipped() {
        let mut registry = TradingPairRegistry::new();
        registry.insert("BTCUSDT", TradingPair::new("BTC", "USDT"));
        registry.insert("BTCUSDT", TradingPair::new("XBT", "USDT"));

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.pair_for_symbol("BTCUSDT").unwrap(),
            TradingPair::new("BTC", "USDT")
        );
    }

    #[test]
    fn reinserting_same_mapping_is_idempotent() {
        let mut registry = TradingPairRegistry::new();
        registry.insert("BTCUSDT", TradingPair::new("BTC", "USDT"));
        registry.insert("BTCUSDT", TradingPair::new("BTC", "USDT"));
        assert_eq!(registry.len(), 1);
    }
}
