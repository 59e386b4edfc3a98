//! Client order id minting.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use super::pairs::TradingPair;

/// Mint a fresh client order id: venue prefix, side marker, a base/quote
/// hint and a time-plus-entropy nonce, truncated to the venue's maximum
/// length. Ids are unique in practice (microsecond clock plus 16 random
/// bits) and keep a stable prefix so the venue can attribute flow.
pub fn new_client_order_id(
    is_buy: bool,
    trading_pair: &TradingPair,
    prefix: &str,
    max_length: usize,
) -> String {
    let side = if is_buy { 'B' } else { 'S' };
    let base_hint: String = trading_pair.base().chars().take(3).collect();
    let quote_hint: String = trading_pair.quote().chars().take(3).collect();
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_micros();
    let entropy: u16 = rand::thread_rng().gen();

    let mut id = format!("{prefix}{side}{base_hint}{quote_hint}{micros:x}{entropy:04x}");
    id.truncate(max_length);
    id
}
