//! In-memory order book for a single trading pair.
//!
//! Each side is a sorted `Vec` of price levels (bids descending, asks
//! ascending) with binary-search upserts: fast for frequent small diffs and
//! small enough (tens to hundreds of levels) that removals stay cheap.
//! Best bid/ask are the first elements, so top-of-book lookups are O(1).

use rust_decimal::Decimal;

use super::message::OrderBookRow;

/// One side of the book. Rows carry the update id that last touched the
/// level.
#[derive(Debug, Clone)]
pub struct OrderBookSide {
    levels: Vec<(Decimal, Decimal, u64)>,
    is_bid: bool,
}

impl OrderBookSide {
    fn new(is_bid: bool) -> Self {
        Self {
            levels: Vec::with_capacity(64),
            is_bid,
        }
    }

    fn replace(&mut self, rows: &[OrderBookRow], update_id: u64) {
        self.levels.clear();
        self.levels.reserve(rows.len());
        for row in rows {
            if row.amount > Decimal::ZERO {
                self.levels.push((row.price, row.amount, update_id));
            }
        }
        if self.is_bid {
            self.levels.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        } else {
            self.levels.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        }
    }

    /// Upsert one level; a zero amount removes it.
    fn apply(&mut self, price: Decimal, amount: Decimal, update_id: u64) {
        let search = self.levels.binary_search_by(|(p, _, _)| {
            if self.is_bid {
                p.cmp(&price).reverse()
            } else {
                p.cmp(&price)
            }
        });
        match search {
            Ok(idx) => {
                if amount.is_zero() {
                    self.levels.remove(idx);
                } else {
                    self.levels[idx] = (price, amount, update_id);
                }
            }
            Err(idx) => {
                if !amount.is_zero() {
                    self.levels.insert(idx, (price, amount, update_id));
                }
            }
        }
    }

    /// Best level: highest bid or lowest ask.
    pub fn best(&self) -> Option<(Decimal, Decimal)> {
        self.levels.first().map(|(p, a, _)| (*p, *a))
    }

    pub fn levels(&self) -> &[(Decimal, Decimal, u64)] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct OrderBook {
    bids: OrderBookSide,
    asks: OrderBookSide,
    snapshot_uid: u64,
    last_diff_uid: u64,
    last_trade_price: Option<Decimal>,
}

impl Default for OrderBook {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderBook {
    pub fn new() -> Self {
        Self {
            bids: OrderBookSide::new(true),
            asks: OrderBookSide::new(false),
            snapshot_uid: 0,
            last_diff_uid: 0,
            last_trade_price: None,
        }
    }

    /// Update id of the last full snapshot applied.
    pub fn snapshot_uid(&self) -> u64 {
        self.snapshot_uid
    }

    /// Update id of the last applied message (diff or snapshot).
    pub fn last_diff_uid(&self) -> u64 {
        self.last_diff_uid
    }

    pub fn last_trade_price(&self) -> Option<Decimal> {
        self.last_trade_price
    }

    pub fn set_last_trade_price(&mut self, price: Decimal) {
        self.last_trade_price = Some(price);
    }

    /// Whether a snapshot has been applied yet.
    pub fn is_initialized(&self) -> bool {
        self.snapshot_uid > 0
    }

    /// Replace the whole book. `snapshot_uid` and `last_diff_uid` both become
    /// `update_id`; every diff at or below it is already reflected.
    pub fn apply_snapshot(&mut self, bids: &[OrderBookRow], asks: &[OrderBookRow], update_id: u64) {
        self.bids.replace(bids, update_id);
        self.asks.replace(asks, update_id);
        self.snapshot_uid = update_id;
        self.last_diff_uid = update_id;
    }

    /// Apply an incremental update. Returns `false` (leaving the book
    /// untouched) for diffs at or below the last applied id, which makes
    /// replayed or reordered diffs harmless.
    pub fn apply_diff(
        &mut self,
        bids: &[OrderBookRow],
        asks: &[OrderBookRow],
        update_id: u64,
    ) -> bool {
        if update_id <= self.last_diff_uid {
            return false;
        }
        for row in bids {
            self.bids.apply(row.price, row.amount, update_id);
        }
        for row in asks {
            self.asks.apply(row.price, row.amount, update_id);
        }
        self.last_diff_uid = update_id;
        true
    }

    /// Rebuild from a snapshot plus a window of recent diffs, replaying only
    /// the diffs newer than the snapshot. Used for the periodic re-sync.
    pub fn restore_from_snapshot_and_diffs(
        &mut self,
        snapshot_bids: &[OrderBookRow],
        snapshot_asks: &[OrderBookRow],
        snapshot_update_id: u64,
        diffs: &[(Vec<OrderBookRow>, Vec<OrderBookRow>, u64)],
    ) {
        self.apply_snapshot(snapshot_bids, snapshot_asks, snapshot_update_id);
        for (bids, asks, update_id) in diffs {
            self.apply_diff(bids, asks, *update_id);
        }
    }

    pub fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        self.bids.best()
    }

    pub fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        self.asks.best()
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => Some(ask - bid),
            _ => None,
        }
    }

    pub fn bids(&self) -> &OrderBookSide {
        &self.bids
    }

    pub fn asks(&self) -> &OrderBookSide {
        &self.asks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn rows(levels: &[(&str, &str)]) -> Vec<OrderBookRow> {
        levels
            .iter()
            .map(|(p, a)| OrderBookRow::new(p.parse().unwrap(), a.parse().unwrap()))
            .collect()
    }

    #[test]
    fn snapshot_sorts_sides_and_sets_ids() {
        let mut book = OrderBook::new();
        book.apply_snapshot(
            &rows(&[("100", "1"), ("102", "2"), ("101", "3")]),
            &rows(&[("105", "1"), ("103", "2"), ("104", "3")]),
            42,
        );

        assert_eq!(book.snapshot_uid(), 42);
        assert_eq!(book.last_diff_uid(), 42);
        assert_eq!(book.best_bid(), Some((dec!(102), dec!(2))));
        assert_eq!(book.best_ask(), Some((dec!(103), dec!(2))));
        assert_eq!(book.mid_price(), Some(dec!(102.5)));
        assert_eq!(book.spread(), Some(dec!(1)));
    }

    #[test]
    fn diff_upserts_and_zero_removes() {
        let mut book = OrderBook::new();
        book.apply_snapshot(&rows(&[("100", "1")]), &rows(&[("101", "1")]), 1);

        assert!(book.apply_diff(&rows(&[("100.5", "2")]), &[], 2));
        assert_eq!(book.best_bid(), Some((dec!(100.5), dec!(2))));

        assert!(book.apply_diff(&rows(&[("100.5", "0")]), &[], 3));
        assert_eq!(book.best_bid(), Some((dec!(100), dec!(1))));
        assert_eq!(book.last_diff_uid(), 3);
    }

    #[test]
    fn stale_diffs_are_ignored() {
        let mut book = OrderBook::new();
        book.apply_snapshot(&rows(&[("100", "1")]), &rows(&[("101", "1")]), 102);

        // Anything at or below the snapshot uid is already reflected.
        assert!(!book.apply_diff(&rows(&[("90", "5")]), &[], 100));
        assert!(!book.apply_diff(&rows(&[("90", "5")]), &[], 102));
        assert_eq!(book.best_bid(), Some((dec!(100), dec!(1))));

        assert!(book.apply_diff(&rows(&[("100.2", "1")]), &[], 103));
        assert_eq!(book.best_bid(), Some((dec!(100.2), dec!(1))));
    }

    #[test]
    fn snapshot_then_stale_diffs_equals_snapshot_alone() {
        let mut with_replay = OrderBook::new();
        with_replay.apply_snapshot(&rows(&[("100", "1")]), &rows(&[("101", "1")]), 10);
        with_replay.apply_diff(&rows(&[("99", "4")]), &[], 8);
        with_replay.apply_diff(&[], &rows(&[("104", "4")]), 10);

        let mut snapshot_only = OrderBook::new();
        snapshot_only.apply_snapshot(&rows(&[("100", "1")]), &rows(&[("101", "1")]), 10);

        assert_eq!(
            with_replay.bids().levels(),
            snapshot_only.bids().levels()
        );
        assert_eq!(
            with_replay.asks().levels(),
            snapshot_only.asks().levels()
        );
    }

    #[test]
    fn restore_replays_only_newer_diffs() {
        let mut book = OrderBook::new();
        book.apply_snapshot(&rows(&[("100", "1")]), &rows(&[("101", "1")]), 5);
        book.apply_diff(&rows(&[("100.1", "1")]), &[], 6);

        let diffs = vec![
            (rows(&[("99", "9")]), vec![], 4u64),
            (rows(&[("100.2", "2")]), vec![], 8u64),
        ];
        book.restore_from_snapshot_and_diffs(
            &rows(&[("100", "3")]),
            &rows(&[("101", "3")]),
            7,
            &diffs,
        );

        assert_eq!(book.snapshot_uid(), 7);
        assert_eq!(book.last_diff_uid(), 8);
        assert_eq!(book.best_bid(), Some((dec!(100.2), dec!(2))));
        // The stale pre-snapshot diff left no trace.
        assert!(!book.bids().levels().iter().any(|(p, _, _)| *p == dec!(99)));
    }

    #[test]
    fn best_bid_stays_below_best_ask() {
        let mut book = OrderBook::new();
        book.apply_snapshot(
            &rows(&[("100", "1"), ("99", "2")]),
            &rows(&[("101", "1"), ("102", "2")]),
            1,
        );
        book.apply_diff(&rows(&[("100.5", "1")]), &rows(&[("100.9", "1")]), 2);

        let (bid, _) = book.best_bid().unwrap();
        let (ask, _) = book.best_ask().unwrap();
        assert!(bid < ask);
    }
}
