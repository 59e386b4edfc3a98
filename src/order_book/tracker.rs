//! Order book tracking: routing, replay buffering and per-pair book upkeep.
//!
//! One tracker per venue. It consumes the venue data source's message stream
//! through a router task, maintains one [`OrderBook`] per tracked pair
//! (mutated only by that pair's task, so books are single-writer by
//! construction), and periodically re-fetches snapshots to bound drift.
//! Books are handed out read-only behind `Arc<RwLock<_>>`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::book::OrderBook;
use super::data_source::OrderBookDataSource;
use super::message::{OrderBookMessage, OrderBookRow};
use crate::connector::pairs::TradingPair;

/// Diffs buffered for a pair whose first snapshot has not arrived yet.
const REPLAY_BUFFER_SIZE: usize = 1000;
/// Recent diffs kept for snapshot-merge replay.
const PAST_DIFF_WINDOW_SIZE: usize = 32;
/// Cadence of the full snapshot re-sync, aligned to the clock hour.
const SNAPSHOT_INTERVAL: f64 = 3600.0;
const ERROR_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct OrderBookTracker {
    data_source: Arc<dyn OrderBookDataSource>,
    trading_pairs: Vec<TradingPair>,
    books: Arc<DashMap<TradingPair, Arc<RwLock<OrderBook>>>>,
    pair_txs: Arc<DashMap<TradingPair, mpsc::UnboundedSender<OrderBookMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OrderBookTracker {
    pub fn new(data_source: Arc<dyn OrderBookDataSource>, trading_pairs: Vec<TradingPair>) -> Self {
        Self {
            data_source,
            trading_pairs,
            books: Arc::new(DashMap::new()),
            pair_txs: Arc::new(DashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Launch the stream listener, the router, one task per tracked pair and
    /// the periodic snapshot loop. Idempotent: an already-running tracker is
    /// stopped first.
    pub fn start(&self) {
        self.stop();

        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let mut tasks = self.tasks.lock();

        for trading_pair in &self.trading_pairs {
            let book = Arc::new(RwLock::new(OrderBook::new()));
            self.books.insert(trading_pair.clone(), book.clone());

            let (pair_tx, pair_rx) = mpsc::unbounded_channel();
            self.pair_txs.insert(trading_pair.clone(), pair_tx);

            let data_source = self.data_source.clone();
            let pair = trading_pair.clone();
            tasks.push(tokio::spawn(async move {
                track_single_book(pair, book, pair_rx, data_source).await;
            }));
        }

        let data_source = self.data_source.clone();
        tasks.push(tokio::spawn(async move {
            data_source.listen(stream_tx).await;
        }));

        let pair_txs = self.pair_txs.clone();
        tasks.push(tokio::spawn(async move {
            route_messages(stream_rx, pair_txs).await;
        }));

        let data_source = self.data_source.clone();
        let trading_pairs = self.trading_pairs.clone();
        let pair_txs = self.pair_txs.clone();
        tasks.push(tokio::spawn(async move {
            snapshot_loop(data_source, trading_pairs, pair_txs).await;
        }));
    }

    /// Cancel every task and drop the books.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.books.clear();
        self.pair_txs.clear();
    }

    /// True once every tracked pair has applied its first snapshot.
    pub fn ready(&self) -> bool {
        !self.trading_pairs.is_empty()
            && self.trading_pairs.iter().all(|pair| {
                self.books
                    .get(pair)
                    .map(|book| book.read().is_initialized())
                    .unwrap_or(false)
            })
    }

    pub fn order_book(&self, trading_pair: &TradingPair) -> Option<Arc<RwLock<OrderBook>>> {
        self.books
            .get(trading_pair)
            .map(|entry| entry.value().clone())
    }

    pub fn order_books(&self) -> Vec<(TradingPair, Arc<RwLock<OrderBook>>)> {
        self.books
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn trading_pairs(&self) -> &[TradingPair] {
        &self.trading_pairs
    }

    pub fn data_source(&self) -> &Arc<dyn OrderBookDataSource> {
        &self.data_source
    }
}

impl Drop for OrderBookTracker {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn route_messages(
    mut stream_rx: mpsc::UnboundedReceiver<OrderBookMessage>,
    pair_txs: Arc<DashMap<TradingPair, mpsc::UnboundedSender<OrderBookMessage>>>,
) {
    while let Some(message) = stream_rx.recv().await {
        match pair_txs.get(message.trading_pair()) {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => {
                debug!(pair = %message.trading_pair(), "Dropping message for untracked pair");
            }
        }
    }
}

async fn snapshot_loop(
    data_source: Arc<dyn OrderBookDataSource>,
    trading_pairs: Vec<TradingPair>,
    pair_txs: Arc<DashMap<TradingPair, mpsc::UnboundedSender<OrderBookMessage>>>,
) {
    loop {
        let now = unix_time_now();
        let delta = SNAPSHOT_INTERVAL - now % SNAPSHOT_INTERVAL;
        tokio::time::sleep(Duration::from_secs_f64(delta)).await;

        for trading_pair in &trading_pairs {
            match data_source.fetch_snapshot(trading_pair).await {
                Ok(snapshot) => {
                    if let Some(tx) = pair_txs.get(trading_pair) {
                        let _ = tx.send(snapshot);
                    }
                    debug!(pair = %trading_pair, "Fetched periodic order book snapshot");
                }
                Err(e) => {
                    warn!(pair = %trading_pair, error = %e, "Periodic snapshot fetch failed");
                    tokio::time::sleep(ERROR_RETRY_DELAY).await;
                }
            }
        }
    }
}

async fn track_single_book(
    trading_pair: TradingPair,
    book: Arc<RwLock<OrderBook>>,
    mut pair_rx: mpsc::UnboundedReceiver<OrderBookMessage>,
    data_source: Arc<dyn OrderBookDataSource>,
) {
    // Diffs that arrive before the first snapshot; bounded, oldest dropped.
    let mut replay: VecDeque<OrderBookMessage> = VecDeque::with_capacity(REPLAY_BUFFER_SIZE);
    let mut past_diffs: VecDeque<(Vec<OrderBookRow>, Vec<OrderBookRow>, u64)> =
        VecDeque::with_capacity(PAST_DIFF_WINDOW_SIZE);

    // Bootstrap: fetch the initial snapshot while buffering early diffs.
    'bootstrap: loop {
        let fetch = data_source.fetch_snapshot(&trading_pair);
        tokio::pin!(fetch);
        loop {
            tokio::select! {
                maybe = pair_rx.recv() => {
                    let Some(message) = maybe else { return };
                    if replay.len() == REPLAY_BUFFER_SIZE {
                        replay.pop_front();
                    }
                    replay.push_back(message);
                }
                result = &mut fetch => {
                    match result {
                        Ok(OrderBookMessage::Snapshot { bids, asks, update_id, .. }) => {
                            book.write().apply_snapshot(&bids, &asks, update_id);
                            info!(pair = %trading_pair, update_id, "Initialized order book");
                            break 'bootstrap;
                        }
                        Ok(_) => {
                            warn!(pair = %trading_pair, "Snapshot fetch returned a non-snapshot message");
                        }
                        Err(e) => {
                            warn!(pair = %trading_pair, error = %e, "Initial snapshot fetch failed, retrying");
                        }
                    }
                    tokio::time::sleep(ERROR_RETRY_DELAY).await;
                    continue 'bootstrap;
                }
            }
        }
    }

    // Drain the replay buffer: the update-id guard drops everything the
    // snapshot already covers.
    for message in replay.drain(..) {
        apply_message(&trading_pair, &book, &mut past_diffs, message, &data_source).await;
    }

    while let Some(message) = pair_rx.recv().await {
        apply_message(&trading_pair, &book, &mut past_diffs, message, &data_source).await;
    }
}

async fn apply_message(
    trading_pair: &TradingPair,
    book: &Arc<RwLock<OrderBook>>,
    past_diffs: &mut VecDeque<(Vec<OrderBookRow>, Vec<OrderBookRow>, u64)>,
    message: OrderBookMessage,
    data_source: &Arc<dyn OrderBookDataSource>,
) {
    match message {
        OrderBookMessage::Diff {
            bids,
            asks,
            update_id,
            prev_update_id,
            ..
        } => {
            let discontinuity = {
                let book = book.read();
                matches!(prev_update_id, Some(prev) if prev > book.last_diff_uid())
            };
            if discontinuity {
                warn!(
                    pair = %trading_pair,
                    update_id,
                    "Update id gap detected, restoring book from snapshot"
                );
                resync_book(trading_pair, book, data_source).await;
                past_diffs.clear();
            }
            let applied = book.write().apply_diff(&bids, &asks, update_id);
            if applied {
                if past_diffs.len() == PAST_DIFF_WINDOW_SIZE {
                    past_diffs.pop_front();
                }
                past_diffs.push_back((bids, asks, update_id));
            }
        }
        OrderBookMessage::Snapshot {
            bids,
            asks,
            update_id,
            ..
        } => {
            let diffs: Vec<_> = past_diffs.iter().cloned().collect();
            book.write()
                .restore_from_snapshot_and_diffs(&bids, &asks, update_id, &diffs);
            debug!(pair = %trading_pair, update_id, "Merged periodic snapshot");
        }
        OrderBookMessage::Trade { price, .. } => {
            book.write().set_last_trade_price(price);
        }
    }
}

async fn resync_book(
    trading_pair: &TradingPair,
    book: &Arc<RwLock<OrderBook>>,
    data_source: &Arc<dyn OrderBookDataSource>,
) {
    loop {
        match data_source.fetch_snapshot(trading_pair).await {
            Ok(OrderBookMessage::Snapshot {
                bids,
                asks,
                update_id,
                ..
            }) => {
                book.write().apply_snapshot(&bids, &asks, update_id);
                info!(pair = %trading_pair, update_id, "Order book restored from snapshot");
                return;
            }
            Ok(_) => {
                warn!(pair = %trading_pair, "Snapshot fetch returned a non-snapshot message");
            }
            Err(e) => {
                warn!(pair = %trading_pair, error = %e, "Snapshot restore failed, retrying");
            }
        }
        tokio::time::sleep(ERROR_RETRY_DELAY).await;
    }
}

fn unix_time_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}
