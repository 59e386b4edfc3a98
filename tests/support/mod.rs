//! Shared test doubles.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Semaphore};

use crosswire::connector::pairs::TradingPair;
use crosswire::error::{Error, Result};
use crosswire::events::{EventListener, MarketEvent};
use crosswire::order_book::{OrderBookDataSource, OrderBookMessage};

/// Order book data source driven entirely by the test: snapshots are served
/// from a queue gated by a semaphore, stream messages are pushed through a
/// channel held by the test.
pub struct ScriptedBookSource {
    snapshots: Mutex<VecDeque<OrderBookMessage>>,
    snapshot_gate: Semaphore,
    snapshot_calls: AtomicUsize,
    stream_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<OrderBookMessage>>>,
}

impl ScriptedBookSource {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<OrderBookMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Arc::new(Self {
            snapshots: Mutex::new(VecDeque::new()),
            snapshot_gate: Semaphore::new(0),
            snapshot_calls: AtomicUsize::new(0),
            stream_rx: tokio::sync::Mutex::new(Some(rx)),
        });
        (source, tx)
    }

    /// Queue a snapshot for a future `fetch_snapshot` call.
    pub fn queue_snapshot(&self, snapshot: OrderBookMessage) {
        self.snapshots.lock().push_back(snapshot);
    }

    /// Allow one queued `fetch_snapshot` call to proceed.
    pub fn release_snapshot(&self) {
        self.snapshot_gate.add_permits(1);
    }

    pub fn snapshot_calls(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderBookDataSource for ScriptedBookSource {
    async fn fetch_snapshot(&self, _trading_pair: &TradingPair) -> Result<OrderBookMessage> {
        let permit = self
            .snapshot_gate
            .acquire()
            .await
            .expect("gate never closed");
        permit.forget();
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        self.snapshots
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Connection("no scripted snapshot".into()))
    }

    async fn listen(&self, output: mpsc::UnboundedSender<OrderBookMessage>) {
        let Some(mut rx) = self.stream_rx.lock().await.take() else {
            return;
        };
        while let Some(message) = rx.recv().await {
            if output.send(message).is_err() {
                return;
            }
        }
        // The test dropped its sender; stay alive like a real stream would.
        std::future::pending::<()>().await;
    }

    async fn last_traded_prices(
        &self,
        _trading_pairs: &[TradingPair],
    ) -> Result<HashMap<TradingPair, Decimal>> {
        Ok(HashMap::new())
    }
}

/// Listener that records every delivered event.
pub struct RecordingListener {
    events: Mutex<Vec<MarketEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<MarketEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }
}

impl EventListener for RecordingListener {
    fn on_event(&self, event: &MarketEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Poll `condition` until it holds or the deadline passes.
pub async fn wait_until<F: Fn() -> bool>(condition: F, deadline: Duration) {
    let start = std::time::Instant::now();
    while !condition() {
        if start.elapsed() > deadline {
            panic!("condition not reached within {deadline:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
