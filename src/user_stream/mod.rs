//! Private (user) stream tracking.
//!
//! A venue's [`UserStreamDataSource`] authenticates the private websocket,
//! subscribes to order/trade/balance/position channels and forwards raw
//! events. The [`UserStreamTracker`] owns the task and the queue the
//! connector's listener drains, and exposes the freshness timestamp the
//! connector uses to switch between short and long polling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Lock-free epoch-seconds cell shared between a stream task and its
/// readers.
#[derive(Default)]
pub struct TimestampCell(AtomicU64);

impl TimestampCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, timestamp: f64) {
        self.0.store(timestamp.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Authenticates and subscribes the venue's private channels.
///
/// `listen` owns the websocket lifecycle: connect, authenticate, subscribe,
/// forward every raw event into `output`, and on any failure back off and
/// reconnect with a fresh signature. It returns only when `output` closes.
#[async_trait]
pub trait UserStreamDataSource: Send + Sync {
    async fn listen(&self, output: mpsc::UnboundedSender<Value>);

    /// Epoch seconds of the last received frame, 0.0 before the first one.
    fn last_recv_time(&self) -> f64;
}

pub struct UserStreamTracker {
    data_source: Arc<dyn UserStreamDataSource>,
    receiver: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UserStreamTracker {
    pub fn new(data_source: Arc<dyn UserStreamDataSource>) -> Self {
        Self {
            data_source,
            receiver: tokio::sync::Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Launch the data source task. Idempotent: restarts the stream.
    pub async fn start(&self) {
        self.stop().await;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.receiver.lock().await = Some(rx);
        let data_source = self.data_source.clone();
        *self.task.lock() = Some(tokio::spawn(async move {
            data_source.listen(tx).await;
        }));
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        *self.receiver.lock().await = None;
    }

    /// Next raw event from the private stream; `None` when stopped.
    pub async fn next(&self) -> Option<Value> {
        let mut receiver = self.receiver.lock().await;
        match receiver.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    pub fn last_recv_time(&self) -> f64 {
        self.data_source.last_recv_time()
    }
}

impl Drop for UserStreamTracker {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
