//! Shared clock driving connector and strategy ticks.
//!
//! The clock emits one tick per `tick_size` boundary and invokes every
//! registered [`TimeIterator`] in registration order. Two modes exist:
//!
//! - [`ClockMode::Realtime`]: wall-clock driven; `run()` sleeps until the
//!   next boundary and ticks all iterators with the boundary timestamp.
//! - [`ClockMode::Backtest`]: logical time; `run_til()` advances in
//!   `tick_size` steps without sleeping.
//!
//! A failing iterator never prevents later iterators from ticking; its error
//! is logged and forwarded on the clock's error channel.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result;

/// A participant in the clock's tick cycle.
///
/// Connectors and strategies implement this; `tick` is invoked once per tick
/// boundary with the boundary timestamp in epoch seconds.
pub trait TimeIterator: Send + Sync {
    /// Process one clock tick.
    fn tick(&self, timestamp: f64) -> Result<()>;

    /// Whether the iterator has finished initializing.
    ///
    /// The clock ticks iterators regardless of readiness (ticking is what
    /// drives them towards readiness); consumers use this to gate strategy
    /// logic.
    fn ready(&self) -> bool;
}

/// Clock operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// Wall-clock driven, ticks at each `tick_size` boundary.
    Realtime,
    /// Logical time advanced explicitly via [`Clock::run_til`].
    Backtest,
}

/// An iterator failure surfaced by the clock.
#[derive(Debug)]
pub struct TickError {
    /// Index of the failing iterator in registration order.
    pub iterator_index: usize,
    /// Timestamp of the tick that failed.
    pub timestamp: f64,
    /// The underlying error.
    pub error: crate::error::Error,
}

pub struct Clock {
    mode: ClockMode,
    tick_size: f64,
    current_time: Mutex<f64>,
    iterators: Mutex<Vec<Arc<dyn TimeIterator>>>,
    error_tx: mpsc::UnboundedSender<TickError>,
    error_rx: Mutex<Option<mpsc::UnboundedReceiver<TickError>>>,
}

impl Clock {
    /// Create a clock. `tick_size` is in seconds (default cadence is 1.0).
    pub fn new(mode: ClockMode, tick_size: f64) -> Self {
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let start = match mode {
            ClockMode::Realtime => unix_time_now(),
            ClockMode::Backtest => 0.0,
        };
        Self {
            mode,
            tick_size,
            current_time: Mutex::new(start),
            iterators: Mutex::new(Vec::new()),
            error_tx,
            error_rx: Mutex::new(Some(error_rx)),
        }
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    pub fn tick_size(&self) -> f64 {
        self.tick_size
    }

    /// Current logical time in epoch seconds.
    pub fn current_time(&self) -> f64 {
        *self.current_time.lock()
    }

    /// Register an iterator. Registration order is the tick order.
    pub fn add_iterator(&self, iterator: Arc<dyn TimeIterator>) {
        self.iterators.lock().push(iterator);
    }

    /// Remove a previously registered iterator.
    pub fn remove_iterator(&self, iterator: &Arc<dyn TimeIterator>) {
        self.iterators
            .lock()
            .retain(|it| !Arc::ptr_eq(it, iterator));
    }

    /// Take the receiving end of the error channel.
    ///
    /// Returns `None` if already taken.
    pub fn take_error_receiver(&self) -> Option<mpsc::UnboundedReceiver<TickError>> {
        self.error_rx.lock().take()
    }

    /// Run the realtime tick loop forever.
    ///
    /// # Panics
    ///
    /// Panics if the clock is in backtest mode; use [`Clock::run_til`].
    pub async fn run(&self) {
        assert_eq!(
            self.mode,
            ClockMode::Realtime,
            "run() is only valid in realtime mode"
        );
        loop {
            let now = unix_time_now();
            let next_boundary = ((now / self.tick_size).floor() + 1.0) * self.tick_size;
            let delay = (next_boundary - now).max(0.0);
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            *self.current_time.lock() = next_boundary;
            self.tick_iterators(next_boundary);
        }
    }

    /// Advance logical time to `target_time` in backtest mode.
    ///
    /// Each `tick_size` boundary between the current time (exclusive) and the
    /// target (inclusive) produces one tick. Idempotent for targets at or
    /// before the current time: time never moves backwards.
    pub fn run_til(&self, target_time: f64) {
        assert_eq!(
            self.mode,
            ClockMode::Backtest,
            "run_til() is only valid in backtest mode"
        );
        loop {
            let next = {
                let current = self.current_time.lock();
                let next = *current + self.tick_size;
                if next > target_time {
                    return;
                }
                next
            };
            *self.current_time.lock() = next;
            self.tick_iterators(next);
        }
    }

    fn tick_iterators(&self, timestamp: f64) {
        let iterators: Vec<Arc<dyn TimeIterator>> = self.iterators.lock().clone();
        for (index, iterator) in iterators.iter().enumerate() {
            if let Err(error) = iterator.tick(timestamp) {
                warn!(index, timestamp, error = %error, "Clock iterator tick failed");
                let _ = self.error_tx.send(TickError {
                    iterator_index: index,
                    timestamp,
                    error,
                });
            }
        }
    }
}

fn unix_time_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}
