//! Server-time offset tracking for request signing.
//!
//! Venues reject signed requests whose timestamp drifts too far from their
//! server clock. The synchronizer keeps a rolling sample of offsets between
//! the venue's server time and the local clock and answers `time()` with the
//! median-corrected local time, so a single skewed sample cannot poison the
//! signing timestamp.

use std::collections::VecDeque;
use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::Result;

const SAMPLE_WINDOW: usize = 5;

pub struct TimeSynchronizer {
    /// Recent (server - local) offsets in seconds, newest last.
    offsets: Mutex<VecDeque<f64>>,
}

impl Default for TimeSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSynchronizer {
    pub fn new() -> Self {
        Self {
            offsets: Mutex::new(VecDeque::with_capacity(SAMPLE_WINDOW)),
        }
    }

    /// Offset-corrected current time in epoch seconds.
    pub fn time(&self) -> f64 {
        local_time_now() + self.median_offset()
    }

    /// Offset-corrected current time in epoch milliseconds.
    pub fn time_ms(&self) -> i64 {
        (self.time() * 1_000.0) as i64
    }

    /// Record one offset sample from a server time observed between
    /// `local_before` and `local_after` (epoch seconds).
    pub fn add_sample(&self, server_time: f64, local_before: f64, local_after: f64) {
        let midpoint = (local_before + local_after) / 2.0;
        let mut offsets = self.offsets.lock();
        if offsets.len() == SAMPLE_WINDOW {
            offsets.pop_front();
        }
        offsets.push_back(server_time - midpoint);
    }

    /// Fetch the server time (epoch seconds) via `provider` and record the
    /// resulting offset sample.
    pub async fn update_server_time_offset<F, Fut>(&self, provider: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<f64>>,
    {
        let local_before = local_time_now();
        let server_time = provider().await?;
        let local_after = local_time_now();
        self.add_sample(server_time, local_before, local_after);
        Ok(())
    }

    fn median_offset(&self) -> f64 {
        let offsets = self.offsets.lock();
        if offsets.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = offsets.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("offsets are finite"));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 1 {
            sorted[mid]
        } else {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        }
    }
}

fn local_time_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}
