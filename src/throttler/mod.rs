//! Weighted sliding-window rate limiting for REST and websocket traffic.
//!
//! Every outbound call is gated by [`AsyncThrottler::execute_task`] with the
//! endpoint's `limit_id`. A [`RateLimit`] may additionally be linked to one
//! or more shared pools; acquiring the endpoint limit then also consumes
//! capacity from each pool. There is no explicit release: entries age out of
//! the window naturally.
//!
//! The throttler never fails — it only delays. If the acquiring future is
//! dropped while waiting, no capacity is consumed.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Default recheck cadence while waiting for capacity.
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// A pool consumed alongside a rate limit, with the weight charged to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedLimitWeightPair {
    pub limit_id: String,
    pub weight: u32,
}

impl LinkedLimitWeightPair {
    pub fn new(limit_id: impl Into<String>) -> Self {
        Self {
            limit_id: limit_id.into(),
            weight: 1,
        }
    }

    pub fn with_weight(limit_id: impl Into<String>, weight: u32) -> Self {
        Self {
            limit_id: limit_id.into(),
            weight,
        }
    }
}

/// A single rate limit: at most `limit` weight units per `time_interval`.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimit {
    pub limit_id: String,
    pub limit: u32,
    pub time_interval: f64,
    pub weight: u32,
    pub linked_limits: Vec<LinkedLimitWeightPair>,
}

impl RateLimit {
    pub fn new(limit_id: impl Into<String>, limit: u32, time_interval: f64) -> Self {
        Self {
            limit_id: limit_id.into(),
            limit,
            time_interval,
            weight: 1,
            linked_limits: Vec::new(),
        }
    }

    /// Weight charged per call (defaults to 1).
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Link this limit to shared pools.
    pub fn linked_to(mut self, linked: Vec<LinkedLimitWeightPair>) -> Self {
        self.linked_limits = linked;
        self
    }
}

/// Sliding-window throttler shared by every call path of a venue.
pub struct AsyncThrottler {
    limits: HashMap<String, RateLimit>,
    task_logs: Mutex<HashMap<String, VecDeque<(Instant, u32)>>>,
    retry_interval: Duration,
    /// Fraction of each capacity actually usable, in percent (1..=100).
    limits_share_pct: f64,
}

impl AsyncThrottler {
    pub fn new(rate_limits: Vec<RateLimit>) -> Self {
        let limits = rate_limits
            .into_iter()
            .map(|limit| (limit.limit_id.clone(), limit))
            .collect();
        Self {
            limits,
            task_logs: Mutex::new(HashMap::new()),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            limits_share_pct: 100.0,
        }
    }

    /// Scale every capacity down to `pct` percent. Values are clamped to
    /// (0, 100]; the effective capacity never drops below 1.
    pub fn with_limits_share_pct(mut self, pct: f64) -> Self {
        self.limits_share_pct = pct.clamp(f64::MIN_POSITIVE, 100.0);
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    fn capacity_of(&self, limit: &RateLimit) -> u32 {
        (((limit.limit as f64) * self.limits_share_pct / 100.0).floor() as u32).max(1)
    }

    /// Acquire capacity for `limit_id`, waiting as long as necessary.
    ///
    /// Resolves once the call fits within the window of the limit and every
    /// linked pool; the weights are recorded at that moment. Unknown ids pass
    /// through unthrottled.
    pub async fn execute_task(&self, limit_id: &str) {
        let Some(limit) = self.limits.get(limit_id) else {
            debug!(limit_id, "No rate limit configured, passing through");
            return;
        };

        // The limit itself plus each linked pool that is actually configured.
        let mut related: Vec<(&RateLimit, u32)> = vec![(limit, limit.weight)];
        for linked in &limit.linked_limits {
            if let Some(pool) = self.limits.get(&linked.limit_id) {
                related.push((pool, linked.weight));
            }
        }

        loop {
            let wait = {
                let mut logs = self.task_logs.lock();
                let now = Instant::now();

                for (rate_limit, _) in &related {
                    prune(
                        logs.entry(rate_limit.limit_id.clone()).or_default(),
                        now,
                        rate_limit.time_interval,
                    );
                }

                let mut shortest_wait: Option<Duration> = None;
                for (rate_limit, weight) in &related {
                    let log = logs
                        .get(&rate_limit.limit_id)
                        .expect("log entry created above");
                    let used: u32 = log.iter().map(|(_, w)| *w).sum();
                    if used + weight > self.capacity_of(rate_limit) {
                        let wait = log
                            .front()
                            .map(|(t, _)| {
                                Duration::from_secs_f64(rate_limit.time_interval)
                                    .saturating_sub(now.duration_since(*t))
                            })
                            .unwrap_or(self.retry_interval);
                        shortest_wait = Some(match shortest_wait {
                            Some(current) => current.min(wait),
                            None => wait,
                        });
                    }
                }

                if shortest_wait.is_none() {
                    for (rate_limit, weight) in &related {
                        logs.get_mut(&rate_limit.limit_id)
                            .expect("log entry created above")
                            .push_back((now, *weight));
                    }
                }
                shortest_wait
            };

            match wait {
                None => return,
                Some(duration) => {
                    // A millisecond floor avoids busy-spinning right at the
                    // window edge.
                    tokio::time::sleep(duration.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Current weight recorded in the window for `limit_id`.
    pub fn current_usage(&self, limit_id: &str) -> u32 {
        let Some(limit) = self.limits.get(limit_id) else {
            return 0;
        };
        let mut logs = self.task_logs.lock();
        let log = logs.entry(limit_id.to_string()).or_default();
        prune(log, Instant::now(), limit.time_interval);
        log.iter().map(|(_, w)| *w).sum()
    }
}

fn prune(log: &mut VecDeque<(Instant, u32)>, now: Instant, time_interval: f64) {
    let window = Duration::from_secs_f64(time_interval);
    while let Some((timestamp, _)) = log.front() {
        if now.duration_since(*timestamp) >= window {
            log.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn calls_within_capacity_complete_promptly() {
        let throttler = AsyncThrottler::new(vec![RateLimit::new("ticker", 5, 1.0)]);
        let start = tokio::time::Instant::now();
        for _ in 0..5 {
            throttler.execute_task("ticker").await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(throttler.current_usage("ticker"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_call_blocks_until_window_frees() {
        let throttler = AsyncThrottler::new(vec![RateLimit::new("ticker", 5, 1.0)]);
        for _ in 0..5 {
            throttler.execute_task("ticker").await;
        }

        let start = tokio::time::Instant::now();
        throttler.execute_task("ticker").await;
        let waited = start.elapsed();
        assert!(
            waited >= Duration::from_secs_f64(0.99),
            "expected ~1s wait, got {waited:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn linked_pool_capacity_is_shared() {
        let throttler = AsyncThrottler::new(vec![
            RateLimit::new("pool", 3, 1.0),
            RateLimit::new("orders", 100, 1.0)
                .linked_to(vec![LinkedLimitWeightPair::new("pool")]),
            RateLimit::new("balance", 100, 1.0)
                .linked_to(vec![LinkedLimitWeightPair::new("pool")]),
        ]);

        throttler.execute_task("orders").await;
        throttler.execute_task("balance").await;
        throttler.execute_task("orders").await;
        assert_eq!(throttler.current_usage("pool"), 3);

        let start = tokio::time::Instant::now();
        throttler.execute_task("balance").await;
        assert!(start.elapsed() >= Duration::from_secs_f64(0.99));
    }

    #[tokio::test(start_paused = true)]
    async fn weights_count_against_pool_capacity() {
        let throttler = AsyncThrottler::new(vec![
            RateLimit::new("weight", 10, 1.0),
            RateLimit::new("account", 100, 1.0)
                .weight(5)
                .linked_to(vec![LinkedLimitWeightPair::with_weight("weight", 5)]),
        ]);

        throttler.execute_task("account").await;
        throttler.execute_task("account").await;
        assert_eq!(throttler.current_usage("weight"), 10);

        let start = tokio::time::Instant::now();
        throttler.execute_task("account").await;
        assert!(start.elapsed() >= Duration::from_secs_f64(0.99));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_limit_id_passes_through() {
        let throttler = AsyncThrottler::new(vec![]);
        let start = tokio::time::Instant::now();
        for _ in 0..100 {
            throttler.execute_task("anything").await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn limits_share_pct_scales_capacity() {
        let throttler = AsyncThrottler::new(vec![RateLimit::new("ticker", 10, 1.0)])
            .with_limits_share_pct(50.0);

        for _ in 0..5 {
            throttler.execute_task("ticker").await;
        }
        let start = tokio::time::Instant::now();
        throttler.execute_task("ticker").await;
        assert!(start.elapsed() >= Duration::from_secs_f64(0.99));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_acquisition_records_nothing() {
        let throttler = std::sync::Arc::new(AsyncThrottler::new(vec![RateLimit::new(
            "ticker", 1, 10.0,
        )]));
        throttler.execute_task("ticker").await;

        let waiting = {
            let throttler = throttler.clone();
            tokio::spawn(async move { throttler.execute_task("ticker").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        waiting.abort();
        let _ = waiting.await;

        assert_eq!(throttler.current_usage("ticker"), 1);
    }
}
