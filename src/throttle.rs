//! Global bandwidth throttle
//!
//! A single token bucket shared by every live body stream. Each worker
//! obtains a per-stream handle from the group and asks it for permission
//! before passing bytes downstream; the sum across all streams therefore
//! never exceeds the polled ceiling. A ceiling of zero or below means
//! unlimited.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

/// Polled bandwidth ceiling in bytes per second.
pub type BandwidthFn = Arc<dyn Fn() -> i64 + Send + Sync>;

/// How long a stream sleeps at most before re-polling the ceiling, so a
/// changed limit takes effect quickly.
const MAX_NAP: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new() -> Self {
        Self {
            tokens: 0.0,
            last_refill: Instant::now(),
        }
    }

    /// Refill from elapsed time; burst capacity is one second of budget.
    fn refill(&mut self, limit: f64, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * limit).min(limit);
        self.last_refill = now;
    }

    fn take(&mut self, wanted: f64) -> f64 {
        let granted = self.tokens.min(wanted);
        self.tokens -= granted;
        granted
    }
}

/// Factory and shared state for all throttled streams of one manager.
pub struct ThrottleGroup {
    bucket: Mutex<TokenBucket>,
    max_bandwidth: BandwidthFn,
}

impl ThrottleGroup {
    pub fn new(max_bandwidth: BandwidthFn) -> Arc<Self> {
        Arc::new(Self {
            bucket: Mutex::new(TokenBucket::new()),
            max_bandwidth,
        })
    }

    /// Produce a throttle handle for one body stream.
    pub fn stream(self: &Arc<Self>) -> Throttle {
        Throttle {
            group: Arc::clone(self),
        }
    }
}

/// Per-stream throttle handle over the shared bucket.
pub struct Throttle {
    group: Arc<ThrottleGroup>,
}

impl Throttle {
    /// Wait until `amount` bytes may pass downstream.
    pub async fn acquire(&self, amount: usize) {
        let mut remaining = amount as f64;

        loop {
            let limit = (self.group.max_bandwidth)();
            if limit <= 0 {
                return;
            }
            let limit = limit as f64;

            let nap = {
                let mut bucket = match self.group.bucket.lock() {
                    Ok(b) => b,
                    Err(_) => return,
                };
                bucket.refill(limit, Instant::now());
                remaining -= bucket.take(remaining);
                if remaining <= 0.0 {
                    return;
                }
                Duration::from_secs_f64(remaining / limit).min(MAX_NAP)
            };

            tokio::time::sleep(nap).await;
        }
    }
}
