//! Token-bucket rate limiter.
//!
//! One bucket per user identity, shared across all of the user's auth keys.
//! Rate and burst can be retuned in place while waiters are queued; a rate of
//! zero disables the bucket entirely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

struct BucketState {
    available: f64,
    last_refill: Instant,
}

pub struct RateBucket {
    /// Bytes per second, 0 = unlimited.
    rate: AtomicU64,
    /// Maximum accumulated tokens in bytes.
    burst: AtomicU64,
    state: Mutex<BucketState>,
}

impl RateBucket {
    pub fn new(rate: u64, burst: u64) -> Self {
        Self {
            rate: AtomicU64::new(rate),
            burst: AtomicU64::new(burst),
            state: Mutex::new(BucketState {
                available: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    pub fn burst(&self) -> u64 {
        self.burst.load(Ordering::Relaxed)
    }

    pub fn set_rate(&self, rate: u64) {
        self.rate.store(rate, Ordering::Relaxed);
    }

    pub fn set_burst(&self, burst: u64) {
        self.burst.store(burst, Ordering::Relaxed);
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let rate = self.rate.load(Ordering::Relaxed);
        if rate == 0 {
            return;
        }
        let elapsed = now.duration_since(state.last_refill);
        state.last_refill = now;
        let burst = self.burst.load(Ordering::Relaxed) as f64;
        state.available = (state.available + rate as f64 * elapsed.as_secs_f64()).min(burst);
    }

    /// Consume `n` tokens, sleeping until enough have accumulated.
    ///
    /// Chunks larger than the burst are charged at the burst size so a single
    /// oversized chunk cannot stall forever. Must not be called while holding
    /// a service lock.
    pub async fn wait_n(&self, n: u64) {
        if n == 0 {
            return;
        }
        loop {
            let rate = self.rate.load(Ordering::Relaxed);
            if rate == 0 {
                return;
            }
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state, Instant::now());
                let charge = (n.min(self.burst.load(Ordering::Relaxed).max(1))) as f64;
                if state.available >= charge {
                    state.available -= charge;
                    return;
                }
                let deficit = charge - state.available;
                Duration::from_secs_f64(deficit / rate as f64)
            };
            tokio::time::sleep(wait).await;
        }
    }
}
