//! Global download rate limiter
//!
//! A token bucket shared by every transfer of every running task. The
//! bucket holds one replenishment period's worth of tokens (100 ms), so a
//! rate change takes effect within a period. The rate itself lives in an
//! atomic and can be swapped while transfers are mid-flight without
//! touching the bucket lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Bucket capacity floor, matching the transfer read-buffer size so one
/// read can always be satisfied by a full bucket
const MIN_CAPACITY: u64 = 8 * 1024;

/// Replenishment period
const PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Bucket {
    available: f64,
    last_refill: Instant,
}

/// Token-bucket limiter on aggregate download bytes per second
///
/// A rate of `0` disables limiting.
#[derive(Debug)]
pub struct RateLimiter {
    /// Bytes per second; 0 = unlimited
    rate: AtomicU64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter at `bytes_per_sec` (0 = unlimited)
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            rate: AtomicU64::new(bytes_per_sec),
            bucket: Mutex::new(Bucket {
                available: 0.0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Create an unlimited limiter
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Current rate in bytes per second (0 = unlimited)
    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    /// Change the rate; effective for in-flight transfers within one
    /// replenishment period
    pub fn set_rate(&self, bytes_per_sec: u64) {
        self.rate.store(bytes_per_sec, Ordering::Relaxed);
    }

    fn capacity(rate: u64) -> f64 {
        (rate / 10).max(MIN_CAPACITY) as f64
    }

    /// Consume `bytes` tokens, sleeping off any debt
    ///
    /// Tokens are deducted immediately and the caller sleeps until the
    /// bucket would be non-negative again, so a single read larger than
    /// the bucket capacity still paces correctly instead of starving.
    pub async fn acquire(&self, bytes: u64) {
        let rate = self.rate();
        if rate == 0 {
            return;
        }
        let wait = {
            let mut bucket = self.bucket.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last_refill);
            bucket.last_refill = now;
            bucket.available = (bucket.available + elapsed.as_secs_f64() * rate as f64)
                .min(Self::capacity(rate));
            bucket.available -= bytes as f64;
            if bucket.available >= 0.0 {
                None
            } else {
                Some(Duration::from_secs_f64(-bucket.available / rate as f64).max(PERIOD / 100))
            }
        };
        if let Some(duration) = wait {
            tokio::time::sleep(duration).await;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn unlimited_never_waits() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        limiter.acquire(u64::MAX / 2).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_paces_to_the_configured_rate() {
        let limiter = RateLimiter::new(100_000);
        let start = Instant::now();
        // 300 KB at 100 KB/s: at least ~2.9s once the initial bucket
        // allowance is spent
        for _ in 0..30 {
            limiter.acquire(10_000).await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2_800), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(3_200), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquirers_share_the_budget() {
        let limiter = Arc::new(RateLimiter::new(100_000));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    limiter.acquire(10_000).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // 400 KB aggregate at 100 KB/s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3_800), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn raising_the_rate_takes_effect_mid_flight() {
        let limiter = Arc::new(RateLimiter::new(10_000));
        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let start = Instant::now();
                // 100 KB at 10 KB/s would take ~10s
                for _ in 0..10 {
                    limiter.acquire(10_000).await;
                }
                start.elapsed()
            })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        limiter.set_rate(1_000_000);
        let elapsed = waiter.await.unwrap();
        assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");
    }
}
