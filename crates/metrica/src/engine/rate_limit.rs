use std::fmt;
use std::num::NonZeroU32;
use std::thread;
use std::time::{Duration, Instant};

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Request budget shared by every worker thread that talks to the engine.
///
/// Wraps a GCRA limiter allowing `rate` calls per second with bursts of up
/// to `burst`. `acquire` blocks the calling thread until the call fits.
pub struct RateLimiter {
    inner: Option<DirectLimiter>,
    clock: DefaultClock,
}

impl RateLimiter {
    /// A non-positive or non-finite `rate` disables limiting.
    pub fn new(rate: f64, burst: u32) -> Self {
        let quota = (rate.is_finite() && rate > 0.0)
            .then(|| Duration::try_from_secs_f64(rate.recip()).ok())
            .flatten()
            .and_then(Quota::with_period)
            .map(|q| q.allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN)));
        Self {
            inner: quota.map(governor::RateLimiter::direct),
            clock: DefaultClock::default(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0.0, 1)
    }

    pub fn is_unlimited(&self) -> bool {
        self.inner.is_none()
    }

    /// Takes one cell if available without waiting.
    pub fn try_acquire(&self) -> bool {
        self.inner.as_ref().map_or(true, |l| l.check().is_ok())
    }

    /// Blocks until the call is admitted. Returns the time spent waiting.
    pub fn acquire(&self) -> Duration {
        let started = Instant::now();
        if let Some(limiter) = &self.inner {
            while let Err(not_until) = limiter.check() {
                thread::sleep(not_until.wait_time_from(self.clock.now()));
            }
        }
        started.elapsed()
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("unlimited", &self.is_unlimited())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_burst_then_empty() {
        let limiter = RateLimiter::new(1.0, 3);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_unlimited_never_blocks() {
        for limiter in [RateLimiter::unlimited(), RateLimiter::new(f64::INFINITY, 1), RateLimiter::new(-2.0, 5)] {
            assert!(limiter.is_unlimited());
            for _ in 0..1000 {
                assert!(limiter.try_acquire());
            }
        }
    }

    #[test]
    fn test_zero_burst_still_admits_one() {
        let limiter = RateLimiter::new(1.0, 0);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_acquire_waits_for_refill() {
        let limiter = RateLimiter::new(50.0, 1);
        limiter.acquire();
        let waited = limiter.acquire();
        assert!(waited >= Duration::from_millis(10), "waited {:?}", waited);
    }

    #[test]
    fn test_concurrent_acquire_respects_rate() {
        let limiter = Arc::new(RateLimiter::new(100.0, 1));
        let started = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || {
                    for _ in 0..5 {
                        limiter.acquire();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        // 20 calls, 1 from the initial burst, the rest at 100/s.
        assert!(started.elapsed() >= Duration::from_millis(150));
    }
}
