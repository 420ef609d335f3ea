//! Continuously refilling token bucket.
//!
//! Refill is computed lazily from the instant passed to each consume attempt,
//! so no timer task exists per bucket. The token count is kept as a real
//! number and the refill timestamp always advances to the attempt instant,
//! which keeps fractional refill credit instead of discarding it.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::RateLimitTier;

/// Outcome of a single consume attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumption {
    /// A token was taken; `remaining` whole tokens are left.
    Consumed { remaining: u64 },
    /// No token was available; one will be after `wait`.
    Rejected { wait: Duration },
}

impl Consumption {
    pub fn is_consumed(&self) -> bool {
        matches!(self, Consumption::Consumed { .. })
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket for one client and tier
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill_tokens: u64,
    refill_period: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket sized from `tier`.
    pub fn new(tier: &RateLimitTier, now: Instant) -> Self {
        Self::with_rate(tier.capacity, tier.refill_tokens, tier.refill_period, now)
    }

    /// Create a full bucket holding `capacity` tokens that regains
    /// `refill_tokens` every `refill_period`.
    pub fn with_rate(
        capacity: u64,
        refill_tokens: u64,
        refill_period: Duration,
        now: Instant,
    ) -> Self {
        Self {
            capacity,
            refill_tokens,
            refill_period,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: now,
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Try to take one token at `now`.
    ///
    /// Refill, check and decrement happen under the bucket's lock, so the last
    /// token can only ever be granted once.
    pub fn try_consume(&self, now: Instant) -> Consumption {
        let mut state = self.lock();
        self.refill(&mut state, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Consumption::Consumed {
                remaining: state.tokens.floor() as u64,
            }
        } else {
            Consumption::Rejected {
                wait: self.wait_for_one(state.tokens),
            }
        }
    }

    /// Whole tokens available at `now`, without consuming any.
    pub fn available(&self, now: Instant) -> u64 {
        let mut state = self.lock();
        self.refill(&mut state, now);
        state.tokens.floor() as u64
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        // A stale instant from a racing caller must not move time backwards.
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }

        let period_nanos = self.refill_period.as_nanos() as f64;
        let added = if period_nanos > 0.0 {
            elapsed.as_nanos() as f64 * self.refill_tokens as f64 / period_nanos
        } else {
            self.capacity as f64
        };

        state.tokens = (state.tokens + added).min(self.capacity as f64);
        state.last_refill = now;
    }

    fn wait_for_one(&self, tokens: f64) -> Duration {
        if self.refill_tokens == 0 {
            return Duration::MAX;
        }
        let missing = (1.0 - tokens).max(0.0);
        let nanos = (missing * self.refill_period.as_nanos() as f64 / self.refill_tokens as f64)
            .ceil();
        Duration::from_nanos(nanos.min(u64::MAX as f64) as u64)
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        // The state is two plain fields that are never left half-written, so a
        // poisoned lock still holds a usable value.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn bucket(capacity: u64, period_secs: u64, now: Instant) -> TokenBucket {
        TokenBucket::with_rate(capacity, capacity, Duration::from_secs(period_secs), now)
    }

    #[test]
    fn test_fresh_bucket_admits_capacity() {
        let now = Instant::now();
        let bucket = bucket(5, 60, now);

        for expected in (0..5).rev() {
            assert_eq!(
                bucket.try_consume(now),
                Consumption::Consumed { remaining: expected }
            );
        }
        assert!(!bucket.try_consume(now).is_consumed());
    }

    #[test]
    fn test_rejection_reports_wait() {
        let now = Instant::now();
        let bucket = bucket(5, 60, now);
        for _ in 0..5 {
            bucket.try_consume(now);
        }

        // One token every 12 seconds.
        assert_eq!(
            bucket.try_consume(now),
            Consumption::Rejected {
                wait: Duration::from_secs(12)
            }
        );

        // Partial credit shortens the wait.
        let later = now + Duration::from_secs(3);
        assert_eq!(
            bucket.try_consume(later),
            Consumption::Rejected {
                wait: Duration::from_secs(9)
            }
        );
    }

    #[test]
    fn test_refill_after_period() {
        let now = Instant::now();
        let bucket = bucket(5, 60, now);
        for _ in 0..5 {
            bucket.try_consume(now);
        }
        assert!(!bucket.try_consume(now).is_consumed());

        let later = now + Duration::from_secs(60);
        assert_eq!(
            bucket.try_consume(later),
            Consumption::Consumed { remaining: 4 }
        );
    }

    #[test]
    fn test_refill_is_capped() {
        let now = Instant::now();
        let bucket = bucket(3, 60, now);
        bucket.try_consume(now);

        let much_later = now + Duration::from_secs(3600);
        assert_eq!(bucket.available(much_later), 3);
        assert_eq!(
            bucket.try_consume(much_later),
            Consumption::Consumed { remaining: 2 }
        );
    }

    #[test]
    fn test_fractional_credit_is_kept() {
        let now = Instant::now();
        let bucket = bucket(2, 60, now);
        bucket.try_consume(now);
        bucket.try_consume(now);

        // Two 15 second steps add half a token each.
        let t1 = now + Duration::from_secs(15);
        assert!(!bucket.try_consume(t1).is_consumed());
        let t2 = t1 + Duration::from_secs(15);
        assert!(bucket.try_consume(t2).is_consumed());
    }

    #[test]
    fn test_stale_instant_does_not_rewind() {
        let now = Instant::now();
        let bucket = bucket(1, 60, now + Duration::from_secs(10));
        assert!(bucket.try_consume(now).is_consumed());
        assert!(!bucket.try_consume(now).is_consumed());
    }

    #[test]
    fn test_available_does_not_consume() {
        let now = Instant::now();
        let bucket = bucket(4, 60, now);
        assert_eq!(bucket.available(now), 4);
        assert_eq!(bucket.available(now), 4);
    }

    #[test]
    fn test_last_token_granted_once_under_contention() {
        let now = Instant::now();
        let bucket = Arc::new(bucket(3, 60, now));
        bucket.try_consume(now);
        bucket.try_consume(now);

        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));
        let granted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let bucket = bucket.clone();
                    let barrier = barrier.clone();
                    scope.spawn(move || {
                        barrier.wait();
                        bucket.try_consume(now).is_consumed() as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(granted, 1);
        assert_eq!(bucket.available(now), 0);
    }
}
