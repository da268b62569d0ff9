use core::{hash::Hash, time::Duration};
use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use types::config::Config;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

#[derive(Debug, Error)]
#[error("rate limit exceeded: {cost} tokens requested, {available} available")]
pub struct RateLimited {
    pub cost: u64,
    pub available: u64,
}

/// Token bucket per peer.
///
/// Checking and charging are separate so that tokens are only spent on work that was actually
/// done. A peer that has never been seen starts with a full bucket.
#[derive(Debug)]
pub struct RateLimiter<K> {
    capacity: u64,
    refill_per_second: u64,
    buckets: Mutex<HashMap<K, Bucket>>,
}

#[derive(Clone, Copy, Debug)]
struct Bucket {
    tokens: u64,
    last_refill: Instant,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    #[must_use]
    pub fn new(capacity: u64, refill_per_second: u64) -> Self {
        Self {
            capacity,
            refill_per_second,
            buckets: Mutex::default(),
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.rate_limit_capacity, config.rate_limit_refill_per_second)
    }

    pub fn check(&self, peer: &K, cost: u64) -> Result<(), RateLimited> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        let available = match buckets.get_mut(peer) {
            Some(bucket) => {
                self.refill(bucket, now);
                bucket.tokens
            }
            None => self.capacity,
        };

        if available < cost {
            return Err(RateLimited { cost, available });
        }

        Ok(())
    }

    pub fn charge(&self, peer: &K, cost: u64) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        let bucket = buckets.entry(peer.clone()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        self.refill(bucket, now);
        bucket.tokens = bucket.tokens.saturating_sub(cost);
    }

    /// Forgets peers whose buckets have refilled completely.
    pub fn prune_idle(&self) {
        let now = Instant::now();

        self.buckets.lock().retain(|_, bucket| {
            self.refill(bucket, now);
            bucket.tokens < self.capacity
        });
    }

    #[must_use]
    pub fn tracked_peers(&self) -> usize {
        self.buckets.lock().len()
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        if bucket.tokens >= self.capacity {
            bucket.last_refill = now;
            return;
        }

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_nanos();
        let rate = u128::from(self.refill_per_second);
        let refilled = elapsed * rate / NANOS_PER_SECOND;

        if refilled == 0 {
            return;
        }

        let missing = self.capacity - bucket.tokens;

        match u64::try_from(refilled) {
            Ok(refilled) if refilled < missing => {
                // Only advance by the time that produced whole tokens.
                let spent = u64::try_from(u128::from(refilled) * NANOS_PER_SECOND / rate)
                    .unwrap_or(u64::MAX);

                bucket.tokens += refilled;
                bucket.last_refill += Duration::from_nanos(spent);
            }
            _ => {
                bucket.tokens = self.capacity;
                bucket.last_refill = now;
            }
        }
    }
}
