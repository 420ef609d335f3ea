//! Per-request rate limit check: tier lookup, bucket selection and token consumption.

use std::sync::Arc;

use crate::{
    bucket::Consumption,
    config::TierTable,
    registry::{BucketKey, BucketRegistry},
    utils::{Clock, MonotonicClock},
};

/// Main rate limiter that coordinates tier configuration and bucket state
pub struct RateLimiter {
    tiers: TierTable,
    registry: Arc<BucketRegistry>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a new rate limiter reading the system clock
    pub fn new(tiers: TierTable, registry: Arc<BucketRegistry>) -> Self {
        Self::with_clock(tiers, registry, Arc::new(MonotonicClock))
    }

    /// Create a rate limiter with an explicit time source
    pub fn with_clock(
        tiers: TierTable,
        registry: Arc<BucketRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tiers,
            registry,
            clock,
        }
    }

    /// Take one token from the bucket for `client` in `tier`.
    ///
    /// Tier names missing from the configuration are limited with the
    /// strictest configured tier.
    pub fn check(&self, client: &str, tier: &str) -> Consumption {
        let config = self.tiers.resolve(tier);
        let key = BucketKey::new(client, tier);
        let now = self.clock.now();

        self.registry
            .get_or_create(&key, config, now)
            .try_consume(now)
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    pub fn registry(&self) -> &BucketRegistry {
        &self.registry
    }
}
