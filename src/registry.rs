//! Lazily populated map from client and tier to token bucket.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::{bucket::TokenBucket, config::RateLimitTier};

/// Identifies one rate limit counter: a client within a tier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub client: String,
    pub tier: String,
}

impl BucketKey {
    pub fn new(client: impl Into<String>, tier: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            tier: tier.into(),
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tier, self.client)
    }
}

/// Process-wide map of token buckets, one per [`BucketKey`].
///
/// Entries are created on first use and live until the registry is dropped.
/// The map is sharded, so creating a bucket for one client never blocks
/// consumption on another client's bucket, and callers get a shared handle
/// they can consume from after the shard lock has been released.
#[derive(Debug, Default)]
pub struct BucketRegistry {
    buckets: DashMap<BucketKey, Arc<TokenBucket>>,
    // Entries are never removed, so counting insertions gives the size
    // without locking every shard.
    created: AtomicUsize,
}

impl BucketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the bucket for `key`, creating a full one sized from `tier`
    /// if none exists yet.
    ///
    /// Creation goes through the shard's entry lock, so concurrent callers
    /// for the same key all receive the same bucket.
    pub fn get_or_create(
        &self,
        key: &BucketKey,
        tier: &RateLimitTier,
        now: Instant,
    ) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return bucket.value().clone();
        }

        self.buckets
            .entry(key.clone())
            .or_insert_with(|| {
                self.created.fetch_add(1, Ordering::Relaxed);
                Arc::new(TokenBucket::new(tier, now))
            })
            .value()
            .clone()
    }

    /// Existing bucket for `key`, if any.
    pub fn get(&self, key: &BucketKey) -> Option<Arc<TokenBucket>> {
        self.buckets.get(key).map(|bucket| bucket.value().clone())
    }

    /// Number of buckets created so far. Reads a counter, not the shards.
    pub fn len(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn same_shard(&self, a: &BucketKey, b: &BucketKey) -> bool {
        self.buckets.determine_map(a) == self.buckets.determine_map(b)
    }

    /// Hold the shard write lock for `key` until the returned entry drops.
    #[cfg(test)]
    pub(crate) fn lock_entry(
        &self,
        key: &BucketKey,
    ) -> dashmap::mapref::entry::Entry<'_, BucketKey, Arc<TokenBucket>> {
        self.buckets.entry(key.clone())
    }

    /// A key for `tier` whose shard differs from the one holding `key`.
    #[cfg(test)]
    pub(crate) fn key_in_other_shard(&self, key: &BucketKey, tier: &str) -> BucketKey {
        (0u32..)
            .map(|i| BucketKey::new(format!("10.99.{}.{}", i / 256, i % 256), tier))
            .find(|candidate| !self.same_shard(key, candidate))
            .unwrap()
    }
}
