//! Portfolio Rate Limit
//!
//! Admission control for the portfolio/blog backend. Every inbound request is
//! classified into a tier (login, admin or public) and charged against a
//! token bucket keyed by client and tier. Callers that run dry receive a 429
//! with a `Retry-After` hint instead of reaching the API handlers.

pub mod bucket;
pub mod config;
pub mod error;
pub mod filter;
pub mod limiter;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod tier;
pub mod utils;

// Re-export main types
pub use crate::bucket::{Consumption, TokenBucket};
pub use crate::config::{RateLimitSettings, RateLimitTier, TierSettings, TierTable};
pub use crate::error::{RateLimitError, Result};
pub use crate::filter::{AdmissionFilter, Decision};
pub use crate::limiter::RateLimiter;
pub use crate::registry::{BucketKey, BucketRegistry};
