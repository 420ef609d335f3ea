//! HTTP admission filter.
//!
//! Runs in front of every route: infrastructure paths pass straight through,
//! everything else is classified into a tier and charged one token from the
//! caller's bucket for that tier. Exhausted callers get a 429 with a
//! `Retry-After` hint and the downstream handler is never invoked.

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Json, Router,
};
use http::{header::RETRY_AFTER, HeaderMap, HeaderValue, Method, StatusCode};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tracing::{debug, warn};

use crate::{
    bucket::Consumption,
    limiter::RateLimiter,
    metrics::Metrics,
    tier::classify,
    utils::retry_after_secs,
};

/// Header carrying the tokens left after an admitted request
pub const RATE_LIMIT_REMAINING: &str = "x-rate-limit-remaining";

/// Paths that are never rate limited: API docs, the OpenAPI document and
/// operational endpoints.
pub const BYPASS_PREFIXES: [&str; 5] = [
    "/swagger-ui",
    "/v3/api-docs",
    "/actuator",
    "/health",
    "/metrics",
];

const FORWARDED_FOR: &str = "x-forwarded-for";
const UNKNOWN_CLIENT: &str = "unknown";

/// Why a request skipped the limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    Allowlisted,
    Disabled,
}

impl BypassReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BypassReason::Allowlisted => "allowlist",
            BypassReason::Disabled => "disabled",
        }
    }
}

/// Outcome of the admission check for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Bypass(BypassReason),
    Admit { tier: &'static str, remaining: u64 },
    Reject { tier: &'static str, retry_after: u64 },
}

/// JSON body returned with a 429
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitErrorBody {
    pub status: &'static str,
    pub error_code: &'static str,
    pub message: String,
}

impl RateLimitErrorBody {
    pub fn new(retry_after: u64) -> Self {
        Self {
            status: "error",
            error_code: "RATE_LIMIT",
            message: format!(
                "Too many requests. Please try again in {} seconds.",
                retry_after
            ),
        }
    }
}

/// Per-request admission control in front of the API routes
pub struct AdmissionFilter {
    enabled: bool,
    limiter: RateLimiter,
    metrics: Arc<Metrics>,
}

impl AdmissionFilter {
    pub fn new(enabled: bool, limiter: RateLimiter, metrics: Arc<Metrics>) -> Self {
        Self {
            enabled,
            limiter,
            metrics,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Decide whether a request may proceed, charging its bucket if it is
    /// subject to limiting.
    pub fn decide(
        &self,
        path: &str,
        method: &Method,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
    ) -> Decision {
        if is_bypassed(path) {
            self.metrics.record_bypassed(BypassReason::Allowlisted.as_str());
            return Decision::Bypass(BypassReason::Allowlisted);
        }
        if !self.enabled {
            self.metrics.record_bypassed(BypassReason::Disabled.as_str());
            return Decision::Bypass(BypassReason::Disabled);
        }

        let _timer = self.metrics.start_decision_timer();
        let client = client_identity(headers, peer);
        let tier = classify(path, method);
        let consumption = self.limiter.check(&client, tier);
        self.metrics.set_buckets_active(self.limiter.registry().len());

        match consumption {
            Consumption::Consumed { remaining } => {
                debug!(client = %client, tier, remaining, "Request admitted");
                self.metrics.record_admitted(tier);
                Decision::Admit { tier, remaining }
            }
            Consumption::Rejected { wait } => {
                let retry_after = retry_after_secs(wait);
                warn!(
                    client = %client,
                    tier,
                    retry_after,
                    path,
                    "Rate limit exceeded"
                );
                self.metrics.record_rejected(tier);
                Decision::Reject { tier, retry_after }
            }
        }
    }
}

/// True for paths that are always forwarded without a rate limit check.
///
/// A prefix only matches whole path segments: `/health` and `/health/live`
/// bypass, `/healthcheck-admin` does not.
pub fn is_bypassed(path: &str) -> bool {
    BYPASS_PREFIXES.iter().any(|prefix| {
        path.strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    })
}

/// Resolve the string that identifies the caller.
///
/// Prefers the first entry of `X-Forwarded-For` so clients behind the reverse
/// proxy are told apart, and falls back to the socket peer address.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get(FORWARDED_FOR)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Build the 429 response sent to throttled callers
pub fn rate_limit_exceeded_response(retry_after: u64) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(RateLimitErrorBody::new(retry_after)),
    )
        .into_response();
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

/// Axum middleware applying [`AdmissionFilter`] to every request
pub async fn admission_middleware(
    State(filter): State<Arc<AdmissionFilter>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let decision = filter.decide(
        request.uri().path(),
        request.method(),
        request.headers(),
        peer,
    );

    match decision {
        Decision::Bypass(_) => next.run(request).await,
        Decision::Admit { remaining, .. } => {
            let mut response = next.run(request).await;
            response
                .headers_mut()
                .insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
            response
        }
        Decision::Reject { retry_after, .. } => rate_limit_exceeded_response(retry_after),
    }
}

/// Wrap `router` so every route behind it passes through admission control
pub fn with_admission_control<S>(router: Router<S>, filter: Arc<AdmissionFilter>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(middleware::from_fn_with_state(filter, admission_middleware))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{RateLimitSettings, TierSettings, TierTable},
        registry::{BucketKey, BucketRegistry},
        tier::{ADMIN_TIER, LOGIN_TIER, PUBLIC_TIER},
        utils::ManualClock,
    };
    use std::time::Duration;

    fn create_test_filter(enabled: bool, clock: Arc<ManualClock>) -> AdmissionFilter {
        let mut settings = RateLimitSettings::default();
        settings
            .tiers
            .insert(LOGIN_TIER.to_string(), TierSettings::new(2, 1));
        let tiers = TierTable::compile(&settings).unwrap();
        let limiter = RateLimiter::with_clock(tiers, Arc::new(BucketRegistry::new()), clock);
        AdmissionFilter::new(enabled, limiter, Arc::new(Metrics::new().unwrap()))
    }

    fn peer(ip: &str) -> Option<SocketAddr> {
        Some(SocketAddr::new(ip.parse().unwrap(), 50000))
    }

    #[test]
    fn test_client_identity_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR,
            HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"),
        );
        assert_eq!(client_identity(&headers, peer("127.0.0.1")), "203.0.113.7");
    }

    #[test]
    fn test_client_identity_ignores_blank_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, HeaderValue::from_static("   "));
        assert_eq!(client_identity(&headers, peer("192.0.2.4")), "192.0.2.4");

        assert_eq!(client_identity(&HeaderMap::new(), None), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_bypass_prefixes() {
        assert!(is_bypassed("/swagger-ui/index.html"));
        assert!(is_bypassed("/v3/api-docs"));
        assert!(is_bypassed("/actuator/health"));
        assert!(is_bypassed("/metrics"));
        assert!(is_bypassed("/health"));
        assert!(!is_bypassed("/api/v1/projects"));
    }

    #[test]
    fn test_bypass_matches_whole_segments_only() {
        assert!(!is_bypassed("/healthcheck-admin"));
        assert!(!is_bypassed("/metricsfoo"));
        assert!(!is_bypassed("/actuatorX"));
        assert!(!is_bypassed("/swagger-uiadmin/delete"));

        let filter = create_test_filter(true, Arc::new(ManualClock::new()));
        assert!(matches!(
            filter.decide("/healthcheck-admin", &Method::DELETE, &HeaderMap::new(), peer("10.0.0.1")),
            Decision::Admit { tier: ADMIN_TIER, .. }
        ));
        assert_eq!(filter.limiter().registry().len(), 1);
    }

    #[test]
    fn test_decide_admits_then_rejects() {
        let filter = create_test_filter(true, Arc::new(ManualClock::new()));
        let headers = HeaderMap::new();
        let path = "/api/v1/auth/login";

        assert_eq!(
            filter.decide(path, &Method::POST, &headers, peer("10.0.0.1")),
            Decision::Admit { tier: LOGIN_TIER, remaining: 1 }
        );
        assert_eq!(
            filter.decide(path, &Method::POST, &headers, peer("10.0.0.1")),
            Decision::Admit { tier: LOGIN_TIER, remaining: 0 }
        );
        assert_eq!(
            filter.decide(path, &Method::POST, &headers, peer("10.0.0.1")),
            Decision::Reject { tier: LOGIN_TIER, retry_after: 30 }
        );
    }

    #[test]
    fn test_decide_retry_after_shrinks_with_time() {
        let clock = Arc::new(ManualClock::new());
        let filter = create_test_filter(true, clock.clone());
        let headers = HeaderMap::new();
        let path = "/api/v1/auth/login";
        for _ in 0..2 {
            filter.decide(path, &Method::POST, &headers, peer("10.0.0.1"));
        }

        clock.advance(Duration::from_millis(27_500));
        assert_eq!(
            filter.decide(path, &Method::POST, &headers, peer("10.0.0.1")),
            Decision::Reject { tier: LOGIN_TIER, retry_after: 3 }
        );
    }

    #[test]
    fn test_decide_classifies_tiers() {
        let filter = create_test_filter(true, Arc::new(ManualClock::new()));
        let headers = HeaderMap::new();

        assert!(matches!(
            filter.decide("/api/v1/projects/5", &Method::DELETE, &headers, peer("10.0.0.1")),
            Decision::Admit { tier: ADMIN_TIER, .. }
        ));
        assert!(matches!(
            filter.decide("/api/v1/projects", &Method::GET, &headers, peer("10.0.0.1")),
            Decision::Admit { tier: PUBLIC_TIER, .. }
        ));
    }

    #[test]
    fn test_disabled_skips_registry() {
        let filter = create_test_filter(false, Arc::new(ManualClock::new()));
        let headers = HeaderMap::new();

        for _ in 0..10 {
            assert_eq!(
                filter.decide("/api/v1/auth/login", &Method::POST, &headers, peer("10.0.0.1")),
                Decision::Bypass(BypassReason::Disabled)
            );
        }
        assert!(filter.limiter().registry().is_empty());
    }

    #[test]
    fn test_allowlist_skips_registry() {
        let filter = create_test_filter(true, Arc::new(ManualClock::new()));
        assert_eq!(
            filter.decide("/v3/api-docs/swagger-config", &Method::GET, &HeaderMap::new(), None),
            Decision::Bypass(BypassReason::Allowlisted)
        );
        assert!(filter.limiter().registry().is_empty());
    }

    #[test]
    fn test_decide_not_blocked_by_unrelated_shard() {
        let filter = create_test_filter(true, Arc::new(ManualClock::new()));
        let headers = HeaderMap::new();
        let path = "/api/v1/projects";
        filter.decide(path, &Method::GET, &headers, peer("10.0.0.1"));

        let registry = filter.limiter().registry();
        let known = BucketKey::new("10.0.0.1", PUBLIC_TIER);
        let other = registry.key_in_other_shard(&known, PUBLIC_TIER);

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::scope(|scope| {
            let guard = registry.lock_entry(&other);
            scope.spawn(|| {
                let _ = tx.send(filter.decide(path, &Method::GET, &headers, peer("10.0.0.1")));
            });
            let decision = rx.recv_timeout(Duration::from_secs(2));
            drop(guard);
            assert_eq!(
                decision.ok(),
                Some(Decision::Admit { tier: PUBLIC_TIER, remaining: 98 })
            );
        });
    }

    #[test]
    fn test_error_body_shape() {
        let body = serde_json::to_value(RateLimitErrorBody::new(3)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "status": "error",
                "errorCode": "RATE_LIMIT",
                "message": "Too many requests. Please try again in 3 seconds."
            })
        );
    }
}
