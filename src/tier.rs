//! Request tier classification.
//!
//! Every request that reaches the limiter is assigned to exactly one tier.
//! Rules are evaluated in order and the first match wins, so a mutating call
//! against the authentication endpoints still lands in the login tier.

use http::Method;

/// Tier applied to authentication endpoints.
pub const LOGIN_TIER: &str = "login";
/// Tier applied to mutating requests outside the authentication endpoints.
pub const ADMIN_TIER: &str = "admin";
/// Tier applied to everything else.
pub const PUBLIC_TIER: &str = "public";

/// Tiers that must be present in every loaded configuration.
pub const REQUIRED_TIERS: [&str; 3] = [LOGIN_TIER, ADMIN_TIER, PUBLIC_TIER];

/// Path prefix served by the authentication controller.
pub const AUTH_PATH_PREFIX: &str = "/api/v1/auth";

/// Map a request path and method to a tier name.
pub fn classify(path: &str, method: &Method) -> &'static str {
    if path.starts_with(AUTH_PATH_PREFIX) {
        LOGIN_TIER
    } else if is_mutating(method) {
        ADMIN_TIER
    } else {
        PUBLIC_TIER
    }
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}
