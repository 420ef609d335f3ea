use thiserror::Error;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur while setting up admission control.
///
/// Throttling a request is not an error; it is reported through
/// [`crate::bucket::Consumption::Rejected`] and answered with a 429 response.
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid tier '{tier}': {reason}")]
    InvalidTier { tier: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl RateLimitError {
    pub(crate) fn invalid_tier(tier: &str, reason: impl Into<String>) -> Self {
        Self::InvalidTier {
            tier: tier.to_string(),
            reason: reason.into(),
        }
    }
}
