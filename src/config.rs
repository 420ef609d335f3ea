//! Tier settings, their validation into a lookup table, and the layered loaders.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::warn;

use crate::{
    error::{RateLimitError, Result},
    tier::{ADMIN_TIER, LOGIN_TIER, PUBLIC_TIER, REQUIRED_TIERS},
};

/// Prefix for environment overrides, e.g. `RATE_LIMIT__ENABLED=false` or
/// `RATE_LIMIT__TIERS__LOGIN__REQUESTS_PER_WINDOW=10`.
pub const ENV_PREFIX: &str = "RATE_LIMIT";

/// Admission control configuration as written by operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_tiers")]
    pub tiers: BTreeMap<String, TierSettings>,
}

/// Per-tier request allowance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSettings {
    pub requests_per_window: u32,
    pub window_minutes: u32,
}

impl TierSettings {
    pub const fn new(requests_per_window: u32, window_minutes: u32) -> Self {
        Self {
            requests_per_window,
            window_minutes,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_tiers() -> BTreeMap<String, TierSettings> {
    BTreeMap::from([
        (LOGIN_TIER.to_string(), TierSettings::new(5, 1)),
        (ADMIN_TIER.to_string(), TierSettings::new(30, 1)),
        (PUBLIC_TIER.to_string(), TierSettings::new(100, 1)),
    ])
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tiers: default_tiers(),
        }
    }
}

/// Runtime tier definition used to size token buckets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitTier {
    pub name: String,
    pub capacity: u64,
    pub refill_tokens: u64,
    pub refill_period: Duration,
}

impl RateLimitTier {
    /// Build a tier from its window settings.
    ///
    /// Capacity equals the window allowance and the bucket refills the full
    /// allowance once per window.
    pub fn from_settings(name: &str, settings: &TierSettings) -> Result<Self> {
        if settings.requests_per_window == 0 {
            return Err(RateLimitError::invalid_tier(
                name,
                "requests_per_window must be greater than zero",
            ));
        }
        if settings.window_minutes == 0 {
            return Err(RateLimitError::invalid_tier(
                name,
                "window_minutes must be greater than zero",
            ));
        }

        Ok(Self {
            name: name.to_string(),
            capacity: u64::from(settings.requests_per_window),
            refill_tokens: u64::from(settings.requests_per_window),
            refill_period: Duration::from_secs(u64::from(settings.window_minutes) * 60),
        })
    }

    /// True when `self` admits traffic more slowly than `other`.
    ///
    /// Compares sustained refill rate first, then burst capacity.
    fn is_stricter_than(&self, other: &RateLimitTier) -> bool {
        let ours = u128::from(self.refill_tokens) * other.refill_period.as_nanos();
        let theirs = u128::from(other.refill_tokens) * self.refill_period.as_nanos();
        (ours, self.capacity, &self.name) < (theirs, other.capacity, &other.name)
    }
}

/// Compiled tier configuration for fast lookups
#[derive(Debug, Clone)]
pub struct TierTable {
    tiers: HashMap<String, RateLimitTier>,
    strictest: String,
}

impl TierTable {
    /// Validate settings and compile them for runtime lookups
    pub fn compile(settings: &RateLimitSettings) -> Result<Self> {
        for required in REQUIRED_TIERS {
            if !settings.tiers.contains_key(required) {
                return Err(RateLimitError::invalid_tier(required, "tier is not configured"));
            }
        }

        let mut tiers = HashMap::with_capacity(settings.tiers.len());
        let mut strictest: Option<&RateLimitTier> = None;
        let compiled = settings
            .tiers
            .iter()
            .map(|(name, tier)| RateLimitTier::from_settings(name, tier))
            .collect::<Result<Vec<_>>>()?;

        for tier in &compiled {
            if strictest.map_or(true, |current| tier.is_stricter_than(current)) {
                strictest = Some(tier);
            }
        }
        let strictest = strictest
            .map(|tier| tier.name.clone())
            .ok_or_else(|| RateLimitError::Config("no tiers configured".to_string()))?;

        for tier in compiled {
            tiers.insert(tier.name.clone(), tier);
        }

        Ok(Self { tiers, strictest })
    }

    /// Look up a tier by exact name
    pub fn get(&self, name: &str) -> Option<&RateLimitTier> {
        self.tiers.get(name)
    }

    /// The tier with the slowest sustained admission rate
    pub fn strictest(&self) -> &RateLimitTier {
        &self.tiers[&self.strictest]
    }

    /// Look up a tier, falling back to the strictest one for unknown names
    pub fn resolve(&self, name: &str) -> &RateLimitTier {
        match self.tiers.get(name) {
            Some(tier) => tier,
            None => {
                let fallback = self.strictest();
                warn!(
                    tier = name,
                    fallback = %fallback.name,
                    "Unknown rate limit tier, applying strictest tier"
                );
                fallback
            }
        }
    }

    /// All configured tiers, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &RateLimitTier> {
        self.tiers.values()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

/// Load configuration from YAML string
pub fn load_config_from_yaml(yaml: &str) -> Result<RateLimitSettings> {
    serde_yaml::from_str(yaml).map_err(|e| {
        RateLimitError::Config(format!("Failed to parse YAML: {}", e))
    })
}

/// Load configuration from YAML file
pub fn load_config_from_file(path: &str) -> Result<RateLimitSettings> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_yaml(&content)
}

/// Load layered settings: built-in defaults, then an optional YAML file,
/// then `RATE_LIMIT__*` environment variables.
pub fn load_settings(path: Option<&str>) -> Result<RateLimitSettings> {
    build_settings(path, env_source())
}

fn env_source() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

fn build_settings(path: Option<&str>, env: config::Environment) -> Result<RateLimitSettings> {
    let mut builder = config::Config::builder()
        .add_source(config::Config::try_from(&RateLimitSettings::default())?);

    if let Some(path) = path {
        builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
    }

    let settings = builder
        .add_source(env)
        .build()?
        .try_deserialize::<RateLimitSettings>()?;

    Ok(settings)
}
