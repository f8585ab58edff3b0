//! Runtime configuration for the session manager.
//!
//! All knobs have safe defaults and can be overridden through `LEGITIMI_*`
//! environment variables. The encryption secret has no default: it is
//! injected by the host application, never hard-coded.

use secrecy::SecretString;
use std::time::Duration;

const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
const DEFAULT_RATE_LIMIT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 300;
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 200;

/// Login throttle settings (client-side defense in depth, not a substitute
/// for server-side rate limiting).
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Window over which attempts per identity are counted.
    pub window: Duration,
    /// Attempts allowed inside one window before blocking.
    pub max_attempts: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECS),
            max_attempts: DEFAULT_RATE_LIMIT_MAX_ATTEMPTS,
        }
    }
}

/// Proactive token refresh settings.
#[derive(Debug, Clone, Copy)]
pub struct RefreshConfig {
    /// Lead time before expiry at which the refresh timer fires.
    pub threshold: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(DEFAULT_REFRESH_THRESHOLD_SECS),
        }
    }
}

/// Bounded retry policy for transient network failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt after that.
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
        }
    }
}

/// Top-level configuration handed to [`crate::session::SessionManager`].
#[derive(Clone)]
pub struct Config {
    pub rate_limit: RateLimitConfig,
    pub refresh: RefreshConfig,
    pub retry: RetryConfig,
    /// Symmetric secret the token store derives its encryption key from.
    pub encryption_secret: SecretString,
    /// Base URL of the auth endpoints, e.g. `https://api.example.com`.
    pub base_url: String,
}

impl Config {
    /// Build a configuration with defaults around the two required inputs.
    #[must_use]
    pub fn new(base_url: impl Into<String>, encryption_secret: SecretString) -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            refresh: RefreshConfig::default(),
            retry: RetryConfig::default(),
            encryption_secret,
            base_url: base_url.into(),
        }
    }

    /// Load configuration from `LEGITIMI_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    ///
    /// # Errors
    ///
    /// Returns an error if `LEGITIMI_BASE_URL` or `LEGITIMI_ENCRYPTION_SECRET`
    /// is missing; neither has a usable default.
    pub fn from_env() -> anyhow::Result<Self> {
        let base_url = std::env::var("LEGITIMI_BASE_URL")
            .map_err(|_| anyhow::anyhow!("LEGITIMI_BASE_URL is not set"))?;
        let secret = std::env::var("LEGITIMI_ENCRYPTION_SECRET")
            .map_err(|_| anyhow::anyhow!("LEGITIMI_ENCRYPTION_SECRET is not set"))?;

        let mut config = Self::new(base_url, SecretString::from(secret));

        if let Some(window) = env_u64("LEGITIMI_RATE_LIMIT_WINDOW") {
            config.rate_limit.window = Duration::from_secs(window);
        }
        if let Some(max_attempts) = env_u32("LEGITIMI_RATE_LIMIT_MAX_ATTEMPTS") {
            config.rate_limit.max_attempts = max_attempts;
        }
        if let Some(threshold) = env_u64("LEGITIMI_REFRESH_THRESHOLD") {
            config.refresh.threshold = Duration::from_secs(threshold);
        }
        if let Some(max_attempts) = env_u32("LEGITIMI_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = max_attempts;
        }
        if let Some(delay_ms) = env_u64("LEGITIMI_RETRY_BASE_DELAY_MS") {
            config.retry.base_delay = Duration::from_millis(delay_ms);
        }

        Ok(config)
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("rate_limit", &self.rate_limit)
            .field("refresh", &self.refresh)
            .field("retry", &self.retry)
            .field("encryption_secret", &"***")
            .field("base_url", &self.base_url)
            .finish()
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}
