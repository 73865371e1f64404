// Registry configuration (spec §6). Grounded in the teacher's
// `app_config.rs` pattern — load every setting once at startup from the
// environment (plus `dotenv` for local `.env` files) — narrowed to just
// the registry's own table instead of the teacher's whole-application
// config surface.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use super::errors::RegistryError;
use super::validator::{validate_config, ConfigRanges};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub ttl_secs: u64,
    pub used_token_ttl_secs: u64,
    pub token_prefix: String,
    pub user_prefix: String,
    pub max_token_length: usize,
    pub max_devices_per_user: u64,
    pub max_batch_size: usize,
    pub enable_scheduled_cleanup: bool,
    pub stats_cache_ttl_secs: u64,
    pub breaker_timeout: Duration,
    pub breaker_threshold_percentage: f64,
    pub breaker_reset_timeout: Duration,
    pub redis_url: String,
    pub pool_size: usize,
    pub connection_retry_attempts: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 604_800,
            used_token_ttl_secs: 300,
            token_prefix: "refresh".to_string(),
            user_prefix: "user_tokens".to_string(),
            max_token_length: 255,
            max_devices_per_user: 10,
            max_batch_size: 300,
            enable_scheduled_cleanup: true,
            stats_cache_ttl_secs: 300,
            breaker_timeout: Duration::from_secs(5),
            breaker_threshold_percentage: 50.0,
            breaker_reset_timeout: Duration::from_secs(30),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 10,
            connection_retry_attempts: 3,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, RegistryError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| RegistryError::Configuration(format!("{key} is not valid"))),
        Err(_) => Ok(default),
    }
}

impl RegistryConfig {
    /// Loads from environment (via `.env` if present), falling back to the
    /// defaults above for anything unset, mirroring
    /// `RedisConfig::from_env()`'s "load ALL env vars ONCE at startup".
    pub fn from_env() -> Result<Self, RegistryError> {
        dotenv::dotenv().ok();

        let defaults = RegistryConfig::default();
        let cfg = RegistryConfig {
            ttl_secs: env_or("REGISTRY_TTL_SECS", defaults.ttl_secs)?,
            used_token_ttl_secs: env_or("REGISTRY_USED_TOKEN_TTL_SECS", defaults.used_token_ttl_secs)?,
            token_prefix: env::var("REGISTRY_TOKEN_PREFIX").unwrap_or(defaults.token_prefix),
            user_prefix: env::var("REGISTRY_USER_PREFIX").unwrap_or(defaults.user_prefix),
            max_token_length: env_or("REGISTRY_MAX_TOKEN_LENGTH", defaults.max_token_length)?,
            max_devices_per_user: env_or("REGISTRY_MAX_DEVICES_PER_USER", defaults.max_devices_per_user)?,
            max_batch_size: env_or("REGISTRY_MAX_BATCH_SIZE", defaults.max_batch_size)?,
            enable_scheduled_cleanup: env_or(
                "REGISTRY_ENABLE_SCHEDULED_CLEANUP",
                defaults.enable_scheduled_cleanup,
            )?,
            stats_cache_ttl_secs: env_or("REGISTRY_STATS_CACHE_TTL_SECS", defaults.stats_cache_ttl_secs)?,
            breaker_timeout: Duration::from_secs(env_or(
                "REGISTRY_BREAKER_TIMEOUT_SECS",
                defaults.breaker_timeout.as_secs(),
            )?),
            breaker_threshold_percentage: env_or(
                "REGISTRY_BREAKER_THRESHOLD_PERCENTAGE",
                defaults.breaker_threshold_percentage,
            )?,
            breaker_reset_timeout: Duration::from_secs(env_or(
                "REGISTRY_BREAKER_RESET_TIMEOUT_SECS",
                defaults.breaker_reset_timeout.as_secs(),
            )?),
            redis_url: env::var("REGISTRY_REDIS_URL").unwrap_or(defaults.redis_url),
            pool_size: env_or("REGISTRY_POOL_SIZE", defaults.pool_size)?,
            connection_retry_attempts: env_or(
                "REGISTRY_CONNECTION_RETRY_ATTEMPTS",
                defaults.connection_retry_attempts,
            )?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        validate_config(&ConfigRanges {
            ttl_secs: self.ttl_secs,
            used_token_ttl_secs: self.used_token_ttl_secs,
        })?;
        if self.pool_size == 0 {
            return Err(RegistryError::Configuration(
                "pool_size must be at least 1".into(),
            ));
        }
        if self.redis_url.is_empty() {
            return Err(RegistryError::Configuration("redis_url must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(RegistryConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_pool_size() {
        let mut cfg = RegistryConfig::default();
        cfg.pool_size = 0;
        assert!(cfg.validate().is_err());
    }
}
