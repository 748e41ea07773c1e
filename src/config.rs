//! Service configuration, read from the environment (after `.env`).

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use validator::Validate;
use crate::services::HttpSettings;
use crate::sync::SyncSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} has an invalid value: {value}")]
    Invalid { var: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

#[derive(Debug, Clone, Validate)]
pub struct Config {
    #[validate(range(min = 1))]
    pub port: u16,
    /// Commerce backend; the in-memory backend is used when absent
    #[validate(url)]
    pub backend_url: Option<String>,
    pub publishable_key: Option<String>,
    #[validate(range(min = 1, max = 300))]
    pub timeout_secs: u64,
    #[validate(range(min = 1, max = 20))]
    pub confirm_attempts: u32,
    #[validate(range(max = 10000))]
    pub confirm_delay_ms: u64,
    pub nats_url: Option<String>,
    #[validate(length(min = 1))]
    pub cache_subject_prefix: String,
    #[validate(length(equal = 3))]
    pub default_currency: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let config = Self {
            port: parse(&get, "PORT", 8083)?,
            backend_url: get("COMMERCE_BACKEND_URL"),
            publishable_key: get("COMMERCE_PUBLISHABLE_KEY"),
            timeout_secs: parse(&get, "COMMERCE_TIMEOUT_SECS", 30)?,
            confirm_attempts: parse(&get, "DISCOUNT_CONFIRM_ATTEMPTS", 3)?,
            confirm_delay_ms: parse(&get, "DISCOUNT_CONFIRM_DELAY_MS", 250)?,
            nats_url: get("NATS_URL"),
            cache_subject_prefix: get("CACHE_SUBJECT_PREFIX").unwrap_or_else(|| "storefront.cache".into()),
            default_currency: get("DEFAULT_CURRENCY").unwrap_or_else(|| "usd".into()).to_lowercase(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn http_settings(&self) -> Option<HttpSettings> {
        self.backend_url.as_ref().map(|url| HttpSettings {
            base_url: url.clone(),
            publishable_key: self.publishable_key.clone(),
            timeout: self.timeout_secs,
        })
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            confirm_attempts: self.confirm_attempts,
            confirm_delay: Duration::from_millis(self.confirm_delay_ms),
        }
    }
}

fn parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError> {
    match get(var) {
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(default),
    }
}
