// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::batch::hard_limit_batches;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;

pub const DEFAULT_API_URL: &str = "https://api.segment.io/v1/";
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
pub const DEFAULT_BATCH_EVERY_MS: u64 = 2_000;
pub const DEFAULT_EVENTS_HARD_LIMIT: usize = 10_000;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_START_MS: u64 = 100;
pub const DEFAULT_RETRY_EXPIRY_MS: u64 = 10_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Where closed batches wait when the scheduler falls behind.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OverflowStorage {
    #[default]
    Memory,
    /// SQLite file at the given path.
    Sqlite(PathBuf),
}

/// Configuration for the batcher and its delivery client
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Write key, sent as the basic-auth username
    pub write_key: String,
    /// Base URL of the ingestion API; `batch` and the event type are joined onto it
    pub api_url: String,
    /// Maximum number of events per periodic delivery
    pub max_batch_size: usize,
    /// Interval between periodic ticks in milliseconds
    pub batch_every_ms: u64,
    /// Event budget for the overflow queue
    pub events_hard_limit: usize,
    pub retry_attempts: u32,
    pub retry_start_ms: u64,
    pub retry_expiry_ms: u64,
    /// Per-request HTTP timeout in milliseconds
    pub request_timeout_ms: u64,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
    pub overflow_storage: OverflowStorage,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            write_key: String::new(),
            api_url: DEFAULT_API_URL.to_string(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            batch_every_ms: DEFAULT_BATCH_EVERY_MS,
            events_hard_limit: DEFAULT_EVENTS_HARD_LIMIT,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_start_ms: DEFAULT_RETRY_START_MS,
            retry_expiry_ms: DEFAULT_RETRY_EXPIRY_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            https_proxy: None,
            overflow_storage: OverflowStorage::Memory,
            log_level: "info".to_string(),
        }
    }
}

impl BatcherConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Create configuration from any variable source, validating the result.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            write_key: lookup("ANALYTICS_WRITE_KEY").unwrap_or_default(),
            api_url: lookup("ANALYTICS_API_URL").unwrap_or(defaults.api_url),
            max_batch_size: parse_var(&lookup, "ANALYTICS_MAX_BATCH_SIZE", defaults.max_batch_size)?,
            batch_every_ms: parse_var(&lookup, "ANALYTICS_BATCH_EVERY_MS", defaults.batch_every_ms)?,
            events_hard_limit: parse_var(
                &lookup,
                "ANALYTICS_EVENTS_HARD_LIMIT",
                defaults.events_hard_limit,
            )?,
            retry_attempts: parse_var(&lookup, "ANALYTICS_RETRY_ATTEMPTS", defaults.retry_attempts)?,
            retry_start_ms: parse_var(&lookup, "ANALYTICS_RETRY_START_MS", defaults.retry_start_ms)?,
            retry_expiry_ms: parse_var(
                &lookup,
                "ANALYTICS_RETRY_EXPIRY_MS",
                defaults.retry_expiry_ms,
            )?,
            request_timeout_ms: parse_var(
                &lookup,
                "ANALYTICS_REQUEST_TIMEOUT_MS",
                defaults.request_timeout_ms,
            )?,
            https_proxy: lookup("ANALYTICS_PROXY_HTTPS").or_else(|| lookup("HTTPS_PROXY")),
            overflow_storage: lookup("ANALYTICS_OVERFLOW_PATH")
                .filter(|path| !path.trim().is_empty())
                .map_or(OverflowStorage::Memory, |path| {
                    OverflowStorage::Sqlite(PathBuf::from(path))
                }),
            log_level: lookup("ANALYTICS_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_key.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "ANALYTICS_WRITE_KEY cannot be empty".to_string(),
            ));
        }

        if reqwest::Url::parse(&self.api_url).is_err() {
            return Err(ConfigError::InvalidValue {
                name: "ANALYTICS_API_URL",
                value: self.api_url.clone(),
            });
        }

        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "max_batch_size must be greater than 0".to_string(),
            ));
        }

        if self.batch_every_ms == 0 {
            return Err(ConfigError::Invalid(
                "batch_every_ms must be greater than 0".to_string(),
            ));
        }

        if self.retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry_attempts must be at least 1".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_every_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_start_ms),
            Duration::from_millis(self.retry_expiry_ms),
        )
    }

    /// Overflow queue capacity in batches.
    #[must_use]
    pub fn hard_limit_batches(&self) -> usize {
        hard_limit_batches(self.events_hard_limit, self.max_batch_size)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        None => Ok(default),
    }
}
