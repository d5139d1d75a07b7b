// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::backoff::BackoffConfig;
use crate::errors::ConfigError;
use crate::register::worker::{
    WorkerConfig, DEFAULT_MAX_BATCH_DURATION, DEFAULT_MAX_BATCH_SIZE,
    DEFAULT_MAX_BATCH_SIZE_BYTES,
};
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_LEN: usize = 1000;
pub const DEFAULT_MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Tuning of the emission pipeline.
#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Number of registration workers
    pub workers: usize,
    /// Capacity of each of the inbound, to-register and registered queues
    pub queue_len: usize,
    /// Batch bounds applied by every registration worker
    pub batch: WorkerConfig,
    /// Retry pacing shared by the registration workers
    pub backoff: BackoffConfig,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_len: DEFAULT_QUEUE_LEN,
            batch: WorkerConfig {
                max_batch_size: DEFAULT_MAX_BATCH_SIZE,
                max_batch_size_bytes: DEFAULT_MAX_BATCH_SIZE_BYTES,
                max_batch_duration: DEFAULT_MAX_BATCH_DURATION,
            },
            backoff: BackoffConfig {
                max_backoff: DEFAULT_MAX_RETRY_BACKOFF,
                ..Default::default()
            },
        }
    }
}

impl EmitterConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`EmitterConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let workers = parse_var(&lookup, "NRI_REGISTER_WORKERS")?.unwrap_or(defaults.workers);
        let queue_len = parse_var(&lookup, "NRI_QUEUE_LEN")?.unwrap_or(defaults.queue_len);
        let max_batch_size = parse_var(&lookup, "NRI_REGISTER_BATCH_SIZE")?
            .unwrap_or(defaults.batch.max_batch_size);
        let max_batch_size_bytes = parse_var(&lookup, "NRI_REGISTER_BATCH_BYTES")?
            .unwrap_or(defaults.batch.max_batch_size_bytes);
        let max_batch_duration = parse_var(&lookup, "NRI_REGISTER_BATCH_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.batch.max_batch_duration);
        let max_backoff = parse_var(&lookup, "NRI_REGISTER_MAX_RETRY_BO_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.backoff.max_backoff);

        let config = Self {
            workers,
            queue_len,
            batch: WorkerConfig {
                max_batch_size,
                max_batch_size_bytes,
                max_batch_duration,
            },
            backoff: BackoffConfig {
                max_backoff,
                ..defaults.backoff
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid(
                "at least one registration worker is required".to_string(),
            ));
        }
        if self.queue_len == 0 {
            return Err(ConfigError::Invalid(
                "queue length must be greater than 0".to_string(),
            ));
        }
        if self.batch.max_batch_size == 0 || self.batch.max_batch_size_bytes == 0 {
            return Err(ConfigError::Invalid(
                "register batch bounds must be greater than 0".to_string(),
            ));
        }
        if self.batch.max_batch_duration.is_zero() {
            return Err(ConfigError::Invalid(
                "register batch duration must be greater than 0".to_string(),
            ));
        }
        if self.backoff.base.is_zero() {
            return Err(ConfigError::Invalid(
                "retry backoff base must be greater than 0".to_string(),
            ));
        }
        if self.backoff.base > self.backoff.max_backoff {
            return Err(ConfigError::Invalid(format!(
                "retry backoff base {:?} exceeds maximum {:?}",
                self.backoff.base, self.backoff.max_backoff
            )));
        }
        if self.backoff.factor.is_nan() || self.backoff.factor <= 1.0 {
            return Err(ConfigError::Invalid(
                "retry backoff factor must be greater than 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{name} has an invalid value '{raw}'"))),
    }
}
