// ABOUTME: Environment-driven configuration for the sbpanel binary
// ABOUTME: Reads database, runtime and worker pool settings with validated defaults

use sbpanel_config::{constants, defaults};
use sbpanel_sandbox::{ManagerConfig, PoolConfig};
use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a whole number, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{var} must be between {min} and {max}, got {value}")]
    OutOfRange {
        var: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: String,
    pub base_image: String,
    pub runtime_prefix: String,
    pub stop_timeout: Duration,
    pub pull_timeout: Duration,
    pub provision_workers: usize,
    pub queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: defaults::DATABASE_URL.to_string(),
            base_image: defaults::BASE_IMAGE.to_string(),
            runtime_prefix: defaults::RUNTIME_PREFIX.to_string(),
            stop_timeout: Duration::from_secs(defaults::STOP_TIMEOUT_SECS),
            pull_timeout: Duration::from_secs(defaults::PULL_TIMEOUT_SECS),
            provision_workers: defaults::PROVISION_WORKERS,
            queue_capacity: defaults::PROVISION_QUEUE_CAPACITY,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let fallback = Self::default();

        // SBPANEL_DATABASE_URL wins over the legacy DATABASE_URL
        let database_url = non_empty(constants::SBPANEL_DATABASE_URL)
            .or_else(|| non_empty(constants::DATABASE_URL))
            .unwrap_or(fallback.database_url);

        let base_image =
            non_empty(constants::SBPANEL_BASE_IMAGE).unwrap_or(fallback.base_image);
        let runtime_prefix =
            non_empty(constants::SBPANEL_RUNTIME_PREFIX).unwrap_or(fallback.runtime_prefix);

        let stop_timeout = number(
            constants::SBPANEL_STOP_TIMEOUT_SECS,
            defaults::STOP_TIMEOUT_SECS,
            0,
            300,
        )?;
        let pull_timeout = number(
            constants::SBPANEL_PULL_TIMEOUT_SECS,
            defaults::PULL_TIMEOUT_SECS,
            1,
            3600,
        )?;
        let provision_workers = number(
            constants::SBPANEL_PROVISION_WORKERS,
            defaults::PROVISION_WORKERS as u64,
            1,
            64,
        )?;
        let queue_capacity = number(
            constants::SBPANEL_PROVISION_QUEUE_CAPACITY,
            defaults::PROVISION_QUEUE_CAPACITY as u64,
            1,
            10_000,
        )?;

        Ok(Config {
            database_url,
            base_image,
            runtime_prefix,
            stop_timeout: Duration::from_secs(stop_timeout),
            pull_timeout: Duration::from_secs(pull_timeout),
            provision_workers: provision_workers as usize,
            queue_capacity: queue_capacity as usize,
        })
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            image: self.base_image.clone(),
            name_prefix: self.runtime_prefix.clone(),
            pool: PoolConfig {
                workers: self.provision_workers,
                capacity: self.queue_capacity,
            },
        }
    }
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn number(var: &'static str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError> {
    let Some(raw) = non_empty(var) else {
        return Ok(default);
    };

    let value = raw.parse::<u64>().map_err(|_| ConfigError::InvalidNumber {
        var,
        value: raw.clone(),
    })?;

    if !(min..=max).contains(&value) {
        return Err(ConfigError::OutOfRange {
            var,
            value,
            min,
            max,
        });
    }

    Ok(value)
}
