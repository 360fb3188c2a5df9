use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config parse error: {0}")]
    ParseError(String),
    #[error("config validation error: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    // Registry
    pub heartbeat_check_interval_ms: u64,
    pub info_request_max_retries: u8,
    pub component_id_min: u8,
    pub component_id_max: u8,

    // Unlock
    pub unlock_timeout_ms: u64,
    pub ecdh_coord_size: usize,

    // Service queues
    pub command_capacity: usize,
    pub event_capacity: usize,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            heartbeat_check_interval_ms: 2000,
            info_request_max_retries: 4,
            component_id_min: 1,
            component_id_max: 4,
            unlock_timeout_ms: 10_000,
            ecdh_coord_size: 32, // NIST P-256
            command_capacity: 64,
            event_capacity: 64,
        }
    }
}

impl CompanionConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {}", path.display(), e)))?;

        let config: CompanionConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        debug!(path = %path.display(), "loaded companion config");
        Ok(config)
    }

    /// Defaults overridden by `OCU_*` environment variables.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = env_parse("OCU_HEARTBEAT_CHECK_INTERVAL_MS")? {
            config.heartbeat_check_interval_ms = v;
        }
        if let Some(v) = env_parse("OCU_INFO_REQUEST_MAX_RETRIES")? {
            config.info_request_max_retries = v;
        }
        if let Some(v) = env_parse("OCU_UNLOCK_TIMEOUT_MS")? {
            config.unlock_timeout_ms = v;
        }
        if let Some(v) = env_parse("OCU_ECDH_COORD_SIZE")? {
            config.ecdh_coord_size = v;
        }
        if let Some(v) = env_parse("OCU_COMPONENT_ID_MIN")? {
            config.component_id_min = v;
        }
        if let Some(v) = env_parse("OCU_COMPONENT_ID_MAX")? {
            config.component_id_max = v;
        }
        if let Some(v) = env_parse("OCU_COMMAND_CAPACITY")? {
            config.command_capacity = v;
        }
        if let Some(v) = env_parse("OCU_EVENT_CAPACITY")? {
            config.event_capacity = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_check_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "heartbeat_check_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.unlock_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "unlock_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if !matches!(self.ecdh_coord_size, 32 | 48) {
            return Err(ConfigError::ValidationError(
                "ecdh_coord_size must be 32 (P-256) or 48 (P-384)".to_string(),
            ));
        }
        if self.component_id_min == 0 || self.component_id_min > self.component_id_max {
            return Err(ConfigError::ValidationError(
                "component id range must satisfy 1 <= min <= max".to_string(),
            ));
        }
        if self.command_capacity == 0 || self.event_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "queue capacities must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_check_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_check_interval_ms)
    }

    pub fn unlock_timeout(&self) -> Duration {
        Duration::from_millis(self.unlock_timeout_ms)
    }

    pub fn component_range(&self) -> RangeInclusive<u8> {
        self.component_id_min..=self.component_id_max
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::ParseError(format!("{key}={raw} is not a valid value"))),
        Err(_) => Ok(None),
    }
}
