//! YAML configuration parsing.
//!
//! Parses and validates the engine configuration from YAML files.

use std::path::Path;

use super::error::ConfigError;
use super::types::{EngineConfig, RetryStrategyConfig};

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load engine configuration from a file.
    pub fn load_engine_config(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse_engine_config(&content)
    }

    /// Parse engine configuration from a YAML string.
    pub fn parse_engine_config(yaml: &str) -> Result<EngineConfig, ConfigError> {
        // An empty document means "all defaults"
        let config: EngineConfig = if yaml.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        Self::validate_engine_config(&config)?;
        Ok(config)
    }

    /// Validate an engine configuration.
    pub fn validate_engine_config(config: &EngineConfig) -> Result<(), ConfigError> {
        if config.workers == 0 {
            return Err(ConfigError::InvalidConfig(
                "workers must be at least 1".into(),
            ));
        }

        if config.default_max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "default_max_attempts must be at least 1".into(),
            ));
        }

        if config.retry.strategy == RetryStrategyConfig::Exponential
            && config.retry.base_delay > config.retry.max_delay
        {
            return Err(ConfigError::InvalidConfig(format!(
                "retry.base_delay ({:?}) exceeds retry.max_delay ({:?})",
                config.retry.base_delay, config.retry.max_delay
            )));
        }

        for schedule in &config.schedules {
            if schedule.job_type.trim().is_empty() {
                return Err(ConfigError::MissingField("schedules[].job_type".into()));
            }

            if schedule.max_attempts == Some(0) {
                return Err(ConfigError::InvalidConfig(format!(
                    "max_attempts must be at least 1 for scheduled job type '{}'",
                    schedule.job_type
                )));
            }

            let parsed = schedule
                .to_schedule()
                .map_err(|source| ConfigError::InvalidSchedule {
                    job_type: schedule.job_type.clone(),
                    source,
                })?;
            parsed
                .next()
                .map_err(|source| ConfigError::InvalidSchedule {
                    job_type: schedule.job_type.clone(),
                    source,
                })?;
        }

        Ok(())
    }
}
