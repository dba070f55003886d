//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for the engine and its
//! recurring schedules.

mod error;
mod types;
mod yaml;

pub use error::ConfigError;
pub use types::{EngineConfig, RetryConfig, RetryStrategyConfig, ScheduleConfig};
pub use yaml::YamlLoader;
