//! Configuration module
//!
//! Colony and drone configuration, plus the bridge configuration file that
//! declares which colonies a server hosts.

mod bridge;
mod colony;
mod drone;

use thiserror::Error;

pub use bridge::*;
pub use colony::*;
pub use drone::*;

/// Errors that can occur while reading or resolving configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
