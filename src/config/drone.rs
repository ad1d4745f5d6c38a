//! Drone configuration
//!
//! Options accepted when hatching a new drone.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{ConfigError, ConfigResult};

/// Opaque caller-supplied metadata, passed through unchanged
pub type Metadata = HashMap<String, serde_json::Value>;

/// Model capability tiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Fast,
    #[default]
    Balanced,
    Powerful,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Fast => "fast",
            ModelTier::Balanced => "balanced",
            ModelTier::Powerful => "powerful",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelTier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(ModelTier::Fast),
            "balanced" => Ok(ModelTier::Balanced),
            "powerful" => Ok(ModelTier::Powerful),
            other => Err(ConfigError::Invalid(format!(
                "unknown model tier '{}' (expected fast, balanced or powerful)",
                other
            ))),
        }
    }
}

/// Configuration for hatching a drone
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DroneConfig {
    /// Working directory the drone operates in
    pub cwd: String,
    /// Model tier
    #[serde(default)]
    pub model: ModelTier,
    /// Tools the drone may invoke, in order
    #[serde(default)]
    pub tools: Vec<String>,
    /// Optional system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Custom metadata
    #[serde(default)]
    pub metadata: Metadata,
}

impl DroneConfig {
    /// Create a config for the given working directory with defaults
    pub fn new(cwd: impl Into<String>) -> Self {
        Self {
            cwd: cwd.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: ModelTier) -> Self {
        self.model = model;
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Set a single metadata entry
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Reject configurations a drone cannot be hatched from
    pub fn validate(&self) -> ConfigResult<()> {
        if self.cwd.trim().is_empty() {
            return Err(ConfigError::Invalid("cwd cannot be empty".to_string()));
        }
        if self.tools.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "tool names cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}
