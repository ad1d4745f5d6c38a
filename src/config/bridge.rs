//! Bridge configuration
//!
//! Loads the list of hosted colonies from a TOML file such as `hive.toml`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{mask_secret, ColonyOptions, ConfigResult, LlmProvider};

/// Default configuration file name
pub const CONFIG_FILE: &str = "hive.toml";

/// One `[[colony]]` table
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ColonyEntry {
    /// Decorator name the colony is registered under
    pub name: Option<String>,
    /// Provider API key
    pub api_key: String,
    /// Provider selector
    pub provider: Option<LlmProvider>,
    /// Base URL override
    pub base_url: Option<String>,
    /// Request timeout in milliseconds
    pub timeout: Option<u64>,
}

impl ColonyEntry {
    /// Split into the decorator name and the colony options
    pub fn into_parts(self) -> (Option<String>, ColonyOptions) {
        let options = ColonyOptions {
            api_key: self.api_key,
            provider: self.provider,
            base_url: self.base_url,
            timeout: self.timeout,
        };
        (self.name, options)
    }
}

impl std::fmt::Debug for ColonyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColonyEntry")
            .field("name", &self.name)
            .field("api_key", &mask_secret(&self.api_key))
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Bridge configuration file
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BridgeConfig {
    /// Colonies to register on startup
    #[serde(default, rename = "colony")]
    pub colonies: Vec<ColonyEntry>,
}

impl BridgeConfig {
    /// Load configuration from a file; a missing file yields the defaults
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: BridgeConfig = toml::from_str(content)?;
        Ok(config)
    }
}
