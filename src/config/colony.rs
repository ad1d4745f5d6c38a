//! Colony configuration
//!
//! [`ColonyOptions`] is what callers and config files provide. It is resolved
//! exactly once into an immutable [`ColonyConfig`] that every drone of the
//! colony shares read-only.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ConfigError, ConfigResult};

/// Default provider request timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Base URL used by the `claude` and `anthropic` providers
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

/// Base URL used by the `openai` provider
pub const OPENAI_BASE_URL: &str = "https://api.openai.com";

/// Marker returned when a key is too short to partially reveal
pub const REDACTED_KEY: &str = "****";

/// Keys at or below this many characters are fully redacted
const MIN_REVEALABLE_KEY_LEN: usize = 8;

/// Supported LLM providers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Claude,
    OpenAi,
    Anthropic,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::Claude => "claude",
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
        }
    }

    /// Base URL used when none is configured explicitly
    pub fn default_base_url(&self) -> &'static str {
        match self {
            LlmProvider::Claude | LlmProvider::Anthropic => ANTHROPIC_BASE_URL,
            LlmProvider::OpenAi => OPENAI_BASE_URL,
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(LlmProvider::Claude),
            "openai" => Ok(LlmProvider::OpenAi),
            "anthropic" => Ok(LlmProvider::Anthropic),
            other => Err(ConfigError::Invalid(format!(
                "unknown provider '{}' (expected claude, openai or anthropic)",
                other
            ))),
        }
    }
}

/// Unresolved colony options; everything except the API key is optional
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ColonyOptions {
    /// Secret API key for the provider
    pub api_key: String,
    /// Provider selector, defaults to `claude`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<LlmProvider>,
    /// Base URL, defaults per provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Request timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl ColonyOptions {
    /// Create options with only the API key set
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    pub fn with_provider(mut self, provider: LlmProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }
}

impl fmt::Debug for ColonyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColonyOptions")
            .field("api_key", &mask_secret(&self.api_key))
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Resolved, immutable colony configuration
#[derive(Clone, PartialEq)]
pub struct ColonyConfig {
    api_key: String,
    provider: LlmProvider,
    base_url: String,
    timeout_ms: u64,
}

impl ColonyConfig {
    /// Apply defaults and validate
    pub fn resolve(options: ColonyOptions) -> ConfigResult<Self> {
        if options.api_key.is_empty() {
            return Err(ConfigError::Invalid("api_key cannot be empty".to_string()));
        }

        let provider = options.provider.unwrap_or_default();

        let base_url = match options.base_url {
            Some(url) if url.is_empty() => {
                return Err(ConfigError::Invalid(
                    "base_url cannot be empty when specified".to_string(),
                ));
            }
            Some(url) => url,
            None => provider.default_base_url().to_string(),
        };

        let timeout_ms = options.timeout.unwrap_or(DEFAULT_TIMEOUT_MS);
        if timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "timeout must be a positive number of milliseconds".to_string(),
            ));
        }

        Ok(Self {
            api_key: options.api_key,
            provider,
            base_url,
            timeout_ms,
        })
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Per-request timeout applied to every provider call
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Display-safe form of the API key
    pub fn masked_api_key(&self) -> String {
        mask_secret(&self.api_key)
    }
}

impl TryFrom<ColonyOptions> for ColonyConfig {
    type Error = ConfigError;

    fn try_from(options: ColonyOptions) -> Result<Self, Self::Error> {
        Self::resolve(options)
    }
}

impl fmt::Debug for ColonyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColonyConfig")
            .field("api_key", &self.masked_api_key())
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

/// Mask a secret for display: short keys are fully redacted, longer keys keep
/// their first and last four characters.
pub fn mask_secret(key: &str) -> String {
    let len = key.chars().count();
    if len <= MIN_REVEALABLE_KEY_LEN {
        return REDACTED_KEY.to_string();
    }

    let head: String = key.chars().take(4).collect();
    let tail: String = key.chars().skip(len - 4).collect();
    format!("{}...{}", head, tail)
}
