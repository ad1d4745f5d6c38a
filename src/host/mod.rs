//! Host integration
//!
//! A [`Host`] is the server-side owner of named colonies. Each plugin
//! registration attaches exactly one colony under its decorator name; a name
//! can be used once per host.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::colony::Colony;
use crate::config::{ColonyConfig, ColonyOptions, ConfigError};
use crate::provider::Provider;
use crate::tools::ToolBox;

/// Decorator name used when a plugin does not specify one
pub const DEFAULT_DECORATOR: &str = "colony";

/// Errors that can occur while registering colonies
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Decorator '{0}' is already registered")]
    DuplicateRegistration(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for host operations
pub type HostResult<T> = Result<T, HostError>;

/// Registration request for one colony
#[derive(Default)]
pub struct ColonyPlugin {
    pub decorator_name: Option<String>,
    pub options: ColonyOptions,
    provider: Option<Arc<dyn Provider>>,
    toolbox: Option<ToolBox>,
}

impl ColonyPlugin {
    pub fn new(options: ColonyOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    pub fn with_decorator_name(mut self, name: impl Into<String>) -> Self {
        self.decorator_name = Some(name.into());
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_toolbox(mut self, toolbox: ToolBox) -> Self {
        self.toolbox = Some(toolbox);
        self
    }

    /// Name the colony will be attached under
    pub fn decorator(&self) -> &str {
        self.decorator_name.as_deref().unwrap_or(DEFAULT_DECORATOR)
    }
}

/// Owner of the colonies a server exposes
#[derive(Default)]
pub struct Host {
    colonies: RwLock<HashMap<String, Arc<Colony>>>,
}

impl Host {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct and attach a colony
    ///
    /// The name is checked before anything is built, so a duplicate never
    /// constructs a second colony.
    pub async fn register(&self, plugin: ColonyPlugin) -> HostResult<Arc<Colony>> {
        let name = plugin.decorator().to_string();
        let mut colonies = self.colonies.write().await;
        if colonies.contains_key(&name) {
            return Err(HostError::DuplicateRegistration(name));
        }

        let ColonyPlugin {
            options,
            provider,
            toolbox,
            ..
        } = plugin;

        let config = ColonyConfig::resolve(options)?;
        let mut colony = Colony::new(config);
        if let Some(provider) = provider {
            colony = colony.with_provider(provider);
        }
        if let Some(toolbox) = toolbox {
            colony = colony.with_toolbox(toolbox);
        }

        info!(
            decorator = %name,
            provider = %colony.provider(),
            api_key = %colony.masked_api_key(),
            "Colony registered"
        );

        let colony = Arc::new(colony);
        colonies.insert(name, Arc::clone(&colony));
        Ok(colony)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Colony>> {
        self.colonies.read().await.get(name).cloned()
    }

    pub async fn has_decorator(&self, name: &str) -> bool {
        self.colonies.read().await.contains_key(name)
    }

    /// Registered decorator names, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.colonies.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Retire every drone of every colony
    pub async fn shutdown(&self) {
        let colonies: Vec<Arc<Colony>> = self.colonies.read().await.values().cloned().collect();
        for colony in colonies {
            colony.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DroneConfig, LlmProvider};

    #[tokio::test]
    async fn test_register_default_decorator() {
        let host = Host::new();
        let colony = host
            .register(ColonyPlugin::new(ColonyOptions::new("test-api-key")))
            .await
            .unwrap();

        assert!(host.has_decorator("colony").await);
        assert_eq!(colony.provider(), LlmProvider::Claude);
        assert!(Arc::ptr_eq(&colony, &host.get("colony").await.unwrap()));
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails() {
        let host = Host::new();
        host.register(ColonyPlugin::new(ColonyOptions::new("first-key-1234")))
            .await
            .unwrap();

        // an invalid config proves nothing is constructed before the name check
        let result = host.register(ColonyPlugin::new(ColonyOptions::new(""))).await;
        assert!(matches!(
            result,
            Err(HostError::DuplicateRegistration(name)) if name == "colony"
        ));
        assert_eq!(host.names().await, vec!["colony".to_string()]);
    }

    #[tokio::test]
    async fn test_distinct_names_are_independent() {
        let host = Host::new();
        let a = host
            .register(ColonyPlugin::new(ColonyOptions::new("key-a-12345")).with_decorator_name("a"))
            .await
            .unwrap();
        let b = host
            .register(
                ColonyPlugin::new(
                    ColonyOptions::new("key-b-12345").with_provider(LlmProvider::OpenAi),
                )
                .with_decorator_name("b"),
            )
            .await
            .unwrap();

        a.hatch(DroneConfig::new("/a")).await.unwrap();
        assert_eq!(a.drone_count().await, 1);
        assert_eq!(b.drone_count().await, 0);
        assert_eq!(b.base_url(), "https://api.openai.com");
        assert_eq!(host.names().await, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_options_are_reported() {
        let host = Host::new();
        let result = host.register(ColonyPlugin::new(ColonyOptions::new(""))).await;
        assert!(matches!(result, Err(HostError::Config(_))));
        assert!(!host.has_decorator("colony").await);
    }

    #[tokio::test]
    async fn test_shutdown_retires_drones() {
        let host = Host::new();
        let colony = host
            .register(ColonyPlugin::new(ColonyOptions::new("test-api-key")))
            .await
            .unwrap();
        let drone = colony.hatch(DroneConfig::new("/test")).await.unwrap();

        host.shutdown().await;

        assert!(drone.is_retired());
        assert_eq!(colony.drone_count().await, 0);
    }
}
