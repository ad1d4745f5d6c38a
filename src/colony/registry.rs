//! Colony registry for coordinating drones
//!
//! Owns the id-to-drone mapping and the configuration shared by every drone
//! it hatches. The mapping lock only guards insertion, removal and listing;
//! each drone guards its own state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use super::drone::{Drone, DroneError, DroneRuntime};
use super::types::{new_drone_id, DroneEvent, DroneId, DroneInfo};
use crate::config::{ColonyConfig, ColonyOptions, ConfigError, DroneConfig, LlmProvider};
use crate::provider::{EchoProvider, Provider};
use crate::tools::ToolBox;

/// Capacity of the colony notification channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Errors that can occur during colony operations
#[derive(Debug, Error)]
pub enum ColonyError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Drone error: {0}")]
    Drone(#[from] DroneError),
}

impl From<ConfigError> for ColonyError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Invalid(msg) => ColonyError::InvalidConfiguration(msg),
            other => ColonyError::InvalidConfiguration(other.to_string()),
        }
    }
}

/// Result type for colony operations
pub type ColonyResult<T> = Result<T, ColonyError>;

/// Events broadcast by a colony
#[derive(Debug, Clone)]
pub enum ColonyEvent {
    /// A drone was hatched and is now tracked
    Hatched(Arc<Drone>),
    /// A drone was retired and is no longer tracked
    Retired(DroneId),
    /// A drone reported a failed prompt cycle
    Error {
        message: String,
        drone_id: Option<DroneId>,
    },
}

/// Tracked drones; `order` preserves hatch order for listings
#[derive(Default)]
struct Roster {
    drones: HashMap<DroneId, Arc<Drone>>,
    order: Vec<DroneId>,
}

impl Roster {
    fn insert(&mut self, drone: Arc<Drone>) {
        self.order.push(drone.id().to_string());
        self.drones.insert(drone.id().to_string(), drone);
    }

    fn remove(&mut self, id: &str) -> Option<Arc<Drone>> {
        let drone = self.drones.remove(id)?;
        self.order.retain(|tracked| tracked != id);
        Some(drone)
    }

    fn in_order(&self) -> impl Iterator<Item = &Arc<Drone>> {
        self.order.iter().filter_map(|id| self.drones.get(id))
    }
}

/// Registry of drones sharing one provider configuration
pub struct Colony {
    runtime: DroneRuntime,
    roster: RwLock<Roster>,
    event_tx: broadcast::Sender<ColonyEvent>,
}

impl Colony {
    /// Create a colony backed by the placeholder provider and no tools
    pub fn new(config: ColonyConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            runtime: DroneRuntime::new(config, Arc::new(EchoProvider::new()), ToolBox::new()),
            roster: RwLock::new(Roster::default()),
            event_tx,
        }
    }

    /// Resolve options and create a colony
    pub fn from_options(options: ColonyOptions) -> ColonyResult<Self> {
        let config = ColonyConfig::resolve(options)?;
        Ok(Self::new(config))
    }

    /// Replace the provider used by drones hatched from now on
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.runtime.provider = provider;
        self
    }

    /// Replace the tools available to drones hatched from now on
    pub fn with_toolbox(mut self, toolbox: ToolBox) -> Self {
        self.runtime.toolbox = Arc::new(toolbox);
        self
    }

    pub fn config(&self) -> &ColonyConfig {
        &self.runtime.config
    }

    pub fn provider(&self) -> LlmProvider {
        self.runtime.config.provider()
    }

    pub fn base_url(&self) -> &str {
        self.runtime.config.base_url()
    }

    pub fn timeout(&self) -> Duration {
        self.runtime.config.timeout()
    }

    /// Display-safe form of the API key
    pub fn masked_api_key(&self) -> String {
        self.runtime.config.masked_api_key()
    }

    /// Subscribe to colony events
    pub fn subscribe(&self) -> broadcast::Receiver<ColonyEvent> {
        self.event_tx.subscribe()
    }

    pub async fn drone_count(&self) -> usize {
        self.roster.read().await.drones.len()
    }

    /// Create and track a new idle drone
    pub async fn hatch(&self, config: DroneConfig) -> ColonyResult<Arc<Drone>> {
        config.validate()?;

        let drone = {
            let mut roster = self.roster.write().await;
            let mut id = new_drone_id();
            while roster.drones.contains_key(&id) {
                warn!(drone_id = %id, "Drone id collision, regenerating");
                id = new_drone_id();
            }

            let drone = Arc::new(Drone::new(id, config, self.runtime.clone()));
            roster.insert(Arc::clone(&drone));
            drone
        };

        self.forward_errors(&drone);
        let _ = self.event_tx.send(ColonyEvent::Hatched(Arc::clone(&drone)));

        info!(
            drone_id = %drone.id(),
            cwd = %drone.cwd(),
            model = %drone.model(),
            "Drone hatched"
        );
        Ok(drone)
    }

    /// Re-emit a drone's failures as colony errors until it is retired
    fn forward_errors(&self, drone: &Drone) {
        let mut drone_rx = drone.subscribe();
        let event_tx = self.event_tx.clone();
        let drone_id = drone.id().to_string();

        tokio::spawn(async move {
            loop {
                match drone_rx.recv().await {
                    Ok(DroneEvent::Error { message }) => {
                        let _ = event_tx.send(ColonyEvent::Error {
                            message,
                            drone_id: Some(drone_id.clone()),
                        });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Drone {} error forwarder lagged by {} events", drone_id, n);
                    }
                }
            }
            debug!("Error forwarding for drone {} stopped", drone_id);
        });
    }

    /// Look up a tracked drone
    pub async fn recall(&self, id: &str) -> Option<Arc<Drone>> {
        let drone = self.roster.read().await.drones.get(id).cloned();
        if drone.is_none() {
            debug!(drone_id = %id, "Recall miss");
        }
        drone
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.roster.read().await.drones.contains_key(id)
    }

    /// Interrupt, detach and stop tracking a drone
    ///
    /// Unknown ids are ignored.
    pub async fn retire(&self, id: &str) {
        let removed = {
            let mut roster = self.roster.write().await;
            match roster.remove(id) {
                Some(drone) => {
                    drone.retire().await;
                    true
                }
                None => false,
            }
        };

        if removed {
            let _ = self.event_tx.send(ColonyEvent::Retired(id.to_string()));
            info!(drone_id = %id, "Drone retired");
        }
    }

    /// Summaries of every tracked drone, in hatch order
    pub async fn list_drones(&self) -> Vec<DroneInfo> {
        self.roster.read().await.in_order().map(|d| d.info()).collect()
    }

    /// Retire every tracked drone
    pub async fn shutdown(&self) {
        let ids: Vec<DroneId> = self.roster.read().await.order.clone();
        info!("Retiring {} drones", ids.len());
        for id in ids {
            self.retire(&id).await;
        }
    }
}

impl std::fmt::Debug for Colony {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Colony")
            .field("config", self.config())
            .field("provider_impl", &self.runtime.provider.name())
            .field("toolbox", &self.runtime.toolbox)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colony::DroneStatus;
    use crate::provider::{ProviderError, ScriptedProvider};
    use std::time::Duration;

    fn colony() -> Colony {
        Colony::from_options(ColonyOptions::new("test-api-key")).unwrap()
    }

    #[test]
    fn test_colony_defaults() {
        let colony = colony();
        assert_eq!(colony.provider(), LlmProvider::Claude);
        assert_eq!(colony.base_url(), "https://api.anthropic.com");
        assert_eq!(colony.timeout(), Duration::from_millis(30_000));
    }

    #[test]
    fn test_colony_openai() {
        let colony =
            Colony::from_options(ColonyOptions::new("test-key").with_provider(LlmProvider::OpenAi))
                .unwrap();
        assert_eq!(colony.base_url(), "https://api.openai.com");
    }

    #[test]
    fn test_masked_api_key() {
        let colony = Colony::from_options(ColonyOptions::new("sk-ant-api-key-12345678")).unwrap();
        assert_eq!(colony.masked_api_key(), "sk-a...5678");

        let colony = Colony::from_options(ColonyOptions::new("short")).unwrap();
        assert_eq!(colony.masked_api_key(), "****");
    }

    #[test]
    fn test_invalid_options() {
        let result = Colony::from_options(ColonyOptions::new(""));
        assert!(matches!(result, Err(ColonyError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_hatch_and_recall() {
        let colony = colony();
        let drone = colony.hatch(DroneConfig::new("/test/project")).await.unwrap();

        assert!(drone.id().starts_with("drone_"));
        assert_eq!(drone.cwd(), "/test/project");
        assert_eq!(drone.status(), DroneStatus::Idle);

        let recalled = colony.recall(drone.id()).await.unwrap();
        assert!(Arc::ptr_eq(&drone, &recalled));
        assert_eq!(colony.drone_count().await, 1);
    }

    #[tokio::test]
    async fn test_hatch_rejects_empty_cwd() {
        let colony = colony();
        let result = colony.hatch(DroneConfig::new("")).await;
        assert!(matches!(result, Err(ColonyError::InvalidConfiguration(_))));
        assert_eq!(colony.drone_count().await, 0);
    }

    #[tokio::test]
    async fn test_hatch_emits_event_after_insert() {
        let colony = colony();
        let mut rx = colony.subscribe();

        let drone = colony.hatch(DroneConfig::new("/test")).await.unwrap();

        match rx.recv().await.unwrap() {
            ColonyEvent::Hatched(hatched) => {
                assert_eq!(hatched.id(), drone.id());
                assert!(colony.contains(hatched.id()).await);
            }
            other => panic!("Expected Hatched, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_drones_in_hatch_order() {
        let colony = colony();
        let mut ids = Vec::new();
        for i in 0..5 {
            let drone = colony
                .hatch(DroneConfig::new(format!("/test/{}", i)))
                .await
                .unwrap();
            ids.push(drone.id().to_string());
        }

        let listed: Vec<String> = colony.list_drones().await.into_iter().map(|d| d.id).collect();
        assert_eq!(listed, ids);

        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 5);
    }

    #[tokio::test]
    async fn test_retire() {
        let colony = colony();
        let mut rx = colony.subscribe();
        let drone = colony.hatch(DroneConfig::new("/test")).await.unwrap();
        let id = drone.id().to_string();
        let _ = rx.recv().await;

        colony.retire(&id).await;

        assert!(colony.recall(&id).await.is_none());
        assert!(drone.is_retired());
        assert!(colony.list_drones().await.is_empty());
        match rx.recv().await.unwrap() {
            ColonyEvent::Retired(retired) => assert_eq!(retired, id),
            other => panic!("Expected Retired, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retire_unknown_is_noop() {
        let colony = colony();
        let mut rx = colony.subscribe();

        colony.retire("non-existent").await;

        assert!(colony.recall("non-existent").await.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_retire_busy_drone_interrupts_first() {
        let colony = colony().with_provider(Arc::new(
            ScriptedProvider::new().with_delay(Duration::from_secs(10)),
        ));
        let drone = colony.hatch(DroneConfig::new("/test")).await.unwrap();
        let mut drone_rx = drone.subscribe();

        let task = {
            let drone = Arc::clone(&drone);
            tokio::spawn(async move { drone.buzz("slow").await })
        };
        drone_rx.recv().await.unwrap();
        assert_eq!(drone.status(), DroneStatus::Thinking);

        colony.retire(drone.id()).await;

        assert_eq!(drone.status(), DroneStatus::Idle);
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(DroneError::Interrupted)));
    }

    #[tokio::test]
    async fn test_drone_errors_forwarded() {
        let colony = colony().with_provider(Arc::new(
            ScriptedProvider::new().then(Err(ProviderError::Request("connection reset".into()))),
        ));
        let mut rx = colony.subscribe();
        let drone = colony.hatch(DroneConfig::new("/test")).await.unwrap();

        assert!(drone.buzz("Hello").await.is_err());

        let forwarded = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(ColonyEvent::Error { message, drone_id }) = rx.recv().await {
                    return (message, drone_id);
                }
            }
        })
        .await
        .unwrap();
        assert!(forwarded.0.contains("connection reset"));
        assert_eq!(forwarded.1.as_deref(), Some(drone.id()));
    }

    #[tokio::test]
    async fn test_shutdown_retires_all() {
        let colony = colony();
        let a = colony.hatch(DroneConfig::new("/a")).await.unwrap();
        let b = colony.hatch(DroneConfig::new("/b")).await.unwrap();

        colony.shutdown().await;

        assert_eq!(colony.drone_count().await, 0);
        assert!(a.is_retired());
        assert!(b.is_retired());
    }

    #[tokio::test]
    async fn test_buzz_round_trip_through_colony() {
        let colony = colony();
        let drone = colony.hatch(DroneConfig::new("/test")).await.unwrap();

        drone.buzz("X").await.unwrap();

        assert_eq!(drone.last_message().unwrap().content, "Received prompt: X");
        assert_eq!(drone.get_messages(None, None).len(), 1);
    }
}
