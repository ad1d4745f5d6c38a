//! Hive bridge
//!
//! Colonies of LLM drone sessions, a host that attaches named colonies to a
//! server, and a WebSocket bridge exposing them to remote clients.

pub mod colony;
pub mod config;
pub mod host;
pub mod provider;
pub mod server;
pub mod tools;

pub use colony::{Colony, ColonyError, ColonyEvent, Drone, DroneError, DroneEvent, DroneStatus};
pub use config::{ColonyConfig, ColonyOptions, DroneConfig, LlmProvider, ModelTier};
pub use host::{ColonyPlugin, Host, HostError};
