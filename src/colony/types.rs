//! Shared colony types
//!
//! Statuses, messages and the notification payloads drones emit.

use std::fmt;
use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Metadata;

/// Identifier of a drone, unique within its colony
pub type DroneId = String;

/// Prefix of generated drone identifiers
pub const DRONE_ID_PREFIX: &str = "drone_";

/// Prefix of generated message identifiers
pub const MESSAGE_ID_PREFIX: &str = "msg_";

/// Generate a fresh 128-bit random drone identifier
pub fn new_drone_id() -> DroneId {
    format!("{}{}", DRONE_ID_PREFIX, Uuid::new_v4().simple())
}

/// Drone lifecycle states
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DroneStatus {
    /// Ready to accept a prompt
    #[default]
    Idle,
    /// A provider request is in flight
    Thinking,
    /// A tool requested by the provider is executing
    ToolRunning,
    /// Unrecoverable failure; only an interrupt leaves this state
    Error,
}

impl DroneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DroneStatus::Idle => "idle",
            DroneStatus::Thinking => "thinking",
            DroneStatus::ToolRunning => "tool_running",
            DroneStatus::Error => "error",
        }
    }
}

impl fmt::Display for DroneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Author of a message; drones only record assistant output
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Assistant,
}

/// Message produced by the assistant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl AssistantMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: format!("{}{}", MESSAGE_ID_PREFIX, Uuid::new_v4().simple()),
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Token accounting for one or more provider turns
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_usd += other.cost_usd;
    }
}

/// Emitted when a tool starts executing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolStartEvent {
    pub id: String,
    pub tool: String,
    pub input: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Emitted when a tool finishes, successfully or not
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolEndEvent {
    pub id: String,
    pub tool: String,
    pub input: serde_json::Value,
    pub result: serde_json::Value,
    pub is_error: bool,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Emitted once per prompt cycle, after the terminal status change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompleteEvent {
    pub success: bool,
    pub usage: Usage,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Notifications pushed to drone subscribers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DroneEvent {
    /// A new assistant message was appended to history
    Message(AssistantMessage),
    ToolStart(ToolStartEvent),
    ToolEnd(ToolEndEvent),
    /// The drone moved to a new status
    Status { status: DroneStatus },
    Complete(CompleteEvent),
    /// A prompt cycle failed
    Error { message: String },
}

/// Read-only projection of a drone for listings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DroneInfo {
    pub id: DroneId,
    pub cwd: String,
    pub status: DroneStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}
