//! Protocol message definitions
//!
//! Defines the message types exchanged between bridge clients and the server.
//! All messages are JSON-encoded and include version information for compatibility.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::colony::{AssistantMessage, DroneEvent, DroneId, DroneInfo};
use crate::config::{Metadata, ModelTier};

/// Current protocol version
/// Increment when making breaking changes to message format
pub const PROTOCOL_VERSION: u32 = 1;

/// Minimum supported protocol version
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Maximum prompt length (1MB)
pub const MAX_PROMPT_LENGTH: usize = 1024 * 1024;

/// Maximum path length
pub const MAX_PATH_LENGTH: usize = 4096;

/// Maximum colony, drone id and tool name length
pub const MAX_NAME_LENGTH: usize = 256;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Protocol version {0} not supported (min: {MIN_PROTOCOL_VERSION}, current: {PROTOCOL_VERSION})")]
    UnsupportedVersion(u32),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Message Envelope
// ============================================================================

/// Protocol envelope wrapping all client messages
/// Includes version for compatibility checking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    /// Protocol version used by the client
    #[serde(default = "default_version")]
    pub version: u32,
    /// The actual message payload
    #[serde(flatten)]
    pub message: ClientMessage,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

impl ClientEnvelope {
    /// Create a new client envelope with the current protocol version
    pub fn new(message: ClientMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }

    /// Parse and validate a client envelope from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let envelope: Self = serde_json::from_str(json)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Validate the envelope and its contents
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.version < MIN_PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(self.version));
        }

        self.message.validate()
    }

    /// Serialize the envelope to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from client to server
///
/// `colony` selects a hosted colony by decorator name and defaults to `colony`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Connection keepalive ping
    Ping {
        /// Sequence number for tracking round-trip time
        seq: u64,
    },

    /// Present the bridge token
    Authenticate { token: String },

    /// Create a new drone
    Hatch {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        colony: Option<String>,
        /// Working directory of the drone
        cwd: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<ModelTier>,
        /// Tools the drone may invoke
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tools: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system_prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Metadata::is_empty")]
        metadata: Metadata,
    },

    /// Send a prompt; the outcome arrives as drone events
    Buzz {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        colony: Option<String>,
        drone_id: DroneId,
        prompt: String,
    },

    /// Cancel a drone's in-flight prompt
    Interrupt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        colony: Option<String>,
        drone_id: DroneId,
    },

    /// Retire a drone
    Retire {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        colony: Option<String>,
        drone_id: DroneId,
    },

    /// List the drones of a colony
    ListDrones {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        colony: Option<String>,
    },

    /// Request drone status
    GetDrone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        colony: Option<String>,
        drone_id: DroneId,
    },

    /// Page through a drone's history
    GetMessages {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        colony: Option<String>,
        drone_id: DroneId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<usize>,
    },

    /// Empty a drone's history
    ClearMessages {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        colony: Option<String>,
        drone_id: DroneId,
    },
}

fn validate_name(field: &str, value: &str) -> ProtocolResult<()> {
    if value.is_empty() {
        return Err(ProtocolError::ValidationError(format!(
            "{} cannot be empty",
            field
        )));
    }
    if value.len() > MAX_NAME_LENGTH {
        return Err(ProtocolError::ValidationError(format!(
            "{} exceeds maximum length of {} characters",
            field, MAX_NAME_LENGTH
        )));
    }
    Ok(())
}

fn validate_colony(colony: &Option<String>) -> ProtocolResult<()> {
    match colony {
        Some(name) => validate_name("colony", name),
        None => Ok(()),
    }
}

impl ClientMessage {
    /// Validate message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ClientMessage::Ping { .. } | ClientMessage::Authenticate { .. } => Ok(()),

            ClientMessage::Hatch {
                colony, cwd, tools, ..
            } => {
                validate_colony(colony)?;
                if cwd.trim().is_empty() {
                    return Err(ProtocolError::ValidationError(
                        "cwd cannot be empty".to_string(),
                    ));
                }
                if cwd.len() > MAX_PATH_LENGTH {
                    return Err(ProtocolError::ValidationError(format!(
                        "cwd exceeds maximum length of {} characters",
                        MAX_PATH_LENGTH
                    )));
                }
                for tool in tools {
                    validate_name("tool name", tool)?;
                }
                Ok(())
            }

            ClientMessage::Buzz {
                colony,
                drone_id,
                prompt,
            } => {
                validate_colony(colony)?;
                validate_name("drone_id", drone_id)?;
                if prompt.len() > MAX_PROMPT_LENGTH {
                    return Err(ProtocolError::ValidationError(format!(
                        "prompt exceeds maximum length of {} bytes",
                        MAX_PROMPT_LENGTH
                    )));
                }
                Ok(())
            }

            ClientMessage::Interrupt { colony, drone_id }
            | ClientMessage::Retire { colony, drone_id }
            | ClientMessage::GetDrone { colony, drone_id }
            | ClientMessage::ClearMessages { colony, drone_id }
            | ClientMessage::GetMessages {
                colony, drone_id, ..
            } => {
                validate_colony(colony)?;
                validate_name("drone_id", drone_id)
            }

            ClientMessage::ListDrones { colony } => validate_colony(colony),
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::Authenticate { .. } => "authenticate",
            ClientMessage::Hatch { .. } => "hatch",
            ClientMessage::Buzz { .. } => "buzz",
            ClientMessage::Interrupt { .. } => "interrupt",
            ClientMessage::Retire { .. } => "retire",
            ClientMessage::ListDrones { .. } => "list_drones",
            ClientMessage::GetDrone { .. } => "get_drone",
            ClientMessage::GetMessages { .. } => "get_messages",
            ClientMessage::ClearMessages { .. } => "clear_messages",
        }
    }

    /// Create a Ping message
    pub fn ping(seq: u64) -> Self {
        ClientMessage::Ping { seq }
    }

    /// Create a Hatch message for the default colony
    pub fn hatch(cwd: impl Into<String>) -> Self {
        ClientMessage::Hatch {
            colony: None,
            cwd: cwd.into(),
            model: None,
            tools: Vec::new(),
            system_prompt: None,
            metadata: Metadata::new(),
        }
    }

    /// Create a Buzz message for the default colony
    pub fn buzz(drone_id: impl Into<DroneId>, prompt: impl Into<String>) -> Self {
        ClientMessage::Buzz {
            colony: None,
            drone_id: drone_id.into(),
            prompt: prompt.into(),
        }
    }

    /// Create an Interrupt message for the default colony
    pub fn interrupt(drone_id: impl Into<DroneId>) -> Self {
        ClientMessage::Interrupt {
            colony: None,
            drone_id: drone_id.into(),
        }
    }

    /// Create a Retire message for the default colony
    pub fn retire(drone_id: impl Into<DroneId>) -> Self {
        ClientMessage::Retire {
            colony: None,
            drone_id: drone_id.into(),
        }
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Welcome message sent on connection
    Welcome {
        /// Server protocol version
        version: u32,
        /// Whether `authenticate` must precede other requests
        auth_required: bool,
        /// Hosted colony names
        #[serde(default)]
        colonies: Vec<String>,
    },

    /// Response to Ping
    Pong {
        /// Echo back the sequence number
        seq: u64,
    },

    /// Token accepted
    Authenticated,

    /// Drone successfully hatched
    DroneHatched { colony: String, drone: DroneInfo },

    /// Drone retired (or was never tracked)
    DroneRetired { colony: String, drone_id: DroneId },

    /// Drones of a colony, in hatch order
    DroneList {
        colony: String,
        drones: Vec<DroneInfo>,
    },

    /// Status of a specific drone
    DroneStatus { colony: String, drone: DroneInfo },

    /// A page of drone history
    Messages {
        drone_id: DroneId,
        messages: Vec<AssistantMessage>,
    },

    /// Request accepted
    Ack { action: String, drone_id: DroneId },

    /// Notification pushed by a drone
    DroneEvent { drone_id: DroneId, event: DroneEvent },

    /// Error response
    Error {
        /// Error message
        message: String,
        /// Error code for programmatic handling
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
        /// Related drone if applicable
        #[serde(skip_serializing_if = "Option::is_none")]
        drone_id: Option<DroneId>,
    },
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid message format
    InvalidMessage,
    /// No colony registered under that name
    ColonyNotFound,
    /// Drone not found
    DroneNotFound,
    /// Drone is not idle
    DroneBusy,
    /// Invalid drone configuration
    HatchFailed,
    /// Prompt cycle failed
    PromptFailed,
    /// Authentication required
    AuthRequired,
    /// Authentication failed
    AuthFailed,
    /// Internal server error
    InternalError,
    /// Unsupported protocol version
    UnsupportedVersion,
}

impl ServerMessage {
    /// Create a Welcome message
    pub fn welcome(auth_required: bool, colonies: Vec<String>) -> Self {
        ServerMessage::Welcome {
            version: PROTOCOL_VERSION,
            auth_required,
            colonies,
        }
    }

    /// Create a Pong message
    pub fn pong(seq: u64) -> Self {
        ServerMessage::Pong { seq }
    }

    /// Create an Ack message
    pub fn ack(action: impl Into<String>, drone_id: impl Into<DroneId>) -> Self {
        ServerMessage::Ack {
            action: action.into(),
            drone_id: drone_id.into(),
        }
    }

    /// Create an Error message
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: None,
            drone_id: None,
        }
    }

    /// Create an Error message with code
    pub fn error_with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
            drone_id: None,
        }
    }

    /// Create an Error message for a specific drone
    pub fn drone_error(
        drone_id: impl Into<DroneId>,
        message: impl Into<String>,
        code: ErrorCode,
    ) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
            drone_id: Some(drone_id.into()),
        }
    }
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        let code = match &err {
            ProtocolError::SerializationError(_) => ErrorCode::InvalidMessage,
            ProtocolError::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            ProtocolError::ValidationError(_) => ErrorCode::InvalidMessage,
        };
        ServerMessage::error_with_code(err.to_string(), code)
    }
}

// ============================================================================
// Tests
// ============================================================================
