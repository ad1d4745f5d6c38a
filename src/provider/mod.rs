//! LLM provider seam
//!
//! A drone talks to its model through the [`Provider`] trait. Each call is
//! bounded by the colony timeout and by the drone's cancellation token; no
//! retries are attempted.

mod echo;
#[cfg(test)]
mod scripted;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::colony::Usage;
use crate::config::{LlmProvider, ModelTier};

pub use echo::EchoProvider;
#[cfg(test)]
pub(crate) use scripted::ScriptedProvider;

/// Errors returned by provider calls
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Provider request failed: {0}")]
    Request(String),

    #[error("Provider rejected the request: {0}")]
    Rejected(String),

    #[error("Provider request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Fatal errors leave the drone in the `error` status
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProviderError::Rejected(_))
    }
}

/// Result type for provider operations
pub type ProviderResult<T> = Result<T, ProviderError>;

/// A tool invocation requested by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// One entry of the transcript sent to the provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Turn {
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    ToolResult {
        call_id: String,
        content: serde_json::Value,
        is_error: bool,
    },
}

/// Outbound provider request
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProviderRequest {
    pub provider: LlmProvider,
    pub base_url: String,
    pub model: ModelTier,
    pub system_prompt: Option<String>,
    pub transcript: Vec<Turn>,
    /// Tools the model may call
    pub tools: Vec<String>,
}

impl ProviderRequest {
    /// Content of the most recent user turn
    pub fn last_user_prompt(&self) -> Option<&str> {
        self.transcript.iter().rev().find_map(|turn| match turn {
            Turn::User { content } => Some(content.as_str()),
            _ => None,
        })
    }
}

/// Provider reply for a single turn
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: Usage,
}

impl ProviderResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

/// An LLM backend
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Perform one request/response round-trip
    async fn complete(&self, request: ProviderRequest) -> ProviderResult<ProviderResponse>;
}

/// Run a provider call, giving up on timeout or cancellation
pub async fn complete_with_deadline(
    provider: &dyn Provider,
    request: ProviderRequest,
    timeout: Duration,
    cancel: &CancellationToken,
) -> ProviderResult<ProviderResponse> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        result = tokio::time::timeout(timeout, provider.complete(request)) => match result {
            Ok(response) => response,
            Err(_) => Err(ProviderError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        },
    }
}
