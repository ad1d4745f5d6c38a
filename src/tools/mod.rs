//! Tool dispatch
//!
//! Tools are registered once per colony in a [`ToolBox`]. Every dispatch is
//! gated against the calling drone's allow-list and fails closed: a tool that
//! is not listed never runs, even when it is registered.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::provider::ToolCall;

/// Errors that can occur while dispatching a tool
#[derive(Debug, Error, PartialEq)]
pub enum ToolError {
    #[error("Tool '{0}' is not in this drone's allow-list")]
    NotAllowed(String),

    #[error("Unknown tool: {0}")]
    Unknown(String),

    #[error("Tool failed: {0}")]
    Failed(String),
}

/// Result type for tool operations
pub type ToolResult<T> = Result<T, ToolError>;

/// Context handed to a tool invocation
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Drone that requested the call
    pub drone_id: String,
    /// Working directory of that drone
    pub cwd: String,
}

/// A tool the model can invoke
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, ctx: &ToolContext, input: serde_json::Value)
        -> ToolResult<serde_json::Value>;
}

/// Registry of tools available to a colony
#[derive(Clone, Default)]
pub struct ToolBox {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolBox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool, replacing any tool with the same name
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run a tool call if the allow-list permits it
    pub async fn dispatch(
        &self,
        allow_list: &[String],
        ctx: &ToolContext,
        call: &ToolCall,
    ) -> ToolResult<serde_json::Value> {
        if !allow_list.iter().any(|allowed| allowed == &call.name) {
            return Err(ToolError::NotAllowed(call.name.clone()));
        }

        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::Unknown(call.name.clone()))?;

        tool.call(ctx, call.input.clone()).await
    }
}

impl std::fmt::Debug for ToolBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolBox").field("tools", &self.names()).finish()
    }
}
