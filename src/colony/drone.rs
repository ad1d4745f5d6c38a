//! Individual drone session
//!
//! A drone owns its status, its message history and its notification channel.
//! Prompts run one at a time: [`Drone::buzz`] rejects overlap instead of
//! queueing, and [`Drone::interrupt`] cancels whatever is in flight.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{
    AssistantMessage, CompleteEvent, DroneEvent, DroneId, DroneInfo, DroneStatus, ToolEndEvent,
    ToolStartEvent, Usage,
};
use crate::config::{ColonyConfig, DroneConfig, Metadata, ModelTier};
use crate::provider::{
    complete_with_deadline, Provider, ProviderError, ProviderRequest, ToolCall, Turn,
};
use crate::tools::{ToolBox, ToolContext};

/// Upper bound on provider round-trips within one prompt cycle
pub const MAX_PROVIDER_TURNS: usize = 16;

/// Capacity of each drone's notification channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Errors that can occur during drone operations
#[derive(Debug, Error)]
pub enum DroneError {
    #[error("Cannot buzz while drone is {status}")]
    Busy { status: DroneStatus },

    #[error("Prompt was interrupted")]
    Interrupted,

    #[error(transparent)]
    Provider(ProviderError),

    #[error("Prompt exceeded {0} provider turns")]
    TurnLimit(usize),

    #[error("Drone has been retired")]
    Retired,
}

impl DroneError {
    /// Whether the failure should park the drone in the `error` status
    pub fn is_fatal(&self) -> bool {
        matches!(self, DroneError::Provider(e) if e.is_fatal())
    }
}

impl From<ProviderError> for DroneError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Cancelled => DroneError::Interrupted,
            other => DroneError::Provider(other),
        }
    }
}

/// Result type for drone operations
pub type DroneResult<T> = Result<T, DroneError>;

/// Colony resources shared read-only by every drone it hatches
#[derive(Clone)]
pub struct DroneRuntime {
    pub config: Arc<ColonyConfig>,
    pub provider: Arc<dyn Provider>,
    pub toolbox: Arc<ToolBox>,
}

impl DroneRuntime {
    pub fn new(config: ColonyConfig, provider: Arc<dyn Provider>, toolbox: ToolBox) -> Self {
        Self {
            config: Arc::new(config),
            provider,
            toolbox: Arc::new(toolbox),
        }
    }
}

/// Status plus the cancellation handle of the cycle that owns it
#[derive(Default)]
struct Phase {
    status: DroneStatus,
    cancel: Option<CancellationToken>,
    retired: bool,
}

/// A failed cycle and whatever usage it accrued first
struct CycleFailure {
    error: DroneError,
    usage: Usage,
}

/// Represents a single LLM session
pub struct Drone {
    id: DroneId,
    cwd: String,
    model: ModelTier,
    tools: Vec<String>,
    system_prompt: Option<String>,
    metadata: Metadata,
    created_at: DateTime<Utc>,
    runtime: DroneRuntime,
    phase: Mutex<Phase>,
    messages: RwLock<Vec<AssistantMessage>>,
    /// `None` once retired; dropping the sender detaches every subscriber
    events: Mutex<Option<broadcast::Sender<DroneEvent>>>,
}

impl Drone {
    /// Create an idle drone
    pub fn new(id: impl Into<DroneId>, config: DroneConfig, runtime: DroneRuntime) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            id: id.into(),
            cwd: config.cwd,
            model: config.model,
            tools: config.tools,
            system_prompt: config.system_prompt,
            metadata: config.metadata,
            created_at: Utc::now(),
            runtime,
            phase: Mutex::new(Phase::default()),
            messages: RwLock::new(Vec::new()),
            events: Mutex::new(Some(event_tx)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Working directory
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn model(&self) -> ModelTier {
        self.model
    }

    /// Tools this drone may invoke
    pub fn tools(&self) -> &[String] {
        &self.tools
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> DroneStatus {
        self.phase.lock().status
    }

    pub fn is_retired(&self) -> bool {
        self.phase.lock().retired
    }

    /// Read-only summary for listings
    pub fn info(&self) -> DroneInfo {
        DroneInfo {
            id: self.id.clone(),
            cwd: self.cwd.clone(),
            status: self.status(),
            created_at: self.created_at,
            metadata: self.metadata.clone(),
        }
    }

    /// Subscribe to notifications
    ///
    /// After [`retire`](Drone::retire) the returned receiver is already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<DroneEvent> {
        match self.events.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    fn emit(&self, event: DroneEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Send a prompt and wait for the cycle to finish
    ///
    /// Fails with [`DroneError::Busy`] without touching state when the drone
    /// is not idle. Whatever happens, the drone is back in `idle` (or `error`
    /// for fatal provider failures) when this returns.
    pub async fn buzz(&self, prompt: &str) -> DroneResult<()> {
        let cancel = self.begin_cycle()?;
        let started = Instant::now();
        info!(drone_id = %self.id, prompt_len = prompt.len(), "Buzz started");

        let outcome = self.run_cycle(prompt, &cancel).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok((content, usage)) => self.finish_success(content, usage, duration_ms, &cancel),
            Err(failure) => self.finish_failure(failure, duration_ms, &cancel),
        }
    }

    /// Claim the drone for a new cycle: idle -> thinking
    fn begin_cycle(&self) -> DroneResult<CancellationToken> {
        let mut phase = self.phase.lock();
        if phase.retired {
            return Err(DroneError::Retired);
        }
        if phase.status != DroneStatus::Idle {
            debug!(drone_id = %self.id, status = %phase.status, "Buzz rejected");
            return Err(DroneError::Busy {
                status: phase.status,
            });
        }

        let cancel = CancellationToken::new();
        phase.status = DroneStatus::Thinking;
        phase.cancel = Some(cancel.clone());
        self.emit(DroneEvent::Status {
            status: DroneStatus::Thinking,
        });
        Ok(cancel)
    }

    /// Move between in-flight statuses unless the cycle was interrupted
    fn advance(&self, cancel: &CancellationToken, status: DroneStatus) -> bool {
        let mut phase = self.phase.lock();
        if cancel.is_cancelled() {
            return false;
        }
        phase.status = status;
        self.emit(DroneEvent::Status { status });
        true
    }

    fn request(&self, transcript: Vec<Turn>) -> ProviderRequest {
        let config = &self.runtime.config;
        ProviderRequest {
            provider: config.provider(),
            base_url: config.base_url().to_string(),
            model: self.model,
            system_prompt: self.system_prompt.clone(),
            transcript,
            tools: self.tools.clone(),
        }
    }

    async fn run_cycle(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, Usage), CycleFailure> {
        let mut transcript = vec![Turn::User {
            content: prompt.to_string(),
        }];
        let mut usage = Usage::default();

        for _ in 0..MAX_PROVIDER_TURNS {
            let request = self.request(transcript.clone());
            let response = complete_with_deadline(
                self.runtime.provider.as_ref(),
                request,
                self.runtime.config.timeout(),
                cancel,
            )
            .await
            .map_err(|e| CycleFailure {
                error: e.into(),
                usage,
            })?;
            usage += response.usage;

            if response.tool_calls.is_empty() {
                return Ok((response.content, usage));
            }

            transcript.push(Turn::Assistant {
                content: response.content,
                tool_calls: response.tool_calls.clone(),
            });

            if !self.advance(cancel, DroneStatus::ToolRunning) {
                return Err(CycleFailure {
                    error: DroneError::Interrupted,
                    usage,
                });
            }

            for call in &response.tool_calls {
                match self.run_tool(call, cancel).await {
                    Some(turn) => transcript.push(turn),
                    None => {
                        return Err(CycleFailure {
                            error: DroneError::Interrupted,
                            usage,
                        })
                    }
                }
            }

            if !self.advance(cancel, DroneStatus::Thinking) {
                return Err(CycleFailure {
                    error: DroneError::Interrupted,
                    usage,
                });
            }
        }

        Err(CycleFailure {
            error: DroneError::TurnLimit(MAX_PROVIDER_TURNS),
            usage,
        })
    }

    /// Dispatch one tool call; `None` when interrupted mid-call
    async fn run_tool(&self, call: &ToolCall, cancel: &CancellationToken) -> Option<Turn> {
        self.emit(DroneEvent::ToolStart(ToolStartEvent {
            id: call.id.clone(),
            tool: call.name.clone(),
            input: call.input.clone(),
            timestamp: Utc::now(),
        }));

        let ctx = ToolContext {
            drone_id: self.id.clone(),
            cwd: self.cwd.clone(),
        };
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = self.runtime.toolbox.dispatch(&self.tools, &ctx, call) => Some(outcome),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let Some(outcome) = outcome else {
            debug!(drone_id = %self.id, tool = %call.name, duration_ms, "Tool call interrupted");
            self.emit(DroneEvent::ToolEnd(ToolEndEvent {
                id: call.id.clone(),
                tool: call.name.clone(),
                input: call.input.clone(),
                result: serde_json::Value::String("interrupted".to_string()),
                is_error: true,
                duration_ms,
                timestamp: Utc::now(),
            }));
            return None;
        };

        let (result, is_error) = match outcome {
            Ok(value) => (value, false),
            Err(e) => {
                warn!(drone_id = %self.id, tool = %call.name, error = %e, "Tool call failed");
                (serde_json::Value::String(e.to_string()), true)
            }
        };
        debug!(drone_id = %self.id, tool = %call.name, duration_ms, is_error, "Tool call finished");

        self.emit(DroneEvent::ToolEnd(ToolEndEvent {
            id: call.id.clone(),
            tool: call.name.clone(),
            input: call.input.clone(),
            result: result.clone(),
            is_error,
            duration_ms,
            timestamp: Utc::now(),
        }));

        Some(Turn::ToolResult {
            call_id: call.id.clone(),
            content: result,
            is_error,
        })
    }

    fn emit_complete(&self, success: bool, usage: Usage, duration_ms: u64) {
        self.emit(DroneEvent::Complete(CompleteEvent {
            success,
            usage,
            duration_ms,
            timestamp: Utc::now(),
        }));
    }

    fn finish_success(
        &self,
        content: String,
        usage: Usage,
        duration_ms: u64,
        cancel: &CancellationToken,
    ) -> DroneResult<()> {
        let mut phase = self.phase.lock();
        if cancel.is_cancelled() {
            drop(phase);
            self.emit_complete(false, usage, duration_ms);
            return Err(DroneError::Interrupted);
        }

        let message = AssistantMessage::new(content);
        self.messages.write().push(message.clone());
        self.emit(DroneEvent::Message(message));

        phase.status = DroneStatus::Idle;
        phase.cancel = None;
        self.emit(DroneEvent::Status {
            status: DroneStatus::Idle,
        });
        drop(phase);

        self.emit_complete(true, usage, duration_ms);
        info!(drone_id = %self.id, duration_ms, "Buzz completed");
        Ok(())
    }

    fn finish_failure(
        &self,
        failure: CycleFailure,
        duration_ms: u64,
        cancel: &CancellationToken,
    ) -> DroneResult<()> {
        let CycleFailure { error, usage } = failure;

        let mut phase = self.phase.lock();
        if cancel.is_cancelled() {
            // interrupt() already restored idle and announced it
            drop(phase);
            self.emit_complete(false, usage, duration_ms);
            info!(drone_id = %self.id, "Buzz interrupted");
            return Err(DroneError::Interrupted);
        }

        let status = if error.is_fatal() {
            DroneStatus::Error
        } else {
            DroneStatus::Idle
        };

        self.emit(DroneEvent::Error {
            message: error.to_string(),
        });
        phase.status = status;
        phase.cancel = None;
        self.emit(DroneEvent::Status { status });
        drop(phase);

        self.emit_complete(false, usage, duration_ms);
        warn!(drone_id = %self.id, error = %error, status = %status, "Buzz failed");
        Err(error)
    }

    /// Cancel in-flight work and return to idle
    ///
    /// A no-op on an idle drone. This is also the only way out of `error`.
    pub async fn interrupt(&self) {
        let mut phase = self.phase.lock();
        self.interrupt_locked(&mut phase);
    }

    /// Cancel the owning cycle and restore idle; caller holds the phase lock
    fn interrupt_locked(&self, phase: &mut Phase) {
        if phase.status == DroneStatus::Idle {
            return;
        }

        if let Some(cancel) = phase.cancel.take() {
            cancel.cancel();
        }
        let previous = phase.status;
        phase.status = DroneStatus::Idle;
        self.emit(DroneEvent::Status {
            status: DroneStatus::Idle,
        });
        info!(drone_id = %self.id, from = %previous, "Drone interrupted");
    }

    /// Interrupt, then detach every subscriber
    ///
    /// Safe to call repeatedly. A retired drone refuses new prompts, and no
    /// cycle can start between the interrupt and the retirement.
    pub async fn retire(&self) {
        {
            let mut phase = self.phase.lock();
            self.interrupt_locked(&mut phase);
            phase.retired = true;
        }
        self.events.lock().take();
        debug!(drone_id = %self.id, "Drone retired");
    }

    /// Page through history
    ///
    /// `offset` defaults to 0 and `limit` to unbounded; an offset past the end
    /// yields an empty page.
    pub fn get_messages(&self, limit: Option<usize>, offset: Option<usize>) -> Vec<AssistantMessage> {
        let messages = self.messages.read();
        messages
            .iter()
            .skip(offset.unwrap_or(0))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Entire history
    pub fn messages(&self) -> Vec<AssistantMessage> {
        self.get_messages(None, None)
    }

    pub fn message_count(&self) -> usize {
        self.messages.read().len()
    }

    pub fn last_message(&self) -> Option<AssistantMessage> {
        self.messages.read().last().cloned()
    }

    /// Empty history; status is unaffected
    pub fn clear_messages(&self) {
        self.messages.write().clear();
    }
}

impl std::fmt::Debug for Drone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drone")
            .field("id", &self.id)
            .field("cwd", &self.cwd)
            .field("model", &self.model)
            .field("status", &self.status())
            .finish()
    }
}
